//! Meridian is a crate for serving PostgreSQL's wire protocol in front of
//! columnar time-series engines.
//!
//! The crate owns the extended-query pipeline (parse, bind, describe,
//! execute, sync, close) and streams result sets through a bounded,
//! resumable response buffer; the SQL compiler, cursors and storage belong
//! to an engine adapter implementing the traits in [engine].

#![warn(missing_docs)]

pub mod bind;
pub mod cache;
pub mod connection;
pub mod engine;
pub mod pipeline;
pub mod protocol;
pub mod protocol_ext;
pub mod server;

//! Per-connection caches for compiled SELECT and INSERT artifacts.
//!
//! Anonymous pipeline entries hand their compiled payload back here when they
//! retire; a later PARSE of the same SQL text skips compilation entirely.
//! Named statements and portals are never cached this way: they own their
//! artifact until closed.

#![allow(missing_docs)]

use crate::engine::{CursorFactory, InsertOperation, StatementKind};
use crate::protocol::DataTypeOid;
use std::collections::HashMap;
use std::sync::Arc;

/// A compiled SELECT (or EXPLAIN) plus the parameter types it was compiled
/// with. The OID lists are shared with every pipeline entry using the
/// artifact.
#[derive(Clone)]
pub struct SelectArtifact {
	pub factory: Arc<dyn CursorFactory>,
	pub kind: StatementKind,
	pub tag: Arc<str>,
	/// Client-declared parameter OIDs at compile time.
	pub in_parameter_oids: Arc<Vec<DataTypeOid>>,
	/// Reconciled OIDs returned in PARAMETER_DESCRIPTION.
	pub out_parameter_oids: Arc<Vec<DataTypeOid>>,
}

/// A compiled INSERT, cached when it has bind variables (a parameterless
/// INSERT is cheap to recompile and rarely repeated verbatim).
#[derive(Clone)]
pub struct InsertArtifact {
	pub insert: Arc<dyn InsertOperation>,
	pub kind: StatementKind,
	pub tag: Arc<str>,
	pub in_parameter_oids: Arc<Vec<DataTypeOid>>,
	pub out_parameter_oids: Arc<Vec<DataTypeOid>>,
	pub has_bind_variables: bool,
}

/// A cached artifact is only reusable when the client declares the same
/// parameter types it was compiled with. Declaring no types always matches;
/// the compiler is assumed to infer identically for identical text.
fn parameter_types_match(cached: &[DataTypeOid], declared: &[DataTypeOid]) -> bool {
	declared.is_empty() || cached == declared
}

/// The SELECT and INSERT caches of one connection.
#[derive(Default)]
pub struct StatementCaches {
	selects: HashMap<String, SelectArtifact>,
	inserts: HashMap<String, InsertArtifact>,
}

impl StatementCaches {
	/// Removes and returns the cached SELECT for this text. The factory is
	/// stateful (it produces one cursor at a time), so a hit transfers
	/// ownership to the caller; a parameter-type mismatch discards the stale
	/// artifact.
	pub fn take_select(&mut self, sql: &str, declared: &[DataTypeOid]) -> Option<SelectArtifact> {
		let artifact = self.selects.remove(sql)?;
		if parameter_types_match(&artifact.in_parameter_oids, declared) {
			Some(artifact)
		} else {
			None
		}
	}

	/// Looks up a cached INSERT. Insert operations are reusable, so the
	/// artifact stays cached and the caller gets a handle to the same one.
	pub fn get_insert(&self, sql: &str, declared: &[DataTypeOid]) -> Option<InsertArtifact> {
		let artifact = self.inserts.get(sql)?;
		if parameter_types_match(&artifact.in_parameter_oids, declared) {
			Some(artifact.clone())
		} else {
			None
		}
	}

	pub fn put_select(&mut self, sql: String, artifact: SelectArtifact) {
		self.selects.insert(sql, artifact);
	}

	pub fn put_insert(&mut self, sql: String, artifact: InsertArtifact) {
		self.inserts.insert(sql, artifact);
	}
}

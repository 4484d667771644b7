//! Per-connection driver: reads client messages off a framed transport,
//! routes them onto pipeline entries, and drains the pipeline on SYNC.
//!
//! Response emission is split in two: connection-scope messages
//! (authentication, READY_FOR_QUERY) go through the codec, while everything a
//! pipeline entry produces streams through the bounded [OutputBuffer] so that
//! result sets larger than the buffer can be flushed and resumed mid-entry.

#![allow(missing_docs)]

use crate::bind::ArenaStatus;
use crate::cache::StatementCaches;
use crate::engine::{Engine, PendingWriters, SqlError, TransactionState};
use crate::pipeline::{free_pending_writers, PipelineEntry, StreamBreak};
use crate::protocol::{
	AuthenticationOk, Bind, ClientMessage, Close, ConnectionCodec, Describe, ErrorResponse, Execute, ParameterStatus,
	Parse, ProtocolError, ReadyForQuery, SSLResponse, Severity, SqlState,
};
use crate::protocol_ext::OutputBuffer;
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::Framed;

#[derive(thiserror::Error, Debug)]
pub enum ConnectionError {
	#[error("io error: {0}")]
	Io(#[from] std::io::Error),
	#[error("protocol error: {0}")]
	Protocol(#[from] ProtocolError),
	#[error("error response: {0}")]
	ErrorResponse(#[from] ErrorResponse),
	#[error("connection closed")]
	ConnectionClosed,
}

/// Per-connection tunables.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
	send_buffer_size: usize,
	max_blob_size: usize,
	max_recompile_attempts: u32,
}

impl Default for ConnectionOptions {
	fn default() -> Self {
		Self {
			send_buffer_size: 64 * 1024,
			max_blob_size: 512 * 1024,
			max_recompile_attempts: 10,
		}
	}
}

impl ConnectionOptions {
	pub fn new() -> Self {
		Self::default()
	}

	/// Bounds the response buffer; an atomic write larger than this aborts
	/// the connection.
	pub fn with_send_buffer_size(mut self, bytes: usize) -> Self {
		self.send_buffer_size = bytes;
		self
	}

	/// Largest binary column value allowed in a result set.
	pub fn with_max_blob_size(mut self, bytes: usize) -> Self {
		self.max_blob_size = bytes;
		self
	}

	/// How many times a stale cached plan is recompiled before giving up.
	pub fn with_max_recompile_attempts(mut self, attempts: u32) -> Self {
		self.max_recompile_attempts = attempts;
		self
	}
}

#[derive(Debug)]
enum ConnectionState {
	Startup,
	Idle,
}

pub struct Connection<E: Engine> {
	engine: E,
	options: ConnectionOptions,
	state: ConnectionState,
	statements: HashMap<String, PipelineEntry>,
	portals: HashMap<String, PipelineEntry>,
	/// Entries accumulated since the last SYNC, in wire order.
	queue: Vec<PipelineEntry>,
	caches: StatementCaches,
	pending_writers: PendingWriters,
	transaction: TransactionState,
	out: OutputBuffer,
}

impl<E: Engine> Connection<E> {
	pub fn new(engine: E, options: ConnectionOptions) -> Self {
		let out = OutputBuffer::new(options.send_buffer_size, options.max_blob_size);
		Self {
			engine,
			options,
			state: ConnectionState::Startup,
			statements: HashMap::new(),
			portals: HashMap::new(),
			queue: Vec::new(),
			caches: StatementCaches::default(),
			pending_writers: PendingWriters::new(),
			transaction: TransactionState::None,
			out,
		}
	}

	fn new_entry(&self) -> PipelineEntry {
		PipelineEntry::new(self.options.max_recompile_attempts)
	}

	fn queue_error_entry(&mut self, message: String) {
		let mut entry = self.new_entry();
		entry.capture_sql_error(SqlError::new(message));
		self.queue.push(entry);
	}

	/// Most recent entry in the live pipeline parsed under `name`. Checked
	/// before the statement table: within one pipeline a statement can be
	/// bound before its own sync has promoted it.
	fn find_statement_in_queue(&self, name: &str) -> Option<usize> {
		self.queue
			.iter()
			.rposition(|e| !e.is_portal && (e.state_parse || e.is_prepared) && e.statement_name() == name)
	}

	fn find_portal_in_queue(&self, name: &str) -> Option<usize> {
		if name.is_empty() {
			// the unnamed portal is the most recently bound entry
			self.queue.iter().rposition(|e| e.state_bind && !e.is_portal)
		} else {
			self.queue.iter().rposition(|e| e.is_portal && e.portal_name() == name)
		}
	}

	async fn on_parse(&mut self, parse: Parse) {
		let mut entry = self.new_entry();
		entry.msg_parse_copy_parameter_types(&parse.parameter_types);
		if parse.query.is_empty() {
			entry.of_empty(&parse.query);
		} else if let Some(artifact) = self.caches.take_select(&parse.query, &parse.parameter_types) {
			entry.of_select(&parse.query, artifact);
		} else if let Some(artifact) = self.caches.get_insert(&parse.query, &parse.parameter_types) {
			entry.of_insert(&parse.query, artifact);
		} else if let Err(e) = entry.compile_new_sql(&mut self.engine, &parse.query).await {
			entry.capture_sql_error(e);
		}

		if entry.text_has_secret {
			tracing::debug!(statement = %parse.prepared_statement_name, "parse (sql redacted)");
		} else {
			tracing::debug!(statement = %parse.prepared_statement_name, sql = %parse.query, "parse");
		}

		if !parse.prepared_statement_name.is_empty() {
			// re-parsing a name replaces the previous statement
			self.statements.remove(&parse.prepared_statement_name);
			entry.set_prepared_statement(&parse.prepared_statement_name);
		}
		entry.state_parse = true;
		self.queue.push(entry);
	}

	fn apply_bind(entry: &mut PipelineEntry, bind: &Bind) {
		entry.msg_bind_copy_parameter_format_codes(&bind.parameter_format_codes, bind.parameter_value_count);
		entry.msg_bind_begin_parameter_values(bind.parameter_area.len());
		match entry.msg_bind_ingest_parameter_values(&bind.parameter_area) {
			ArenaStatus::Complete => {}
			ArenaStatus::Incomplete { missing } => {
				// frames arrive whole behind the codec; a short block here
				// means the declared sizes lied
				entry.capture_sql_error(SqlError::new(format!("bind value block short by {} bytes", missing)));
			}
		}
		entry.msg_bind_copy_select_format_codes(&bind.result_format_codes);
		entry.state_bind = true;
	}

	fn on_bind(&mut self, bind: Bind) {
		if !bind.portal.is_empty() {
			// a named portal is a separate entry sharing the statement's
			// parsed payload; the statement itself stays bindable
			let copy = if let Some(idx) = self.find_statement_in_queue(&bind.prepared_statement_name) {
				Some(self.queue[idx].copy_parsed())
			} else {
				self.statements
					.get(&bind.prepared_statement_name)
					.map(PipelineEntry::copy_parsed)
			};
			match copy {
				Some(mut entry) => {
					let parent = (!bind.prepared_statement_name.is_empty()).then_some(bind.prepared_statement_name.as_str());
					Self::apply_bind(&mut entry, &bind);
					entry.set_portal(&bind.portal, parent);
					self.portals.remove(&bind.portal);
					self.queue.push(entry);
				}
				None => self.queue_error_entry(format!(
					"prepared statement does not exist: {:?}",
					bind.prepared_statement_name
				)),
			}
			return;
		}

		// unnamed portal: bind onto the statement entry itself
		if let Some(idx) = self.find_statement_in_queue(&bind.prepared_statement_name) {
			if self.queue[idx].state_exec {
				// already executed in this pipeline: the old entry keeps
				// streaming, a shallow copy takes the new binding
				let mut entry = self.queue[idx].copy_parsed();
				Self::apply_bind(&mut entry, &bind);
				self.queue.push(entry);
			} else {
				Self::apply_bind(&mut self.queue[idx], &bind);
			}
		} else if let Some(mut entry) = self.statements.remove(&bind.prepared_statement_name) {
			Self::apply_bind(&mut entry, &bind);
			self.queue.push(entry);
		} else {
			self.queue_error_entry(format!(
				"prepared statement does not exist: {:?}",
				bind.prepared_statement_name
			));
		}
	}

	fn on_describe(&mut self, describe: Describe) {
		match describe {
			Describe::PreparedStatement(name) => {
				if let Some(idx) = self.find_statement_in_queue(&name) {
					self.queue[idx].set_state_desc_statement();
				} else if let Some(mut entry) = self.statements.remove(&name) {
					entry.set_state_desc_statement();
					self.queue.push(entry);
				} else {
					self.queue_error_entry(format!("prepared statement does not exist: {:?}", name));
				}
			}
			Describe::Portal(name) => {
				if let Some(idx) = self.find_portal_in_queue(&name) {
					self.queue[idx].set_state_desc_portal();
				} else if let Some(mut entry) = self.portals.remove(&name) {
					entry.set_state_desc_portal();
					self.queue.push(entry);
				} else {
					self.queue_error_entry(format!("portal does not exist: {:?}", name));
				}
			}
		}
	}

	async fn on_execute(&mut self, execute: Execute) {
		let idx = match self.find_portal_in_queue(&execute.portal) {
			Some(idx) => Some(idx),
			None => match self.portals.remove(&execute.portal) {
				Some(entry) => {
					// a suspended portal re-enters the pipeline to continue
					self.queue.push(entry);
					Some(self.queue.len() - 1)
				}
				None => None,
			},
		};
		let Some(idx) = idx else {
			self.queue_error_entry(format!("portal does not exist: {:?}", execute.portal));
			return;
		};

		let limit = execute.max_rows.unwrap_or(0).max(0) as u64;
		let entry = &mut self.queue[idx];
		entry.set_return_row_count_limit(limit);
		entry.state_exec = true;
		self.transaction = entry
			.msg_execute(&mut self.engine, self.transaction, &mut self.caches, &mut self.pending_writers)
			.await;
	}

	fn on_close(&mut self, close: Close) {
		match close {
			Close::PreparedStatement(name) => {
				if let Some(idx) = self.find_statement_in_queue(&name) {
					self.queue[idx].set_state_closed();
				} else if let Some(mut entry) = self.statements.remove(&name) {
					entry.set_state_closed();
					self.queue.push(entry);
				} else {
					// closing an unknown name still answers CLOSE_COMPLETE
					let mut entry = self.new_entry();
					entry.set_state_closed();
					self.queue.push(entry);
				}
			}
			Close::Portal(name) => {
				if let Some(idx) = self.find_portal_in_queue(&name) {
					self.queue[idx].set_state_closed();
				} else if let Some(mut entry) = self.portals.remove(&name) {
					entry.set_state_closed();
					self.queue.push(entry);
				} else {
					let mut entry = self.new_entry();
					entry.set_state_closed();
					self.queue.push(entry);
				}
			}
		}
	}

	async fn on_query<S: AsyncRead + AsyncWrite + Unpin>(
		&mut self,
		sql: String,
		framed: &mut Framed<S, ConnectionCodec>,
	) -> Result<(), ConnectionError> {
		let mut entry = self.new_entry();
		if sql.is_empty() {
			entry.of_empty(&sql);
		} else if let Err(e) = entry.compile_new_sql(&mut self.engine, &sql).await {
			entry.capture_sql_error(e);
		}
		if !entry.is_error() && !sql.is_empty() {
			if entry.produces_result_set() {
				// simple query sends a row description but never parameter
				// metadata
				entry.set_state_desc_simple_query();
			}
			entry.state_exec = true;
			self.transaction = entry
				.msg_execute(&mut self.engine, self.transaction, &mut self.caches, &mut self.pending_writers)
				.await;
		}
		self.queue.push(entry);
		self.drain_pipeline(framed).await?;
		framed.send(ReadyForQuery(self.transaction.status())).await?;
		Ok(())
	}

	async fn on_sync<S: AsyncRead + AsyncWrite + Unpin>(
		&mut self,
		framed: &mut Framed<S, ConnectionCodec>,
	) -> Result<(), ConnectionError> {
		self.drain_pipeline(framed).await?;
		framed.send(ReadyForQuery(self.transaction.status())).await?;
		Ok(())
	}

	/// Syncs every queued entry in wire order, flushing the output buffer
	/// whenever it fills and parking on wake events when a cursor pauses.
	async fn drain_pipeline<S: AsyncRead + AsyncWrite + Unpin>(
		&mut self,
		framed: &mut Framed<S, ConnectionCodec>,
	) -> Result<(), ConnectionError> {
		let entries: Vec<PipelineEntry> = self.queue.drain(..).collect();
		let mut abandoned = false;
		for mut entry in entries {
			if abandoned {
				// an error poisons the rest of the pipeline: remaining
				// entries retire silently
				entry.cache_if_possible(&mut self.caches);
				continue;
			}
			let errored = loop {
				match entry.sync(&mut self.out, &mut self.pending_writers, &mut self.transaction) {
					Ok(errored) => break errored,
					Err(StreamBreak::OutOfSpace) => {
						if self.out.flush_len() == 0 {
							// nothing flushable: a single atomic write is
							// larger than the whole buffer
							return Err(ErrorResponse::fatal(
								SqlState::ProtocolViolation,
								"response does not fit the send buffer",
							)
							.into());
						}
						framed.get_mut().write_all(self.out.flushable()).await?;
						framed.get_mut().flush().await?;
						self.out.consume_flushed();
					}
					Err(StreamBreak::Paused(event)) => {
						// ship the complete rows we have, then park until
						// the cold data arrives
						if self.out.flush_len() > 0 {
							framed.get_mut().write_all(self.out.flushable()).await?;
							framed.get_mut().flush().await?;
							self.out.consume_flushed();
						}
						tracing::debug!(event = event.id(), "cursor paused on cold storage");
						event.wait().await;
					}
				}
			};
			if errored {
				abandoned = true;
				entry.cache_if_possible(&mut self.caches);
				continue;
			}
			self.retire(entry);
		}
		if !self.out.is_empty() {
			framed.get_mut().write_all(self.out.written()).await?;
			framed.get_mut().flush().await?;
			self.out.clear();
		}
		Ok(())
	}

	/// Puts a fully-synced entry back where it belongs: named statements and
	/// portals return to their tables, anonymous entries donate their
	/// compiled artifacts to the caches and drop.
	fn retire(&mut self, mut entry: PipelineEntry) {
		if entry.is_prepared {
			self.statements.insert(entry.statement_name().to_string(), entry);
		} else if entry.is_portal {
			self.portals.insert(entry.portal_name().to_string(), entry);
		} else {
			entry.cache_if_possible(&mut self.caches);
		}
	}

	async fn step<S: AsyncRead + AsyncWrite + Unpin>(
		&mut self,
		framed: &mut Framed<S, ConnectionCodec>,
	) -> Result<bool, ConnectionError> {
		match self.state {
			ConnectionState::Startup => {
				match self.next(framed).await? {
					ClientMessage::SSLRequest => {
						// no TLS; the client falls back to cleartext
						framed.send(SSLResponse(false)).await?;
						return Ok(true);
					}
					ClientMessage::Startup(startup) => {
						tracing::debug!(parameters = ?startup.parameters, "startup");
					}
					_ => {
						return Err(
							ErrorResponse::fatal(SqlState::ProtocolViolation, "expected startup message").into(),
						)
					}
				}

				framed.send(AuthenticationOk).await?;
				framed.send(ParameterStatus::new("server_version", "12.3")).await?;
				framed.send(ParameterStatus::new("client_encoding", "UTF8")).await?;
				framed.send(ReadyForQuery(self.transaction.status())).await?;
				self.state = ConnectionState::Idle;
				Ok(true)
			}
			ConnectionState::Idle => {
				match self.next(framed).await? {
					ClientMessage::Parse(parse) => self.on_parse(parse).await,
					ClientMessage::Bind(bind) => self.on_bind(bind),
					ClientMessage::Describe(describe) => self.on_describe(describe),
					ClientMessage::Execute(execute) => self.on_execute(execute).await,
					ClientMessage::Close(close) => self.on_close(close),
					ClientMessage::Sync => self.on_sync(framed).await?,
					ClientMessage::Query(sql) => self.on_query(sql, framed).await?,
					ClientMessage::Terminate => {
						free_pending_writers(&mut self.pending_writers, false).ok();
						return Ok(false);
					}
					_ => {
						return Err(ErrorResponse::error(SqlState::ProtocolViolation, "unexpected message").into());
					}
				}
				Ok(true)
			}
		}
	}

	async fn next<S: AsyncRead + AsyncWrite + Unpin>(
		&mut self,
		framed: &mut Framed<S, ConnectionCodec>,
	) -> Result<ClientMessage, ConnectionError> {
		Ok(framed.next().await.ok_or(ConnectionError::ConnectionClosed)??)
	}

	pub async fn run<S: AsyncRead + AsyncWrite + Unpin>(&mut self, stream: S) -> Result<(), ConnectionError> {
		let mut framed = Framed::new(stream, ConnectionCodec::new());
		loop {
			match self.step(&mut framed).await {
				Ok(true) => {}
				Ok(false) => return Ok(()),
				Err(ConnectionError::ErrorResponse(err_info)) => {
					framed.send(err_info.clone()).await?;

					if err_info.severity == Severity::Fatal {
						return Err(err_info.into());
					}

					framed.send(ReadyForQuery(self.transaction.status())).await?;
				}
				Err(err) => {
					let _ = framed
						.send(ErrorResponse::fatal(SqlState::ConnectionException, "connection error"))
						.await;
					return Err(err);
				}
			}
		}
	}
}

//! The per-connection extended-query pipeline entry.
//!
//! A [PipelineEntry] owns the lifecycle of one compiled SQL through the
//! PARSE, BIND, DESCRIBE, EXECUTE, SYNC and CLOSE stages: message state is
//! accumulated by the `msg_*` methods, engine work happens in
//! [PipelineEntry::msg_execute], and a single re-entrant
//! [PipelineEntry::sync] call drives all response emission. Sync cooperates
//! with the bounded output buffer (which raises out-of-space) and the cursor
//! (which may raise a cold-storage pause); on either signal the entry
//! preserves enough state to resume exactly where it left off.

#![allow(missing_docs)]

use crate::bind::{
	decode_bind_variables, reconcile_parameter_types, spread_parameter_format_codes, ArenaStatus, BitSet,
	ParameterArena,
};
use crate::cache::{InsertArtifact, SelectArtifact, StatementCaches};
use crate::engine::{
	CircuitBreaker as _, ColumnDesc, ColumnType, CompiledSql, Cursor, CursorError, CursorFactory as _, DdlOperation as _,
	Engine, EngineError, ExecutionContext, InsertMethod as _, InsertOperation as _, PendingWriters, Record, SqlError,
	SqlPayload, StatementKind, TableToken, TableWriter, TransactionState, UpdateOperation, WakeEvent, WriterSource,
};
use crate::protocol::{
	DataTypeOid, FormatCode, MESSAGE_TYPE_BIND_COMPLETE, MESSAGE_TYPE_CLOSE_COMPLETE, MESSAGE_TYPE_COMMAND_COMPLETE,
	MESSAGE_TYPE_EMPTY_QUERY, MESSAGE_TYPE_ERROR_RESPONSE, MESSAGE_TYPE_NO_DATA, MESSAGE_TYPE_PARAMETER_DESCRIPTION,
	MESSAGE_TYPE_PARSE_COMPLETE, MESSAGE_TYPE_PORTAL_SUSPENDED, MESSAGE_TYPE_ROW_DESCRIPTION, PG_EPOCH_OFFSET_USEC,
};
use crate::protocol_ext::{OutOfSpace, OutputBuffer};
use chrono::DateTime;
use std::sync::Arc;
use uuid::Uuid;

/// Sync progression. The first six states run in order within one sync call;
/// the cursor states are set by the streamer and handled after the main
/// dispatch.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum SyncState {
	/// Emit PARSE_COMPLETE if this entry was parsed.
	Parse,
	/// Emit BIND_COMPLETE if it was bound.
	Bind,
	/// Emit PARAMETER_DESCRIPTION / ROW_DESCRIPTION / NO_DATA as described.
	Describe,
	/// Run the execution output; SELECTs move on to `Stream`.
	Execute,
	/// Mid-result-set; re-entry continues row emission.
	Stream,
	/// Nothing left to emit for this entry.
	Done,
	/// Cursor exhausted: close it and emit COMMAND_COMPLETE.
	CursorComplete,
	/// Batch limit reached with rows remaining: emit PORTAL_SUSPENDED.
	Suspended,
}

/// How this entry was described, which governs the DESCRIBE response shape.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
enum DescribeState {
	#[default]
	None,
	/// DESCRIBE of a portal: row description only.
	Portal,
	/// Simple-query execution: row description only, no parameter metadata.
	SimpleQuery,
	/// DESCRIBE of a named statement: parameter description first.
	Statement,
}

/// Control-flow signals raised by [PipelineEntry::sync]. Neither is an
/// error: both mean "flush or wait, then call sync again".
#[derive(Debug)]
pub enum StreamBreak {
	/// The output buffer cannot take the next write. Flush the bookmarked
	/// prefix and re-enter.
	OutOfSpace,
	/// The cursor hit cold storage. Park the connection on the event and
	/// re-enter once it fires.
	Paused(WakeEvent),
}

impl From<OutOfSpace> for StreamBreak {
	fn from(_: OutOfSpace) -> Self {
		StreamBreak::OutOfSpace
	}
}

enum RecordBreak {
	Space,
	Abort(SqlError),
}

impl From<OutOfSpace> for RecordBreak {
	fn from(_: OutOfSpace) -> Self {
		RecordBreak::Space
	}
}

/// Writer source that consults the pending-writer map first: a second INSERT
/// into the same table within one transaction keeps staging through the
/// writer already checked out for it.
struct PendingAwareWriterSource<'a> {
	pending: &'a mut PendingWriters,
	inner: &'a mut dyn WriterSource,
}

impl WriterSource for PendingAwareWriterSource<'_> {
	fn acquire(&mut self, table: &TableToken) -> Result<Box<dyn TableWriter>, EngineError> {
		match self.pending.remove(table) {
			Some(writer) => Ok(writer),
			None => self.inner.acquire(table),
		}
	}
}

/// Flushes the pending-writer map, committing or rolling back every writer.
/// The map is cleared even when a commit fails; the first failure is
/// reported.
pub fn free_pending_writers(pending: &mut PendingWriters, commit: bool) -> Result<(), SqlError> {
	let mut first_error = None;
	for (_, mut writer) in pending.drain() {
		if commit {
			if let Err(e) = writer.commit() {
				let e = match e {
					EngineError::Sql(e) => e,
					other => SqlError::new(other.to_string()),
				};
				first_error.get_or_insert(e);
			}
		} else {
			writer.rollback();
		}
	}
	match first_error {
		Some(e) => Err(e),
		None => Ok(()),
	}
}

pub struct PipelineEntry {
	// identity; a cached entry never holds ephemeral slices, so names and
	// SQL text are owned
	prepared_statement_name: Option<String>,
	portal_name: Option<String>,
	pub(crate) is_prepared: bool,
	pub(crate) is_portal: bool,
	/// Name of the prepared statement this portal was bound from. Lookup
	/// only, never ownership.
	pub(crate) parent_prepared: Option<String>,

	// SQL payload
	sql_text: Arc<str>,
	sql_tag: Arc<str>,
	kind: Option<StatementKind>,
	payload: SqlPayload,
	select_artifact: Option<SelectArtifact>,
	insert_artifact: Option<InsertArtifact>,
	pub(crate) text_has_secret: bool,
	empty: bool,
	cache_hit: bool,
	pub(crate) deallocate_target: Option<String>,

	// parse-time descriptor, shared with clones of this entry
	parse_parameter_oids: Arc<Vec<DataTypeOid>>,
	out_parameter_oids: Arc<Vec<DataTypeOid>>,
	/// One `(type, geo flags)` pair per result column.
	result_columns: Arc<Vec<ColumnDesc>>,

	// bind-time state
	param_value_count: usize,
	param_format_codes: BitSet,
	select_format_codes: BitSet,
	select_format_code_count: usize,
	arena: ParameterArena,

	// cursor state
	cursor: Option<Box<dyn Cursor>>,
	resend_cursor_record: bool,
	return_row_count: u64,
	total_return_row_count: u64,
	return_row_count_to_be_sent: u64,
	return_row_count_limit: u64,

	// execution bookkeeping
	affected_row_count: u64,
	parse_executed: bool,

	// stage flags
	pub(crate) state_parse: bool,
	pub(crate) state_bind: bool,
	state_desc: DescribeState,
	pub(crate) state_exec: bool,
	pub(crate) state_closed: bool,
	state_sync: SyncState,

	// error state
	error: bool,
	error_message: String,
	error_position: i32,
	stale_plan_error: bool,

	max_recompile_attempts: u32,
}

impl PipelineEntry {
	pub fn new(max_recompile_attempts: u32) -> Self {
		Self {
			prepared_statement_name: None,
			portal_name: None,
			is_prepared: false,
			is_portal: false,
			parent_prepared: None,
			sql_text: Arc::from(""),
			sql_tag: Arc::from(""),
			kind: None,
			payload: SqlPayload::None,
			select_artifact: None,
			insert_artifact: None,
			text_has_secret: false,
			empty: false,
			cache_hit: false,
			deallocate_target: None,
			parse_parameter_oids: Arc::new(Vec::new()),
			out_parameter_oids: Arc::new(Vec::new()),
			result_columns: Arc::new(Vec::new()),
			param_value_count: 0,
			param_format_codes: BitSet::default(),
			select_format_codes: BitSet::default(),
			select_format_code_count: 0,
			arena: ParameterArena::new(),
			cursor: None,
			resend_cursor_record: false,
			return_row_count: 0,
			total_return_row_count: 0,
			return_row_count_to_be_sent: 0,
			return_row_count_limit: 0,
			affected_row_count: 0,
			parse_executed: false,
			state_parse: false,
			state_bind: false,
			state_desc: DescribeState::None,
			state_exec: false,
			state_closed: false,
			state_sync: SyncState::Parse,
			error: false,
			error_message: String::new(),
			error_position: -1,
			stale_plan_error: false,
			max_recompile_attempts: max_recompile_attempts.max(1),
		}
	}

	pub fn statement_name(&self) -> &str {
		self.prepared_statement_name.as_deref().unwrap_or("")
	}

	pub fn portal_name(&self) -> &str {
		self.portal_name.as_deref().unwrap_or("")
	}

	pub fn sql_text(&self) -> &str {
		&self.sql_text
	}

	pub fn is_error(&self) -> bool {
		self.error
	}

	/// Whether this entry compiled into a cursor factory (SELECT-shaped).
	pub fn produces_result_set(&self) -> bool {
		matches!(self.payload, SqlPayload::Select(_))
	}

	pub fn out_parameter_oids(&self) -> &[DataTypeOid] {
		&self.out_parameter_oids
	}

	/// Marks this entry as a named prepared statement. The entry is about to
	/// be cached under that name, so everything it references is owned.
	pub fn set_prepared_statement(&mut self, name: &str) {
		self.is_prepared = true;
		self.prepared_statement_name = Some(name.to_string());
	}

	/// Marks this entry as a named portal bound from `parent`. The portal
	/// plays only that role; its parent statement remains a separate entry.
	pub fn set_portal(&mut self, name: &str, parent: Option<&str>) {
		self.is_portal = true;
		self.is_prepared = false;
		self.portal_name = Some(name.to_string());
		self.parent_prepared = parent.map(str::to_string);
	}

	/// CLOSE drops both roles: the entry retires after its next sync.
	pub fn set_state_closed(&mut self) {
		self.state_closed = true;
		self.is_portal = false;
		self.is_prepared = false;
	}

	pub fn set_return_row_count_limit(&mut self, limit: u64) {
		self.return_row_count_limit = limit;
	}

	// ---- PARSE ----

	pub fn of_empty(&mut self, sql: &str) {
		self.sql_text = Arc::from(sql);
		self.empty = true;
		self.cache_hit = true;
	}

	/// Adopts a cached SELECT artifact instead of compiling.
	pub fn of_select(&mut self, sql: &str, artifact: SelectArtifact) {
		self.sql_text = Arc::from(sql);
		self.empty = false;
		self.cache_hit = true;
		self.kind = Some(artifact.kind);
		self.sql_tag = Arc::clone(&artifact.tag);
		self.out_parameter_oids = Arc::clone(&artifact.out_parameter_oids);
		self.payload = SqlPayload::Select(Arc::clone(&artifact.factory));
		self.result_columns = Arc::new(artifact.factory.metadata().to_vec());
		self.select_artifact = Some(artifact);
	}

	/// Adopts a cached INSERT artifact instead of compiling.
	pub fn of_insert(&mut self, sql: &str, artifact: InsertArtifact) {
		self.sql_text = Arc::from(sql);
		self.empty = false;
		self.cache_hit = true;
		self.kind = Some(artifact.kind);
		self.sql_tag = Arc::clone(&artifact.tag);
		self.out_parameter_oids = Arc::clone(&artifact.out_parameter_oids);
		self.payload = SqlPayload::Insert(Arc::clone(&artifact.insert));
		self.insert_artifact = Some(artifact);
	}

	pub fn msg_parse_copy_parameter_types(&mut self, types: &[DataTypeOid]) {
		self.parse_parameter_oids = Arc::new(types.to_vec());
	}

	/// Compiles the SQL text through the engine and adopts the result. Also
	/// used by the stale-plan retry loops.
	pub async fn compile_new_sql(&mut self, engine: &mut dyn Engine, sql: &str) -> Result<(), SqlError> {
		self.sql_text = Arc::from(sql);
		self.empty = sql.is_empty();
		if self.empty {
			self.cache_hit = true;
			return Ok(());
		}
		self.cache_hit = false;
		let declared: Vec<DataTypeOid> = self.parse_parameter_oids.to_vec();
		let compiled = engine.compile(sql, &declared).await?;
		self.out_parameter_oids = Arc::new(reconcile_parameter_types(&declared, &compiled.inferred_parameter_types));
		self.setup_after_compilation(compiled);
		self.copy_result_columns();
		Ok(())
	}

	fn setup_after_compilation(&mut self, compiled: CompiledSql) {
		self.kind = Some(compiled.kind);
		self.sql_tag = compiled.tag;
		self.text_has_secret = compiled.contains_secret;
		self.deallocate_target = compiled.deallocate_target;
		if compiled.executed_at_parse {
			// the compiler already did the work (CTAS, auto-commit DDL);
			// EXECUTE must not run this statement again
			self.parse_executed = true;
			self.affected_row_count = compiled.affected_rows;
		}
		self.payload = compiled.payload;
		match compiled.kind {
			StatementKind::Select | StatementKind::Explain => {
				if let SqlPayload::Select(factory) = &self.payload {
					self.select_artifact = Some(SelectArtifact {
						factory: Arc::clone(factory),
						kind: compiled.kind,
						tag: Arc::clone(&self.sql_tag),
						in_parameter_oids: Arc::clone(&self.parse_parameter_oids),
						out_parameter_oids: Arc::clone(&self.out_parameter_oids),
					});
				}
			}
			// PSEUDO_SELECT output is not worth caching: no artifact means
			// the retirement path leaves it alone
			StatementKind::PseudoSelect => {}
			StatementKind::Insert => {
				if let SqlPayload::Insert(insert) = &self.payload {
					self.insert_artifact = Some(InsertArtifact {
						insert: Arc::clone(insert),
						kind: compiled.kind,
						tag: Arc::clone(&self.sql_tag),
						in_parameter_oids: Arc::clone(&self.parse_parameter_oids),
						out_parameter_oids: Arc::clone(&self.out_parameter_oids),
						has_bind_variables: !self.out_parameter_oids.is_empty(),
					});
				}
			}
			_ => {}
		}
	}

	fn copy_result_columns(&mut self) {
		if let SqlPayload::Select(factory) = &self.payload {
			self.result_columns = Arc::new(factory.metadata().to_vec());
		}
	}

	/// Shallow-shares the parse-time fields into a fresh entry so a still
	/// streaming entry can keep its cursor while the prepared statement is
	/// re-bound. Only immutable descriptor lists and the compiled payload
	/// are shared; all per-execution state starts clean.
	pub fn copy_parsed(&self) -> PipelineEntry {
		let mut copy = PipelineEntry::new(self.max_recompile_attempts);
		copy.cache_hit = self.cache_hit;
		copy.empty = self.empty;
		copy.sql_text = Arc::clone(&self.sql_text);
		copy.sql_tag = Arc::clone(&self.sql_tag);
		copy.kind = self.kind;
		copy.payload = self.payload.clone();
		copy.select_artifact = self.select_artifact.clone();
		copy.insert_artifact = self.insert_artifact.clone();
		copy.text_has_secret = self.text_has_secret;
		copy.parent_prepared = self.parent_prepared.clone();
		copy.is_prepared = self.is_prepared;
		copy.prepared_statement_name = self.prepared_statement_name.clone();
		copy.parse_parameter_oids = Arc::clone(&self.parse_parameter_oids);
		copy.out_parameter_oids = Arc::clone(&self.out_parameter_oids);
		copy.result_columns = Arc::clone(&self.result_columns);
		copy
	}

	// ---- BIND ----

	pub fn msg_bind_copy_parameter_format_codes(&mut self, codes: &[FormatCode], value_count: i16) {
		self.param_value_count = value_count.max(0) as usize;
		spread_parameter_format_codes(codes, self.param_value_count, &mut self.param_format_codes);
	}

	/// Starts ingesting a BIND value block of `area_size` bytes.
	pub fn msg_bind_begin_parameter_values(&mut self, area_size: usize) {
		self.arena.begin(area_size);
	}

	/// Feeds value-block bytes; returns `Incomplete` when the network frame
	/// ended short of the declared block, in which case the caller re-enters
	/// with more bytes once they arrive.
	pub fn msg_bind_ingest_parameter_values(&mut self, chunk: &[u8]) -> ArenaStatus {
		self.arena.ingest(chunk)
	}

	/// Captures result-column format codes. Kept across executions: a
	/// suspended portal must keep serving the formats the client bound, even
	/// after its plan is invalidated.
	pub fn msg_bind_copy_select_format_codes(&mut self, codes: &[FormatCode]) {
		self.select_format_code_count = codes.len();
		self.select_format_codes.clear();
		for (i, code) in codes.iter().enumerate() {
			if *code == FormatCode::Binary {
				self.select_format_codes.set(i);
			}
		}
	}

	fn execution_context(&self) -> Result<ExecutionContext<'_>, SqlError> {
		if !self.arena.is_complete() {
			return Err(SqlError::new("bind value block is incomplete"));
		}
		let binds = decode_bind_variables(
			self.arena.values(),
			self.param_value_count,
			&self.param_format_codes,
			&self.out_parameter_oids,
		)
		.map_err(|e| SqlError::new(e.to_string()))?;
		Ok(ExecutionContext {
			binds,
			cache_hit: self.cache_hit,
			contains_secret: self.text_has_secret,
		})
	}

	// ---- EXECUTE ----

	/// Runs the engine-side work for this entry and returns the new
	/// transaction state. Failures are captured into the entry's error sink;
	/// the next sync call reports them as an ERROR_RESPONSE.
	pub async fn msg_execute(
		&mut self,
		engine: &mut dyn Engine,
		transaction: TransactionState,
		caches: &mut StatementCaches,
		pending_writers: &mut PendingWriters,
	) -> TransactionState {
		// do not execute anything that has been parse-executed
		if self.parse_executed {
			self.parse_executed = false;
			return transaction;
		}
		match self.dispatch_execute(engine, transaction, caches, pending_writers).await {
			Ok(new_state) => new_state,
			Err(e) => {
				self.capture_sql_error(e);
				// the transaction is poisoned the moment a statement fails,
				// not at sync time: EXECUTEs already pipelined behind this
				// one must skip their writes
				if transaction == TransactionState::Active {
					TransactionState::Error
				} else {
					transaction
				}
			}
		}
	}

	async fn dispatch_execute(
		&mut self,
		engine: &mut dyn Engine,
		transaction: TransactionState,
		caches: &mut StatementCaches,
		pending_writers: &mut PendingWriters,
	) -> Result<TransactionState, SqlError> {
		match self.kind {
			Some(StatementKind::Select) | Some(StatementKind::Explain) | Some(StatementKind::PseudoSelect) => {
				self.execute_select(engine).await?;
				Ok(transaction)
			}
			Some(StatementKind::Insert) | Some(StatementKind::InsertAsSelect) => {
				self.execute_insert(engine, transaction, caches, pending_writers).await?;
				Ok(transaction)
			}
			Some(StatementKind::Update) => {
				self.execute_update(engine, transaction, pending_writers).await?;
				Ok(transaction)
			}
			Some(StatementKind::Ddl) => {
				self.execute_ddl(engine, transaction).await?;
				Ok(transaction)
			}
			Some(StatementKind::Begin) => Ok(TransactionState::Active),
			Some(StatementKind::Commit) => {
				free_pending_writers(pending_writers, true)?;
				Ok(TransactionState::None)
			}
			Some(StatementKind::Rollback) => {
				free_pending_writers(pending_writers, false)?;
				Ok(TransactionState::None)
			}
			Some(StatementKind::Set) => Ok(transaction),
			Some(StatementKind::Deallocate) => {
				// deallocation arrives as a protocol CLOSE message; the SQL
				// spelling is rejected rather than half-supported
				Err(SqlError::new("DEALLOCATE is only supported as a protocol Close message"))
			}
			Some(StatementKind::CreateTableAsSelect) | None => {
				// unclassified DDL that was not parse-executed runs directly
				if !self.empty && self.kind.is_none() {
					self.affected_row_count = engine.ddl(&self.sql_text.clone()).await?;
				}
				Ok(transaction)
			}
		}
	}

	async fn execute_select(&mut self, engine: &mut dyn Engine) -> Result<(), SqlError> {
		if self.cursor.is_some() {
			// resuming a suspended portal; the cursor keeps its position
			return Ok(());
		}
		engine.circuit_breaker().reset_timer();
		let old_columns = Arc::clone(&self.result_columns);
		for attempt in 1..=self.max_recompile_attempts {
			let factory = match &self.payload {
				SqlPayload::Select(factory) => Arc::clone(factory),
				_ => return Err(SqlError::new("statement does not produce a result set")),
			};
			let opened = {
				let cx = self.execution_context()?;
				factory.open(&cx)
			};
			match opened {
				Ok(cursor) => {
					self.cursor = Some(cursor);
					self.total_return_row_count = 0;
					return Ok(());
				}
				Err(EngineError::TableReferenceOutOfDate) => {
					if attempt == self.max_recompile_attempts {
						self.select_artifact = None;
						return Err(SqlError::new("table reference is out of date"));
					}
					self.cache_hit = false;
					let sql = Arc::clone(&self.sql_text);
					if let Err(e) = self.compile_new_sql(engine, &sql).await {
						self.select_artifact = None;
						return Err(e);
					}
					self.validate_metadata_after_recompile(&old_columns)?;
				}
				Err(EngineError::Sql(e)) => {
					// un-cache the erroneous SQL
					self.select_artifact = None;
					return Err(e);
				}
			}
		}
		Err(SqlError::new("table reference is out of date"))
	}

	/// After a recompile inside a prepared statement the result shape must
	/// not have changed: strict clients compare it against the row
	/// description they already hold.
	fn validate_metadata_after_recompile(&mut self, old_columns: &[ColumnDesc]) -> Result<(), SqlError> {
		if !self.is_prepared && self.parent_prepared.is_none() {
			return Ok(());
		}
		let new_columns = match &self.payload {
			SqlPayload::Select(factory) => factory.metadata().to_vec(),
			_ => Vec::new(),
		};
		let unchanged = old_columns.len() == new_columns.len()
			&& old_columns
				.iter()
				.zip(new_columns.iter())
				.all(|(a, b)| a.name == b.name && a.column_type == b.column_type);
		if unchanged {
			Ok(())
		} else {
			self.stale_plan_error = true;
			Err(SqlError::new("cached plan must not change result type"))
		}
	}

	async fn execute_insert(
		&mut self,
		engine: &mut dyn Engine,
		transaction: TransactionState,
		caches: &mut StatementCaches,
		pending_writers: &mut PendingWriters,
	) -> Result<(), SqlError> {
		if transaction == TransactionState::Error {
			// skip execution until the client rolls back
			return Ok(());
		}
		let in_transaction = transaction == TransactionState::Active;
		for attempt in 1..=self.max_recompile_attempts {
			let insert = match &self.payload {
				SqlPayload::Insert(insert) => Arc::clone(insert),
				_ => return Err(SqlError::new("statement is not an insert")),
			};
			let step = (|| -> Result<(u64, Option<Box<dyn TableWriter>>), EngineError> {
				let cx = self.execution_context().map_err(EngineError::Sql)?;
				let mut source = PendingAwareWriterSource {
					pending: &mut *pending_writers,
					inner: engine.writer_source(),
				};
				let mut method = insert.create_method(&cx, &mut source)?;
				let affected = method.execute()?;
				if in_transaction {
					// commit is deferred to COMMIT; the writer joins the
					// pending map so the transaction can resolve it
					Ok((affected, Some(method.pop_writer())))
				} else {
					// implicit single-statement transaction
					method.commit()?;
					Ok((affected, None))
				}
			})();
			match step {
				Ok((affected, writer)) => {
					self.affected_row_count = affected;
					if let Some(writer) = writer {
						pending_writers.insert(writer.table(), writer);
					}
					if let Some(artifact) = &self.insert_artifact {
						if artifact.has_bind_variables {
							caches.put_insert(self.sql_text.to_string(), artifact.clone());
						}
					}
					return Ok(());
				}
				Err(EngineError::TableReferenceOutOfDate) => {
					if attempt == self.max_recompile_attempts {
						return Err(SqlError::new("table reference is out of date"));
					}
					self.insert_artifact = None;
					let sql = Arc::clone(&self.sql_text);
					self.compile_new_sql(engine, &sql).await?;
				}
				Err(EngineError::Sql(e)) => return Err(e),
			}
		}
		Err(SqlError::new("table reference is out of date"))
	}

	async fn execute_update(
		&mut self,
		engine: &mut dyn Engine,
		transaction: TransactionState,
		pending_writers: &mut PendingWriters,
	) -> Result<(), SqlError> {
		if transaction == TransactionState::Error {
			return Ok(());
		}
		for attempt in 1..=self.max_recompile_attempts {
			let update = match &self.payload {
				SqlPayload::Update(update) => Arc::clone(update),
				_ => return Err(SqlError::new("statement is not an update")),
			};
			let step = if let Some(writer) = pending_writers.get_mut(&update.table()) {
				// the update must see the pending rows: commit the writer
				// first, then apply against the clean baseline
				match writer.commit() {
					Ok(_) => {
						let cx = self.execution_context()?;
						writer.apply_update(update.as_ref(), &cx)
					}
					Err(e) => Err(e),
				}
			} else {
				let cx = self.execution_context()?;
				update.execute(&cx).await
			};
			match step {
				Ok(affected) => {
					self.affected_row_count = affected;
					return Ok(());
				}
				Err(EngineError::TableReferenceOutOfDate) => {
					if attempt == self.max_recompile_attempts {
						return Err(SqlError::new("table reference is out of date"));
					}
					let sql = Arc::clone(&self.sql_text);
					self.compile_new_sql(engine, &sql).await?;
				}
				Err(EngineError::Sql(e)) => return Err(e),
			}
		}
		Err(SqlError::new("table reference is out of date"))
	}

	async fn execute_ddl(&mut self, engine: &mut dyn Engine, transaction: TransactionState) -> Result<(), SqlError> {
		if transaction == TransactionState::Error {
			return Ok(());
		}
		for attempt in 1..=self.max_recompile_attempts {
			let op = match &self.payload {
				SqlPayload::Ddl(op) => Arc::clone(op),
				// plain auto-commit DDL was parse-executed; anything else
				// still classified as DDL runs through the engine directly
				_ => {
					if !self.empty {
						self.affected_row_count = engine.ddl(&self.sql_text.clone()).await?;
					}
					return Ok(());
				}
			};
			let step = {
				let cx = self.execution_context()?;
				op.execute(&cx).await
			};
			match step {
				Ok(affected) => {
					self.affected_row_count = affected;
					return Ok(());
				}
				Err(EngineError::TableReferenceOutOfDate) => {
					if attempt == self.max_recompile_attempts {
						return Err(SqlError::new("table reference is out of date"));
					}
					let sql = Arc::clone(&self.sql_text);
					self.compile_new_sql(engine, &sql).await?;
				}
				Err(EngineError::Sql(e)) => return Err(e),
			}
		}
		Err(SqlError::new("table reference is out of date"))
	}

	// ---- error sink ----

	pub fn capture_sql_error(&mut self, e: SqlError) {
		if !self.error {
			self.error_message = e.message;
			self.error_position = e.position;
		}
		self.error = true;
	}

	// ---- SYNC ----

	/// Streams this entry's response into the output buffer. Re-entrant: on
	/// [StreamBreak] the caller flushes or waits, then calls again; the
	/// entry resumes exactly where it left off. Returns whether the entry
	/// ended in error.
	pub fn sync(
		&mut self,
		out: &mut OutputBuffer,
		pending_writers: &mut PendingWriters,
		transaction: &mut TransactionState,
	) -> Result<bool, StreamBreak> {
		if self.error {
			self.out_error(out, pending_writers, transaction)?;
			self.clear_state();
			return Ok(true);
		}

		if self.state_sync == SyncState::Parse {
			if self.state_parse {
				out.put_simple_message(MESSAGE_TYPE_PARSE_COMPLETE)?;
			}
			self.state_sync = SyncState::Bind;
		}
		if self.state_sync == SyncState::Bind {
			if self.state_bind {
				out.put_simple_message(MESSAGE_TYPE_BIND_COMPLETE)?;
			}
			self.state_sync = SyncState::Describe;
		}
		if self.state_sync == SyncState::Describe {
			match self.state_desc {
				DescribeState::Statement => {
					// named prepared statement: parameter metadata first
					self.out_parameter_type_description(out)?;
					self.out_row_description_or_no_data(out)?;
				}
				DescribeState::Portal | DescribeState::SimpleQuery => {
					self.out_row_description_or_no_data(out)?;
				}
				DescribeState::None => {}
			}
			self.state_sync = SyncState::Execute;
		}
		if matches!(self.state_sync, SyncState::Execute | SyncState::Stream) {
			if self.empty && !self.is_prepared && !self.is_portal {
				// the JDBC driver does not expect EMPTY_QUERY for an empty
				// prepared statement, only for the anonymous flow
				out.put_simple_message(MESSAGE_TYPE_EMPTY_QUERY)?;
				self.state_sync = SyncState::Done;
			} else if self.state_exec {
				match self.kind {
					Some(StatementKind::Select) | Some(StatementKind::Explain) | Some(StatementKind::PseudoSelect) => {
						self.out_cursor(out)?;
					}
					Some(StatementKind::Insert) | Some(StatementKind::InsertAsSelect) => {
						out.bookmark();
						let frame = out.begin_message(MESSAGE_TYPE_COMMAND_COMPLETE)?;
						out.put_slice(self.sql_tag.as_bytes())?;
						out.put_slice(b" 0 ")?;
						out.put_cstr(&self.affected_row_count.to_string())?;
						out.finish_message(frame);
						self.state_sync = SyncState::Done;
					}
					Some(StatementKind::Update) | Some(StatementKind::CreateTableAsSelect) => {
						self.out_command_complete(out, self.affected_row_count)?;
						self.state_sync = SyncState::Done;
					}
					_ => {
						// bare tag, e.g. CREATE TABLE, BEGIN, SET
						out.bookmark();
						let frame = out.begin_message(MESSAGE_TYPE_COMMAND_COMPLETE)?;
						out.put_cstr(&self.sql_tag)?;
						out.finish_message(frame);
						self.state_sync = SyncState::Done;
					}
				}
			}
		}

		// set by the cursor streamer; handled outside the staged flow above
		match self.state_sync {
			SyncState::CursorComplete => {
				self.cursor = None;
				self.out_command_complete(out, self.total_return_row_count)?;
			}
			SyncState::Suspended => {
				out.put_simple_message(MESSAGE_TYPE_PORTAL_SUSPENDED)?;
				if !self.is_portal {
					// an anonymous portal cannot be executed again, so the
					// cursor is closed even though it was not exhausted
					self.cursor = None;
				}
			}
			_ => {}
		}

		if self.state_closed {
			out.put_simple_message(MESSAGE_TYPE_CLOSE_COMPLETE)?;
		}

		let errored = self.error;
		if errored {
			self.out_error(out, pending_writers, transaction)?;
		}

		// prepare for the next execution iteration, in case the entry is a
		// prepared statement or portal; identity and payload stay
		self.clear_state();
		Ok(errored)
	}

	fn clear_state(&mut self) {
		self.error = false;
		self.error_message.clear();
		self.error_position = -1;
		self.stale_plan_error = false;
		self.state_sync = SyncState::Parse;
		self.state_parse = false;
		self.state_bind = false;
		self.state_desc = DescribeState::None;
		self.state_exec = false;
		self.state_closed = false;
	}

	pub fn set_state_desc_statement(&mut self) {
		self.state_desc = DescribeState::Statement;
	}

	pub fn set_state_desc_portal(&mut self) {
		self.state_desc = DescribeState::Portal;
	}

	pub fn set_state_desc_simple_query(&mut self) {
		self.state_desc = DescribeState::SimpleQuery;
	}

	// ---- emission helpers ----

	fn out_parameter_type_description(&mut self, out: &mut OutputBuffer) -> Result<(), OutOfSpace> {
		let frame = out.begin_message(MESSAGE_TYPE_PARAMETER_DESCRIPTION)?;
		out.put_i16(self.out_parameter_oids.len() as i16)?;
		for oid in self.out_parameter_oids.iter() {
			out.put_u32((*oid).into())?;
		}
		out.finish_message(frame);
		Ok(())
	}

	fn out_row_description_or_no_data(&mut self, out: &mut OutputBuffer) -> Result<(), OutOfSpace> {
		if matches!(self.payload, SqlPayload::Select(_)) {
			self.out_row_description(out)
		} else {
			out.put_simple_message(MESSAGE_TYPE_NO_DATA)
		}
	}

	fn out_row_description(&mut self, out: &mut OutputBuffer) -> Result<(), OutOfSpace> {
		let columns = Arc::clone(&self.result_columns);
		let frame = out.begin_message(MESSAGE_TYPE_ROW_DESCRIPTION)?;
		out.put_i16(columns.len() as i16)?;
		for (i, column) in columns.iter().enumerate() {
			// NULL-typed columns (e.g. literal NULL projections) are
			// described as text
			let column_type = if column.column_type == ColumnType::Null {
				ColumnType::Varchar
			} else {
				column.column_type
			};
			let oid = column_type.to_oid();
			out.put_cstr(&column.name)?;
			out.put_i32(0)?; // table oid
			out.put_i16((i + 1) as i16)?; // ordinal, 1-based
			out.put_u32(oid.into())?;
			out.put_i16(oid.size_bytes())?;
			out.put_i32(-1)?; // type modifier
			out.put_i16(if self.column_format_is_binary(i, column.column_type) {
				1
			} else {
				0
			})?;
		}
		out.finish_message(frame);
		out.bookmark();
		Ok(())
	}

	/// Per-column output format: binary columns are always binary (never
	/// hex-encoded), otherwise the client's bound format codes apply, with a
	/// single code broadcast across all columns.
	fn column_format_is_binary(&self, index: usize, column_type: ColumnType) -> bool {
		if column_type == ColumnType::Binary {
			return true;
		}
		if self.select_format_code_count > 1 {
			self.select_format_codes.get(index)
		} else {
			self.select_format_codes.get(0)
		}
	}

	fn out_command_complete(&mut self, out: &mut OutputBuffer, row_count: u64) -> Result<(), OutOfSpace> {
		out.bookmark();
		let frame = out.begin_message(MESSAGE_TYPE_COMMAND_COMPLETE)?;
		out.put_slice(self.sql_tag.as_bytes())?;
		out.put_u8(b' ')?;
		out.put_cstr(&row_count.to_string())?;
		out.finish_message(frame);
		Ok(())
	}

	fn out_compute_cursor_size(&mut self) {
		self.return_row_count = 0;
		self.return_row_count_to_be_sent = if self.return_row_count_limit > 0 {
			self.return_row_count_limit
		} else {
			u64::MAX
		};
	}

	fn out_cursor(&mut self, out: &mut OutputBuffer) -> Result<(), StreamBreak> {
		if self.state_sync == SyncState::Execute {
			self.out_compute_cursor_size();
			self.state_sync = SyncState::Stream;
		}
		out.bookmark();
		let columns = Arc::clone(&self.result_columns);

		'stream: {
			if self.resend_cursor_record {
				// the previous attempt overflowed mid-row; the cursor has
				// not moved, so the same record goes out again in full
				match self.out_record(out, &columns) {
					Ok(()) => {}
					Err(RecordBreak::Space) => return Err(StreamBreak::OutOfSpace),
					Err(RecordBreak::Abort(e)) => {
						out.reset_to_bookmark();
						self.capture_sql_error(e);
						break 'stream;
					}
				}
			}
			while self.return_row_count < self.return_row_count_to_be_sent {
				let advanced = match self.cursor.as_mut() {
					Some(cursor) => cursor.advance(),
					None => Ok(false),
				};
				match advanced {
					Ok(true) => {
						self.resend_cursor_record = true;
						match self.out_record(out, &columns) {
							Ok(()) => {}
							Err(RecordBreak::Space) => return Err(StreamBreak::OutOfSpace),
							Err(RecordBreak::Abort(e)) => {
								out.reset_to_bookmark();
								self.capture_sql_error(e);
								break 'stream;
							}
						}
					}
					Ok(false) => break 'stream,
					Err(CursorError::DataUnavailable(event)) => {
						out.reset_to_bookmark();
						return Err(StreamBreak::Paused(event));
					}
					Err(CursorError::Sql(e)) => {
						out.reset_to_bookmark();
						self.capture_sql_error(e);
						break 'stream;
					}
				}
			}
		}

		// the loop ended because the cursor ran dry (complete) or because
		// the batch limit was reached (suspend); the suffix differs
		self.state_sync = if self.return_row_count < self.return_row_count_to_be_sent {
			SyncState::CursorComplete
		} else {
			SyncState::Suspended
		};
		Ok(())
	}

	fn out_record(&mut self, out: &mut OutputBuffer, columns: &[ColumnDesc]) -> Result<(), RecordBreak> {
		{
			let record = match self.cursor.as_ref() {
				Some(cursor) => cursor.record(),
				None => return Ok(()),
			};
			let frame = out.begin_row(columns.len())?;
			for (i, column) in columns.iter().enumerate() {
				let binary = self.column_format_is_binary(i, column.column_type);
				write_column(out, record, i, column, binary)?;
			}
			out.finish_message(frame);
		}
		out.bookmark();
		self.resend_cursor_record = false;
		self.return_row_count += 1;
		self.total_return_row_count += 1;
		Ok(())
	}

	fn out_error(
		&mut self,
		out: &mut OutputBuffer,
		pending_writers: &mut PendingWriters,
		transaction: &mut TransactionState,
	) -> Result<(), StreamBreak> {
		// a failed statement poisons the transaction and rolls back
		// everything the pipeline had pending
		let _ = free_pending_writers(pending_writers, false);
		if *transaction == TransactionState::Active {
			*transaction = TransactionState::Error;
		}
		out.reset_to_bookmark();
		let frame = out.begin_message(MESSAGE_TYPE_ERROR_RESPONSE)?;
		out.put_u8(b'C')?;
		if self.stale_plan_error {
			// what PostgreSQL sends when recompiling a query produced a
			// different result set; clients restart the query on seeing it
			out.put_cstr(SqlError::STALE_PLAN_SQLSTATE)?;
			out.put_u8(b'R')?;
			out.put_cstr("RevalidateCachedQuery")?;
		} else {
			out.put_cstr("00000")?;
		}
		out.put_u8(b'M')?;
		out.put_cstr(&self.error_message)?;
		out.put_u8(b'S')?;
		out.put_cstr("ERROR")?;
		if self.error_position > -1 {
			out.put_u8(b'P')?;
			out.put_cstr(&(self.error_position + 1).to_string())?;
		}
		out.put_u8(0)?;
		out.finish_message(frame);
		out.bookmark();
		Ok(())
	}

	/// Hands compiled artifacts back to the per-connection caches. Named
	/// statements and portals keep theirs; only retiring anonymous entries
	/// donate.
	pub fn cache_if_possible(&mut self, caches: &mut StatementCaches) {
		if self.is_portal || self.is_prepared {
			return;
		}
		if let Some(artifact) = self.select_artifact.take() {
			// the factory produces one cursor at a time; close ours first
			self.cursor = None;
			self.payload = SqlPayload::None;
			caches.put_select(self.sql_text.to_string(), artifact);
		} else if let Some(artifact) = self.insert_artifact.take() {
			self.payload = SqlPayload::None;
			caches.put_insert(self.sql_text.to_string(), artifact);
		}
	}
}

impl SqlError {
	/// SQLSTATE reported for stale-plan errors (feature_not_supported).
	pub const STALE_PLAN_SQLSTATE: &'static str = "0A000";
}

const GEOHASH_ALPHABET: &[u8; 32] = b"0123456789bcdefghjkmnpqrstuvwxyz";

fn write_text(out: &mut OutputBuffer, text: &str) -> Result<(), OutOfSpace> {
	out.put_sized(text.as_bytes())
}

fn write_column(
	out: &mut OutputBuffer,
	record: &dyn Record,
	i: usize,
	column: &ColumnDesc,
	binary: bool,
) -> Result<(), RecordBreak> {
	match column.column_type {
		ColumnType::Bool => match record.get_bool(i) {
			Some(value) => {
				if binary {
					out.put_sized(&[value as u8])?;
				} else {
					out.put_sized(if value { b"t" } else { b"f" })?;
				}
			}
			None => out.put_null_value()?,
		},
		ColumnType::Byte => match record.get_byte(i) {
			Some(value) => {
				if binary {
					// bytes travel as 2-byte wire shorts
					out.put_i32(2)?;
					out.put_i16(value as i16)?;
				} else {
					write_text(out, &value.to_string())?;
				}
			}
			None => out.put_null_value()?,
		},
		ColumnType::Short => match record.get_short(i) {
			Some(value) => {
				if binary {
					out.put_i32(2)?;
					out.put_i16(value)?;
				} else {
					write_text(out, &value.to_string())?;
				}
			}
			None => out.put_null_value()?,
		},
		ColumnType::Char => match record.get_char(i) {
			Some(value) => {
				let mut buf = [0u8; 4];
				out.put_sized(value.encode_utf8(&mut buf).as_bytes())?;
			}
			None => out.put_null_value()?,
		},
		ColumnType::Int => match record.get_int(i) {
			Some(value) => {
				if binary {
					out.put_i32(4)?;
					out.put_i32(value)?;
				} else {
					write_text(out, &value.to_string())?;
				}
			}
			None => out.put_null_value()?,
		},
		ColumnType::Long => match record.get_long(i) {
			Some(value) => {
				if binary {
					out.put_i32(8)?;
					out.put_i64(value)?;
				} else {
					write_text(out, &value.to_string())?;
				}
			}
			None => out.put_null_value()?,
		},
		ColumnType::Float => match record.get_float(i) {
			Some(value) => {
				if binary {
					out.put_i32(4)?;
					out.put_u32(value.to_bits())?;
				} else {
					write_text(out, &value.to_string())?;
				}
			}
			None => out.put_null_value()?,
		},
		ColumnType::Double => match record.get_double(i) {
			Some(value) => {
				if binary {
					out.put_i32(8)?;
					out.put_i64(value.to_bits() as i64)?;
				} else {
					write_text(out, &value.to_string())?;
				}
			}
			None => out.put_null_value()?,
		},
		ColumnType::Timestamp => match record.get_timestamp(i) {
			Some(micros) => {
				if binary {
					out.put_i32(8)?;
					// the wire epoch starts at 2000 rather than 1970
					out.put_i64(micros - PG_EPOCH_OFFSET_USEC)?;
				} else {
					write_text(out, &format_timestamp_text(micros))?;
				}
			}
			None => out.put_null_value()?,
		},
		ColumnType::Date => match record.get_date(i) {
			Some(millis) => {
				if binary {
					out.put_i32(8)?;
					out.put_i64(millis * 1000 - PG_EPOCH_OFFSET_USEC)?;
				} else {
					write_text(out, &format_date_text(millis))?;
				}
			}
			None => out.put_null_value()?,
		},
		ColumnType::Uuid => match record.get_uuid(i) {
			Some((hi, lo)) => {
				if binary {
					out.put_i32(16)?;
					out.put_i64(hi)?;
					out.put_i64(lo)?;
				} else {
					let uuid = Uuid::from_u64_pair(hi as u64, lo as u64);
					write_text(out, &uuid.to_string())?;
				}
			}
			None => out.put_null_value()?,
		},
		// symbols are interned strings; on the wire they are just strings
		ColumnType::Varchar | ColumnType::Symbol => match record.get_str(i) {
			Some(value) => out.put_sized(value.as_bytes())?,
			None => out.put_null_value()?,
		},
		ColumnType::Binary => match record.get_bin(i) {
			Some(value) => {
				if value.len() >= out.max_blob_size() {
					// oversized blobs abort the result set
					return Err(RecordBreak::Abort(SqlError::new(format!(
						"blob is too large: {} bytes, max {} (column {})",
						value.len(),
						out.max_blob_size(),
						i
					))));
				}
				out.put_sized(value)?;
			}
			None => out.put_null_value()?,
		},
		ColumnType::GeoHash => match record.get_geo(i) {
			Some(value) => write_text(out, &format_geohash_text(value, column.geo_flags))?,
			None => out.put_null_value()?,
		},
		ColumnType::Null => out.put_null_value()?,
	}
	Ok(())
}

fn format_timestamp_text(micros: i64) -> String {
	match DateTime::from_timestamp_micros(micros) {
		Some(dt) => dt.format("%Y-%m-%d %H:%M:%S%.6f").to_string(),
		None => micros.to_string(),
	}
}

fn format_date_text(millis: i64) -> String {
	match DateTime::from_timestamp_millis(millis) {
		Some(dt) => dt.format("%Y-%m-%d %H:%M:%S%.3f+00").to_string(),
		None => millis.to_string(),
	}
}

/// Negative flags render that many base-32 chars, positive flags that many
/// raw bits.
fn format_geohash_text(value: u64, flags: i32) -> String {
	if flags < 0 {
		let chars = (-flags) as usize;
		let mut text = String::with_capacity(chars);
		for i in 0..chars {
			let shift = 5 * (chars - 1 - i);
			text.push(GEOHASH_ALPHABET[((value >> shift) & 0x1f) as usize] as char);
		}
		text
	} else {
		let bits = flags as usize;
		let mut text = String::with_capacity(bits);
		for i in 0..bits {
			let shift = bits - 1 - i;
			text.push(if (value >> shift) & 1 == 1 { '1' } else { '0' });
		}
		text
	}
}

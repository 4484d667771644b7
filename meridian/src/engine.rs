//! Contains core interface definitions for backend SQL engines.
//!
//! The wire front-end is engine-agnostic: it compiles SQL through [Engine],
//! streams rows from [Cursor]s and routes writes through [TableWriter]s. An
//! engine adapter implements these traits; everything else in this crate
//! consumes them.

#![allow(missing_docs)]

use crate::protocol::{DataTypeOid, TransactionStatus};
use async_trait::async_trait;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Engine-side column types. A columnar store is expected to hand the
/// front-end one of these per result column or bind slot.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ColumnType {
	Bool,
	/// 8-bit integer; travels as a 2-byte short on the binary wire.
	Byte,
	Short,
	Char,
	Int,
	Long,
	Float,
	Double,
	/// Microseconds since the unix epoch.
	Timestamp,
	/// Milliseconds since the unix epoch.
	Date,
	Uuid,
	/// Variable-length UTF-8.
	Varchar,
	/// Interned string; indistinguishable from varchar on the wire.
	Symbol,
	/// Opaque blob.
	Binary,
	/// Geohash; rendering is controlled by the column's bit flags.
	GeoHash,
	/// The type of `NULL` literals; described as text on the wire.
	Null,
}

impl ColumnType {
	/// The wire type this column is reported and encoded as.
	pub fn to_oid(self) -> DataTypeOid {
		match self {
			ColumnType::Bool => DataTypeOid::Bool,
			ColumnType::Byte | ColumnType::Short => DataTypeOid::Int2,
			ColumnType::Char => DataTypeOid::Char,
			ColumnType::Int => DataTypeOid::Int4,
			ColumnType::Long => DataTypeOid::Int8,
			ColumnType::Float => DataTypeOid::Float4,
			ColumnType::Double => DataTypeOid::Float8,
			// dates carry a time component in this engine, so both travel
			// as binary timestamps rather than 4-byte wire dates
			ColumnType::Timestamp | ColumnType::Date => DataTypeOid::Timestamp,
			ColumnType::Uuid => DataTypeOid::Uuid,
			ColumnType::Binary => DataTypeOid::Bytea,
			ColumnType::Varchar | ColumnType::Symbol | ColumnType::GeoHash | ColumnType::Null => DataTypeOid::Varchar,
		}
	}
}

/// A result-set column: name, engine type, and the geohash bit flags
/// (positive = render that many bits, negative = render that many base-32
/// chars, zero for non-geo columns).
#[derive(Debug, Clone)]
pub struct ColumnDesc {
	pub name: String,
	pub column_type: ColumnType,
	pub geo_flags: i32,
}

impl ColumnDesc {
	pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
		Self {
			name: name.into(),
			column_type,
			geo_flags: 0,
		}
	}
}

/// One row of a result set. Accessors return `None` for NULL; implementations
/// only need the accessors for types their columns actually carry.
#[allow(unused_variables)]
pub trait Record {
	fn get_bool(&self, col: usize) -> Option<bool> {
		None
	}
	fn get_byte(&self, col: usize) -> Option<i8> {
		None
	}
	fn get_short(&self, col: usize) -> Option<i16> {
		None
	}
	fn get_char(&self, col: usize) -> Option<char> {
		None
	}
	fn get_int(&self, col: usize) -> Option<i32> {
		None
	}
	fn get_long(&self, col: usize) -> Option<i64> {
		None
	}
	fn get_float(&self, col: usize) -> Option<f32> {
		None
	}
	fn get_double(&self, col: usize) -> Option<f64> {
		None
	}
	/// Microseconds since the unix epoch.
	fn get_timestamp(&self, col: usize) -> Option<i64> {
		None
	}
	/// Milliseconds since the unix epoch.
	fn get_date(&self, col: usize) -> Option<i64> {
		None
	}
	/// `(hi, lo)` halves of the 128-bit value.
	fn get_uuid(&self, col: usize) -> Option<(i64, i64)> {
		None
	}
	fn get_str(&self, col: usize) -> Option<&str> {
		None
	}
	fn get_bin(&self, col: usize) -> Option<&[u8]> {
		None
	}
	fn get_geo(&self, col: usize) -> Option<u64> {
		None
	}
}

static NEXT_WAKE_EVENT_ID: AtomicU64 = AtomicU64::new(0);

/// Wake-up handle carried by a cursor pause. The party that raised the pause
/// calls [WakeEvent::notify] when the data is ready; the connection awaits
/// [WakeEvent::wait] before re-entering sync.
#[derive(Clone)]
pub struct WakeEvent {
	id: u64,
	notify: Arc<Notify>,
}

impl WakeEvent {
	pub fn new() -> Self {
		Self {
			id: NEXT_WAKE_EVENT_ID.fetch_add(1, Ordering::Relaxed),
			notify: Arc::new(Notify::new()),
		}
	}

	pub fn id(&self) -> u64 {
		self.id
	}

	pub fn notify(&self) {
		self.notify.notify_one();
	}

	pub async fn wait(&self) {
		self.notify.notified().await;
	}
}

impl Default for WakeEvent {
	fn default() -> Self {
		Self::new()
	}
}

impl fmt::Debug for WakeEvent {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("WakeEvent").field("id", &self.id).finish()
	}
}

/// A compilation or execution failure reported by the engine.
#[derive(thiserror::Error, Debug, Clone)]
#[error("{message}")]
pub struct SqlError {
	pub message: String,
	/// 0-based position into the SQL text, -1 when not applicable.
	pub position: i32,
}

impl SqlError {
	pub fn new(message: impl Into<String>) -> Self {
		Self {
			message: message.into(),
			position: -1,
		}
	}

	pub fn at(position: i32, message: impl Into<String>) -> Self {
		Self {
			message: message.into(),
			position,
		}
	}
}

#[derive(thiserror::Error, Debug)]
pub enum EngineError {
	/// A cached artifact refers to metadata that has drifted since it was
	/// compiled. The caller recompiles and retries.
	#[error("table reference is out of date")]
	TableReferenceOutOfDate,
	#[error(transparent)]
	Sql(#[from] SqlError),
}

#[derive(thiserror::Error, Debug)]
pub enum CursorError {
	/// The next row lives in cold storage. Not an error: the connection parks
	/// on the event and re-enters the fetch once it fires.
	#[error("data unavailable, waiting on event {}", .0.id())]
	DataUnavailable(WakeEvent),
	#[error(transparent)]
	Sql(#[from] SqlError),
}

/// A typed bind variable handed to the engine. String and blob variants
/// borrow the entry's parameter arena and are only valid for the duration of
/// a single execute call; an engine that needs them longer must copy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BindValue<'a> {
	/// NULL, typed so the engine can still plan around it.
	Null(ColumnType),
	Bool(bool),
	Byte(i8),
	Short(i16),
	Char(char),
	Int(i32),
	Long(i64),
	Float(f32),
	Double(f64),
	/// Microseconds since the unix epoch.
	Timestamp(i64),
	/// Milliseconds since the unix epoch.
	Date(i64),
	/// `(hi, lo)` halves.
	Uuid(i64, i64),
	Varchar(&'a str),
	Binary(&'a [u8]),
}

/// The bind variables for one execution, in slot order.
#[derive(Debug, Default)]
pub struct BindVariables<'a> {
	values: Vec<BindValue<'a>>,
}

impl<'a> BindVariables<'a> {
	pub fn with_capacity(n: usize) -> Self {
		Self {
			values: Vec::with_capacity(n),
		}
	}

	pub fn push(&mut self, value: BindValue<'a>) {
		self.values.push(value);
	}

	pub fn get(&self, index: usize) -> Option<&BindValue<'a>> {
		self.values.get(index)
	}

	pub fn len(&self) -> usize {
		self.values.len()
	}

	pub fn is_empty(&self) -> bool {
		self.values.is_empty()
	}
}

/// Everything the engine sees about the current execution.
pub struct ExecutionContext<'a> {
	pub binds: BindVariables<'a>,
	/// Whether the artifact being executed came from a cache.
	pub cache_hit: bool,
	/// Suppresses logging of the SQL text downstream.
	pub contains_secret: bool,
}

/// Produces cursors for a compiled SELECT-like statement.
pub trait CursorFactory: Send + Sync {
	fn metadata(&self) -> &[ColumnDesc];

	/// Opens a cursor over the result set. Fails with
	/// [EngineError::TableReferenceOutOfDate] when the underlying table has
	/// changed since compilation.
	fn open(&self, cx: &ExecutionContext<'_>) -> Result<Box<dyn Cursor>, EngineError>;
}

/// A streaming result-set cursor. Iteration is synchronous and re-entrant:
/// `advance` moves to the next row if one exists, and the current row stays
/// readable through `record` until the next `advance`.
pub trait Cursor: Send {
	fn advance(&mut self) -> Result<bool, CursorError>;

	fn record(&self) -> &dyn Record;
}

impl fmt::Debug for dyn Cursor {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("Cursor")
	}
}

/// Identifies a table for writer bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableToken(Arc<str>);

impl TableToken {
	pub fn new(name: impl Into<Arc<str>>) -> Self {
		Self(name.into())
	}

	pub fn name(&self) -> &str {
		&self.0
	}
}

/// A table writer checked out from the engine. Writers accumulate uncommitted
/// rows; the connection keeps them in its pending-writer map until the
/// transaction resolves.
pub trait TableWriter: Send {
	fn table(&self) -> TableToken;

	fn commit(&mut self) -> Result<u64, EngineError>;

	fn rollback(&mut self);

	/// Applies an update through this writer. Only called after a commit, so
	/// the update sees a clean baseline.
	fn apply_update(&mut self, op: &dyn UpdateOperation, cx: &ExecutionContext<'_>) -> Result<u64, EngineError>;

	/// For engine-side downcasts; insert methods stage rows through the
	/// writer they were created against.
	fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Hands out table writers; owned by the connection's engine side.
pub trait WriterSource: Send {
	fn acquire(&mut self, table: &TableToken) -> Result<Box<dyn TableWriter>, EngineError>;
}

/// A compiled INSERT. Creating a method binds the current variable values
/// against a writer; the method is then executed and either committed in
/// place or left pending.
pub trait InsertOperation: Send + Sync {
	fn table(&self) -> TableToken;

	fn create_method(
		&self,
		cx: &ExecutionContext<'_>,
		writers: &mut dyn WriterSource,
	) -> Result<Box<dyn InsertMethod>, EngineError>;
}

pub trait InsertMethod: Send {
	fn execute(&mut self) -> Result<u64, EngineError>;

	fn commit(&mut self) -> Result<(), EngineError>;

	/// Surrenders the writer so it can join the pending-writer map.
	fn pop_writer(self: Box<Self>) -> Box<dyn TableWriter>;
}

/// A compiled UPDATE. Executes directly against the engine, or through an
/// already-pending writer for its table.
#[async_trait]
pub trait UpdateOperation: Send + Sync {
	fn table(&self) -> TableToken;

	async fn execute(&self, cx: &ExecutionContext<'_>) -> Result<u64, EngineError>;

	/// For writer-side application; the engine downcasts to its own type.
	fn as_any(&self) -> &dyn Any;
}

/// A compiled DDL-class operation (ALTER and friends) executed at EXECUTE
/// time rather than during PARSE.
#[async_trait]
pub trait DdlOperation: Send + Sync {
	async fn execute(&self, cx: &ExecutionContext<'_>) -> Result<u64, EngineError>;
}

/// Classifies a compiled statement; drives response framing and the command
/// tag suffix.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StatementKind {
	Select,
	Explain,
	/// SELECT-shaped output from a non-SELECT source; never cached.
	PseudoSelect,
	Insert,
	InsertAsSelect,
	Update,
	CreateTableAsSelect,
	/// DDL with a deferred operation, or plain auto-commit DDL.
	Ddl,
	Begin,
	Commit,
	Rollback,
	Set,
	Deallocate,
}

impl StatementKind {
	pub fn is_select_like(self) -> bool {
		matches!(self, StatementKind::Select | StatementKind::Explain | StatementKind::PseudoSelect)
	}
}

/// The payload of a compiled statement. Heavy artifacts are shared so a
/// pipeline entry clone and the statement caches can hold the same one.
#[derive(Clone)]
pub enum SqlPayload {
	Select(Arc<dyn CursorFactory>),
	Insert(Arc<dyn InsertOperation>),
	Update(Arc<dyn UpdateOperation>),
	Ddl(Arc<dyn DdlOperation>),
	/// Transaction control, SET, parse-executed DDL: nothing to run at
	/// EXECUTE time.
	None,
}

impl fmt::Debug for SqlPayload {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let name = match self {
			SqlPayload::Select(_) => "Select",
			SqlPayload::Insert(_) => "Insert",
			SqlPayload::Update(_) => "Update",
			SqlPayload::Ddl(_) => "Ddl",
			SqlPayload::None => "None",
		};
		f.write_str(name)
	}
}

/// The result of compiling one SQL text.
#[derive(Debug, Clone)]
pub struct CompiledSql {
	pub kind: StatementKind,
	/// Command tag used in COMMAND_COMPLETE, e.g. `SELECT` or `CREATE TABLE`.
	pub tag: Arc<str>,
	pub payload: SqlPayload,
	/// Compiler-inferred bind variable types, per slot; `None` where the
	/// compiler could not infer one.
	pub inferred_parameter_types: Vec<Option<ColumnType>>,
	/// True when the statement's work happened during compilation (CTAS,
	/// INSERT-AS-SELECT, auto-commit DDL). EXECUTE is then a no-op.
	pub executed_at_parse: bool,
	pub affected_rows: u64,
	/// SQL carries credentials; its text must not be logged.
	pub contains_secret: bool,
	/// Target name of a DEALLOCATE statement.
	pub deallocate_target: Option<String>,
}

/// Cancellation hook. Reset when a SELECT starts executing; cursor iteration
/// inside the engine polls it and fails the fetch on expiry.
pub trait CircuitBreaker: Send + Sync {
	fn reset_timer(&self);

	fn is_timer_set(&self) -> bool;
}

/// Breaker used when the engine does not supply one.
pub struct NoopCircuitBreaker;

impl CircuitBreaker for NoopCircuitBreaker {
	fn reset_timer(&self) {}

	fn is_timer_set(&self) -> bool {
		true
	}
}

/// The engine seam. Each connection is allocated one engine instance, which
/// it uses to compile statements and acquire writers.
#[async_trait]
pub trait Engine: Send + 'static {
	async fn compile(&mut self, sql: &str, declared_types: &[DataTypeOid]) -> Result<CompiledSql, SqlError>;

	/// Executes DDL that reaches EXECUTE without a compiled operation.
	async fn ddl(&mut self, sql: &str) -> Result<u64, SqlError>;

	fn writer_source(&mut self) -> &mut dyn WriterSource;

	fn circuit_breaker(&self) -> Arc<dyn CircuitBreaker> {
		Arc::new(NoopCircuitBreaker)
	}
}

/// Writers parked by in-transaction INSERTs, keyed by table. Owned by the
/// connection; committed or rolled back as one group.
pub type PendingWriters = HashMap<TableToken, Box<dyn TableWriter>>;

/// Connection-level transaction state as the dispatcher sees it.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TransactionState {
	None,
	Active,
	/// A statement failed inside an open transaction; writes are skipped
	/// until ROLLBACK.
	Error,
}

impl TransactionState {
	pub fn status(self) -> TransactionStatus {
		match self {
			TransactionState::None => TransactionStatus::Idle,
			TransactionState::Active => TransactionStatus::Transaction,
			TransactionState::Error => TransactionStatus::FailedTransaction,
		}
	}
}

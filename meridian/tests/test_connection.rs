use async_trait::async_trait;
use meridian::engine::{
	ColumnDesc, ColumnType, CompiledSql, Cursor, CursorError, CursorFactory, Engine, EngineError, ExecutionContext,
	Record, SqlError, SqlPayload, StatementKind, TableToken, TableWriter, WriterSource,
};
use meridian::protocol::DataTypeOid;
use meridian::server::{self, ServerOptions};
use std::sync::Arc;
use tokio_postgres::{connect, NoTls, SimpleQueryMessage};

struct ScalarRecord {
	value: i32,
}

impl Record for ScalarRecord {
	fn get_int(&self, _col: usize) -> Option<i32> {
		Some(self.value)
	}
}

struct RangeCursor {
	next: i32,
	limit: i32,
	current: ScalarRecord,
}

impl Cursor for RangeCursor {
	fn advance(&mut self) -> Result<bool, CursorError> {
		if self.next >= self.limit {
			return Ok(false);
		}
		self.current = ScalarRecord { value: self.next };
		self.next += 1;
		Ok(true)
	}

	fn record(&self) -> &dyn Record {
		&self.current
	}
}

struct RangeFactory {
	columns: Vec<ColumnDesc>,
	start: i32,
	limit: i32,
}

impl RangeFactory {
	fn new(column: &str, start: i32, limit: i32) -> Self {
		Self {
			columns: vec![ColumnDesc::new(column, ColumnType::Int)],
			start,
			limit,
		}
	}
}

impl CursorFactory for RangeFactory {
	fn metadata(&self) -> &[ColumnDesc] {
		&self.columns
	}

	fn open(&self, _cx: &ExecutionContext<'_>) -> Result<Box<dyn Cursor>, EngineError> {
		Ok(Box::new(RangeCursor {
			next: self.start,
			limit: self.limit,
			current: ScalarRecord { value: 0 },
		}))
	}
}

struct ReadOnlyWriters;

impl WriterSource for ReadOnlyWriters {
	fn acquire(&mut self, _table: &TableToken) -> Result<Box<dyn TableWriter>, EngineError> {
		Err(EngineError::Sql(SqlError::new("engine is read-only")))
	}
}

struct ReturnSingleScalarEngine {
	writers: ReadOnlyWriters,
}

fn plain(kind: StatementKind, tag: &str, payload: SqlPayload) -> CompiledSql {
	CompiledSql {
		kind,
		tag: Arc::from(tag),
		payload,
		inferred_parameter_types: Vec::new(),
		executed_at_parse: false,
		affected_rows: 0,
		contains_secret: false,
		deallocate_target: None,
	}
}

#[async_trait]
impl Engine for ReturnSingleScalarEngine {
	async fn compile(&mut self, sql: &str, _declared: &[DataTypeOid]) -> Result<CompiledSql, SqlError> {
		let lowered = sql.trim().to_ascii_lowercase();
		if lowered.starts_with("begin") {
			return Ok(plain(StatementKind::Begin, "BEGIN", SqlPayload::None));
		}
		if lowered.starts_with("commit") {
			return Ok(plain(StatementKind::Commit, "COMMIT", SqlPayload::None));
		}
		if lowered.starts_with("rollback") {
			return Ok(plain(StatementKind::Rollback, "ROLLBACK", SqlPayload::None));
		}
		if lowered.starts_with("set") {
			return Ok(plain(StatementKind::Set, "SET", SqlPayload::None));
		}
		if lowered.contains("test_error") {
			return Err(SqlError::new("test error"));
		}
		if lowered.contains("series") {
			return Ok(plain(
				StatementKind::Select,
				"SELECT",
				SqlPayload::Select(Arc::new(RangeFactory::new("n", 0, 10))),
			));
		}
		Ok(plain(
			StatementKind::Select,
			"SELECT",
			SqlPayload::Select(Arc::new(RangeFactory::new("test", 1, 2))),
		))
	}

	async fn ddl(&mut self, _sql: &str) -> Result<u64, SqlError> {
		Ok(0)
	}

	fn writer_source(&mut self) -> &mut dyn WriterSource {
		&mut self.writers
	}
}

async fn setup() -> tokio_postgres::Client {
	let port = server::run_background(
		ServerOptions::new().with_port(0),
		Arc::new(|| {
			Box::pin(async {
				ReturnSingleScalarEngine {
					writers: ReadOnlyWriters,
				}
			})
		}),
	)
	.await
	.unwrap();

	let (client, conn) = connect(&format!("postgres://localhost:{}/test", port), NoTls)
		.await
		.expect("failed to init client");

	tokio::spawn(async move { conn.await.unwrap() });

	client
}

#[tokio::test]
async fn extended_query_flow() {
	let client = setup().await;
	let row = client.query_one("select 1", &[]).await.unwrap();
	let value: i32 = row.get(0);
	assert_eq!(value, 1);
}

#[tokio::test]
async fn simple_query_flow() {
	let client = setup().await;
	let messages = client.simple_query("select 1").await.unwrap();

	let mut rows_seen = 0;
	let mut num_rows = None;
	for message in &messages {
		match message {
			SimpleQueryMessage::Row(row) => {
				assert_eq!(row.get(0), Some("1"));
				rows_seen += 1;
			}
			SimpleQueryMessage::CommandComplete(rows) => num_rows = Some(*rows),
			_ => {}
		}
	}

	assert_eq!(rows_seen, 1);
	assert_eq!(num_rows, Some(1));
}

#[tokio::test]
async fn error_handling() {
	let client = setup().await;
	let err = client
		.query_one("select test_error from blah", &[])
		.await
		.expect_err("expected error in query");

	let db_err = err.as_db_error().expect("expected db error");
	assert_eq!(db_err.message(), "test error");
}

#[tokio::test]
async fn set_variable_noop() {
	let client = setup().await;
	client
		.simple_query("set somevar to 'my_val'")
		.await
		.expect("failed to set var");
}

#[tokio::test]
async fn empty_simple_query() {
	let client = setup().await;
	client.simple_query("").await.unwrap();
}

#[tokio::test]
async fn empty_extended_query() {
	let client = setup().await;
	client.query("", &[]).await.unwrap();
}

#[tokio::test]
async fn prepared_statement_reuse() {
	let client = setup().await;
	let statement = client.prepare("select 1").await.unwrap();
	for _ in 0..3 {
		let row = client.query_one(&statement, &[]).await.unwrap();
		let value: i32 = row.get(0);
		assert_eq!(value, 1);
	}
}

#[tokio::test]
async fn portal_batches() {
	let mut client = setup().await;
	let txn = client.transaction().await.unwrap();
	let portal = txn.bind("select n from series", &[]).await.unwrap();

	let mut seen = Vec::new();
	loop {
		let rows = txn.query_portal(&portal, 3).await.unwrap();
		let batch_len = rows.len();
		for row in rows {
			let value: i32 = row.get(0);
			seen.push(value);
		}
		if batch_len < 3 {
			break;
		}
	}
	txn.commit().await.unwrap();

	// no repetition, no loss across suspends
	assert_eq!(seen, (0..10).collect::<Vec<_>>());
}

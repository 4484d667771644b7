//! Column-major storage: tables, snapshots, records, scan cursors and
//! writers. Tables carry a version that DDL bumps; compiled plans pin the
//! version they saw and fail with `TableReferenceOutOfDate` when it moved.

use meridian::bind::parse_timestamp_text;
use meridian::engine::{
	ColumnDesc, ColumnType, Cursor, CursorError, EngineError, ExecutionContext, Record, SqlError, TableToken,
	TableWriter, UpdateOperation, WakeEvent, WriterSource,
};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// One cell. Storage is column-major (a `Vec<Value>` per column); `Null`
/// stands in for absent values of any type.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
	Bool(bool),
	Int(i32),
	Long(i64),
	Double(f64),
	/// Microseconds since the unix epoch.
	Timestamp(i64),
	Str(String),
	Uuid(i64, i64),
	Bin(Vec<u8>),
	Null,
}

impl Value {
	/// Coerces a value to a column type, parsing strings where the target
	/// is temporal and widening integers where lossless.
	pub fn coerce(self, target: ColumnType) -> Result<Value, SqlError> {
		let value = match (self, target) {
			(Value::Null, _) => Value::Null,
			(Value::Int(v), ColumnType::Long) => Value::Long(v as i64),
			(Value::Long(v), ColumnType::Int) => {
				i32::try_from(v).map(Value::Int).map_err(|_| SqlError::new("integer out of range"))?
			}
			(Value::Int(v), ColumnType::Double) => Value::Double(v as f64),
			(Value::Long(v), ColumnType::Double) => Value::Double(v as f64),
			(Value::Long(v), ColumnType::Timestamp) => Value::Timestamp(v),
			(Value::Str(s), ColumnType::Timestamp) => match parse_timestamp_text(&s) {
				Some(us) => Value::Timestamp(us),
				None => return Err(SqlError::new(format!("invalid timestamp: {}", s))),
			},
			(v, _) => v,
		};
		Ok(value)
	}

	fn column_type(&self) -> ColumnType {
		match self {
			Value::Bool(_) => ColumnType::Bool,
			Value::Int(_) => ColumnType::Int,
			Value::Long(_) => ColumnType::Long,
			Value::Double(_) => ColumnType::Double,
			Value::Timestamp(_) => ColumnType::Timestamp,
			Value::Str(_) => ColumnType::Varchar,
			Value::Uuid(..) => ColumnType::Uuid,
			Value::Bin(_) => ColumnType::Binary,
			Value::Null => ColumnType::Null,
		}
	}
}

/// The engine type a literal of this value would have.
pub fn value_column_type(value: &Value) -> ColumnType {
	value.column_type()
}

#[derive(Debug, Clone)]
pub struct Column {
	pub name: String,
	pub column_type: ColumnType,
	pub data: Vec<Value>,
}

#[derive(Debug, Clone)]
pub struct Table {
	pub name: String,
	/// Bumped by every schema change; plans pin it.
	pub version: u64,
	pub columns: Vec<Column>,
	/// Row indexes that simulate a cold-partition fetch: the first scan to
	/// touch one pauses once before serving it.
	pub cold_rows: Vec<usize>,
}

impl Table {
	pub fn row_count(&self) -> usize {
		self.columns.first().map_or(0, |c| c.data.len())
	}

	pub fn metadata(&self) -> Vec<ColumnDesc> {
		self.columns
			.iter()
			.map(|c| ColumnDesc::new(c.name.clone(), c.column_type))
			.collect()
	}

	pub fn column_index(&self, name: &str) -> Option<usize> {
		self.columns.iter().position(|c| c.name == name)
	}

	fn push_row(&mut self, row: Vec<Value>) {
		for (column, value) in self.columns.iter_mut().zip(row) {
			column.data.push(value);
		}
	}

	/// Row-major view of the table, for scans.
	pub fn rows(&self) -> Vec<Vec<Value>> {
		(0..self.row_count())
			.map(|r| self.columns.iter().map(|c| c.data[r].clone()).collect())
			.collect()
	}
}

/// The shared table catalog. Cloning shares the underlying tables.
#[derive(Clone, Default)]
pub struct Catalog {
	inner: Arc<RwLock<HashMap<String, Table>>>,
}

impl Catalog {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn create_table(&self, name: &str, columns: Vec<(String, ColumnType)>) -> Result<(), SqlError> {
		let mut tables = self.inner.write().expect("catalog lock");
		if tables.contains_key(name) {
			return Err(SqlError::new(format!("table already exists: {}", name)));
		}
		tables.insert(
			name.to_string(),
			Table {
				name: name.to_string(),
				version: 0,
				columns: columns
					.into_iter()
					.map(|(name, column_type)| Column {
						name,
						column_type,
						data: Vec::new(),
					})
					.collect(),
				cold_rows: Vec::new(),
			},
		);
		Ok(())
	}

	pub fn drop_table(&self, name: &str) -> Result<(), SqlError> {
		let mut tables = self.inner.write().expect("catalog lock");
		tables
			.remove(name)
			.map(|_| ())
			.ok_or_else(|| SqlError::new(format!("table does not exist: {}", name)))
	}

	/// Adds a column, bumping the version so cached plans go stale.
	pub fn add_column(&self, table: &str, column: &str, column_type: ColumnType) -> Result<(), SqlError> {
		self.with_table_mut(table, |t| {
			let rows = t.row_count();
			t.columns.push(Column {
				name: column.to_string(),
				column_type,
				data: vec![Value::Null; rows],
			});
			t.version += 1;
		})
	}

	/// Bumps the version without changing the schema. Stands in for schema
	/// changes this catalog does not model.
	pub fn touch(&self, table: &str) -> Result<(), SqlError> {
		self.with_table_mut(table, |t| t.version += 1)
	}

	/// Marks a row as cold: the next scan pauses once before serving it.
	pub fn mark_cold(&self, table: &str, row: usize) -> Result<(), SqlError> {
		self.with_table_mut(table, |t| t.cold_rows.push(row))
	}

	pub fn version_of(&self, table: &str) -> Result<u64, SqlError> {
		self.with_table(table, |t| t.version)
	}

	/// A point-in-time copy for scanning.
	pub fn snapshot(&self, table: &str) -> Result<Table, SqlError> {
		self.with_table(table, Table::clone)
	}

	pub fn with_table<R>(&self, name: &str, f: impl FnOnce(&Table) -> R) -> Result<R, SqlError> {
		let tables = self.inner.read().expect("catalog lock");
		tables
			.get(name)
			.map(f)
			.ok_or_else(|| SqlError::new(format!("table does not exist: {}", name)))
	}

	pub fn with_table_mut<R>(&self, name: &str, f: impl FnOnce(&mut Table) -> R) -> Result<R, SqlError> {
		let mut tables = self.inner.write().expect("catalog lock");
		tables
			.get_mut(name)
			.map(f)
			.ok_or_else(|| SqlError::new(format!("table does not exist: {}", name)))
	}

	pub fn append_rows(&self, name: &str, rows: Vec<Vec<Value>>) -> Result<u64, SqlError> {
		self.with_table_mut(name, |t| {
			let n = rows.len() as u64;
			for row in rows {
				t.push_row(row);
			}
			n
		})
	}
}

/// A materialized result row.
pub struct RowRecord {
	pub values: Vec<Value>,
}

impl Record for RowRecord {
	fn get_bool(&self, col: usize) -> Option<bool> {
		match self.values.get(col)? {
			Value::Bool(v) => Some(*v),
			_ => None,
		}
	}

	fn get_int(&self, col: usize) -> Option<i32> {
		match self.values.get(col)? {
			Value::Int(v) => Some(*v),
			Value::Long(v) => i32::try_from(*v).ok(),
			_ => None,
		}
	}

	fn get_long(&self, col: usize) -> Option<i64> {
		match self.values.get(col)? {
			Value::Long(v) => Some(*v),
			Value::Int(v) => Some(*v as i64),
			_ => None,
		}
	}

	fn get_double(&self, col: usize) -> Option<f64> {
		match self.values.get(col)? {
			Value::Double(v) => Some(*v),
			Value::Int(v) => Some(*v as f64),
			Value::Long(v) => Some(*v as f64),
			_ => None,
		}
	}

	fn get_timestamp(&self, col: usize) -> Option<i64> {
		match self.values.get(col)? {
			Value::Timestamp(v) => Some(*v),
			_ => None,
		}
	}

	fn get_uuid(&self, col: usize) -> Option<(i64, i64)> {
		match self.values.get(col)? {
			Value::Uuid(hi, lo) => Some((*hi, *lo)),
			_ => None,
		}
	}

	fn get_str(&self, col: usize) -> Option<&str> {
		match self.values.get(col)? {
			Value::Str(v) => Some(v),
			_ => None,
		}
	}

	fn get_bin(&self, col: usize) -> Option<&[u8]> {
		match self.values.get(col)? {
			Value::Bin(v) => Some(v),
			_ => None,
		}
	}
}

/// Cursor over materialized rows. Rows marked cold pause the scan once,
/// waking the connection shortly after (the "fetch" completes on a timer).
pub struct MemCursor {
	rows: Vec<Vec<Value>>,
	pos: usize,
	current: RowRecord,
	cold_rows: HashSet<usize>,
	fetched: HashSet<usize>,
}

impl MemCursor {
	pub fn new(rows: Vec<Vec<Value>>, cold_rows: Vec<usize>) -> Self {
		Self {
			rows,
			pos: 0,
			current: RowRecord { values: Vec::new() },
			cold_rows: cold_rows.into_iter().collect(),
			fetched: HashSet::new(),
		}
	}
}

impl Cursor for MemCursor {
	fn advance(&mut self) -> Result<bool, CursorError> {
		if self.cold_rows.contains(&self.pos) && !self.fetched.contains(&self.pos) {
			self.fetched.insert(self.pos);
			let event = WakeEvent::new();
			let wake = event.clone();
			tokio::spawn(async move {
				tokio::time::sleep(Duration::from_millis(5)).await;
				wake.notify();
			});
			return Err(CursorError::DataUnavailable(event));
		}
		if self.pos >= self.rows.len() {
			return Ok(false);
		}
		self.current = RowRecord {
			values: self.rows[self.pos].clone(),
		};
		self.pos += 1;
		Ok(true)
	}

	fn record(&self) -> &dyn Record {
		&self.current
	}
}

/// A table writer: staged rows become visible at commit.
pub struct MemTableWriter {
	catalog: Catalog,
	table: TableToken,
	staged: Vec<Vec<Value>>,
}

impl MemTableWriter {
	pub fn new(catalog: Catalog, table: TableToken) -> Self {
		Self {
			catalog,
			table,
			staged: Vec::new(),
		}
	}

	pub fn stage(&mut self, rows: Vec<Vec<Value>>) -> u64 {
		let n = rows.len() as u64;
		self.staged.extend(rows);
		n
	}
}

impl TableWriter for MemTableWriter {
	fn table(&self) -> TableToken {
		self.table.clone()
	}

	fn commit(&mut self) -> Result<u64, EngineError> {
		let rows = std::mem::take(&mut self.staged);
		Ok(self.catalog.append_rows(self.table.name(), rows)?)
	}

	fn rollback(&mut self) {
		self.staged.clear();
	}

	fn apply_update(&mut self, op: &dyn UpdateOperation, cx: &ExecutionContext<'_>) -> Result<u64, EngineError> {
		let update = op
			.as_any()
			.downcast_ref::<crate::sql::MemUpdateOperation>()
			.ok_or_else(|| EngineError::Sql(SqlError::new("foreign update operation")))?;
		update.apply(cx)
	}

	fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
		self
	}
}

/// Hands out writers over the shared catalog.
pub struct MemWriterSource {
	catalog: Catalog,
}

impl MemWriterSource {
	pub fn new(catalog: Catalog) -> Self {
		Self { catalog }
	}
}

impl WriterSource for MemWriterSource {
	fn acquire(&mut self, table: &TableToken) -> Result<Box<dyn TableWriter>, EngineError> {
		// verify the table exists before checking out a writer
		self.catalog.with_table(table.name(), |_| ())?;
		Ok(Box::new(MemTableWriter::new(self.catalog.clone(), table.clone())))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn sample_catalog() -> Catalog {
		let catalog = Catalog::new();
		catalog
			.create_table(
				"trades",
				vec![
					("price".to_string(), ColumnType::Double),
					("qty".to_string(), ColumnType::Long),
				],
			)
			.unwrap();
		catalog
	}

	#[test]
	fn append_and_scan_rows() {
		let catalog = sample_catalog();
		catalog
			.append_rows(
				"trades",
				vec![
					vec![Value::Double(1.5), Value::Long(10)],
					vec![Value::Double(2.5), Value::Long(20)],
				],
			)
			.unwrap();

		let snapshot = catalog.snapshot("trades").unwrap();
		assert_eq!(snapshot.row_count(), 2);
		assert_eq!(snapshot.rows()[1][1], Value::Long(20));
	}

	#[test]
	fn add_column_bumps_version_and_backfills_nulls() {
		let catalog = sample_catalog();
		catalog.append_rows("trades", vec![vec![Value::Double(1.0), Value::Long(1)]]).unwrap();
		assert_eq!(catalog.version_of("trades").unwrap(), 0);

		catalog.add_column("trades", "venue", ColumnType::Varchar).unwrap();
		assert_eq!(catalog.version_of("trades").unwrap(), 1);

		let snapshot = catalog.snapshot("trades").unwrap();
		assert_eq!(snapshot.rows()[0][2], Value::Null);
	}

	#[test]
	fn writer_stages_until_commit() {
		let catalog = sample_catalog();
		let mut writer = MemTableWriter::new(catalog.clone(), TableToken::new("trades"));
		writer.stage(vec![vec![Value::Double(9.0), Value::Long(1)]]);
		assert_eq!(catalog.snapshot("trades").unwrap().row_count(), 0);

		writer.commit().unwrap();
		assert_eq!(catalog.snapshot("trades").unwrap().row_count(), 1);
	}

	#[test]
	fn writer_rollback_discards_staged_rows() {
		let catalog = sample_catalog();
		let mut writer = MemTableWriter::new(catalog.clone(), TableToken::new("trades"));
		writer.stage(vec![vec![Value::Double(9.0), Value::Long(1)]]);
		writer.rollback();
		writer.commit().unwrap();
		assert_eq!(catalog.snapshot("trades").unwrap().row_count(), 0);
	}

	#[test]
	fn coerce_parses_timestamp_strings() {
		let coerced = Value::Str("2024-01-01T00:00:00Z".to_string())
			.coerce(ColumnType::Timestamp)
			.unwrap();
		assert_eq!(coerced, Value::Timestamp(1_704_067_200_000_000));
	}
}

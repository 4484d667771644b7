//! Statement classification and trivial planning over the in-memory catalog.
//!
//! SQL text is parsed with sqlparser's Postgres dialect and lowered into the
//! compiled artifacts the wire front-end consumes: scan factories for
//! SELECT, staged-row operations for INSERT/UPDATE, deferred operations for
//! ALTER, and immediate execution for auto-commit DDL.

use crate::table::{value_column_type, Catalog, MemCursor, MemTableWriter, Value};
use async_trait::async_trait;
use meridian::bind::column_type_for_oid;
use meridian::engine::{
	BindValue, ColumnDesc, ColumnType, CompiledSql, CursorFactory, DdlOperation, EngineError, ExecutionContext,
	InsertMethod, InsertOperation, SqlError, SqlPayload, StatementKind, TableToken, TableWriter, WriterSource,
};
use meridian::protocol::DataTypeOid;
use sqlparser::ast::{
	self, ColumnDef, ObjectType, Select, SelectItem, SetExpr, Statement, TableFactor, TableWithJoins,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use std::any::Any;
use std::sync::Arc;

/// A lowered scalar expression: enough for projections, VALUES rows and
/// simple equality filters.
#[derive(Debug, Clone)]
pub(crate) enum Expr {
	Column(usize),
	Literal(Value),
	Parameter(usize),
}

impl Expr {
	fn evaluate(&self, row: Option<&[Value]>, cx: &ExecutionContext<'_>) -> Result<Value, SqlError> {
		match self {
			Expr::Column(index) => Ok(row
				.and_then(|r| r.get(*index))
				.cloned()
				.unwrap_or(Value::Null)),
			Expr::Literal(value) => Ok(value.clone()),
			Expr::Parameter(index) => match cx.binds.get(*index) {
				Some(bind) => Ok(bind_to_value(bind)),
				None => Err(SqlError::new(format!("missing bind variable ${}", index + 1))),
			},
		}
	}
}

fn bind_to_value(bind: &BindValue<'_>) -> Value {
	match bind {
		BindValue::Null(_) => Value::Null,
		BindValue::Bool(v) => Value::Bool(*v),
		BindValue::Byte(v) => Value::Int(*v as i32),
		BindValue::Short(v) => Value::Int(*v as i32),
		BindValue::Char(v) => Value::Str(v.to_string()),
		BindValue::Int(v) => Value::Int(*v),
		BindValue::Long(v) => Value::Long(*v),
		BindValue::Float(v) => Value::Double(*v as f64),
		BindValue::Double(v) => Value::Double(*v),
		BindValue::Timestamp(v) => Value::Timestamp(*v),
		BindValue::Date(v) => Value::Timestamp(*v * 1000),
		BindValue::Uuid(hi, lo) => Value::Uuid(*hi, *lo),
		// borrowed slices are only valid for this execution; own them now
		BindValue::Varchar(v) => Value::Str((*v).to_string()),
		BindValue::Binary(v) => Value::Bin(v.to_vec()),
	}
}

/// Tracks compiler-inferred bind variable types as expressions are lowered.
#[derive(Default)]
struct ParameterTypes {
	inferred: Vec<Option<ColumnType>>,
}

impl ParameterTypes {
	fn note(&mut self, index: usize, column_type: Option<ColumnType>) {
		if self.inferred.len() <= index {
			self.inferred.resize(index + 1, None);
		}
		if let Some(column_type) = column_type {
			self.inferred[index].get_or_insert(column_type);
		}
	}
}

fn object_name(name: &ast::ObjectName) -> String {
	name.0.last().map(|ident| ident.value.clone()).unwrap_or_default()
}

fn parse_single(sql: &str) -> Result<Statement, SqlError> {
	let statements =
		Parser::parse_sql(&PostgreSqlDialect {}, sql).map_err(|e| SqlError::new(format!("parse error: {}", e)))?;
	if statements.len() != 1 {
		return Err(SqlError::new("expected exactly one statement"));
	}
	Ok(statements.into_iter().next().expect("statement checked above"))
}

fn placeholder_index(text: &str) -> Option<usize> {
	text.strip_prefix('$')?.parse::<usize>().ok()?.checked_sub(1)
}

fn data_type_to_column_type(data_type: &ast::DataType) -> ColumnType {
	use ast::DataType;
	match data_type {
		DataType::Boolean => ColumnType::Bool,
		DataType::SmallInt(_) => ColumnType::Short,
		DataType::Int(_) | DataType::Integer(_) => ColumnType::Int,
		DataType::BigInt(_) => ColumnType::Long,
		DataType::Real | DataType::Float(_) => ColumnType::Float,
		DataType::Double | DataType::DoublePrecision => ColumnType::Double,
		DataType::Timestamp(..) | DataType::Datetime(_) => ColumnType::Timestamp,
		DataType::Date => ColumnType::Date,
		DataType::Uuid => ColumnType::Uuid,
		DataType::Bytea | DataType::Blob(_) => ColumnType::Binary,
		_ => ColumnType::Varchar,
	}
}

fn literal_value(value: &ast::Value) -> Result<Value, SqlError> {
	match value {
		ast::Value::Number(text, _) => {
			if text.contains('.') || text.contains('e') || text.contains('E') {
				text.parse::<f64>()
					.map(Value::Double)
					.map_err(|_| SqlError::new(format!("invalid number: {}", text)))
			} else {
				text.parse::<i64>()
					.map(Value::Long)
					.map_err(|_| SqlError::new(format!("invalid number: {}", text)))
			}
		}
		ast::Value::SingleQuotedString(text) => Ok(Value::Str(text.clone())),
		ast::Value::Boolean(v) => Ok(Value::Bool(*v)),
		ast::Value::Null => Ok(Value::Null),
		other => Err(SqlError::new(format!("unsupported literal: {}", other))),
	}
}

/// Lowers a sqlparser expression. `columns` is the scan's column list when a
/// FROM table is in scope; `hint` types bare parameters from context (e.g.
/// the target column of an INSERT).
fn lower_expr(
	expr: &ast::Expr,
	columns: Option<&[ColumnDesc]>,
	hint: Option<ColumnType>,
	params: &mut ParameterTypes,
	declared: &[DataTypeOid],
) -> Result<(Expr, ColumnType), SqlError> {
	match expr {
		ast::Expr::Identifier(ident) => {
			let columns = columns.ok_or_else(|| SqlError::new(format!("unknown column: {}", ident.value)))?;
			let index = columns
				.iter()
				.position(|c| c.name == ident.value)
				.ok_or_else(|| SqlError::new(format!("unknown column: {}", ident.value)))?;
			Ok((Expr::Column(index), columns[index].column_type))
		}
		ast::Expr::Value(ast::Value::Placeholder(text)) => {
			let index =
				placeholder_index(text).ok_or_else(|| SqlError::new(format!("invalid placeholder: {}", text)))?;
			// prefer the context hint, then the client's declared OID
			let declared_type = declared.get(index).copied().and_then(|oid| {
				if oid == DataTypeOid::Unspecified {
					None
				} else {
					Some(column_type_for_oid(oid))
				}
			});
			let inferred = hint.or(declared_type);
			params.note(index, inferred);
			Ok((Expr::Parameter(index), inferred.unwrap_or(ColumnType::Varchar)))
		}
		ast::Expr::Value(value) => {
			let value = literal_value(value)?;
			let column_type = value_column_type(&value);
			Ok((Expr::Literal(value), column_type))
		}
		ast::Expr::Cast { expr, data_type, .. } => {
			let target = data_type_to_column_type(data_type);
			let (lowered, _) = lower_expr(expr, columns, Some(target), params, declared)?;
			Ok((lowered, target))
		}
		ast::Expr::Nested(inner) => lower_expr(inner, columns, hint, params, declared),
		other => Err(SqlError::new(format!("unsupported expression: {}", other))),
	}
}

fn projection_name(item: &SelectItem, expr: &ast::Expr, index: usize) -> String {
	match item {
		SelectItem::ExprWithAlias { alias, .. } => alias.value.clone(),
		_ => match expr {
			ast::Expr::Identifier(ident) => ident.value.clone(),
			ast::Expr::Cast { expr, .. } => projection_name(item, expr, index),
			_ => format!("column{}", index + 1),
		},
	}
}

fn scan_table_name(from: &[TableWithJoins]) -> Result<Option<String>, SqlError> {
	match from {
		[] => Ok(None),
		[TableWithJoins { relation, joins }] if joins.is_empty() => match relation {
			TableFactor::Table { name, .. } => Ok(Some(object_name(name))),
			other => Err(SqlError::new(format!("unsupported table source: {}", other))),
		},
		_ => Err(SqlError::new("joins are not supported")),
	}
}

/// Scan-and-project factory. The plan pins the table version it was
/// compiled against; opening it later fails with
/// [EngineError::TableReferenceOutOfDate] if DDL has moved the table on.
pub struct MemSelectFactory {
	catalog: Catalog,
	table: Option<String>,
	compiled_version: u64,
	columns: Vec<ColumnDesc>,
	projection: Vec<Expr>,
	selection: Option<(Expr, Expr)>,
}

impl CursorFactory for MemSelectFactory {
	fn metadata(&self) -> &[ColumnDesc] {
		&self.columns
	}

	fn open(&self, cx: &ExecutionContext<'_>) -> Result<Box<dyn meridian::engine::Cursor>, EngineError> {
		let (source_rows, cold_rows) = match &self.table {
			Some(table) => {
				if self.catalog.version_of(table)? != self.compiled_version {
					return Err(EngineError::TableReferenceOutOfDate);
				}
				let snapshot = self.catalog.snapshot(table)?;
				(snapshot.rows(), snapshot.cold_rows.clone())
			}
			// projection without FROM: a single synthetic row
			None => (vec![Vec::new()], Vec::new()),
		};

		// bind variables only live for this call, so rows materialize here
		let mut rows = Vec::with_capacity(source_rows.len());
		for source in &source_rows {
			if let Some((left, right)) = &self.selection {
				let lhs = left.evaluate(Some(source), cx)?;
				let rhs = right.evaluate(Some(source), cx)?;
				if lhs != rhs {
					continue;
				}
			}
			let mut row = Vec::with_capacity(self.projection.len());
			for (expr, desc) in self.projection.iter().zip(&self.columns) {
				let value = expr.evaluate(Some(source), cx)?;
				row.push(value.coerce(desc.column_type)?);
			}
			rows.push(row);
		}
		Ok(Box::new(MemCursor::new(rows, cold_rows)))
	}
}

fn lower_select(
	catalog: &Catalog,
	select: &Select,
	params: &mut ParameterTypes,
	declared: &[DataTypeOid],
) -> Result<MemSelectFactory, SqlError> {
	let table = scan_table_name(&select.from)?;
	let (scan_columns, compiled_version) = match &table {
		Some(name) => (
			Some(catalog.with_table(name, |t| t.metadata())?),
			catalog.version_of(name)?,
		),
		None => (None, 0),
	};

	let mut projection = Vec::new();
	let mut columns = Vec::new();
	for (index, item) in select.projection.iter().enumerate() {
		match item {
			SelectItem::Wildcard(_) => {
				let scan = scan_columns
					.as_deref()
					.ok_or_else(|| SqlError::new("SELECT * requires a table"))?;
				for (i, column) in scan.iter().enumerate() {
					projection.push(Expr::Column(i));
					columns.push(column.clone());
				}
			}
			SelectItem::UnnamedExpr(expr) | SelectItem::ExprWithAlias { expr, .. } => {
				let (lowered, column_type) = lower_expr(expr, scan_columns.as_deref(), None, params, declared)?;
				projection.push(lowered);
				columns.push(ColumnDesc::new(projection_name(item, expr, index), column_type));
			}
			other => return Err(SqlError::new(format!("unsupported projection: {}", other))),
		}
	}

	let selection = match &select.selection {
		None => None,
		Some(ast::Expr::BinaryOp { left, op, right }) if *op == ast::BinaryOperator::Eq => {
			let (lhs, lhs_type) = lower_expr(left, scan_columns.as_deref(), None, params, declared)?;
			let (rhs, _) = lower_expr(right, scan_columns.as_deref(), Some(lhs_type), params, declared)?;
			Some((lhs, rhs))
		}
		Some(other) => return Err(SqlError::new(format!("unsupported predicate: {}", other))),
	};

	Ok(MemSelectFactory {
		catalog: catalog.clone(),
		table,
		compiled_version,
		columns,
		projection,
		selection,
	})
}

/// A compiled INSERT ... VALUES. Rows are evaluated and staged against a
/// writer when a method is created.
pub struct MemInsertOperation {
	catalog: Catalog,
	table: TableToken,
	compiled_version: u64,
	/// Target column index and type per value position.
	targets: Vec<(usize, ColumnType)>,
	rows: Vec<Vec<Expr>>,
}

impl InsertOperation for MemInsertOperation {
	fn table(&self) -> TableToken {
		self.table.clone()
	}

	fn create_method(
		&self,
		cx: &ExecutionContext<'_>,
		writers: &mut dyn WriterSource,
	) -> Result<Box<dyn InsertMethod>, EngineError> {
		if self.catalog.version_of(self.table.name())? != self.compiled_version {
			return Err(EngineError::TableReferenceOutOfDate);
		}
		let column_count = self.catalog.with_table(self.table.name(), |t| t.columns.len())?;

		let mut staged = Vec::with_capacity(self.rows.len());
		for exprs in &self.rows {
			let mut row = vec![Value::Null; column_count];
			for ((column, column_type), expr) in self.targets.iter().zip(exprs) {
				row[*column] = expr.evaluate(None, cx)?.coerce(*column_type)?;
			}
			staged.push(row);
		}

		let writer = writers.acquire(&self.table)?;
		Ok(Box::new(MemInsertMethod {
			writer,
			rows: Some(staged),
		}))
	}
}

struct MemInsertMethod {
	writer: Box<dyn TableWriter>,
	rows: Option<Vec<Vec<Value>>>,
}

impl InsertMethod for MemInsertMethod {
	fn execute(&mut self) -> Result<u64, EngineError> {
		let rows = self.rows.take().unwrap_or_default();
		let writer = self
			.writer
			.as_any_mut()
			.downcast_mut::<MemTableWriter>()
			.ok_or_else(|| EngineError::Sql(SqlError::new("foreign table writer")))?;
		Ok(writer.stage(rows))
	}

	fn commit(&mut self) -> Result<(), EngineError> {
		self.writer.commit()?;
		Ok(())
	}

	fn pop_writer(self: Box<Self>) -> Box<dyn TableWriter> {
		self.writer
	}
}

/// A compiled UPDATE ... SET ... [WHERE col = expr].
pub struct MemUpdateOperation {
	catalog: Catalog,
	table: TableToken,
	compiled_version: u64,
	assignments: Vec<(usize, ColumnType, Expr)>,
	selection: Option<(usize, Expr)>,
}

impl MemUpdateOperation {
	/// Runs the update against the catalog; shared by the direct path and
	/// the pending-writer path.
	pub(crate) fn apply(&self, cx: &ExecutionContext<'_>) -> Result<u64, EngineError> {
		if self.catalog.version_of(self.table.name())? != self.compiled_version {
			return Err(EngineError::TableReferenceOutOfDate);
		}

		// evaluate assignment sources once, outside the row loop
		let mut updates = Vec::with_capacity(self.assignments.len());
		for (column, column_type, expr) in &self.assignments {
			updates.push((*column, expr.evaluate(None, cx)?.coerce(*column_type)?));
		}
		let filter = match &self.selection {
			Some((column, expr)) => Some((*column, expr.evaluate(None, cx)?)),
			None => None,
		};

		let affected = self.catalog.with_table_mut(self.table.name(), |t| {
			let mut affected = 0u64;
			for row in 0..t.row_count() {
				if let Some((column, expected)) = &filter {
					if t.columns[*column].data[row] != *expected {
						continue;
					}
				}
				for (column, value) in &updates {
					t.columns[*column].data[row] = value.clone();
				}
				affected += 1;
			}
			affected
		})?;
		Ok(affected)
	}
}

#[async_trait]
impl meridian::engine::UpdateOperation for MemUpdateOperation {
	fn table(&self) -> TableToken {
		self.table.clone()
	}

	async fn execute(&self, cx: &ExecutionContext<'_>) -> Result<u64, EngineError> {
		self.apply(cx)
	}

	fn as_any(&self) -> &dyn Any {
		self
	}
}

/// ALTER handled at EXECUTE time: the catalog only models the version bump.
struct MemAlterOperation {
	catalog: Catalog,
	table: String,
}

#[async_trait]
impl DdlOperation for MemAlterOperation {
	async fn execute(&self, _cx: &ExecutionContext<'_>) -> Result<u64, EngineError> {
		self.catalog.touch(&self.table)?;
		Ok(0)
	}
}

fn compiled(kind: StatementKind, tag: &str, payload: SqlPayload, params: ParameterTypes) -> CompiledSql {
	CompiledSql {
		kind,
		tag: Arc::from(tag),
		payload,
		inferred_parameter_types: params.inferred,
		executed_at_parse: false,
		affected_rows: 0,
		contains_secret: false,
		deallocate_target: None,
	}
}

fn parse_executed(tag: &str, affected_rows: u64) -> CompiledSql {
	CompiledSql {
		kind: StatementKind::Ddl,
		tag: Arc::from(tag),
		payload: SqlPayload::None,
		inferred_parameter_types: Vec::new(),
		executed_at_parse: true,
		affected_rows,
		contains_secret: false,
		deallocate_target: None,
	}
}

fn lower_insert(
	catalog: &Catalog,
	table_name: &ast::ObjectName,
	columns: &[ast::Ident],
	source: &ast::Query,
	declared: &[DataTypeOid],
) -> Result<CompiledSql, SqlError> {
	let name = object_name(table_name);
	let (metadata, version) = (
		catalog.with_table(&name, |t| t.metadata())?,
		catalog.version_of(&name)?,
	);

	let targets: Vec<(usize, ColumnType)> = if columns.is_empty() {
		metadata.iter().enumerate().map(|(i, c)| (i, c.column_type)).collect()
	} else {
		columns
			.iter()
			.map(|ident| {
				metadata
					.iter()
					.position(|c| c.name == ident.value)
					.map(|i| (i, metadata[i].column_type))
					.ok_or_else(|| SqlError::new(format!("unknown column: {}", ident.value)))
			})
			.collect::<Result<_, _>>()?
	};

	let values = match source.body.as_ref() {
		SetExpr::Values(values) => &values.rows,
		_ => return Err(SqlError::new("only INSERT ... VALUES is supported")),
	};

	let mut params = ParameterTypes::default();
	let mut rows = Vec::with_capacity(values.len());
	for row in values {
		if row.len() != targets.len() {
			return Err(SqlError::new("value count does not match column count"));
		}
		let mut lowered = Vec::with_capacity(row.len());
		for (expr, (_, column_type)) in row.iter().zip(&targets) {
			let (value, _) = lower_expr(expr, None, Some(*column_type), &mut params, declared)?;
			lowered.push(value);
		}
		rows.push(lowered);
	}

	let op = MemInsertOperation {
		catalog: catalog.clone(),
		table: TableToken::new(name),
		compiled_version: version,
		targets,
		rows,
	};
	Ok(compiled(StatementKind::Insert, "INSERT", SqlPayload::Insert(Arc::new(op)), params))
}

fn lower_update(
	catalog: &Catalog,
	table: &TableWithJoins,
	assignments: &[ast::Assignment],
	selection: Option<&ast::Expr>,
	declared: &[DataTypeOid],
) -> Result<CompiledSql, SqlError> {
	let name = match &table.relation {
		TableFactor::Table { name, .. } => object_name(name),
		other => return Err(SqlError::new(format!("unsupported update target: {}", other))),
	};
	let metadata = catalog.with_table(&name, |t| t.metadata())?;
	let version = catalog.version_of(&name)?;

	let mut params = ParameterTypes::default();
	let mut lowered_assignments = Vec::with_capacity(assignments.len());
	for assignment in assignments {
		let column_name = assignment
			.id
			.last()
			.ok_or_else(|| SqlError::new("empty assignment target"))?;
		let index = metadata
			.iter()
			.position(|c| c.name == column_name.value)
			.ok_or_else(|| SqlError::new(format!("unknown column: {}", column_name.value)))?;
		let column_type = metadata[index].column_type;
		let (value, _) = lower_expr(&assignment.value, None, Some(column_type), &mut params, declared)?;
		lowered_assignments.push((index, column_type, value));
	}

	let lowered_selection = match selection {
		None => None,
		Some(ast::Expr::BinaryOp { left, op, right }) if *op == ast::BinaryOperator::Eq => {
			let (column, column_type) = match left.as_ref() {
				ast::Expr::Identifier(ident) => metadata
					.iter()
					.position(|c| c.name == ident.value)
					.map(|i| (i, metadata[i].column_type))
					.ok_or_else(|| SqlError::new(format!("unknown column: {}", ident.value)))?,
				other => return Err(SqlError::new(format!("unsupported predicate: {}", other))),
			};
			let (value, _) = lower_expr(right, None, Some(column_type), &mut params, declared)?;
			Some((column, value))
		}
		Some(other) => return Err(SqlError::new(format!("unsupported predicate: {}", other))),
	};

	let op = MemUpdateOperation {
		catalog: catalog.clone(),
		table: TableToken::new(name),
		compiled_version: version,
		assignments: lowered_assignments,
		selection: lowered_selection,
	};
	Ok(compiled(StatementKind::Update, "UPDATE", SqlPayload::Update(Arc::new(op)), params))
}

fn column_defs(columns: &[ColumnDef]) -> Vec<(String, ColumnType)> {
	columns
		.iter()
		.map(|c| (c.name.value.clone(), data_type_to_column_type(&c.data_type)))
		.collect()
}

/// Compiles one SQL text into the artifact the pipeline executes.
pub fn compile_statement(catalog: &Catalog, sql: &str, declared: &[DataTypeOid]) -> Result<CompiledSql, SqlError> {
	let statement = parse_single(sql)?;
	tracing::debug!(%sql, "compiling");
	match &statement {
		Statement::Query(query) => match query.body.as_ref() {
			SetExpr::Select(select) => {
				let mut params = ParameterTypes::default();
				let factory = lower_select(catalog, select, &mut params, declared)?;
				Ok(compiled(
					StatementKind::Select,
					"SELECT",
					SqlPayload::Select(Arc::new(factory)),
					params,
				))
			}
			other => Err(SqlError::new(format!("unsupported query: {}", other))),
		},
		Statement::Insert {
			table_name,
			columns,
			source,
			..
		} => lower_insert(catalog, table_name, columns, source, declared),
		Statement::Update {
			table,
			assignments,
			selection,
			..
		} => lower_update(catalog, table, assignments, selection.as_ref(), declared),
		Statement::CreateTable { name, columns, .. } => {
			// auto-commit DDL executes during compilation
			catalog.create_table(&object_name(name), column_defs(columns))?;
			Ok(parse_executed("CREATE TABLE", 0))
		}
		Statement::Drop {
			object_type: ObjectType::Table,
			names,
			..
		} => {
			for name in names {
				catalog.drop_table(&object_name(name))?;
			}
			Ok(parse_executed("DROP TABLE", 0))
		}
		Statement::AlterTable { name, .. } => {
			let op = MemAlterOperation {
				catalog: catalog.clone(),
				table: object_name(name),
			};
			Ok(compiled(
				StatementKind::Ddl,
				"ALTER TABLE",
				SqlPayload::Ddl(Arc::new(op)),
				ParameterTypes::default(),
			))
		}
		Statement::StartTransaction { .. } => Ok(compiled(
			StatementKind::Begin,
			"BEGIN",
			SqlPayload::None,
			ParameterTypes::default(),
		)),
		Statement::Commit { .. } => Ok(compiled(
			StatementKind::Commit,
			"COMMIT",
			SqlPayload::None,
			ParameterTypes::default(),
		)),
		Statement::Rollback { .. } => Ok(compiled(
			StatementKind::Rollback,
			"ROLLBACK",
			SqlPayload::None,
			ParameterTypes::default(),
		)),
		Statement::SetVariable { .. } | Statement::SetTimeZone { .. } => Ok(compiled(
			StatementKind::Set,
			"SET",
			SqlPayload::None,
			ParameterTypes::default(),
		)),
		Statement::Explain { statement, .. } => {
			let plan = explain_text(statement);
			let factory = MemSelectFactory {
				catalog: catalog.clone(),
				table: None,
				compiled_version: 0,
				columns: vec![ColumnDesc::new("QUERY PLAN", ColumnType::Varchar)],
				projection: vec![Expr::Literal(Value::Str(plan))],
				selection: None,
			};
			Ok(compiled(
				StatementKind::Explain,
				"EXPLAIN",
				SqlPayload::Select(Arc::new(factory)),
				ParameterTypes::default(),
			))
		}
		Statement::Deallocate { name, .. } => {
			let mut out = compiled(
				StatementKind::Deallocate,
				"DEALLOCATE",
				SqlPayload::None,
				ParameterTypes::default(),
			);
			out.deallocate_target = Some(name.value.clone());
			Ok(out)
		}
		other => Err(SqlError::new(format!("unsupported statement: {}", other))),
	}
}

fn explain_text(statement: &Statement) -> String {
	match statement {
		Statement::Query(query) => match query.body.as_ref() {
			SetExpr::Select(select) => match scan_table_name(&select.from) {
				Ok(Some(table)) => format!("Seq Scan on {}", table),
				_ => "Result".to_string(),
			},
			_ => "Result".to_string(),
		},
		_ => "Result".to_string(),
	}
}

/// Convenience used by [crate::MemEngine::ddl] for DDL that arrives without
/// a compiled operation.
pub fn execute_raw_ddl(catalog: &Catalog, sql: &str) -> Result<u64, SqlError> {
	let compiled = compile_statement(catalog, sql, &[])?;
	Ok(compiled.affected_rows)
}

#[cfg(test)]
mod tests {
	use super::*;
	use meridian::engine::{BindVariables, Cursor as _, Record as _, StatementKind};

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
			.append_rows(
				"trades",
				vec![
					vec![Value::Double(1.0), Value::Long(10)],
					vec![Value::Double(2.0), Value::Long(20)],
				],
			)
			.unwrap();
		catalog
	}

	fn no_binds() -> ExecutionContext<'static> {
		ExecutionContext {
			binds: BindVariables::default(),
			cache_hit: false,
			contains_secret: false,
		}
	}

	fn collect_rows(factory: &dyn CursorFactory, cx: &ExecutionContext<'_>) -> Vec<Vec<Value>> {
		let mut cursor = factory.open(cx).unwrap();
		let width = factory.metadata().len();
		let mut rows = Vec::new();
		while cursor.advance().unwrap() {
			let record = cursor.record();
			let mut row = Vec::new();
			for i in 0..width {
				row.push(match (record.get_double(i), record.get_long(i), record.get_str(i)) {
					(Some(d), _, _) => Value::Double(d),
					(_, Some(l), _) => Value::Long(l),
					(_, _, Some(s)) => Value::Str(s.to_string()),
					_ => Value::Null,
				});
			}
			rows.push(row);
		}
		rows
	}

	#[test]
	fn wildcard_select_expands_all_columns() {
		let catalog = sample_catalog();
		let compiled = compile_statement(&catalog, "select * from trades", &[]).unwrap();
		assert_eq!(compiled.kind, StatementKind::Select);
		assert_eq!(compiled.tag.as_ref(), "SELECT");

		let factory = match &compiled.payload {
			SqlPayload::Select(f) => f,
			_ => panic!("expected select payload"),
		};
		assert_eq!(factory.metadata().len(), 2);
		assert_eq!(factory.metadata()[0].name, "price");
		assert_eq!(collect_rows(factory.as_ref(), &no_binds()).len(), 2);
	}

	#[test]
	fn cast_parameter_types_the_bind_slot() {
		let catalog = sample_catalog();
		let compiled = compile_statement(&catalog, "select $1::bigint", &[]).unwrap();
		assert_eq!(compiled.inferred_parameter_types, vec![Some(ColumnType::Long)]);

		let factory = match &compiled.payload {
			SqlPayload::Select(f) => f,
			_ => panic!("expected select payload"),
		};
		assert_eq!(factory.metadata()[0].column_type, ColumnType::Long);
	}

	#[test]
	fn insert_parameters_inherit_column_types() {
		let catalog = sample_catalog();
		let compiled = compile_statement(&catalog, "insert into trades values ($1, $2)", &[]).unwrap();
		assert_eq!(compiled.kind, StatementKind::Insert);
		assert_eq!(
			compiled.inferred_parameter_types,
			vec![Some(ColumnType::Double), Some(ColumnType::Long)]
		);
	}

	#[test]
	fn equality_predicate_filters_rows() {
		let catalog = sample_catalog();
		let compiled = compile_statement(&catalog, "select price from trades where qty = 20", &[]).unwrap();
		let factory = match &compiled.payload {
			SqlPayload::Select(f) => f,
			_ => panic!("expected select payload"),
		};
		let rows = collect_rows(factory.as_ref(), &no_binds());
		assert_eq!(rows, vec![vec![Value::Double(2.0)]]);
	}

	#[test]
	fn schema_change_invalidates_compiled_plan() {
		let catalog = sample_catalog();
		let compiled = compile_statement(&catalog, "select * from trades", &[]).unwrap();
		let factory = match &compiled.payload {
			SqlPayload::Select(f) => f,
			_ => panic!("expected select payload"),
		};

		catalog.add_column("trades", "venue", ColumnType::Varchar).unwrap();
		let err = factory.open(&no_binds()).unwrap_err();
		assert!(matches!(err, EngineError::TableReferenceOutOfDate));
	}

	#[test]
	fn create_table_is_parse_executed() {
		let catalog = Catalog::new();
		let compiled = compile_statement(&catalog, "create table t (a int, b text)", &[]).unwrap();
		assert!(compiled.executed_at_parse);
		assert_eq!(compiled.tag.as_ref(), "CREATE TABLE");
		assert_eq!(catalog.version_of("t").unwrap(), 0);
	}

	#[test]
	fn transaction_control_classifies() {
		let catalog = Catalog::new();
		for (sql, kind, tag) in [
			("begin", StatementKind::Begin, "BEGIN"),
			("commit", StatementKind::Commit, "COMMIT"),
			("rollback", StatementKind::Rollback, "ROLLBACK"),
			("set somevar to 'my_val'", StatementKind::Set, "SET"),
		] {
			let compiled = compile_statement(&catalog, sql, &[]).unwrap();
			assert_eq!(compiled.kind, kind, "for {}", sql);
			assert_eq!(compiled.tag.as_ref(), tag, "for {}", sql);
		}
	}

	#[test]
	fn deallocate_records_target() {
		let catalog = Catalog::new();
		let compiled = compile_statement(&catalog, "deallocate s1", &[]).unwrap();
		assert_eq!(compiled.kind, StatementKind::Deallocate);
		assert_eq!(compiled.deallocate_target.as_deref(), Some("s1"));
	}

	#[test]
	fn multiple_statements_are_rejected() {
		let catalog = Catalog::new();
		let err = compile_statement(&catalog, "select 1; select 2", &[]).unwrap_err();
		assert!(err.message.contains("exactly one statement"));
	}
}

//! In-memory columnar engine adapter for the meridian wire front-end.
//!
//! Useful as a reference adapter and as the backing engine for end-to-end
//! tests: it implements the full engine seam (compilation, scan cursors with
//! cold-partition pauses, staged writers, version-pinned plans) over tables
//! held in process memory.

pub mod sql;
pub mod table;

use async_trait::async_trait;
use meridian::engine::{CompiledSql, Engine, SqlError, WriterSource};
use meridian::protocol::DataTypeOid;
use table::{Catalog, MemWriterSource};

/// An engine instance over a shared [Catalog]. Each connection gets its own
/// instance; cloning the catalog shares the tables.
pub struct MemEngine {
	catalog: Catalog,
	writers: MemWriterSource,
}

impl MemEngine {
	pub fn new(catalog: Catalog) -> Self {
		Self {
			writers: MemWriterSource::new(catalog.clone()),
			catalog,
		}
	}

	pub fn catalog(&self) -> &Catalog {
		&self.catalog
	}
}

#[async_trait]
impl Engine for MemEngine {
	async fn compile(&mut self, sql: &str, declared_types: &[DataTypeOid]) -> Result<CompiledSql, SqlError> {
		sql::compile_statement(&self.catalog, sql, declared_types)
	}

	async fn ddl(&mut self, sql: &str) -> Result<u64, SqlError> {
		sql::execute_raw_ddl(&self.catalog, sql)
	}

	fn writer_source(&mut self) -> &mut dyn WriterSource {
		&mut self.writers
	}
}

//! DuckDB warehouse backend implementation
//!
//! Provides an embedded warehouse using DuckDB, backed by a file for local
//! runs or held in memory for tests.

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

use super::schema::WarehouseSchema;
use super::{
    DatabaseError, DatabaseResult, Dialect, QueryResult, SqlValue, Statement, Warehouse,
};
use crate::extract::StagingRowSet;

/// Days between 0001-01-01 and 1970-01-01
const UNIX_EPOCH_DAYS_FROM_CE: i32 = 719_163;

/// DuckDB warehouse backend
///
/// Supports both file-based persistence and in-memory mode.
pub struct DuckDBWarehouse {
    /// Path to the database file (None for in-memory)
    db_path: Option<PathBuf>,
    /// DuckDB connection (wrapped in Mutex for thread safety)
    connection: Mutex<duckdb::Connection>,
}

impl DuckDBWarehouse {
    /// Open (or create) a file-based warehouse
    pub fn new(db_path: impl AsRef<Path>) -> DatabaseResult<Self> {
        let path = db_path.as_ref().to_path_buf();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::IoError(format!("Failed to create {}: {}", parent.display(), e))
            })?;
        }

        let connection = duckdb::Connection::open(&path).map_err(|e| {
            DatabaseError::ConnectionFailed(format!("Failed to open DuckDB: {}", e))
        })?;

        Ok(Self {
            db_path: Some(path),
            connection: Mutex::new(connection),
        })
    }

    /// Create an in-memory warehouse
    pub fn in_memory() -> DatabaseResult<Self> {
        let connection = duckdb::Connection::open_in_memory().map_err(|e| {
            DatabaseError::ConnectionFailed(format!("Failed to create in-memory DuckDB: {}", e))
        })?;

        Ok(Self {
            db_path: None,
            connection: Mutex::new(connection),
        })
    }

    /// Get the database file path (None for in-memory)
    pub fn db_path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    /// Check if this is an in-memory database
    pub fn is_in_memory(&self) -> bool {
        self.db_path.is_none()
    }

    fn lock(&self) -> DatabaseResult<MutexGuard<'_, duckdb::Connection>> {
        self.connection
            .lock()
            .map_err(|e| DatabaseError::ConnectionFailed(format!("Lock error: {}", e)))
    }

    /// Borrow typed parameters as DuckDB bind values
    fn bind(params: &[SqlValue]) -> Vec<&dyn duckdb::ToSql> {
        params
            .iter()
            .map(|p| match p {
                SqlValue::Text(v) => v as &dyn duckdb::ToSql,
                SqlValue::Timestamp(v) => v as &dyn duckdb::ToSql,
                SqlValue::BigInt(v) => v as &dyn duckdb::ToSql,
            })
            .collect()
    }

    fn query(
        conn: &duckdb::Connection,
        sql: &str,
        params: &[SqlValue],
    ) -> DatabaseResult<QueryResult> {
        let start = std::time::Instant::now();

        let mut stmt = conn
            .prepare(sql)
            .map_err(|e| DatabaseError::QueryFailed(format!("Prepare failed: {}", e)))?;

        // In DuckDB 1.4+, we need to execute the query first, then get columns
        let bound = Self::bind(params);
        let mut result_rows = stmt
            .query(bound.as_slice())
            .map_err(|e| DatabaseError::QueryFailed(format!("Query failed: {}", e)))?;

        let column_count = result_rows.as_ref().map(|r| r.column_count()).unwrap_or(0);
        let columns: Vec<String> = (0..column_count)
            .map(|i| {
                result_rows
                    .as_ref()
                    .and_then(|r| r.column_name(i).ok())
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| format!("col{}", i))
            })
            .collect();

        let mut rows = Vec::new();
        while let Some(row) = result_rows
            .next()
            .map_err(|e| DatabaseError::QueryFailed(format!("Row fetch error: {}", e)))?
        {
            rows.push(Self::row_to_json(row, &columns));
        }

        Ok(QueryResult {
            columns,
            rows,
            rows_affected: None,
            execution_time_ms: start.elapsed().as_millis() as u64,
        })
    }

    /// Convert a DuckDB row to a JSON value
    fn row_to_json(row: &duckdb::Row, columns: &[String]) -> serde_json::Value {
        let mut map = serde_json::Map::new();

        for (i, col_name) in columns.iter().enumerate() {
            let value = match row.get_ref(i) {
                Ok(value_ref) => Self::value_ref_to_json(value_ref),
                Err(_) => serde_json::Value::Null,
            };
            map.insert(col_name.clone(), value);
        }

        serde_json::Value::Object(map)
    }

    /// Convert a DuckDB ValueRef to a JSON value
    fn value_ref_to_json(value: duckdb::types::ValueRef) -> serde_json::Value {
        use duckdb::types::{TimeUnit, ValueRef};

        match value {
            ValueRef::Null => serde_json::Value::Null,
            ValueRef::Boolean(b) => serde_json::Value::Bool(b),
            ValueRef::TinyInt(i) => serde_json::Value::Number(i.into()),
            ValueRef::SmallInt(i) => serde_json::Value::Number(i.into()),
            ValueRef::Int(i) => serde_json::Value::Number(i.into()),
            ValueRef::BigInt(i) => serde_json::Value::Number(i.into()),
            // i128 may not fit in a JSON number
            ValueRef::HugeInt(i) => serde_json::Value::String(i.to_string()),
            ValueRef::UTinyInt(i) => serde_json::Value::Number(i.into()),
            ValueRef::USmallInt(i) => serde_json::Value::Number(i.into()),
            ValueRef::UInt(i) => serde_json::Value::Number(i.into()),
            ValueRef::UBigInt(i) => serde_json::Value::Number(i.into()),
            ValueRef::Float(f) => serde_json::Number::from_f64(f as f64)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            ValueRef::Double(f) => serde_json::Number::from_f64(f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            ValueRef::Text(bytes) => String::from_utf8_lossy(bytes).into_owned().into(),
            ValueRef::Blob(bytes) => {
                use base64::Engine;
                serde_json::Value::String(base64::engine::general_purpose::STANDARD.encode(bytes))
            }
            ValueRef::Timestamp(unit, v) => {
                let micros = match unit {
                    TimeUnit::Second => v.saturating_mul(1_000_000),
                    TimeUnit::Millisecond => v.saturating_mul(1_000),
                    TimeUnit::Microsecond => v,
                    TimeUnit::Nanosecond => v / 1_000,
                };
                chrono::DateTime::from_timestamp_micros(micros)
                    .map(|dt| serde_json::Value::String(dt.naive_utc().to_string()))
                    .unwrap_or(serde_json::Value::Null)
            }
            ValueRef::Date32(days) => NaiveDate::from_num_days_from_ce_opt(
                days.saturating_add(UNIX_EPOCH_DAYS_FROM_CE),
            )
            .map(|d| serde_json::Value::String(d.to_string()))
            .unwrap_or(serde_json::Value::Null),
            ValueRef::Decimal(d) => serde_json::Value::String(d.to_string()),
            other => serde_json::Value::String(format!("{:?}", other)),
        }
    }
}

#[async_trait(?Send)]
impl Warehouse for DuckDBWarehouse {
    fn dialect(&self) -> Dialect {
        Dialect::DuckDb
    }

    fn backend_type(&self) -> &'static str {
        "duckdb"
    }

    async fn initialize(&self) -> DatabaseResult<()> {
        let conn = self.lock()?;
        conn.execute_batch(&WarehouseSchema::create_schemas_sql())
            .map_err(|e| DatabaseError::MigrationFailed(format!("Failed to create schemas: {}", e)))
    }

    async fn execute_query(&self, sql: &str) -> DatabaseResult<QueryResult> {
        let conn = self.lock()?;
        Self::query(&conn, sql, &[])
    }

    async fn execute_query_params(
        &self,
        sql: &str,
        params: &[SqlValue],
    ) -> DatabaseResult<QueryResult> {
        let conn = self.lock()?;
        Self::query(&conn, sql, params)
    }

    async fn execute_statement(&self, sql: &str, params: &[SqlValue]) -> DatabaseResult<u64> {
        debug!("{}", sql);
        let conn = self.lock()?;
        let bound = Self::bind(params);
        conn.execute(sql, bound.as_slice())
            .map(|n| n as u64)
            .map_err(|e| DatabaseError::QueryFailed(format!("Execute failed: {}", e)))
    }

    async fn execute_batch(&self, sql: &str) -> DatabaseResult<()> {
        debug!("{}", sql);
        let conn = self.lock()?;
        conn.execute_batch(sql)
            .map_err(|e| DatabaseError::QueryFailed(format!("Batch execute failed: {}", e)))
    }

    async fn run_in_transaction(&self, statements: &[Statement]) -> DatabaseResult<Vec<u64>> {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction()
            .map_err(|e| DatabaseError::TransactionFailed(format!("Begin failed: {}", e)))?;

        let mut counts = Vec::with_capacity(statements.len());
        for statement in statements {
            debug!("{}", statement.sql);
            let bound = Self::bind(&statement.params);
            // Dropping `tx` on error rolls back
            let n = tx
                .execute(&statement.sql, bound.as_slice())
                .map_err(|e| DatabaseError::TransactionFailed(e.to_string()))?;
            counts.push(n as u64);
        }

        tx.commit()
            .map_err(|e| DatabaseError::TransactionFailed(format!("Commit failed: {}", e)))?;
        Ok(counts)
    }

    async fn replace_staging(&self, rows: &StagingRowSet, load_id: &str) -> DatabaseResult<u64> {
        let (drop_sql, create_sql, insert_sql) = WarehouseSchema::staging_sql(self.dialect(), rows);
        let load_id = SqlValue::text(load_id);
        let loaded_at = SqlValue::Timestamp(Some(Utc::now().naive_utc()));

        let mut conn = self.lock()?;
        let tx = conn
            .transaction()
            .map_err(|e| DatabaseError::TransactionFailed(format!("Begin failed: {}", e)))?;

        tx.execute(&drop_sql, [])
            .map_err(|e| DatabaseError::TransactionFailed(e.to_string()))?;
        tx.execute(&create_sql, [])
            .map_err(|e| DatabaseError::TransactionFailed(e.to_string()))?;

        let mut written = 0u64;
        {
            let mut stmt = tx
                .prepare(&insert_sql)
                .map_err(|e| DatabaseError::TransactionFailed(e.to_string()))?;
            for row in &rows.rows {
                let mut values = row.clone();
                values.push(load_id.clone());
                values.push(loaded_at.clone());
                let bound = Self::bind(&values);
                written += stmt
                    .execute(bound.as_slice())
                    .map_err(|e| DatabaseError::TransactionFailed(e.to_string()))?
                    as u64;
            }
        }

        tx.commit()
            .map_err(|e| DatabaseError::TransactionFailed(format!("Commit failed: {}", e)))?;
        debug!("raw.{}: {} rows staged", rows.table, written);
        Ok(written)
    }
}

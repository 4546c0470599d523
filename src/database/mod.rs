//! Warehouse backend abstraction
//!
//! This module provides the warehouse layer the pipeline writes through:
//! - DuckDB: Embedded warehouse for local runs and tests
//! - PostgreSQL: Shared warehouse for scheduled deployments
//!
//! Every pipeline operation receives a `&dyn Warehouse` (or a generic `W`)
//! explicitly; no connection is held globally.

use async_trait::async_trait;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::extract::StagingRowSet;

// Re-export implementations based on features
#[cfg(feature = "duckdb-backend")]
pub mod duckdb;

#[cfg(feature = "postgres-backend")]
pub mod postgres;

pub mod schema;

#[cfg(feature = "duckdb-backend")]
pub use self::duckdb::DuckDBWarehouse;

#[cfg(feature = "postgres-backend")]
pub use self::postgres::PostgresWarehouse;

pub use schema::{WarehouseSchema, qualified, quote_ident};

/// Error type for database operations
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    /// Failed to connect to database
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Query execution failed
    #[error("Query failed: {0}")]
    QueryFailed(String),

    /// Schema creation failed
    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    /// Transaction failed and was rolled back
    #[error("Transaction failed: {0}")]
    TransactionFailed(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// IO error
    #[error("IO error: {0}")]
    IoError(String),
}

/// Result type for database operations
pub type DatabaseResult<T> = Result<T, DatabaseError>;

/// SQL dialect spoken by a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    DuckDb,
    Postgres,
}

impl Dialect {
    /// Positional parameter placeholder, 1-based
    pub fn placeholder(&self, index: usize) -> String {
        match self {
            Dialect::DuckDb => "?".to_string(),
            Dialect::Postgres => format!("${}", index),
        }
    }

    /// Comma separated placeholders for `count` parameters
    pub fn placeholders(&self, count: usize) -> String {
        (1..=count)
            .map(|i| self.placeholder(i))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Typed statement parameter
///
/// Nulls keep their type so that strictly typed drivers can bind them.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Text(Option<String>),
    Timestamp(Option<NaiveDateTime>),
    BigInt(Option<i64>),
}

impl SqlValue {
    pub fn text(value: impl Into<String>) -> Self {
        SqlValue::Text(Some(value.into()))
    }

    pub fn is_null(&self) -> bool {
        match self {
            SqlValue::Text(v) => v.is_none(),
            SqlValue::Timestamp(v) => v.is_none(),
            SqlValue::BigInt(v) => v.is_none(),
        }
    }

    /// Timestamp payload, if this is a non-null timestamp
    pub fn as_timestamp(&self) -> Option<NaiveDateTime> {
        match self {
            SqlValue::Timestamp(v) => *v,
            _ => None,
        }
    }

    /// Text payload, if this is non-null text
    pub fn as_text(&self) -> Option<&str> {
        match self {
            SqlValue::Text(v) => v.as_deref(),
            _ => None,
        }
    }
}

/// A SQL statement with its bound parameters
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<SqlValue>,
}

impl Statement {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
        }
    }

    pub fn with_params(sql: impl Into<String>, params: Vec<SqlValue>) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }
}

/// Column description read from `information_schema.columns`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
    pub ordinal: i64,
}

/// Query result row as a JSON value
pub type QueryRow = serde_json::Value;

/// Query result set
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResult {
    /// Column names
    pub columns: Vec<String>,
    /// Rows of data
    pub rows: Vec<QueryRow>,
    /// Number of rows affected (for INSERT/UPDATE/DELETE)
    pub rows_affected: Option<u64>,
    /// Execution time in milliseconds
    pub execution_time_ms: u64,
}

impl QueryResult {
    /// Create a new query result
    pub fn new(columns: Vec<String>, rows: Vec<QueryRow>) -> Self {
        Self {
            columns,
            rows,
            rows_affected: None,
            execution_time_ms: 0,
        }
    }

    /// Create an empty result
    pub fn empty() -> Self {
        Self::new(Vec::new(), Vec::new())
    }

    /// Get the number of rows
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Check if the result is empty
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Value of `column` in the first row
    pub fn first_value(&self, column: &str) -> Option<&serde_json::Value> {
        self.rows.first().and_then(|row| row.get(column))
    }

    /// String value of `column` in the first row (nulls are `None`)
    pub fn first_str(&self, column: &str) -> Option<&str> {
        self.first_value(column).and_then(|v| v.as_str())
    }

    /// Integer value of `column` in the first row, accepting numeric strings
    pub fn first_i64(&self, column: &str) -> Option<i64> {
        self.first_value(column).and_then(json_as_i64)
    }
}

/// Read a JSON value as an integer; drivers return some counts as strings
pub(crate) fn json_as_i64(value: &serde_json::Value) -> Option<i64> {
    match value {
        serde_json::Value::Number(n) => n.as_i64(),
        serde_json::Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// Warehouse backend trait
///
/// Implemented by the DuckDB and PostgreSQL backends. The default methods
/// cover catalog inspection through `information_schema`, which both
/// backends expose.
#[async_trait(?Send)]
pub trait Warehouse: Send + Sync {
    /// SQL dialect of this backend
    fn dialect(&self) -> Dialect;

    /// Get the database backend type name ("duckdb" or "postgres")
    fn backend_type(&self) -> &'static str;

    /// Create the raw/bronze/gold/metadata schemas and the run log table
    async fn initialize(&self) -> DatabaseResult<()>;

    /// Execute a SQL query and return results
    async fn execute_query(&self, sql: &str) -> DatabaseResult<QueryResult>;

    /// Execute a parameterized SQL query
    ///
    /// Placeholders follow [`Warehouse::dialect`].
    async fn execute_query_params(
        &self,
        sql: &str,
        params: &[SqlValue],
    ) -> DatabaseResult<QueryResult>;

    /// Execute one statement and return the number of affected rows
    async fn execute_statement(&self, sql: &str, params: &[SqlValue]) -> DatabaseResult<u64>;

    /// Execute several `;`-separated statements without parameters
    async fn execute_batch(&self, sql: &str) -> DatabaseResult<()>;

    /// Run statements in a single transaction
    ///
    /// Returns the affected row count of each statement. Any failure rolls
    /// back the whole unit.
    async fn run_in_transaction(&self, statements: &[Statement]) -> DatabaseResult<Vec<u64>>;

    /// Replace `raw.<table>` with the given row set in one transaction
    ///
    /// Returns the number of rows written.
    async fn replace_staging(&self, rows: &StagingRowSet, load_id: &str) -> DatabaseResult<u64>;

    /// Terminate idle or blocking sessions left behind by earlier runs
    ///
    /// Returns the number of sessions terminated.
    async fn terminate_stale_sessions(&self) -> DatabaseResult<u64> {
        Ok(0)
    }

    /// Columns of `schema.table` in ordinal order (empty if the table is missing)
    async fn table_columns(&self, schema: &str, table: &str) -> DatabaseResult<Vec<ColumnInfo>> {
        let dialect = self.dialect();
        let sql = format!(
            "SELECT CAST(column_name AS TEXT) AS column_name, \
             CAST(data_type AS TEXT) AS data_type, \
             CAST(ordinal_position AS BIGINT) AS ordinal_position \
             FROM information_schema.columns \
             WHERE table_schema = CAST({} AS TEXT) AND table_name = CAST({} AS TEXT) \
             ORDER BY ordinal_position",
            dialect.placeholder(1),
            dialect.placeholder(2)
        );
        let result = self
            .execute_query_params(&sql, &[SqlValue::text(schema), SqlValue::text(table)])
            .await?;

        let mut columns = Vec::with_capacity(result.rows.len());
        for row in &result.rows {
            let name = row
                .get("column_name")
                .and_then(|v| v.as_str())
                .ok_or_else(|| {
                    DatabaseError::SerializationError(format!(
                        "information_schema row without column_name for {}.{}",
                        schema, table
                    ))
                })?;
            let data_type = row
                .get("data_type")
                .and_then(|v| v.as_str())
                .unwrap_or("TEXT");
            let ordinal = row
                .get("ordinal_position")
                .and_then(json_as_i64)
                .unwrap_or(columns.len() as i64 + 1);
            columns.push(ColumnInfo {
                name: name.to_string(),
                data_type: data_type.to_string(),
                ordinal,
            });
        }
        Ok(columns)
    }

    /// Check whether `schema.table` exists
    async fn table_exists(&self, schema: &str, table: &str) -> DatabaseResult<bool> {
        let dialect = self.dialect();
        let sql = format!(
            "SELECT COUNT(*) AS n FROM information_schema.tables \
             WHERE table_schema = CAST({} AS TEXT) AND table_name = CAST({} AS TEXT)",
            dialect.placeholder(1),
            dialect.placeholder(2)
        );
        let result = self
            .execute_query_params(&sql, &[SqlValue::text(schema), SqlValue::text(table)])
            .await?;
        Ok(result.first_i64("n").unwrap_or(0) > 0)
    }

    /// Count rows in `schema.table`
    async fn count_rows(&self, schema: &str, table: &str) -> DatabaseResult<u64> {
        let sql = format!("SELECT COUNT(*) AS n FROM {}", qualified(schema, table));
        let result = self.execute_query(&sql).await?;
        Ok(result.first_i64("n").unwrap_or(0).max(0) as u64)
    }

    /// Check if database is healthy and accessible
    async fn health_check(&self) -> DatabaseResult<bool> {
        let result = self.execute_query("SELECT 1 AS healthy").await?;
        Ok(!result.rows.is_empty())
    }
}

/// Output format for query results
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    /// ASCII table format (default)
    #[default]
    Table,
    /// JSON format
    Json,
    /// CSV format
    Csv,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "table" => Ok(OutputFormat::Table),
            "json" => Ok(OutputFormat::Json),
            "csv" => Ok(OutputFormat::Csv),
            _ => Err(format!("Unknown output format: {}", s)),
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputFormat::Table => write!(f, "table"),
            OutputFormat::Json => write!(f, "json"),
            OutputFormat::Csv => write!(f, "csv"),
        }
    }
}

/// Format query results for display
pub fn format_query_result(result: &QueryResult, format: OutputFormat) -> String {
    match format {
        OutputFormat::Json => {
            serde_json::to_string_pretty(&result.rows).unwrap_or_else(|_| "[]".to_string())
        }
        OutputFormat::Csv => format_as_csv(result),
        OutputFormat::Table => format_as_table(result),
    }
}

fn display_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}

fn format_as_csv(result: &QueryResult) -> String {
    let mut writer = csv::Writer::from_writer(Vec::new());

    if writer.write_record(&result.columns).is_err() {
        return String::new();
    }

    for row in &result.rows {
        let values: Vec<String> = result
            .columns
            .iter()
            .map(|col| match row.get(col) {
                None | Some(serde_json::Value::Null) => String::new(),
                Some(value) => display_value(value),
            })
            .collect();
        if writer.write_record(&values).is_err() {
            break;
        }
    }

    writer
        .into_inner()
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .unwrap_or_default()
}

fn format_as_table(result: &QueryResult) -> String {
    if result.is_empty() {
        return "(0 rows)".to_string();
    }

    let cells: Vec<Vec<String>> = result
        .rows
        .iter()
        .map(|row| {
            result
                .columns
                .iter()
                .map(|col| display_value(row.get(col).unwrap_or(&serde_json::Value::Null)))
                .collect()
        })
        .collect();

    let mut widths: Vec<usize> = result.columns.iter().map(|c| c.len()).collect();
    for row in &cells {
        for (i, value) in row.iter().enumerate() {
            widths[i] = widths[i].max(value.len());
        }
    }

    let render = |values: &[String]| -> String {
        values
            .iter()
            .enumerate()
            .map(|(i, v)| format!("{:width$}", v, width = widths[i]))
            .collect::<Vec<_>>()
            .join(" | ")
    };

    let mut output = render(&result.columns);
    output.push('\n');
    output.push_str(
        &widths
            .iter()
            .map(|w| "-".repeat(*w))
            .collect::<Vec<_>>()
            .join("-+-"),
    );
    output.push('\n');
    for row in &cells {
        output.push_str(&render(row));
        output.push('\n');
    }
    output.push_str(&format!("({} rows)", result.row_count()));

    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_output_format_from_str() {
        assert_eq!(
            OutputFormat::from_str("table").unwrap(),
            OutputFormat::Table
        );
        assert_eq!(OutputFormat::from_str("JSON").unwrap(), OutputFormat::Json);
        assert_eq!(OutputFormat::from_str("csv").unwrap(), OutputFormat::Csv);
        assert!(OutputFormat::from_str("parquet").is_err());
    }

    #[test]
    fn test_placeholders() {
        assert_eq!(Dialect::DuckDb.placeholders(3), "?, ?, ?");
        assert_eq!(Dialect::Postgres.placeholders(3), "$1, $2, $3");
        assert_eq!(Dialect::Postgres.placeholders(0), "");
    }

    #[test]
    fn test_first_value_helpers() {
        let result = QueryResult::new(
            vec!["n".to_string(), "s".to_string()],
            vec![serde_json::json!({"n": "42", "s": "x"})],
        );
        assert_eq!(result.first_i64("n"), Some(42));
        assert_eq!(result.first_str("s"), Some("x"));
        assert_eq!(result.first_str("missing"), None);
        assert_eq!(QueryResult::empty().first_i64("n"), None);
    }

    #[test]
    fn test_format_as_table() {
        let result = QueryResult::new(
            vec!["table_name".to_string(), "rows".to_string()],
            vec![
                serde_json::json!({"table_name": "crm_leads", "rows": 10}),
                serde_json::json!({"table_name": "crm_buyers", "rows": null}),
            ],
        );

        let output = format_as_table(&result);
        assert!(output.contains("table_name"));
        assert!(output.contains("crm_leads"));
        assert!(output.contains("null"));
        assert!(output.contains("(2 rows)"));
    }

    #[test]
    fn test_format_as_csv_quotes_commas() {
        let result = QueryResult::new(
            vec!["name".to_string(), "note".to_string()],
            vec![
                serde_json::json!({"name": "a", "note": "plain"}),
                serde_json::json!({"name": "b", "note": "has, comma"}),
            ],
        );

        let output = format_as_csv(&result);
        assert!(output.starts_with("name,note\n"));
        assert!(output.contains("a,plain"));
        assert!(output.contains("\"has, comma\""));
    }

    #[test]
    fn test_sql_value_accessors() {
        assert!(SqlValue::Text(None).is_null());
        assert_eq!(SqlValue::text("x").as_text(), Some("x"));
        assert!(SqlValue::BigInt(Some(1)).as_timestamp().is_none());
    }
}

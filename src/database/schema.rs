//! Warehouse schema definitions
//!
//! Provides the DDL shared by DuckDB and PostgreSQL plus identifier quoting.
//! Both dialects accept the same `TEXT`/`TIMESTAMP`/`BIGINT` column types.

use super::Dialect;
use crate::extract::StagingRowSet;

/// Staging schema, replaced on every load
pub const RAW_SCHEMA: &str = "raw";

/// Durable schema the reconciler writes into
pub const BRONZE_SCHEMA: &str = "bronze";

/// Derived views refreshed after reconciliation
pub const GOLD_SCHEMA: &str = "gold";

/// Pipeline bookkeeping
pub const METADATA_SCHEMA: &str = "metadata";

/// Run log table name inside [`METADATA_SCHEMA`]
pub const RUN_LOG_TABLE: &str = "etl_run_log";

/// Prefix of columns the pipeline adds to every staged row
pub const BOOKKEEPING_PREFIX: &str = "_elt_";

/// Load identifier column added to raw rows
pub const LOAD_ID_COLUMN: &str = "_elt_load_id";

/// Load timestamp column added to raw rows
pub const LOADED_AT_COLUMN: &str = "_elt_loaded_at";

/// Quote an identifier with double quotes, doubling embedded quotes
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quoted `schema.table` reference
pub fn qualified(schema: &str, table: &str) -> String {
    format!("{}.{}", quote_ident(schema), quote_ident(table))
}

/// Whether a column is one of the pipeline's bookkeeping columns
pub fn is_bookkeeping_column(name: &str) -> bool {
    name.starts_with(BOOKKEEPING_PREFIX)
}

/// Whether a column is a spreadsheet artifact (an unnamed header)
pub fn is_unnamed_column(name: &str) -> bool {
    name.to_lowercase().starts_with("unnamed")
}

/// Warehouse schema helper
pub struct WarehouseSchema;

impl WarehouseSchema {
    /// Schemas created by `initialize`
    pub fn schemas() -> [&'static str; 4] {
        [RAW_SCHEMA, BRONZE_SCHEMA, GOLD_SCHEMA, METADATA_SCHEMA]
    }

    /// Schema and run log creation SQL
    ///
    /// This SQL is compatible with both DuckDB and PostgreSQL.
    pub fn create_schemas_sql() -> String {
        let mut sql: String = Self::schemas()
            .iter()
            .map(|s| format!("CREATE SCHEMA IF NOT EXISTS {};\n", quote_ident(s)))
            .collect();
        sql.push_str(&Self::create_run_log_sql());
        sql
    }

    /// Append-only run log; failure entries carry a NULL `filter_end`
    pub fn create_run_log_sql() -> String {
        format!(
            r#"
CREATE TABLE IF NOT EXISTS {} (
    run_id TEXT,
    table_name TEXT NOT NULL,
    status TEXT NOT NULL,
    filter_end TIMESTAMP,
    rows_processed BIGINT,
    error TEXT,
    run_completed_at TIMESTAMP NOT NULL
);
"#,
            qualified(METADATA_SCHEMA, RUN_LOG_TABLE)
        )
    }

    /// DDL for a staging table
    pub fn create_table_sql(schema: &str, table: &str, columns: &[(String, String)]) -> String {
        let defs: Vec<String> = columns
            .iter()
            .map(|(name, ty)| format!("{} {}", quote_ident(name), ty))
            .collect();
        format!(
            "CREATE TABLE {} ({})",
            qualified(schema, table),
            defs.join(", ")
        )
    }

    pub fn drop_table_sql(schema: &str, table: &str) -> String {
        format!("DROP TABLE IF EXISTS {}", qualified(schema, table))
    }

    /// Column definitions of `raw.<table>` for a row set, bookkeeping last
    pub fn staging_columns(rows: &StagingRowSet) -> Vec<(String, String)> {
        let mut columns: Vec<(String, String)> = rows
            .columns
            .iter()
            .map(|c| (c.name.clone(), c.kind.sql_type().to_string()))
            .collect();
        columns.push((LOAD_ID_COLUMN.to_string(), "TEXT".to_string()));
        columns.push((LOADED_AT_COLUMN.to_string(), "TIMESTAMP".to_string()));
        columns
    }

    /// Drop, create and row-insert SQL for replacing `raw.<table>`
    pub fn staging_sql(dialect: Dialect, rows: &StagingRowSet) -> (String, String, String) {
        let columns = Self::staging_columns(rows);
        let names: Vec<&str> = columns.iter().map(|(name, _)| name.as_str()).collect();
        (
            Self::drop_table_sql(RAW_SCHEMA, &rows.table),
            Self::create_table_sql(RAW_SCHEMA, &rows.table, &columns),
            Self::insert_row_sql(dialect, RAW_SCHEMA, &rows.table, &names),
        )
    }

    /// Parameterized single-row insert
    pub fn insert_row_sql(dialect: Dialect, schema: &str, table: &str, columns: &[&str]) -> String {
        let names: Vec<String> = columns.iter().map(|c| quote_ident(c)).collect();
        format!(
            "INSERT INTO {} ({}) VALUES ({})",
            qualified(schema, table),
            names.join(", "),
            dialect.placeholders(columns.len())
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_ident_escapes_quotes() {
        assert_eq!(quote_ident("name"), "\"name\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
        assert_eq!(qualified("raw", "crm_leads"), "\"raw\".\"crm_leads\"");
    }

    #[test]
    fn test_schema_sql_covers_all_layers() {
        let sql = WarehouseSchema::create_schemas_sql();
        for schema in WarehouseSchema::schemas() {
            assert!(sql.contains(&format!("CREATE SCHEMA IF NOT EXISTS \"{}\"", schema)));
        }
        assert!(sql.contains("\"metadata\".\"etl_run_log\""));
        assert!(sql.contains("filter_end TIMESTAMP"));
    }

    #[test]
    fn test_insert_row_sql() {
        let sql =
            WarehouseSchema::insert_row_sql(Dialect::Postgres, "raw", "t", &["a", "b"]);
        assert_eq!(sql, "INSERT INTO \"raw\".\"t\" (\"a\", \"b\") VALUES ($1, $2)");
    }

    #[test]
    fn test_column_classes() {
        assert!(is_bookkeeping_column(LOAD_ID_COLUMN));
        assert!(!is_bookkeeping_column("eventid"));
        assert!(is_unnamed_column("unnamed_3"));
        assert!(is_unnamed_column("Unnamed: 0"));
        assert!(!is_unnamed_column("name"));
    }
}

//! Raw-to-bronze reconciliation
//!
//! Each table is reconciled in its own transaction: optional bronze
//! provisioning, key deletion (merge only), insert, raw drain and the success
//! run log entry commit together or not at all.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info, warn};

use crate::database::schema::{
    BRONZE_SCHEMA, RAW_SCHEMA, WarehouseSchema, is_bookkeeping_column, is_unnamed_column,
};
use crate::database::{ColumnInfo, DatabaseError, Statement, Warehouse, qualified, quote_ident};
use crate::runlog::{RunLog, RunLogEntry, parse_warehouse_timestamp};
use crate::tables::{TableConfig, WriteStrategy};

const RANK_COLUMN: &str = "_elt_rank";

/// Error that turns a table's outcome into `error`
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("Schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

/// Per-table result of a reconciliation run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum TableOutcome {
    /// Nothing staged; bronze untouched
    Skipped { rows: u64 },
    Success {
        rows: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filter_end: Option<NaiveDateTime>,
    },
    Error { error: String },
}

impl TableOutcome {
    pub fn is_error(&self) -> bool {
        matches!(self, TableOutcome::Error { .. })
    }

    pub fn rows(&self) -> u64 {
        match self {
            TableOutcome::Skipped { rows } | TableOutcome::Success { rows, .. } => *rows,
            TableOutcome::Error { .. } => 0,
        }
    }
}

impl std::fmt::Display for TableOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TableOutcome::Skipped { rows } => write!(f, "skipped ({} rows)", rows),
            TableOutcome::Success {
                rows,
                filter_end: Some(end),
            } => write!(f, "success ({} rows, filter_end={})", rows, end),
            TableOutcome::Success { rows, .. } => write!(f, "success ({} rows)", rows),
            TableOutcome::Error { error } => write!(f, "error: {}", error),
        }
    }
}

/// Aggregate `{table: outcome}` map of one run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReconcileReport {
    pub run_id: String,
    pub outcomes: BTreeMap<String, TableOutcome>,
}

impl ReconcileReport {
    pub fn error_count(&self) -> usize {
        self.outcomes.values().filter(|o| o.is_error()).count()
    }

    pub fn rows_written(&self) -> u64 {
        self.outcomes
            .values()
            .filter(|o| matches!(o, TableOutcome::Success { .. }))
            .map(TableOutcome::rows)
            .sum()
    }

    pub fn get(&self, table: &str) -> Option<&TableOutcome> {
        self.outcomes.get(table)
    }
}

/// A column copied from raw into bronze
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PlannedColumn {
    pub name: String,
    /// Bronze type to cast to when the raw type differs
    pub cast_to: Option<String>,
}

impl PlannedColumn {
    /// Selection expression over the `staged` alias
    fn select_expr(&self) -> String {
        let column = format!("staged.{}", quote_ident(&self.name));
        match &self.cast_to {
            Some(ty) => format!("CAST({} AS {}) AS {}", column, ty, quote_ident(&self.name)),
            None => column,
        }
    }
}

/// Columns present in both tables, data columns in raw order then bookkeeping
pub(crate) fn plan_columns(
    table: &str,
    raw: &[ColumnInfo],
    bronze: &[ColumnInfo],
) -> Result<Vec<PlannedColumn>, ReconcileError> {
    let bronze_types: HashMap<&str, &str> = bronze
        .iter()
        .map(|c| (c.name.as_str(), c.data_type.as_str()))
        .collect();

    let mut ordered: Vec<&ColumnInfo> = raw.iter().filter(|c| !is_unnamed_column(&c.name)).collect();
    ordered.sort_by_key(|c| (is_bookkeeping_column(&c.name), c.ordinal));

    let planned: Vec<PlannedColumn> = ordered
        .into_iter()
        .filter_map(|c| {
            let bronze_type = bronze_types.get(c.name.as_str())?;
            let cast_to = (!c.data_type.eq_ignore_ascii_case(bronze_type))
                .then(|| bronze_type.to_string());
            Some(PlannedColumn {
                name: c.name.clone(),
                cast_to,
            })
        })
        .collect();

    if !planned.iter().any(|c| !is_bookkeeping_column(&c.name)) {
        return Err(ReconcileError::SchemaMismatch(format!(
            "{}: raw and bronze share no data columns",
            table
        )));
    }
    Ok(planned)
}

/// Bronze DDL derived from the raw column set
pub(crate) fn provision_sql(table: &str, raw: &[ColumnInfo]) -> String {
    let columns: Vec<(String, String)> = raw
        .iter()
        .filter(|c| !is_unnamed_column(&c.name))
        .map(|c| (c.name.clone(), c.data_type.clone()))
        .collect();
    WarehouseSchema::create_table_sql(BRONZE_SCHEMA, table, &columns)
}

fn column_list(columns: &[PlannedColumn]) -> String {
    columns
        .iter()
        .map(|c| quote_ident(&c.name))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Delete bronze rows whose key tuple appears in the raw batch
pub(crate) fn merge_delete_sql(table: &str, key: &[&PlannedColumn]) -> String {
    let predicate = key
        .iter()
        .map(|c| {
            let staged = format!("staged.{}", quote_ident(&c.name));
            let staged = match &c.cast_to {
                Some(ty) => format!("CAST({} AS {})", staged, ty),
                None => staged,
            };
            format!("target.{} = {}", quote_ident(&c.name), staged)
        })
        .collect::<Vec<_>>()
        .join(" AND ");

    format!(
        "DELETE FROM {} AS target WHERE EXISTS (SELECT 1 FROM {} AS staged WHERE {})",
        qualified(BRONZE_SCHEMA, table),
        qualified(RAW_SCHEMA, table),
        predicate
    )
}

/// Insert the latest raw row per key, newest by `order_by`
pub(crate) fn merge_insert_sql(
    table: &str,
    columns: &[PlannedColumn],
    key: &[&PlannedColumn],
    order_by: &str,
) -> String {
    let exprs: Vec<String> = columns.iter().map(PlannedColumn::select_expr).collect();
    let partition = key
        .iter()
        .map(|c| format!("staged.{}", quote_ident(&c.name)))
        .collect::<Vec<_>>()
        .join(", ");
    let names = column_list(columns);

    format!(
        "INSERT INTO {target} ({names}) SELECT {names} FROM (SELECT {exprs}, \
         ROW_NUMBER() OVER (PARTITION BY {partition} ORDER BY staged.{order} DESC NULLS LAST) AS {rank} \
         FROM {source} AS staged) AS ranked WHERE {rank} = 1",
        target = qualified(BRONZE_SCHEMA, table),
        names = names,
        exprs = exprs.join(", "),
        partition = partition,
        order = quote_ident(order_by),
        rank = quote_ident(RANK_COLUMN),
        source = qualified(RAW_SCHEMA, table),
    )
}

/// Number of rows `merge_insert_sql` writes: one per distinct key tuple
pub(crate) fn merge_row_count_sql(table: &str, key: &[&PlannedColumn]) -> String {
    let group = key
        .iter()
        .map(|c| format!("staged.{}", quote_ident(&c.name)))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "SELECT COUNT(*) AS n FROM (SELECT 1 AS k FROM {} AS staged GROUP BY {}) AS grouped",
        qualified(RAW_SCHEMA, table),
        group
    )
}

/// Insert every raw row as-is
pub(crate) fn append_insert_sql(table: &str, columns: &[PlannedColumn]) -> String {
    let exprs: Vec<String> = columns.iter().map(PlannedColumn::select_expr).collect();
    format!(
        "INSERT INTO {} ({}) SELECT {} FROM {} AS staged",
        qualified(BRONZE_SCHEMA, table),
        column_list(columns),
        exprs.join(", "),
        qualified(RAW_SCHEMA, table)
    )
}

/// Moves staged rows into bronze, one transaction per table
pub struct Reconciler<'a, W: Warehouse + ?Sized> {
    warehouse: &'a W,
    run_id: String,
}

impl<'a, W: Warehouse + ?Sized> Reconciler<'a, W> {
    pub fn new(warehouse: &'a W) -> Self {
        Self::with_run_id(warehouse, uuid::Uuid::new_v4().to_string())
    }

    pub fn with_run_id(warehouse: &'a W, run_id: impl Into<String>) -> Self {
        Self {
            warehouse,
            run_id: run_id.into(),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Reconcile every table; one table's failure never stops the others
    pub async fn reconcile_all(&self, tables: &[TableConfig]) -> ReconcileReport {
        match self.warehouse.terminate_stale_sessions().await {
            Ok(0) => {}
            Ok(n) => info!("Terminated {} stale session(s) before reconciling", n),
            Err(e) => warn!("Could not terminate stale sessions: {}", e),
        }

        let run_log = RunLog::new(self.warehouse);
        let mut report = ReconcileReport {
            run_id: self.run_id.clone(),
            outcomes: BTreeMap::new(),
        };

        for table in tables {
            let outcome = match self.reconcile_table(table).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    let error = e.to_string();
                    warn!("{}: reconciliation failed: {}", table.name, error);
                    let entry = RunLogEntry::failure(&self.run_id, &table.name, &error);
                    if let Err(log_err) = run_log.record_run(&entry).await {
                        warn!("{}: could not record failure: {}", table.name, log_err);
                    }
                    TableOutcome::Error { error }
                }
            };
            info!("{}: {}", table.name, outcome);
            report.outcomes.insert(table.name.clone(), outcome);
        }

        report
    }

    /// Reconcile one table
    pub async fn reconcile_table(&self, table: &TableConfig) -> Result<TableOutcome, ReconcileError> {
        let name = table.name.as_str();
        if !self.warehouse.table_exists(RAW_SCHEMA, name).await? {
            debug!("{}: no raw table", name);
            return Ok(TableOutcome::Skipped { rows: 0 });
        }
        let staged_rows = self.warehouse.count_rows(RAW_SCHEMA, name).await?;
        if staged_rows == 0 {
            return Ok(TableOutcome::Skipped { rows: 0 });
        }

        let raw_columns = self.warehouse.table_columns(RAW_SCHEMA, name).await?;
        let mut bronze_columns = self.warehouse.table_columns(BRONZE_SCHEMA, name).await?;

        let mut statements = Vec::new();
        if bronze_columns.is_empty() {
            info!("{}: provisioning bronze table from raw columns", name);
            statements.push(Statement::new(provision_sql(name, &raw_columns)));
            bronze_columns = raw_columns
                .iter()
                .filter(|c| !is_unnamed_column(&c.name))
                .cloned()
                .collect();
        }

        let columns = plan_columns(name, &raw_columns, &bronze_columns)?;
        let cursor_present = columns.iter().any(|c| c.name == table.incremental_column);

        let mut written_rows = staged_rows;
        let insert_sql = match table.strategy {
            WriteStrategy::Merge => {
                let mut key = Vec::new();
                for key_column in table.merge_key() {
                    let planned = columns.iter().find(|c| c.name == key_column).ok_or_else(|| {
                        ReconcileError::SchemaMismatch(format!(
                            "{}: key column '{}' missing from raw or bronze",
                            name, key_column
                        ))
                    })?;
                    key.push(planned);
                }
                statements.push(Statement::new(merge_delete_sql(name, &key)));
                if cursor_present {
                    let counted = self
                        .warehouse
                        .execute_query(&merge_row_count_sql(name, &key))
                        .await?;
                    written_rows = counted
                        .first_i64("n")
                        .map_or(staged_rows, |n| n.max(0) as u64);
                    merge_insert_sql(name, &columns, &key, &table.incremental_column)
                } else {
                    // No cursor to pick a winner by, so every staged row is kept
                    warn!(
                        "{}: '{}' not staged, inserting all {} rows without dedup",
                        name, table.incremental_column, staged_rows
                    );
                    append_insert_sql(name, &columns)
                }
            }
            WriteStrategy::Append => append_insert_sql(name, &columns),
        };
        let insert_index = statements.len();
        statements.push(Statement::new(insert_sql));
        statements.push(Statement::new(format!(
            "DELETE FROM {}",
            qualified(RAW_SCHEMA, name)
        )));

        let run_log = RunLog::new(self.warehouse);
        let previous = run_log.get_last_watermark(name).await;
        let staged_max = if cursor_present {
            self.max_staged_cursor(name, &table.incremental_column).await?
        } else {
            None
        };
        let filter_end = staged_max.map_or(previous, |m| m.max(previous));

        let entry = RunLogEntry::success(&self.run_id, name, filter_end, written_rows);
        statements.push(run_log.insert_statement(&entry));

        let counts = self.warehouse.run_in_transaction(&statements).await?;
        let rows = counts.get(insert_index).copied().unwrap_or(written_rows);

        Ok(TableOutcome::Success {
            rows,
            filter_end: Some(filter_end),
        })
    }

    async fn max_staged_cursor(
        &self,
        table: &str,
        column: &str,
    ) -> Result<Option<NaiveDateTime>, ReconcileError> {
        let sql = format!(
            "SELECT CAST(MAX({}) AS VARCHAR) AS m FROM {}",
            quote_ident(column),
            qualified(RAW_SCHEMA, table)
        );
        let result = self.warehouse.execute_query(&sql).await?;
        let value = result.first_str("m").and_then(parse_warehouse_timestamp);
        if value.is_none() && result.first_str("m").is_some() {
            warn!("{}: '{}' is not a timestamp column, watermark not advanced", table, column);
        }
        Ok(value)
    }
}

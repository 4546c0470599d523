//! Run log and watermark store
//!
//! `metadata.etl_run_log` is an append-only ledger. The watermark of a table
//! is the `filter_end` of its most recent successful entry.

use chrono::{NaiveDate, NaiveDateTime, Utc};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::database::schema::{METADATA_SCHEMA, RUN_LOG_TABLE};
use crate::database::{
    DatabaseError, DatabaseResult, SqlValue, Statement, Warehouse, json_as_i64, qualified,
};

/// Watermark used when a table has no successful run yet
pub static SENTINEL_WATERMARK: Lazy<NaiveDateTime> = Lazy::new(|| {
    NaiveDate::from_ymd_opt(1900, 1, 1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .unwrap_or_default()
});

const TIMESTAMP_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"];

/// Parse a timestamp rendered by the warehouse as text
pub fn parse_warehouse_timestamp(value: &str) -> Option<NaiveDateTime> {
    let value = value.trim();
    TIMESTAMP_FORMATS
        .iter()
        .find_map(|f| NaiveDateTime::parse_from_str(value, f).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(value, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

/// Outcome recorded for one table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Success,
    Failure,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Success => "success",
            RunStatus::Failure => "failure",
        }
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(RunStatus::Success),
            "failure" | "failed" => Ok(RunStatus::Failure),
            _ => Err(format!("Unknown run status: {}", s)),
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of the run log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunLogEntry {
    pub run_id: String,
    pub table_name: String,
    pub status: RunStatus,
    /// Watermark achieved; always `None` for failures
    pub filter_end: Option<NaiveDateTime>,
    pub rows_processed: Option<i64>,
    pub error: Option<String>,
    pub run_completed_at: NaiveDateTime,
}

impl RunLogEntry {
    pub fn success(
        run_id: impl Into<String>,
        table_name: impl Into<String>,
        filter_end: NaiveDateTime,
        rows_processed: u64,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            table_name: table_name.into(),
            status: RunStatus::Success,
            filter_end: Some(filter_end),
            rows_processed: Some(rows_processed as i64),
            error: None,
            run_completed_at: Utc::now().naive_utc(),
        }
    }

    pub fn failure(
        run_id: impl Into<String>,
        table_name: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            table_name: table_name.into(),
            status: RunStatus::Failure,
            filter_end: None,
            rows_processed: None,
            error: Some(error.into()),
            run_completed_at: Utc::now().naive_utc(),
        }
    }

    fn from_row(row: &serde_json::Value) -> DatabaseResult<Self> {
        let text = |col: &str| row.get(col).and_then(|v| v.as_str()).map(str::to_string);
        let timestamp = |col: &str| {
            row.get(col)
                .and_then(|v| v.as_str())
                .and_then(parse_warehouse_timestamp)
        };

        let status = text("status")
            .ok_or_else(|| DatabaseError::SerializationError("run log row without status".into()))?
            .parse()
            .map_err(DatabaseError::SerializationError)?;

        Ok(Self {
            run_id: text("run_id").unwrap_or_default(),
            table_name: text("table_name").unwrap_or_default(),
            status,
            filter_end: timestamp("filter_end"),
            rows_processed: row.get("rows_processed").and_then(json_as_i64),
            error: text("error"),
            run_completed_at: timestamp("run_completed_at").ok_or_else(|| {
                DatabaseError::SerializationError("run log row without completion time".into())
            })?,
        })
    }
}

/// Reads and appends run log entries through a warehouse handle
pub struct RunLog<'a, W: Warehouse + ?Sized> {
    warehouse: &'a W,
}

impl<'a, W: Warehouse + ?Sized> RunLog<'a, W> {
    pub fn new(warehouse: &'a W) -> Self {
        Self { warehouse }
    }

    fn select_sql(&self, filter: &str) -> String {
        format!(
            "SELECT run_id, table_name, status, \
             CAST(filter_end AS VARCHAR) AS filter_end, rows_processed, error, \
             CAST(run_completed_at AS VARCHAR) AS run_completed_at \
             FROM {} AS log WHERE log.table_name = {}{} \
             ORDER BY log.run_completed_at DESC, log.filter_end DESC NULLS LAST",
            qualified(METADATA_SCHEMA, RUN_LOG_TABLE),
            self.warehouse.dialect().placeholder(1),
            filter
        )
    }

    /// Watermark of the most recent successful run, if any
    pub async fn try_last_watermark(&self, table: &str) -> DatabaseResult<Option<NaiveDateTime>> {
        let sql = format!(
            "{} LIMIT 1",
            self.select_sql(" AND log.status = 'success' AND log.filter_end IS NOT NULL")
        );
        let result = self
            .warehouse
            .execute_query_params(&sql, &[SqlValue::text(table)])
            .await?;

        match result.first_str("filter_end") {
            Some(raw) => parse_warehouse_timestamp(raw).map(Some).ok_or_else(|| {
                DatabaseError::SerializationError(format!("unreadable filter_end '{}'", raw))
            }),
            None => Ok(None),
        }
    }

    /// Current watermark, degrading to the sentinel when none is recorded or
    /// the lookup fails
    pub async fn get_last_watermark(&self, table: &str) -> NaiveDateTime {
        match self.try_last_watermark(table).await {
            Ok(Some(value)) => {
                info!("{}: seeded from run log (filter_end={})", table, value);
                value
            }
            Ok(None) => {
                info!(
                    "{}: no run log entry, using {}",
                    table, *SENTINEL_WATERMARK
                );
                *SENTINEL_WATERMARK
            }
            Err(e) => {
                warn!("{}: could not read run log ({}), using default", table, e);
                *SENTINEL_WATERMARK
            }
        }
    }

    /// Most recent entry of any status
    pub async fn latest_entry(&self, table: &str) -> DatabaseResult<Option<RunLogEntry>> {
        Ok(self.history(table, 1).await?.into_iter().next())
    }

    /// Most recent entries first
    pub async fn history(&self, table: &str, limit: usize) -> DatabaseResult<Vec<RunLogEntry>> {
        let sql = format!("{} LIMIT {}", self.select_sql(""), limit);
        let result = self
            .warehouse
            .execute_query_params(&sql, &[SqlValue::text(table)])
            .await?;
        result.rows.iter().map(RunLogEntry::from_row).collect()
    }

    /// Insert statement for `entry`, for use inside a larger transaction
    pub fn insert_statement(&self, entry: &RunLogEntry) -> Statement {
        Statement::with_params(
            format!(
                "INSERT INTO {} (run_id, table_name, status, filter_end, rows_processed, error, run_completed_at) \
                 VALUES ({})",
                qualified(METADATA_SCHEMA, RUN_LOG_TABLE),
                self.warehouse.dialect().placeholders(7)
            ),
            vec![
                SqlValue::text(entry.run_id.as_str()),
                SqlValue::text(entry.table_name.as_str()),
                SqlValue::text(entry.status.as_str()),
                SqlValue::Timestamp(entry.filter_end),
                SqlValue::BigInt(entry.rows_processed),
                SqlValue::Text(entry.error.clone()),
                SqlValue::Timestamp(Some(entry.run_completed_at)),
            ],
        )
    }

    /// Append `entry`; history is never rewritten
    pub async fn record_run(&self, entry: &RunLogEntry) -> DatabaseResult<()> {
        let statement = self.insert_statement(entry);
        self.warehouse
            .execute_statement(&statement.sql, &statement.params)
            .await?;
        Ok(())
    }
}

#[cfg(all(test, feature = "duckdb-backend"))]
mod tests {
    use super::*;
    use crate::database::DuckDBWarehouse;

    fn day(d: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, d)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
    }

    #[test]
    fn test_parse_warehouse_timestamp() {
        assert_eq!(parse_warehouse_timestamp("2024-01-02 00:00:00"), Some(day(2)));
        assert_eq!(parse_warehouse_timestamp("2024-01-02T00:00:00"), Some(day(2)));
        assert_eq!(parse_warehouse_timestamp("2024-01-02"), Some(day(2)));
        assert!(parse_warehouse_timestamp("02/01/2024").is_none());
    }

    #[tokio::test]
    async fn test_sentinel_when_empty() {
        let warehouse = DuckDBWarehouse::in_memory().unwrap();
        warehouse.initialize().await.unwrap();
        let log = RunLog::new(&warehouse);

        assert_eq!(log.get_last_watermark("crm_leads").await, *SENTINEL_WATERMARK);
        assert!(log.latest_entry("crm_leads").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_lookup_failure_degrades_to_sentinel() {
        // No initialize: the run log table does not exist
        let warehouse = DuckDBWarehouse::in_memory().unwrap();
        let log = RunLog::new(&warehouse);

        assert!(log.try_last_watermark("crm_leads").await.is_err());
        assert_eq!(log.get_last_watermark("crm_leads").await, *SENTINEL_WATERMARK);
    }

    #[tokio::test]
    async fn test_latest_success_wins_and_failures_ignored() {
        let warehouse = DuckDBWarehouse::in_memory().unwrap();
        warehouse.initialize().await.unwrap();
        let log = RunLog::new(&warehouse);

        log.record_run(&RunLogEntry::success("r1", "crm_leads", day(1), 3))
            .await
            .unwrap();
        log.record_run(&RunLogEntry::success("r2", "crm_leads", day(5), 2))
            .await
            .unwrap();
        log.record_run(&RunLogEntry::failure("r3", "crm_leads", "lock timeout"))
            .await
            .unwrap();
        log.record_run(&RunLogEntry::success("r4", "crm_buyers", day(9), 1))
            .await
            .unwrap();

        assert_eq!(log.get_last_watermark("crm_leads").await, day(5));

        let latest = log.latest_entry("crm_leads").await.unwrap().unwrap();
        assert_eq!(latest.status, RunStatus::Failure);
        assert_eq!(latest.filter_end, None);
        assert_eq!(latest.error.as_deref(), Some("lock timeout"));

        let history = log.history("crm_leads", 10).await.unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[2].rows_processed, Some(3));
    }
}

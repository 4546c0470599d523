//! CRM ELT - incremental spreadsheet-to-warehouse pipeline
//!
//! Provides unified interfaces for:
//! - Classifying exported CRM spreadsheets by filename and partition year
//! - Incremental extraction against a run-log watermark
//! - Loading extracted rows into the `raw` staging schema
//! - Reconciling `raw` into the durable `bronze` schema (merge or append)
//! - Refreshing `gold` summary views
//!
//! The warehouse handle is always passed explicitly; nothing in this crate
//! holds a process-wide connection.

#[cfg(feature = "cli")]
pub mod cli;
pub mod classify;
pub mod config;
pub mod database;
pub mod extract;
pub mod gold;
pub mod pipeline;
pub mod reconcile;
pub mod runlog;
pub mod source;
pub mod tables;

// Re-export commonly used types
pub use classify::{Classification, FilenameClassifier};
pub use config::{ConfigError, PipelineConfig};
pub use database::{DatabaseError, DatabaseResult, QueryResult, SqlValue, Warehouse};
#[cfg(feature = "duckdb-backend")]
pub use database::DuckDBWarehouse;
#[cfg(feature = "postgres-backend")]
pub use database::PostgresWarehouse;
pub use extract::{ExtractError, IncrementalExtractor, StagingRowSet};
pub use gold::{GoldRefreshResult, refresh_gold_views};
pub use pipeline::{LoadReport, Pipeline, PipelineError, PipelineReport, RunOptions};
pub use reconcile::{ReconcileReport, Reconciler, TableOutcome};
pub use runlog::{RunLog, RunLogEntry, RunStatus, SENTINEL_WATERMARK};
pub use source::{FileStore, LocalFolderStore, RemoteFile, SourceError, StagedFiles};
pub use tables::{TableConfig, TableRegistry, WriteStrategy};

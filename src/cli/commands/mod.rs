//! CLI command implementations

pub mod classify;
pub mod init;
pub mod query;
pub mod run;
pub mod status;

use std::path::{Path, PathBuf};
use tracing::info;

use crate::cli::error::CliError;
use crate::config::{DatabaseBackendType, PipelineConfig};
use crate::database::Warehouse;

/// Arguments shared by every command
#[derive(Debug, Clone)]
pub struct CommonArgs {
    /// Directory holding `crm-elt.toml`; relative paths resolve against it
    pub config_dir: PathBuf,
}

impl CommonArgs {
    pub fn load_config(&self) -> Result<PipelineConfig, CliError> {
        Ok(PipelineConfig::load(&self.config_dir)?)
    }
}

/// Runtime for a single command
pub(crate) fn runtime() -> Result<tokio::runtime::Runtime, CliError> {
    tokio::runtime::Runtime::new()
        .map_err(|e| CliError::IoError(format!("Failed to create runtime: {}", e)))
}

/// Open the configured warehouse
pub(crate) async fn open_warehouse(
    config: &PipelineConfig,
    config_dir: &Path,
) -> Result<Box<dyn Warehouse>, CliError> {
    match config.database.backend {
        DatabaseBackendType::DuckDB => {
            let db_path = config.get_duckdb_path(config_dir);
            info!("Opening DuckDB warehouse at {}", db_path.display());
            let warehouse = crate::database::DuckDBWarehouse::new(&db_path)?;
            Ok(Box::new(warehouse))
        }
        DatabaseBackendType::Postgres => {
            #[cfg(feature = "postgres-backend")]
            {
                let warehouse =
                    crate::database::PostgresWarehouse::connect(&config.postgres).await?;
                info!(
                    "Connected to PostgreSQL warehouse {}",
                    warehouse.connection_string_masked()
                );
                Ok(Box::new(warehouse))
            }
            #[cfg(not(feature = "postgres-backend"))]
            {
                Err(CliError::InvalidArgument(
                    "PostgreSQL backend not enabled. Build with --features postgres-backend"
                        .to_string(),
                ))
            }
        }
    }
}

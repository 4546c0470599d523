//! `init` command: config file, schemas and run log table

use crate::cli::commands::{CommonArgs, open_warehouse, runtime};
use crate::cli::error::CliError;
use crate::config::{CONFIG_FILENAME, PipelineConfig, sample_config};
use crate::database::WarehouseSchema;

/// Init command arguments
#[derive(Debug, Clone)]
pub struct InitArgs {
    pub common: CommonArgs,
    /// Write a sample `crm-elt.toml` when none exists
    pub write_config: bool,
}

/// Create the warehouse layers
pub fn handle_init(args: &InitArgs) -> Result<(), CliError> {
    let config_dir = &args.common.config_dir;

    if args.write_config && !PipelineConfig::exists(config_dir) {
        std::fs::create_dir_all(config_dir)
            .map_err(|e| CliError::IoError(format!("Failed to create {}: {}", config_dir.display(), e)))?;
        std::fs::write(config_dir.join(CONFIG_FILENAME), sample_config())
            .map_err(|e| CliError::IoError(format!("Failed to write config: {}", e)))?;
        println!("Wrote {}", config_dir.join(CONFIG_FILENAME).display());
    }

    let config = args.common.load_config()?;
    let rt = runtime()?;

    rt.block_on(async {
        let warehouse = open_warehouse(&config, config_dir).await?;
        warehouse.initialize().await?;

        println!("Initialized {} warehouse", warehouse.backend_type());
        for schema in WarehouseSchema::schemas() {
            println!("  schema {}", schema);
        }
        println!("  {} table(s) configured", config.tables.len());
        Ok::<(), CliError>(())
    })
}

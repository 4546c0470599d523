//! `status` command: watermark and latest run per table

use crate::cli::commands::{CommonArgs, open_warehouse, runtime};
use crate::cli::error::CliError;
use crate::runlog::{RunLog, SENTINEL_WATERMARK};

/// Status command arguments
#[derive(Debug, Clone)]
pub struct StatusArgs {
    pub common: CommonArgs,
}

/// Print the watermark and the most recent run log entry of every table
pub fn handle_status(args: &StatusArgs) -> Result<(), CliError> {
    let config_dir = &args.common.config_dir;
    let config = args.common.load_config()?;
    let registry = config.registry()?;
    let rt = runtime()?;

    rt.block_on(async {
        let warehouse = open_warehouse(&config, config_dir).await?;
        let run_log = RunLog::new(warehouse.as_ref());

        println!("Backend: {}", warehouse.backend_type());
        println!(
            "{:<22} {:<8} {:<22} {:<10} {}",
            "table", "strategy", "watermark", "last run", "completed"
        );

        for table in registry.iter() {
            let watermark = match run_log.try_last_watermark(&table.name).await? {
                Some(value) => value.to_string(),
                None => format!("{} (none)", SENTINEL_WATERMARK.date()),
            };
            let (status, completed) = match run_log.latest_entry(&table.name).await? {
                Some(entry) => (
                    entry.status.to_string(),
                    match entry.error {
                        Some(error) => format!("{} ({})", entry.run_completed_at, error),
                        None => entry.run_completed_at.to_string(),
                    },
                ),
                None => ("-".to_string(), "-".to_string()),
            };
            println!(
                "{:<22} {:<8} {:<22} {:<10} {}",
                table.name,
                table.strategy.to_string(),
                watermark,
                status,
                completed
            );
        }

        Ok::<(), CliError>(())
    })
}

//! SQL query CLI command
//!
//! Runs ad-hoc SQL against the configured warehouse. A handful of canned
//! queries are available as `:name` shortcuts.

use crate::cli::commands::{CommonArgs, open_warehouse, runtime};
use crate::cli::error::CliError;
use crate::database::{OutputFormat, format_query_result};

/// Query command arguments
#[derive(Debug, Clone)]
pub struct QueryArgs {
    pub common: CommonArgs,
    /// SQL query to execute, or a `:name` shortcut
    pub sql: String,
    /// Output format
    pub format: String,
}

/// Execute a SQL query against the warehouse
pub fn handle_query(args: &QueryArgs) -> Result<(), CliError> {
    let config_dir = &args.common.config_dir;
    let config = args.common.load_config()?;

    let output_format: OutputFormat = args
        .format
        .parse()
        .map_err(|e: String| CliError::InvalidArgument(e))?;
    let sql = queries::resolve(&args.sql)?;

    let rt = runtime()?;
    rt.block_on(async {
        let warehouse = open_warehouse(&config, config_dir).await?;
        let result = warehouse.execute_query(&sql).await?;

        println!("{}", format_query_result(&result, output_format));

        // Print execution time for non-JSON formats
        if output_format != OutputFormat::Json {
            eprintln!("\nExecution time: {}ms", result.execution_time_ms);
        }
        Ok::<(), CliError>(())
    })
}

/// Canned warehouse queries
pub mod queries {
    use crate::cli::error::CliError;

    /// Most recent run log entries across all tables
    pub const RECENT_RUNS: &str = r#"
SELECT
    table_name,
    status,
    CAST(filter_end AS VARCHAR) AS filter_end,
    rows_processed,
    CAST(run_completed_at AS VARCHAR) AS run_completed_at,
    error
FROM metadata.etl_run_log
ORDER BY run_completed_at DESC
LIMIT 50
"#;

    /// Current watermark per table
    pub const WATERMARKS: &str = r#"
SELECT
    table_name,
    CAST(MAX(filter_end) AS VARCHAR) AS watermark
FROM metadata.etl_run_log
WHERE status = 'success'
GROUP BY table_name
ORDER BY table_name
"#;

    /// Tables in the pipeline layers
    pub const LAYER_TABLES: &str = r#"
SELECT
    CAST(table_schema AS VARCHAR) AS table_schema,
    CAST(table_name AS VARCHAR) AS table_name
FROM information_schema.tables
WHERE table_schema IN ('raw', 'bronze', 'gold', 'metadata')
ORDER BY table_schema, table_name
"#;

    /// Expand a `:name` shortcut; anything else is passed through
    pub fn resolve(input: &str) -> Result<String, CliError> {
        let trimmed = input.trim();
        let Some(name) = trimmed.strip_prefix(':') else {
            return Ok(trimmed.to_string());
        };
        match name {
            "runs" => Ok(RECENT_RUNS.to_string()),
            "watermarks" => Ok(WATERMARKS.to_string()),
            "tables" => Ok(LAYER_TABLES.to_string()),
            _ => Err(CliError::InvalidArgument(format!(
                "Unknown query shortcut ':{}'. Available: :runs, :watermarks, :tables",
                name
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::queries;

    #[test]
    fn test_resolve_shortcuts() {
        assert_eq!(queries::resolve(" SELECT 1 ").unwrap(), "SELECT 1");
        assert_eq!(queries::resolve(":runs").unwrap(), queries::RECENT_RUNS);
        assert!(queries::resolve(":nope").is_err());
    }
}

//! `run`, `extract` and `transform` commands

use crate::cli::commands::{CommonArgs, open_warehouse, runtime};
use crate::cli::error::CliError;
use crate::pipeline::{LoadReport, Pipeline, PipelineReport, RunOptions};
use crate::source::open_file_store;

/// Which stages a pipeline command runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Extract, load, reconcile and refresh
    All,
    /// Stage and load into raw only
    Extract,
    /// Reconcile and refresh only
    Transform,
}

/// Pipeline command arguments
#[derive(Debug, Clone)]
pub struct RunArgs {
    pub common: CommonArgs,
    pub stage: Stage,
    pub tables: Vec<String>,
    pub dry_run: bool,
    /// Print the report as JSON instead of text
    pub json: bool,
}

/// Run the pipeline stages selected by `args.stage`
pub fn handle_run(args: &RunArgs) -> Result<(), CliError> {
    if args.dry_run && args.stage == Stage::Transform {
        return Err(CliError::InvalidArgument(
            "--dry-run only applies to stages that extract".to_string(),
        ));
    }

    let config_dir = &args.common.config_dir;
    let config = args.common.load_config()?;
    let options = RunOptions {
        tables: args.tables.clone(),
        dry_run: args.dry_run,
    };

    let rt = runtime()?;
    let report = rt.block_on(async {
        let warehouse = open_warehouse(&config, config_dir).await?;
        warehouse.initialize().await?;
        let pipeline = Pipeline::new(warehouse.as_ref(), &config, config_dir)?;

        let report = match args.stage {
            Stage::All => {
                let store = open_file_store(&config, config_dir)?;
                pipeline.run(store.as_ref(), &options).await?
            }
            Stage::Extract => {
                let store = open_file_store(&config, config_dir)?;
                PipelineReport {
                    load: Some(pipeline.extract(store.as_ref(), &options).await?),
                    ..Default::default()
                }
            }
            Stage::Transform => pipeline.transform(&options).await?,
        };
        Ok::<_, CliError>(report)
    })?;

    if args.json {
        let json = serde_json::to_string_pretty(&report)
            .map_err(|e| CliError::IoError(format!("Failed to serialize report: {}", e)))?;
        println!("{}", json);
    } else {
        print!("{}", render_report(&report));
    }

    match report.error_count() {
        0 => Ok(()),
        n => Err(CliError::TableErrors(n)),
    }
}

fn render_load(load: &LoadReport, out: &mut String) {
    let title = if load.dry_run { "Extract (dry run)" } else { "Extract" };
    out.push_str(&format!("{} [{}]\n", title, load.load_id));
    if load.tables.is_empty() {
        out.push_str("  no files staged\n");
    }
    for (table, result) in &load.tables {
        match &result.error {
            Some(error) => out.push_str(&format!("  {:<22} error: {}\n", table, error)),
            None => out.push_str(&format!(
                "  {:<22} {}/{} rows kept, {} written\n",
                table, result.kept_rows, result.total_rows, result.written_rows
            )),
        }
    }
}

/// Human readable report
pub fn render_report(report: &PipelineReport) -> String {
    let mut out = String::new();

    if let Some(load) = &report.load {
        render_load(load, &mut out);
    }

    if let Some(reconcile) = &report.reconcile {
        out.push_str(&format!("Reconcile [{}]\n", reconcile.run_id));
        for (table, outcome) in &reconcile.outcomes {
            out.push_str(&format!("  {:<22} {}\n", table, outcome));
        }
    }

    if !report.gold.is_empty() {
        out.push_str("Gold views\n");
        for view in &report.gold {
            match (&view.action, &view.error) {
                (_, Some(error)) => out.push_str(&format!("  {:<22} error: {}\n", view.view, error)),
                (Some(action), None) => {
                    out.push_str(&format!("  {:<22} {:?}\n", view.view, action))
                }
                (None, None) => out.push_str(&format!("  {}\n", view.view)),
            }
        }
    }

    out.push_str(&format!("{} error(s)\n", report.error_count()));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconcile::{ReconcileReport, TableOutcome};

    #[test]
    fn test_render_report_lists_outcomes() {
        let mut reconcile = ReconcileReport {
            run_id: "r1".to_string(),
            ..Default::default()
        };
        reconcile
            .outcomes
            .insert("crm_leads".to_string(), TableOutcome::Skipped { rows: 0 });
        reconcile.outcomes.insert(
            "crm_buyers".to_string(),
            TableOutcome::Error {
                error: "lock timeout".to_string(),
            },
        );
        let report = PipelineReport {
            reconcile: Some(reconcile),
            ..Default::default()
        };

        let text = render_report(&report);
        assert!(text.contains("Reconcile [r1]"));
        assert!(text.contains("skipped (0 rows)"));
        assert!(text.contains("error: lock timeout"));
        assert!(text.ends_with("1 error(s)\n"));
    }
}

//! `classify` command: show how filenames map onto tables

use chrono::Datelike;

use crate::classify::{Classification, FilenameClassifier};
use crate::cli::commands::CommonArgs;
use crate::cli::error::CliError;

/// Classify command arguments
#[derive(Debug, Clone)]
pub struct ClassifyArgs {
    pub common: CommonArgs,
    pub filenames: Vec<String>,
    /// Classify as if this were the current year
    pub year: Option<i32>,
}

/// One line per filename: table and partition year, or the reject reason
pub fn handle_classify(args: &ClassifyArgs) -> Result<(), CliError> {
    if args.filenames.is_empty() {
        return Err(CliError::InvalidArgument(
            "at least one filename is required".to_string(),
        ));
    }

    let config = args.common.load_config()?;
    let registry = config.registry()?;
    let year = args.year.unwrap_or_else(|| chrono::Local::now().year());
    let classifier = FilenameClassifier::from_config(&config, &registry, year);

    for line in classify_lines(&classifier, &args.filenames) {
        println!("{}", line);
    }
    Ok(())
}

fn classify_lines(classifier: &FilenameClassifier, filenames: &[String]) -> Vec<String> {
    filenames
        .iter()
        .map(|name| match classifier.classify(name) {
            Classification::Table {
                table,
                partition_year: Some(year),
            } => format!("{} -> {} ({})", name, table, year),
            Classification::Table { table, .. } => format!("{} -> {}", name, table),
            Classification::Reject(reason) => format!("{} -> skipped: {}", name, reason),
        })
        .collect()
}

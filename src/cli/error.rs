//! CLI-specific error types

use thiserror::Error;

use crate::config::ConfigError;
use crate::database::DatabaseError;
use crate::pipeline::PipelineError;
use crate::source::SourceError;

/// CLI-specific error type
#[derive(Error, Debug)]
pub enum CliError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    #[error("{0}")]
    Pipeline(#[from] PipelineError),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("IO error: {0}")]
    IoError(String),

    /// The run finished but some tables failed
    #[error("{0} table(s) failed")]
    TableErrors(usize),
}

impl CliError {
    /// Process exit code: 2 for per-table failures, 1 for anything fatal
    pub fn exit_code(&self) -> i32 {
        match self {
            CliError::TableErrors(_) => 2,
            _ => 1,
        }
    }
}

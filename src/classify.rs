//! Drive filename classification
//!
//! Maps an exported filename onto a configured table. Non-partitioned tables
//! match on their source name; partitioned tables match `<base>_<yyyy>` for
//! the current year only.

use chrono::Datelike;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::collections::{HashMap, HashSet};

use crate::config::PipelineConfig;
use crate::tables::TableRegistry;

static PARTITIONED_NAME: Lazy<Result<Regex, regex::Error>> =
    Lazy::new(|| Regex::new(r"^(.+)_(\d{4})$"));

/// Why a filename was not mapped to a table
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum RejectReason {
    /// Not a spreadsheet with the expected extension
    Extension,
    /// A partitioned export for a year other than the current one
    StaleYear { year: i32 },
    /// Looks partitioned but no partitioned table has that base
    UnknownTable { table: String },
    /// Matches no naming rule (includes legacy `all_<base>` exports)
    Unrecognized,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectReason::Extension => write!(f, "unexpected extension"),
            RejectReason::StaleYear { year } => write!(f, "partition year {} is not current", year),
            RejectReason::UnknownTable { table } => write!(f, "no partitioned table {}", table),
            RejectReason::Unrecognized => write!(f, "no naming rule matches"),
        }
    }
}

/// Result of classifying one filename
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Classification {
    Table {
        table: String,
        partition_year: Option<i32>,
    },
    Reject(RejectReason),
}

impl Classification {
    /// Target table, if accepted
    pub fn table(&self) -> Option<&str> {
        match self {
            Classification::Table { table, .. } => Some(table),
            Classification::Reject(_) => None,
        }
    }

    pub fn is_accepted(&self) -> bool {
        matches!(self, Classification::Table { .. })
    }
}

/// Pure filename classifier over static table config and a fixed year
#[derive(Debug, Clone)]
pub struct FilenameClassifier {
    extension: String,
    table_prefix: String,
    current_year: i32,
    /// Source base name to table, for non-partitioned tables
    unpartitioned: HashMap<String, String>,
    partitioned: HashSet<String>,
}

impl FilenameClassifier {
    pub fn new(
        registry: &TableRegistry,
        extension: impl Into<String>,
        table_prefix: impl Into<String>,
        current_year: i32,
    ) -> Self {
        let mut unpartitioned = HashMap::new();
        let mut partitioned = HashSet::new();
        for table in registry.iter() {
            if table.year_partitioned {
                partitioned.insert(table.name.clone());
            } else {
                unpartitioned.insert(table.file_base().to_string(), table.name.clone());
            }
        }

        Self {
            extension: extension.into(),
            table_prefix: table_prefix.into(),
            current_year,
            unpartitioned,
            partitioned,
        }
    }

    /// Classifier for the `[source]` settings of a config
    pub fn from_config(
        config: &PipelineConfig,
        registry: &TableRegistry,
        current_year: i32,
    ) -> Self {
        Self::new(
            registry,
            config.source.extension.clone(),
            config.source.table_prefix.clone(),
            current_year,
        )
    }

    /// Classifier pinned to today's local calendar year
    pub fn for_today(config: &PipelineConfig, registry: &TableRegistry) -> Self {
        Self::from_config(config, registry, chrono::Local::now().year())
    }

    pub fn current_year(&self) -> i32 {
        self.current_year
    }

    /// Classify a filename; never fails, rejects instead
    pub fn classify(&self, filename: &str) -> Classification {
        let Some(base) = strip_suffix_ignore_case(filename, &self.extension) else {
            return Classification::Reject(RejectReason::Extension);
        };

        if let Some(table) = self.unpartitioned.get(base) {
            return Classification::Table {
                table: table.clone(),
                partition_year: None,
            };
        }

        let captures = match PARTITIONED_NAME.as_ref() {
            Ok(re) => re.captures(base),
            Err(_) => None,
        };
        let Some(captures) = captures else {
            return Classification::Reject(RejectReason::Unrecognized);
        };

        let table_base = &captures[1];
        let year: i32 = match captures[2].parse() {
            Ok(year) => year,
            Err(_) => return Classification::Reject(RejectReason::Unrecognized),
        };

        if year != self.current_year {
            return Classification::Reject(RejectReason::StaleYear { year });
        }

        let table = format!("{}{}", self.table_prefix, table_base);
        if self.partitioned.contains(&table) {
            Classification::Table {
                table,
                partition_year: Some(year),
            }
        } else {
            Classification::Reject(RejectReason::UnknownTable { table })
        }
    }
}

fn strip_suffix_ignore_case<'a>(name: &'a str, suffix: &str) -> Option<&'a str> {
    let split = name.len().checked_sub(suffix.len())?;
    if !name.is_char_boundary(split) {
        return None;
    }
    let (base, tail) = name.split_at(split);
    if tail.eq_ignore_ascii_case(suffix) && !base.is_empty() {
        Some(base)
    } else {
        None
    }
}

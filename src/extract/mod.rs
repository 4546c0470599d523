//! Incremental extraction of CRM spreadsheets
//!
//! Reads one source file, normalizes its headers, types every cell against
//! the table's date columns and keeps only rows newer than the watermark.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::database::SqlValue;
use crate::database::schema::is_bookkeeping_column;
use crate::runlog::SENTINEL_WATERMARK;
use crate::tables::TableConfig;

pub mod dates;
pub mod sheet;

#[cfg(feature = "xlsx")]
pub use sheet::XlsxSheetReader;
pub use sheet::{CsvSheetReader, SheetReader, read_sheet};

/// Errors raised while reading a source spreadsheet
#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("Failed to parse {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("IO error: {0}")]
    Io(String),

    #[error("Unsupported spreadsheet format: {0}")]
    UnsupportedFormat(String),

    #[error("No worksheet found in {0}")]
    MissingSheet(PathBuf),
}

/// A single spreadsheet cell as read from disk
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Empty,
    Text(String),
    Number(f64),
    Bool(bool),
    DateTime(NaiveDateTime),
}

/// Header row plus data rows of one worksheet
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Sheet {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<Cell>>,
}

/// Storage class of a staged column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnKind {
    Timestamp,
    Text,
}

impl ColumnKind {
    /// Column type used when creating the staging table
    pub fn sql_type(&self) -> &'static str {
        match self {
            ColumnKind::Timestamp => "TIMESTAMP",
            ColumnKind::Text => "TEXT",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagingColumn {
    pub name: String,
    pub kind: ColumnKind,
}

/// Rows extracted from one source file, ready for `raw.<table>`
#[derive(Debug, Clone, PartialEq)]
pub struct StagingRowSet {
    /// Target table name
    pub table: String,
    /// Normalized columns in sheet order
    pub columns: Vec<StagingColumn>,
    /// Typed values; every row has one value per column
    pub rows: Vec<Vec<SqlValue>>,
    /// Data rows seen in the file before filtering
    pub total_rows: usize,
    /// Watermark the filter was applied against
    pub watermark: NaiveDateTime,
    /// Whether the incremental column was present in the file
    pub cursor_present: bool,
}

impl StagingRowSet {
    /// Rows kept after filtering
    pub fn kept_rows(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    /// Largest non-null value of a timestamp column
    pub fn max_timestamp(&self, column: &str) -> Option<NaiveDateTime> {
        let idx = self.column_index(column)?;
        self.rows
            .iter()
            .filter_map(|row| row.get(idx).and_then(SqlValue::as_timestamp))
            .max()
    }
}

/// Normalize a header: trim, lowercase, whitespace to `_`, drop anything
/// outside `[a-z0-9_]`
pub fn normalize_column_name(raw: &str) -> String {
    raw.trim()
        .to_lowercase()
        .chars()
        .map(|c| if c.is_whitespace() { '_' } else { c })
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '_')
        .collect()
}

/// Normalize a header row; blank headers become `unnamed_<index>`, names in
/// the reserved bookkeeping namespace lose their leading underscores and
/// repeated names get a numeric suffix
pub fn normalize_headers(headers: &[String]) -> Vec<String> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut names = Vec::with_capacity(headers.len());

    for (idx, header) in headers.iter().enumerate() {
        let mut name = normalize_column_name(header);
        if is_bookkeeping_column(&name) {
            name = name.trim_start_matches('_').to_string();
        }
        if name.is_empty() {
            name = format!("unnamed_{}", idx);
        }
        if seen.contains(&name) {
            let mut n = 1;
            while seen.contains(&format!("{}_{}", name, n)) {
                n += 1;
            }
            name = format!("{}_{}", name, n);
        }
        seen.insert(name.clone());
        names.push(name);
    }

    names
}

/// Format a number the way it reads in the sheet (whole numbers without `.0`)
fn number_text(n: f64) -> String {
    if n.is_finite() && n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        n.to_string()
    }
}

fn text_value(cell: &Cell) -> Option<String> {
    let text = match cell {
        Cell::Empty => return None,
        Cell::Text(s) => s.clone(),
        Cell::Number(n) => number_text(*n),
        Cell::Bool(b) => b.to_string(),
        Cell::DateTime(dt) => dt.format("%Y-%m-%d %H:%M:%S").to_string(),
    };

    match text.as_str() {
        "" | "nan" | "None" => None,
        _ => Some(text),
    }
}

fn timestamp_value(cell: &Cell) -> Option<NaiveDateTime> {
    match cell {
        Cell::DateTime(dt) => Some(*dt),
        Cell::Text(s) => dates::parse_day_first(s),
        Cell::Number(n) => dates::from_excel_serial(*n),
        Cell::Empty | Cell::Bool(_) => None,
    }
}

/// Reads source files and filters them against a watermark
#[derive(Debug, Default, Clone, Copy)]
pub struct IncrementalExtractor;

impl IncrementalExtractor {
    pub fn new() -> Self {
        Self
    }

    /// Read `path` and produce the rows of `table` newer than `watermark`
    pub fn extract_file(
        &self,
        path: &Path,
        table: &TableConfig,
        watermark: NaiveDateTime,
    ) -> Result<StagingRowSet, ExtractError> {
        info!("{}: reading {}", table.name, path.display());
        let sheet = read_sheet(path)?;
        Ok(self.extract_sheet(sheet, table, watermark))
    }

    /// Type and filter an already parsed sheet
    pub fn extract_sheet(
        &self,
        sheet: Sheet,
        table: &TableConfig,
        watermark: NaiveDateTime,
    ) -> StagingRowSet {
        let names = normalize_headers(&sheet.headers);
        let columns: Vec<StagingColumn> = names
            .into_iter()
            .map(|name| {
                let kind = if table.is_date_column(&name) {
                    ColumnKind::Timestamp
                } else {
                    ColumnKind::Text
                };
                StagingColumn { name, kind }
            })
            .collect();

        let total_rows = sheet.rows.len();
        let cursor_idx = columns
            .iter()
            .position(|c| c.name == table.incremental_column);
        let filter_active = cursor_idx.is_some() && watermark > *SENTINEL_WATERMARK;

        let mut rows = Vec::with_capacity(total_rows);
        for cells in &sheet.rows {
            let row: Vec<SqlValue> = columns
                .iter()
                .enumerate()
                .map(|(i, column)| {
                    let cell = cells.get(i).unwrap_or(&Cell::Empty);
                    match column.kind {
                        ColumnKind::Timestamp => SqlValue::Timestamp(timestamp_value(cell)),
                        ColumnKind::Text => SqlValue::Text(text_value(cell)),
                    }
                })
                .collect();

            if filter_active
                && let Some(idx) = cursor_idx
            {
                match row[idx].as_timestamp() {
                    Some(value) if value > watermark => {}
                    _ => continue,
                }
            }
            rows.push(row);
        }

        match (cursor_idx, filter_active) {
            (None, _) => warn!(
                "{}: incremental column '{}' not found, keeping all {} rows",
                table.name, table.incremental_column, total_rows
            ),
            (Some(_), true) => info!(
                "{}: {}/{} rows after {}",
                table.name,
                rows.len(),
                total_rows,
                watermark
            ),
            (Some(_), false) => info!("{}: {} rows (first run)", table.name, total_rows),
        }
        debug!(
            "{}: columns {:?}",
            table.name,
            columns.iter().map(|c| &c.name).collect::<Vec<_>>()
        );

        StagingRowSet {
            table: table.name.clone(),
            columns,
            rows,
            total_rows,
            watermark,
            cursor_present: cursor_idx.is_some(),
        }
    }
}

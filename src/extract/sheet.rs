//! Spreadsheet readers
//!
//! Each reader turns a local file into a [`Sheet`]: the header row exactly as
//! written, plus typed cells. Normalization happens later in the extractor.

use std::path::Path;

use super::{Cell, ExtractError, Sheet};

/// Parses a local file into a row/column table
pub trait SheetReader {
    /// Lowercase extensions (without the dot) this reader understands
    fn extensions(&self) -> &'static [&'static str];

    /// Read the first worksheet of `path`
    fn read(&self, path: &Path) -> Result<Sheet, ExtractError>;
}

/// Comma separated files; every cell is text
#[derive(Debug, Default, Clone, Copy)]
pub struct CsvSheetReader;

impl SheetReader for CsvSheetReader {
    fn extensions(&self) -> &'static [&'static str] {
        &["csv"]
    }

    fn read(&self, path: &Path) -> Result<Sheet, ExtractError> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_path(path)
            .map_err(|e| parse_error(path, e))?;

        let headers: Vec<String> = reader
            .headers()
            .map_err(|e| parse_error(path, e))?
            .iter()
            .map(str::to_string)
            .collect();

        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record.map_err(|e| parse_error(path, e))?;
            let mut row: Vec<Cell> = record
                .iter()
                .map(|value| {
                    if value.is_empty() {
                        Cell::Empty
                    } else {
                        Cell::Text(value.to_string())
                    }
                })
                .collect();
            row.resize(headers.len().max(row.len()), Cell::Empty);
            rows.push(row);
        }

        Ok(Sheet { headers, rows })
    }
}

/// Excel and OpenDocument workbooks via calamine
#[cfg(feature = "xlsx")]
#[derive(Debug, Default, Clone, Copy)]
pub struct XlsxSheetReader;

#[cfg(feature = "xlsx")]
impl SheetReader for XlsxSheetReader {
    fn extensions(&self) -> &'static [&'static str] {
        &["xlsx", "xlsm", "xls", "ods"]
    }

    fn read(&self, path: &Path) -> Result<Sheet, ExtractError> {
        use calamine::{Reader, open_workbook_auto};

        let mut workbook = open_workbook_auto(path).map_err(|e| parse_error(path, e))?;
        let range = workbook
            .worksheet_range_at(0)
            .ok_or_else(|| ExtractError::MissingSheet(path.to_path_buf()))?
            .map_err(|e| parse_error(path, e))?;

        let mut rows_iter = range.rows();
        let headers: Vec<String> = match rows_iter.next() {
            Some(header_row) => header_row.iter().map(header_text).collect(),
            None => Vec::new(),
        };

        let rows = rows_iter
            .map(|row| row.iter().map(cell_from_data).collect())
            .collect();

        Ok(Sheet { headers, rows })
    }
}

#[cfg(feature = "xlsx")]
fn header_text(data: &calamine::Data) -> String {
    match data {
        calamine::Data::Empty => String::new(),
        calamine::Data::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(feature = "xlsx")]
fn cell_from_data(data: &calamine::Data) -> Cell {
    use calamine::Data;

    match data {
        Data::Empty | Data::Error(_) => Cell::Empty,
        Data::String(s) => Cell::Text(s.clone()),
        Data::Int(i) => Cell::Number(*i as f64),
        Data::Float(f) => Cell::Number(*f),
        Data::Bool(b) => Cell::Bool(*b),
        Data::DateTime(dt) => match dt.as_datetime() {
            Some(value) => Cell::DateTime(value),
            None => Cell::Number(dt.as_f64()),
        },
        Data::DateTimeIso(s) | Data::DurationIso(s) => Cell::Text(s.clone()),
    }
}

fn parse_error(path: &Path, e: impl std::fmt::Display) -> ExtractError {
    ExtractError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    }
}

/// Read `path` with the reader registered for its extension
pub fn read_sheet(path: &Path) -> Result<Sheet, ExtractError> {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_lowercase)
        .unwrap_or_default();

    #[allow(unused_mut)]
    let mut readers: Vec<Box<dyn SheetReader>> = vec![Box::new(CsvSheetReader)];
    #[cfg(feature = "xlsx")]
    readers.push(Box::new(XlsxSheetReader));

    let reader = readers
        .into_iter()
        .find(|r| r.extensions().contains(&extension.as_str()))
        .ok_or_else(|| ExtractError::UnsupportedFormat(path.display().to_string()))?;

    if !path.exists() {
        return Err(ExtractError::Io(format!(
            "File not found: {}",
            path.display()
        )));
    }

    reader.read(path)
}

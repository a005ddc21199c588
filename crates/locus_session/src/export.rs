//! Delimited-text export of sampled datasets.
//!
//! The header row is the key set of the first data point in insertion
//! order; a key missing from a later point becomes an empty cell. Values
//! use `f64`'s shortest-roundtrip `Display`, so parsing the text back
//! reproduces them exactly.

use locus_core::simulation::DataPoint;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ExportError {
    #[error("row {row}: expected {expected} cells, found {found}")]
    RaggedRow {
        row: usize,
        expected: usize,
        found: usize,
    },
    #[error("row {row}: `{cell}` is not a number")]
    BadNumber { row: usize, cell: String },
}

/// A re-parsed delimited dataset. Empty cells come back as `None`.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedDataset {
    pub header: Vec<String>,
    pub rows: Vec<Vec<Option<f64>>>,
}

/// Serializes a dataset with the given delimiter, one row per line.
/// An empty dataset serializes to the empty string.
pub fn dataset_to_delimited(points: &[DataPoint], delimiter: char) -> String {
    let Some(first) = points.first() else {
        return String::new();
    };
    let header: Vec<String> = first.keys().cloned().collect();

    let mut out = String::new();
    for (i, key) in header.iter().enumerate() {
        if i > 0 {
            out.push(delimiter);
        }
        out.push_str(key);
    }
    for point in points {
        out.push('\n');
        for (i, key) in header.iter().enumerate() {
            if i > 0 {
                out.push(delimiter);
            }
            if let Some(value) = point.get(key) {
                out.push_str(&value.to_string());
            }
        }
    }
    out
}

/// Comma-delimited convenience wrapper.
pub fn dataset_to_csv(points: &[DataPoint]) -> String {
    dataset_to_delimited(points, ',')
}

/// Parses delimited text produced by [`dataset_to_delimited`]. Every data
/// row must match the header arity; cells must be empty or numeric.
pub fn parse_delimited(text: &str, delimiter: char) -> Result<ParsedDataset, ExportError> {
    let mut lines = text.lines();
    let Some(header_line) = lines.next() else {
        return Ok(ParsedDataset {
            header: Vec::new(),
            rows: Vec::new(),
        });
    };
    let header: Vec<String> = header_line.split(delimiter).map(str::to_string).collect();

    let mut rows = Vec::new();
    for (row, line) in lines.enumerate() {
        let mut cells = Vec::with_capacity(header.len());
        for cell in line.split(delimiter) {
            if cell.is_empty() {
                cells.push(None);
            } else {
                let value = cell.parse::<f64>().map_err(|_| ExportError::BadNumber {
                    row,
                    cell: cell.to_string(),
                })?;
                cells.push(Some(value));
            }
        }
        if cells.len() != header.len() {
            return Err(ExportError::RaggedRow {
                row,
                expected: header.len(),
                found: cells.len(),
            });
        }
        rows.push(cells);
    }
    Ok(ParsedDataset { header, rows })
}

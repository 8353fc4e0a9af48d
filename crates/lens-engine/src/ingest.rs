use std::collections::HashSet;
use std::io::Cursor;
use std::path::Path;

use calamine::{open_workbook_auto_from_rs, Data, Reader};
use lens_contracts::catalog::{Catalog, CellValue, RowRecord};
use tracing::debug;

use crate::error::LensError;

const ZIP_MAGIC: &[u8] = b"PK\x03\x04";
const OLE_MAGIC: &[u8] = &[0xD0, 0xCF, 0x11, 0xE0];
const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";
const WORKBOOK_EXTENSIONS: &[&str] = &["xlsx", "xlsm", "xlsb", "xls", "ods"];
const BLANK_HEADER: &str = "__EMPTY";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SheetFormat {
    Workbook,
    Delimited(u8),
}

pub fn read_spreadsheet(path: &Path) -> Result<Catalog, LensError> {
    let bytes = std::fs::read(path)
        .map_err(|err| LensError::Ingestion(format!("{}: {err}", path.display())))?;
    let name = path
        .file_name()
        .and_then(|value| value.to_str())
        .unwrap_or("spreadsheet");
    parse_spreadsheet(&bytes, name)
}

/// Parses the first sheet of an uploaded file into row records.
///
/// The first line is the header row. Only non-empty cells are kept on each
/// record and rows without any value are dropped.
pub fn parse_spreadsheet(bytes: &[u8], file_name: &str) -> Result<Catalog, LensError> {
    let format = detect_format(bytes, file_name)?;
    debug!(file_name, ?format, "parsing spreadsheet");
    let grid = match format {
        SheetFormat::Workbook => read_workbook_grid(bytes)?,
        SheetFormat::Delimited(delimiter) => read_delimited_grid(bytes, delimiter)?,
    };
    let rows = rows_from_grid(grid)?;
    Ok(Catalog::new(file_name, rows))
}

fn detect_format(bytes: &[u8], file_name: &str) -> Result<SheetFormat, LensError> {
    if bytes.is_empty() {
        return Err(LensError::Ingestion("file is empty".to_string()));
    }
    let extension = Path::new(file_name)
        .extension()
        .and_then(|value| value.to_str())
        .map(|value| value.to_ascii_lowercase())
        .unwrap_or_default();
    if bytes.starts_with(ZIP_MAGIC)
        || bytes.starts_with(OLE_MAGIC)
        || WORKBOOK_EXTENSIONS.contains(&extension.as_str())
    {
        return Ok(SheetFormat::Workbook);
    }
    if bytes.contains(&0) {
        return Err(LensError::Ingestion(format!(
            "unsupported file format ({file_name})"
        )));
    }
    if extension == "tsv" {
        return Ok(SheetFormat::Delimited(b'\t'));
    }
    let header_line = bytes.split(|byte| *byte == b'\n').next().unwrap_or_default();
    if header_line.contains(&b'\t') && !header_line.contains(&b',') {
        return Ok(SheetFormat::Delimited(b'\t'));
    }
    Ok(SheetFormat::Delimited(b','))
}

fn read_workbook_grid(bytes: &[u8]) -> Result<Vec<Vec<CellValue>>, LensError> {
    let mut workbook = open_workbook_auto_from_rs(Cursor::new(bytes.to_vec()))
        .map_err(|err| LensError::Ingestion(err.to_string()))?;
    let range = workbook
        .worksheet_range_at(0)
        .ok_or_else(|| LensError::Ingestion("workbook has no sheets".to_string()))?
        .map_err(|err| LensError::Ingestion(err.to_string()))?;
    Ok(range
        .rows()
        .map(|row| row.iter().map(cell_from_workbook).collect())
        .collect())
}

fn cell_from_workbook(cell: &Data) -> CellValue {
    match cell {
        Data::Empty | Data::Error(_) => CellValue::Empty,
        Data::String(text) if text.is_empty() => CellValue::Empty,
        Data::String(text) => CellValue::Text(text.clone()),
        Data::Int(value) => CellValue::Number(*value as f64),
        Data::Float(value) => CellValue::Number(*value),
        Data::Bool(value) => CellValue::Bool(*value),
        other => CellValue::Text(other.to_string()),
    }
}

fn read_delimited_grid(bytes: &[u8], delimiter: u8) -> Result<Vec<Vec<CellValue>>, LensError> {
    let bytes = bytes.strip_prefix(UTF8_BOM).unwrap_or(bytes);
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .delimiter(delimiter)
        .from_reader(bytes);
    let mut grid = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|err| LensError::Ingestion(err.to_string()))?;
        grid.push(record.iter().map(cell_from_text).collect());
    }
    Ok(grid)
}

/// Numbers and booleans keep their type only when the text form survives
/// unchanged, so codes like `00123` stay text.
fn cell_from_text(raw: &str) -> CellValue {
    if raw.trim().is_empty() {
        return CellValue::Empty;
    }
    match raw {
        "TRUE" | "true" | "True" => return CellValue::Bool(true),
        "FALSE" | "false" | "False" => return CellValue::Bool(false),
        _ => {}
    }
    let numeric_shape = raw
        .chars()
        .all(|ch| ch.is_ascii_digit() || matches!(ch, '.' | '-' | '+' | 'e' | 'E'))
        && raw.chars().any(|ch| ch.is_ascii_digit());
    if numeric_shape {
        if let Ok(value) = raw.parse::<f64>() {
            if value.is_finite() && value.to_string() == raw {
                return CellValue::Number(value);
            }
        }
    }
    CellValue::Text(raw.to_string())
}

fn header_names(header: &[CellValue]) -> Vec<String> {
    let mut used: HashSet<String> = HashSet::new();
    let mut names = Vec::with_capacity(header.len());
    for cell in header {
        let text = cell.to_string();
        let base = if text.trim().is_empty() {
            BLANK_HEADER.to_string()
        } else {
            text
        };
        let mut candidate = base.clone();
        let mut suffix = 1;
        while used.contains(&candidate) {
            candidate = format!("{base}_{suffix}");
            suffix += 1;
        }
        used.insert(candidate.clone());
        names.push(candidate);
    }
    names
}

fn rows_from_grid(grid: Vec<Vec<CellValue>>) -> Result<Vec<RowRecord>, LensError> {
    let mut lines = grid.into_iter();
    let header = lines
        .next()
        .ok_or_else(|| LensError::Ingestion("missing header row".to_string()))?;
    if header.iter().all(CellValue::is_empty) {
        return Err(LensError::Ingestion("header row is empty".to_string()));
    }
    let names = header_names(&header);

    let rows: Vec<RowRecord> = lines
        .map(|cells| {
            names
                .iter()
                .zip(cells)
                .filter(|(_, cell)| !cell.is_empty())
                .map(|(name, cell)| (name.clone(), cell))
                .collect::<RowRecord>()
        })
        .filter(|row| !row.is_empty())
        .collect();
    if rows.is_empty() {
        return Err(LensError::Ingestion("no data rows found".to_string()));
    }
    Ok(rows)
}

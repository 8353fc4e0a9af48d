use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

const FILENAME_COLUMN_HINTS: &[&str] = &["name", "sku", "id"];

/// A single spreadsheet cell after ingestion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(untagged)]
pub enum CellValue {
    Text(String),
    Number(f64),
    Bool(bool),
    #[default]
    Empty,
}

impl CellValue {
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Text(text) => text.is_empty(),
            Self::Empty => true,
            Self::Number(_) | Self::Bool(_) => false,
        }
    }
}

impl fmt::Display for CellValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(text) => f.write_str(text),
            Self::Number(value) => f.write_str(&format_number(*value)),
            Self::Bool(value) => write!(f, "{value}"),
            Self::Empty => Ok(()),
        }
    }
}

/// Renders a number the way spreadsheet text is shown to users: integral
/// values without a fractional part, and exponent notation outside
/// `[1e-6, 1e21)` with an explicit sign on positive exponents.
fn format_number(value: f64) -> String {
    if value.is_infinite() {
        return if value > 0.0 { "Infinity" } else { "-Infinity" }.to_string();
    }
    let magnitude = value.abs();
    if value == 0.0 || value.is_nan() || (1e-6..1e21).contains(&magnitude) {
        return value.to_string();
    }
    let formatted = format!("{value:e}");
    match formatted.split_once('e') {
        Some((mantissa, exponent)) if !exponent.starts_with('-') => {
            format!("{mantissa}e+{exponent}")
        }
        _ => formatted,
    }
}

impl From<&str> for CellValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for CellValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<f64> for CellValue {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

impl From<bool> for CellValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

/// One ingested row, keyed by column name in sheet order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct RowRecord {
    cells: IndexMap<String, CellValue>,
}

impl RowRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, column: impl Into<String>, value: impl Into<CellValue>) {
        self.cells.insert(column.into(), value.into());
    }

    pub fn get(&self, column: &str) -> Option<&CellValue> {
        self.cells.get(column)
    }

    /// Text form of a cell. Columns the row does not carry read as "".
    pub fn text(&self, column: &str) -> String {
        self.cells
            .get(column)
            .map(CellValue::to_string)
            .unwrap_or_default()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.cells.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}

impl<K: Into<String>, V: Into<CellValue>> FromIterator<(K, V)> for RowRecord {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut row = Self::new();
        for (key, value) in iter {
            row.insert(key, value);
        }
        row
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct ColumnSet {
    names: Vec<String>,
}

impl ColumnSet {
    /// Columns are taken from the first row only; later rows are not checked.
    pub fn from_rows(rows: &[RowRecord]) -> Self {
        let names = rows
            .first()
            .map(|row| row.keys().map(str::to_string).collect())
            .unwrap_or_default();
        Self { names }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.iter().any(|existing| existing == name)
    }

    pub fn first(&self) -> Option<&str> {
        self.names.first().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Catalog {
    pub source_name: String,
    pub rows: Vec<RowRecord>,
    pub columns: ColumnSet,
}

impl Catalog {
    pub fn new(source_name: impl Into<String>, rows: Vec<RowRecord>) -> Self {
        let columns = ColumnSet::from_rows(&rows);
        Self {
            source_name: source_name.into(),
            rows,
            columns,
        }
    }
}

pub fn default_prompt_column(columns: &ColumnSet) -> Option<String> {
    columns.first().map(str::to_string)
}

pub fn default_filename_column(columns: &ColumnSet) -> Option<String> {
    columns
        .iter()
        .find(|name| {
            let lowered = name.to_lowercase();
            FILENAME_COLUMN_HINTS
                .iter()
                .any(|hint| lowered.contains(hint))
        })
        .or_else(|| columns.first())
        .map(str::to_string)
}

//! Tabular Dataset - in-memory representation of the loaded results sheet
//!
//! Cells keep their own type so a column can end up mixed after soft numeric
//! coercion. Conversion to polars happens only when a query runs.

use crate::error::Result;
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::io::Read;

/// A single cell value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Int(i64),
    Float(f64),
    Text(String),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Parse text as a number the way a dataframe reader would: integers first,
    /// then finite floats. Surrounding whitespace is ignored.
    pub fn parse_number(raw: &str) -> Option<Value> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return None;
        }
        if let Ok(i) = trimmed.parse::<i64>() {
            return Some(Value::Int(i));
        }
        match trimmed.parse::<f64>() {
            Ok(f) if f.is_finite() => Some(Value::Float(f)),
            _ => None,
        }
    }

    /// Convert a polars cell into a `Value`.
    pub fn from_any(av: &AnyValue) -> Value {
        if av.is_null() {
            return Value::Null;
        }
        match av {
            AnyValue::String(s) => return Value::Text(s.to_string()),
            AnyValue::StringOwned(s) => return Value::Text(s.to_string()),
            AnyValue::Boolean(b) => return Value::Text(b.to_string()),
            _ => {}
        }
        let dtype = av.dtype();
        if dtype.is_integer() {
            if let Some(i) = av.extract::<i64>() {
                return Value::Int(i);
            }
        }
        if dtype.is_float() {
            if let Some(f) = av.extract::<f64>() {
                return Value::Float(f);
            }
        }
        Value::Text(av.to_string())
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => Ok(()),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(v) => {
                if v.is_finite() && v.fract() == 0.0 && v.abs() < 1e16 {
                    write!(f, "{:.1}", v)
                } else {
                    write!(f, "{}", v)
                }
            }
            Value::Text(s) => f.write_str(s),
        }
    }
}

/// Semantic type of a column, derived from its values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnKind {
    Empty,
    Integer,
    Float,
    Text,
    Mixed,
}

impl fmt::Display for ColumnKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ColumnKind::Empty => "empty",
            ColumnKind::Integer => "integer",
            ColumnKind::Float => "float",
            ColumnKind::Text => "text",
            ColumnKind::Mixed => "mixed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub name: String,
    pub values: Vec<Value>,
}

impl Column {
    pub fn new(name: impl Into<String>, values: Vec<Value>) -> Self {
        Self {
            name: name.into(),
            values,
        }
    }

    pub fn kind(&self) -> ColumnKind {
        let (mut ints, mut floats, mut texts) = (false, false, false);
        for value in &self.values {
            match value {
                Value::Null => {}
                Value::Int(_) => ints = true,
                Value::Float(_) => floats = true,
                Value::Text(_) => texts = true,
            }
        }
        match (ints, floats, texts) {
            (false, false, false) => ColumnKind::Empty,
            (_, _, true) if ints || floats => ColumnKind::Mixed,
            (_, _, true) => ColumnKind::Text,
            (_, true, false) => ColumnKind::Float,
            (true, false, false) => ColumnKind::Integer,
        }
    }

    fn to_series(&self) -> Series {
        match self.kind() {
            ColumnKind::Integer => {
                let values: Vec<Option<i64>> = self
                    .values
                    .iter()
                    .map(|v| match v {
                        Value::Int(i) => Some(*i),
                        _ => None,
                    })
                    .collect();
                Series::new(&self.name, values)
            }
            ColumnKind::Float => {
                let values: Vec<Option<f64>> = self
                    .values
                    .iter()
                    .map(|v| match v {
                        Value::Int(i) => Some(*i as f64),
                        Value::Float(f) => Some(*f),
                        _ => None,
                    })
                    .collect();
                Series::new(&self.name, values)
            }
            ColumnKind::Empty | ColumnKind::Text | ColumnKind::Mixed => {
                let values: Vec<Option<String>> = self
                    .values
                    .iter()
                    .map(|v| if v.is_null() { None } else { Some(v.to_string()) })
                    .collect();
                Series::new(&self.name, values)
            }
        }
    }
}

/// Ordered collection of equally long, uniquely named columns
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Dataset {
    columns: Vec<Column>,
    row_count: usize,
}

impl Dataset {
    pub fn new(columns: Vec<Column>) -> Result<Self> {
        let row_count = columns.first().map(|c| c.values.len()).unwrap_or(0);
        if let Some(bad) = columns.iter().find(|c| c.values.len() != row_count) {
            return Err(crate::error::KyrkError::Query(format!(
                "column '{}' has {} values, expected {}",
                bad.name,
                bad.values.len(),
                row_count
            )));
        }
        Ok(Self { columns, row_count })
    }

    /// Parse CSV with a header row. Rows with a different field count are a
    /// hard error.
    pub fn from_csv_reader<R: Read>(reader: R) -> Result<Self> {
        let mut rdr = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(false)
            .from_reader(reader);

        let headers: Vec<String> = rdr.headers()?.iter().map(|h| h.to_string()).collect();
        let headers = dedupe_headers(&headers);

        let mut raw: Vec<Vec<String>> = vec![Vec::new(); headers.len()];
        for record in rdr.records() {
            let record = record?;
            for (idx, cell) in record.iter().enumerate() {
                raw[idx].push(cell.to_string());
            }
        }

        let columns = headers
            .into_iter()
            .zip(raw)
            .map(|(name, cells)| Column::new(name, infer_column(cells)))
            .collect();
        Self::new(columns)
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn row_count(&self) -> usize {
        self.row_count
    }

    pub fn width(&self) -> usize {
        self.columns.len()
    }

    pub(crate) fn columns_mut(&mut self) -> &mut Vec<Column> {
        &mut self.columns
    }

    /// Replace a column of the same name in place, or append it.
    pub fn upsert_column(&mut self, column: Column) -> Result<()> {
        if !self.columns.is_empty() && column.values.len() != self.row_count {
            return Err(crate::error::KyrkError::Query(format!(
                "column '{}' has {} values, expected {}",
                column.name,
                column.values.len(),
                self.row_count
            )));
        }
        if self.columns.is_empty() {
            self.row_count = column.values.len();
        }
        match self.columns.iter_mut().find(|c| c.name == column.name) {
            Some(existing) => *existing = column,
            None => self.columns.push(column),
        }
        Ok(())
    }

    /// Row `idx` as display strings.
    pub fn row_text(&self, idx: usize) -> Vec<String> {
        self.columns
            .iter()
            .map(|c| c.values.get(idx).map(|v| v.to_string()).unwrap_or_default())
            .collect()
    }

    pub fn to_polars(&self) -> Result<DataFrame> {
        let series: Vec<Series> = self.columns.iter().map(Column::to_series).collect();
        Ok(DataFrame::new(series)?)
    }

    pub fn from_polars(df: &DataFrame) -> Result<Self> {
        let mut columns = Vec::with_capacity(df.width());
        for series in df.get_columns() {
            let mut values = Vec::with_capacity(series.len());
            for idx in 0..series.len() {
                values.push(Value::from_any(&series.get(idx)?));
            }
            columns.push(Column::new(series.name(), values));
        }
        Self::new(columns)
    }
}

/// Type a raw column: all integers, else all finite floats, else text.
/// Empty cells are null either way.
fn infer_column(cells: Vec<String>) -> Vec<Value> {
    let parsed: Vec<Option<Value>> = cells
        .iter()
        .map(|c| if c.is_empty() { None } else { Value::parse_number(c) })
        .collect();

    let all_numeric = cells
        .iter()
        .zip(&parsed)
        .all(|(raw, p)| raw.is_empty() || p.is_some());

    if !all_numeric {
        return cells
            .into_iter()
            .map(|c| if c.is_empty() { Value::Null } else { Value::Text(c) })
            .collect();
    }

    let any_float = parsed.iter().any(|p| matches!(p, Some(Value::Float(_))));
    parsed
        .into_iter()
        .map(|p| match p {
            None => Value::Null,
            Some(Value::Int(i)) if any_float => Value::Float(i as f64),
            Some(v) => v,
        })
        .collect()
}

/// Blank headers become `Unnamed: <idx>`; repeats get `.1`, `.2`, ...
fn dedupe_headers(headers: &[String]) -> Vec<String> {
    let mut seen: HashMap<String, usize> = HashMap::new();
    let mut out: Vec<String> = Vec::with_capacity(headers.len());
    for (idx, header) in headers.iter().enumerate() {
        let base = if header.trim().is_empty() {
            format!("Unnamed: {}", idx)
        } else {
            header.clone()
        };
        let mut candidate = base.clone();
        while out.contains(&candidate) {
            let counter = seen.entry(base.clone()).or_insert(0);
            *counter += 1;
            candidate = format!("{}.{}", base, counter);
        }
        out.push(candidate);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> Dataset {
        Dataset::from_csv_reader(text.as_bytes()).unwrap()
    }

    #[test]
    fn test_infers_column_types() {
        let ds = parse("YEAR,TIME,NAME,LAPS\n2024,10:01:02,John,12\n2023,,Jane,11.5\n");
        assert_eq!(ds.row_count(), 2);
        assert_eq!(ds.column("YEAR").unwrap().kind(), ColumnKind::Integer);
        assert_eq!(ds.column("TIME").unwrap().kind(), ColumnKind::Text);
        assert_eq!(ds.column("NAME").unwrap().kind(), ColumnKind::Text);
        assert_eq!(ds.column("LAPS").unwrap().kind(), ColumnKind::Float);
        assert_eq!(ds.column("LAPS").unwrap().values[0], Value::Float(12.0));
        assert_eq!(ds.column("TIME").unwrap().values[1], Value::Null);
    }

    #[test]
    fn test_quoted_fields_keep_commas() {
        let ds = parse("NAME,CLUB\n\"Doe, John\",\"Runners, Inc\"\n");
        assert_eq!(ds.column("NAME").unwrap().values[0], Value::Text("Doe, John".into()));
        assert_eq!(ds.width(), 2);
    }

    #[test]
    fn test_ragged_rows_are_an_error() {
        let err = Dataset::from_csv_reader("A,B\n1,2,3\n".as_bytes()).unwrap_err();
        assert!(matches!(err, crate::error::KyrkError::Csv(_)));
    }

    #[test]
    fn test_duplicate_and_blank_headers() {
        let ds = parse("A,A,,A\n1,2,3,4\n");
        assert_eq!(ds.column_names(), vec!["A", "A.1", "Unnamed: 2", "A.2"]);
    }

    #[test]
    fn test_value_display() {
        assert_eq!(Value::Int(3).to_string(), "3");
        assert_eq!(Value::Float(3.0).to_string(), "3.0");
        assert_eq!(Value::Float(2.25).to_string(), "2.25");
        assert_eq!(Value::Null.to_string(), "");
        assert_eq!(Value::Text("f".into()).to_string(), "f");
    }

    #[test]
    fn test_mixed_column_kind() {
        let col = Column::new(
            "TIME",
            vec![Value::Float(1.5), Value::Text("DNF".into()), Value::Null],
        );
        assert_eq!(col.kind(), ColumnKind::Mixed);
    }

    #[test]
    fn test_polars_round_trip_preserves_shape() {
        let ds = parse("YEAR,Gender,NAME\n2024,m,John\n2024,f,Jane\n");
        let df = ds.to_polars().unwrap();
        assert_eq!(df.height(), 2);
        assert_eq!(df.get_column_names(), vec!["YEAR", "Gender", "NAME"]);

        let back = Dataset::from_polars(&df).unwrap();
        assert_eq!(back.column("YEAR").unwrap().values[0], Value::Int(2024));
        assert_eq!(back.column("NAME").unwrap().values[1], Value::Text("Jane".into()));
    }

    #[test]
    fn test_upsert_rejects_wrong_length() {
        let mut ds = parse("A\n1\n2\n");
        assert!(ds.upsert_column(Column::new("B", vec![Value::Null])).is_err());
        ds.upsert_column(Column::new("A", vec![Value::Int(7), Value::Int(8)])).unwrap();
        assert_eq!(ds.width(), 1);
        assert_eq!(ds.column("A").unwrap().values[0], Value::Int(7));
    }
}

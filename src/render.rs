//! Result Renderer - turns a `QueryResult` into something a person can read

use crate::dataset::Value;
use crate::error::{KyrkError, Result};
use crate::result::QueryResult;
use itertools::Itertools;
use polars::prelude::*;
use serde::{Deserialize, Serialize};

/// File name offered for tabular answers
pub const DOWNLOAD_NAME: &str = "answer.csv";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Rendered {
    Table {
        columns: Vec<String>,
        rows: Vec<Vec<String>>,
        csv: String,
        download_name: String,
    },
    Text {
        text: String,
    },
}

pub fn render(result: &QueryResult) -> Result<Rendered> {
    match result {
        QueryResult::Table(df) => {
            let columns = df.get_column_names().iter().map(|s| s.to_string()).collect();
            Ok(Rendered::Table {
                columns,
                rows: table_rows(df)?,
                csv: table_to_csv(df)?,
                download_name: DOWNLOAD_NAME.to_string(),
            })
        }
        QueryResult::Sequence(values) => Ok(Rendered::Text {
            text: values.iter().join(", "),
        }),
        QueryResult::Scalar(value) => Ok(Rendered::Text {
            text: value.to_string(),
        }),
    }
}

/// Header row plus data rows, no index column.
pub fn table_to_csv(df: &DataFrame) -> Result<String> {
    let mut out = df.clone();
    let mut buffer: Vec<u8> = Vec::new();
    CsvWriter::new(&mut buffer)
        .include_header(true)
        .finish(&mut out)?;
    String::from_utf8(buffer).map_err(|e| KyrkError::Query(format!("CSV export is not UTF-8: {}", e)))
}

fn table_rows(df: &DataFrame) -> Result<Vec<Vec<String>>> {
    let mut rows = Vec::with_capacity(df.height());
    for row_idx in 0..df.height() {
        let mut row = Vec::with_capacity(df.width());
        for series in df.get_columns() {
            row.push(Value::from_any(&series.get(row_idx)?).to_string());
        }
        rows.push(row);
    }
    Ok(rows)
}

/// Plain-text grid for terminals.
pub fn format_grid(columns: &[String], rows: &[Vec<String>]) -> String {
    let mut widths: Vec<usize> = columns.iter().map(|c| c.chars().count()).collect();
    for row in rows {
        for (idx, cell) in row.iter().enumerate() {
            if let Some(w) = widths.get_mut(idx) {
                *w = (*w).max(cell.chars().count());
            }
        }
    }

    let line = |cells: &[String]| {
        cells
            .iter()
            .zip(&widths)
            .map(|(cell, w)| format!("{:<width$}", cell, width = *w))
            .join(" | ")
            .trim_end()
            .to_string()
    };
    let rule = widths.iter().map(|w| "-".repeat(*w)).join("-+-");

    let mut out = String::new();
    out.push_str(&line(columns));
    out.push('\n');
    out.push_str(&rule);
    out.push('\n');
    for row in rows {
        out.push_str(&line(row));
        out.push('\n');
    }
    out
}

impl Rendered {
    /// Terminal form: a grid for tables, the text otherwise.
    pub fn to_terminal(&self) -> String {
        match self {
            Rendered::Table { columns, rows, .. } => format_grid(columns, rows),
            Rendered::Text { text } => format!("{}\n", text),
        }
    }
}

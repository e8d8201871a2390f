//! Query Result - what a question produces, before rendering

use crate::dataset::Value;
use polars::prelude::DataFrame;

/// Answer to one question. Built by the dispatcher, consumed by the renderer.
#[derive(Debug, Clone)]
pub enum QueryResult {
    Table(DataFrame),
    Sequence(Vec<Value>),
    Scalar(Value),
}

impl QueryResult {
    pub fn kind(&self) -> &'static str {
        match self {
            QueryResult::Table(_) => "table",
            QueryResult::Sequence(_) => "sequence",
            QueryResult::Scalar(_) => "scalar",
        }
    }
}

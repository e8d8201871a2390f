//! Prompt construction for the query engine
//!
//! Two application variants exist: `Classic` forwards the bare question,
//! `Guided` adds a preamble with the race-results conventions.

use crate::dataset::Dataset;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Rows of sample data included in the schema summary
pub const SAMPLE_ROWS: usize = 5;

lazy_static! {
    static ref CLASSIC_NUMERIC: Regex =
        Regex::new(r"(?i)laps?|distance|time|hours|mins?|seconds?").unwrap();
    static ref GUIDED_NUMERIC: Regex =
        Regex::new(r"(?i)laps|distance|time|hours|mins|seconds").unwrap();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Variant {
    Classic,
    Guided,
}

impl Variant {
    /// Columns whose names match are coerced to numbers on load.
    pub fn coercion_pattern(&self) -> &'static Regex {
        match self {
            Variant::Classic => &*CLASSIC_NUMERIC,
            Variant::Guided => &*GUIDED_NUMERIC,
        }
    }

    pub fn preamble(&self) -> Option<&'static str> {
        match self {
            Variant::Classic => None,
            Variant::Guided => Some(RACE_RESULTS_PREAMBLE),
        }
    }

    pub fn placeholder(&self) -> &'static str {
        match self {
            Variant::Classic => "Who won 2024 and how many laps?",
            Variant::Guided => "Who were the male and female winners in 2022?",
        }
    }
}

impl Default for Variant {
    fn default() -> Self {
        Variant::Guided
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Variant::Classic => f.write_str("classic"),
            Variant::Guided => f.write_str("guided"),
        }
    }
}

impl FromStr for Variant {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "classic" | "v1" => Ok(Variant::Classic),
            "guided" | "v2" => Ok(Variant::Guided),
            other => Err(format!("unknown variant '{}' (expected classic or guided)", other)),
        }
    }
}

pub const RACE_RESULTS_PREAMBLE: &str = r#"You answer questions about endurance-race results held in a table named `results`.

DATA ASSUMPTIONS
* Each row is one runner's performance in one edition of the race.
* Key columns (case-sensitive, use whichever exist):
    - YEAR (or YEAR OF RACE)        integer
    - Gender                        'm' or 'f'
    - NAME (or Runner, Athlete)     full name; NAME_CLEAN is a lowercased copy
    - POSITION                      integer rank or the string 'Winner'
    - TIME or FINISH_TIME           HH:MM:SS text, or a number when it parsed
    - LAPS_COMPLETED or LAPS        numeric

RESPONSE RULES
1. Winners, podium, fastest: when the question does not name a gender, return
   rows for both the male and the female category in one table
   (columns YEAR, Gender, NAME, POSITION, TIME/LAPS).
2. Counts by sex or category, e.g. "How many women finished each year?":
   group by YEAR and return one row per year with columns YEAR, COUNT.
   Never collapse to a single aggregate.
3. Top-N lists with a gender adjective ("top 3 female finishers") filter on
   Gender = 'f' (or 'm').
4. Prefer table answers where practical.
5. Use the exact column names present in the table."#;

/// Response contract appended to every system prompt
pub const RESPONSE_CONTRACT: &str = r#"Reply with a single JSON object and nothing else, in one of these shapes:
{"kind": "table", "sql": "<SELECT over results>"}
{"kind": "list", "sql": "<SELECT whose first column is the answer list>"}
{"kind": "scalar", "sql": "<SELECT returning one value>"}
{"kind": "text", "answer": "<plain-text answer>"}
SQL must be a single SELECT statement against the table `results`.
Quote column names containing spaces with double quotes."#;

/// Columns, their kinds and the first rows, as plain text for the model.
pub fn schema_summary(dataset: &Dataset) -> String {
    let mut out = format!(
        "Table `results` has {} rows and these columns:\n",
        dataset.row_count()
    );
    for column in dataset.columns() {
        out.push_str(&format!("- {} ({})\n", column.name, column.kind()));
    }

    let sample = dataset.row_count().min(SAMPLE_ROWS);
    if sample > 0 {
        out.push_str(&format!("\nFirst {} rows (CSV):\n", sample));
        out.push_str(&dataset.column_names().join(","));
        out.push('\n');
        for idx in 0..sample {
            out.push_str(&dataset.row_text(idx).join(","));
            out.push('\n');
        }
    }
    out
}

pub fn system_prompt(preamble: Option<&str>) -> String {
    match preamble {
        Some(preamble) => format!("{}\n\n{}", preamble, RESPONSE_CONTRACT),
        None => format!(
            "You answer questions about a table named `results`.\n\n{}",
            RESPONSE_CONTRACT
        ),
    }
}

pub fn user_prompt(schema: &str, question: &str) -> String {
    format!("{}\nQuestion: {}", schema, question)
}

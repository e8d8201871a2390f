//! Query Dispatcher - forwards a question to the query engine and adapts the
//! engine's plan into a `QueryResult`.
//!
//! The engine only decides *what* to run. Generated SQL is checked to be a
//! single SELECT and executed locally over the session's dataset with the
//! polars SQL context.

use crate::dataset::{Dataset, Value};
use crate::error::{KyrkError, Result};
use crate::llm::{strip_code_fences, LlmClient};
use crate::prompt::{schema_summary, system_prompt, user_prompt};
use crate::result::QueryResult;
use async_trait::async_trait;
use polars::prelude::*;
use polars::sql::SQLContext;
use serde::{Deserialize, Serialize};
use sqlparser::ast::Statement;
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;
use std::sync::Arc;
use tracing::{debug, info};

/// Name the dataset is registered under for SQL
pub const TABLE_NAME: &str = "results";

/// Everything the engine gets to see for one question
#[derive(Debug, Clone)]
pub struct QueryRequest<'a> {
    pub question: &'a str,
    pub schema: &'a str,
    pub preamble: Option<&'a str>,
}

/// What the engine wants done, tagged by the shape of the answer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QueryPlan {
    Table { sql: String },
    List { sql: String },
    Scalar { sql: String },
    Text { answer: serde_json::Value },
}

#[async_trait]
pub trait QueryEngine: Send + Sync {
    async fn plan(&self, request: &QueryRequest<'_>) -> Result<QueryPlan>;
}

/// Query engine backed by a hosted chat model
pub struct LlmQueryEngine {
    client: LlmClient,
}

impl LlmQueryEngine {
    pub fn new(client: LlmClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl QueryEngine for LlmQueryEngine {
    async fn plan(&self, request: &QueryRequest<'_>) -> Result<QueryPlan> {
        let system = system_prompt(request.preamble);
        let user = user_prompt(request.schema, request.question);
        debug!("Planning with {}: {}", self.client.model(), request.question);

        let reply = self.client.chat(&system, &user).await?;
        parse_plan(&reply)
    }
}

pub fn parse_plan(reply: &str) -> Result<QueryPlan> {
    let cleaned = strip_code_fences(reply);
    serde_json::from_str(cleaned).map_err(|e| {
        KyrkError::Llm(format!("Failed to parse query plan: {}. Response: {}", e, cleaned))
    })
}

pub struct QueryDispatcher {
    engine: Arc<dyn QueryEngine>,
    preamble: Option<&'static str>,
}

impl QueryDispatcher {
    pub fn new(engine: Arc<dyn QueryEngine>, preamble: Option<&'static str>) -> Self {
        Self { engine, preamble }
    }

    pub async fn dispatch(&self, dataset: &Dataset, question: &str) -> Result<QueryResult> {
        let question = question.trim();
        if question.is_empty() {
            return Err(KyrkError::Query("Question is required".to_string()));
        }

        let schema = schema_summary(dataset);
        let request = QueryRequest {
            question,
            schema: &schema,
            preamble: self.preamble,
        };
        let plan = self.engine.plan(&request).await?;
        info!("Question answered with a {} plan", plan_kind(&plan));

        adapt(plan, dataset)
    }
}

fn plan_kind(plan: &QueryPlan) -> &'static str {
    match plan {
        QueryPlan::Table { .. } => "table",
        QueryPlan::List { .. } => "list",
        QueryPlan::Scalar { .. } => "scalar",
        QueryPlan::Text { .. } => "text",
    }
}

/// Run a plan against the dataset and shape the output.
pub fn adapt(plan: QueryPlan, dataset: &Dataset) -> Result<QueryResult> {
    match plan {
        QueryPlan::Table { sql } => Ok(QueryResult::Table(execute_sql(dataset, &sql)?)),
        QueryPlan::List { sql } => {
            let df = execute_sql(dataset, &sql)?;
            let first = df
                .get_columns()
                .first()
                .ok_or_else(|| KyrkError::Query("query returned no columns".to_string()))?;
            let mut values = Vec::with_capacity(first.len());
            for idx in 0..first.len() {
                values.push(Value::from_any(&first.get(idx)?));
            }
            Ok(QueryResult::Sequence(values))
        }
        QueryPlan::Scalar { sql } => {
            let df = execute_sql(dataset, &sql)?;
            let first = df
                .get_columns()
                .first()
                .filter(|s| !s.is_empty())
                .ok_or_else(|| KyrkError::Query("query returned no rows".to_string()))?;
            Ok(QueryResult::Scalar(Value::from_any(&first.get(0)?)))
        }
        QueryPlan::Text { answer } => Ok(QueryResult::Scalar(json_to_value(answer))),
    }
}

fn json_to_value(answer: serde_json::Value) -> Value {
    match answer {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::String(s) => Value::Text(s),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(i) => Value::Int(i),
            None => n.as_f64().map(Value::Float).unwrap_or(Value::Text(n.to_string())),
        },
        other => Value::Text(other.to_string()),
    }
}

/// Reject anything but one SELECT statement.
pub fn validate_select(sql: &str) -> Result<()> {
    let statements = Parser::parse_sql(&GenericDialect {}, sql)
        .map_err(|e| KyrkError::Query(format!("Invalid SQL: {}", e)))?;
    match statements.as_slice() {
        [Statement::Query(_)] => Ok(()),
        [] => Err(KyrkError::Query("Empty SQL".to_string())),
        [_] => Err(KyrkError::Query("Only SELECT queries are allowed".to_string())),
        _ => Err(KyrkError::Query("Only one statement is allowed".to_string())),
    }
}

pub fn execute_sql(dataset: &Dataset, sql: &str) -> Result<DataFrame> {
    validate_select(sql)?;
    debug!("Executing SQL: {}", sql);

    let mut ctx = SQLContext::new();
    ctx.register(TABLE_NAME, dataset.to_polars()?.lazy());
    let df = ctx.execute(sql)?.collect()?;
    Ok(df)
}

//! Application session - the one context object built at startup and shared
//! by the CLI and every HTTP connection.

use crate::config::{resolve_api_key, AppConfig, API_KEY_VAR};
use crate::dataset::{ColumnKind, Dataset};
use crate::dispatcher::{LlmQueryEngine, QueryDispatcher, QueryEngine};
use crate::error::{KyrkError, Result};
use crate::llm::LlmClient;
use crate::loader::DatasetCache;
use crate::locator::{locate_csv, CsvSource};
use crate::render::{render, Rendered};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Outcome of one question as shown to the user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Answer {
    Ok {
        #[serde(flatten)]
        rendered: Rendered,
    },
    Error {
        error: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnSummary {
    pub name: String,
    pub kind: ColumnKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetSummary {
    pub source: String,
    pub rows: usize,
    pub columns: Vec<ColumnSummary>,
    /// Set when the data came from an upload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uploaded_at: Option<DateTime<Utc>>,
}

impl DatasetSummary {
    pub fn new(source: &CsvSource, dataset: &Dataset) -> Self {
        Self {
            source: source.display_name(),
            rows: dataset.row_count(),
            columns: dataset
                .columns()
                .iter()
                .map(|c| ColumnSummary {
                    name: c.name.clone(),
                    kind: c.kind(),
                })
                .collect(),
            uploaded_at: None,
        }
    }
}

#[derive(Debug, Clone)]
struct Upload {
    source: CsvSource,
    received_at: DateTime<Utc>,
}

pub struct AppSession {
    config: AppConfig,
    cache: DatasetCache,
    upload: RwLock<Option<Upload>>,
    dispatcher: QueryDispatcher,
}

impl AppSession {
    pub fn new(config: AppConfig, engine: Arc<dyn QueryEngine>) -> Self {
        let dispatcher = QueryDispatcher::new(engine, config.variant.preamble());
        Self {
            config,
            cache: DatasetCache::new(),
            upload: RwLock::new(None),
            dispatcher,
        }
    }

    /// Resolve the credential and wire the LLM-backed engine. Fails before
    /// any data is looked at when no API key is available.
    pub fn bootstrap(config: AppConfig, cli_api_key: Option<String>) -> Result<Self> {
        let env_key = cli_api_key.or_else(|| std::env::var(API_KEY_VAR).ok());
        let api_key = resolve_api_key(env_key, &config.secrets_file)?;

        let client = LlmClient::new(api_key, config.model.clone(), config.base_url.clone());
        info!(
            "Session ready: variant {}, model {}",
            config.variant,
            client.model()
        );
        Ok(Self::new(config, Arc::new(LlmQueryEngine::new(client))))
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub async fn current_source(&self) -> Result<CsvSource> {
        if let Some(path) = &self.config.csv_override {
            return Ok(CsvSource::File(path.clone()));
        }
        let upload = self.upload.read().await;
        locate_csv(&self.config.data_dir, upload.as_ref().map(|u| &u.source))
    }

    pub async fn dataset(&self) -> Result<(CsvSource, Arc<Dataset>)> {
        let source = self.current_source().await?;
        let dataset = self.cache.get_or_load(&source, self.config.variant)?;
        Ok((source, dataset))
    }

    pub async fn summary(&self) -> Result<DatasetSummary> {
        let (source, dataset) = self.dataset().await?;
        let mut summary = DatasetSummary::new(&source, &dataset);
        if let CsvSource::Upload { .. } = source {
            summary.uploaded_at = self.upload.read().await.as_ref().map(|u| u.received_at);
        }
        Ok(summary)
    }

    /// The CSV on disk that outranks any upload, if there is one.
    fn disk_source(&self) -> Result<Option<CsvSource>> {
        if let Some(path) = &self.config.csv_override {
            return Ok(Some(CsvSource::File(path.clone())));
        }
        match locate_csv(&self.config.data_dir, None) {
            Ok(source) => Ok(Some(source)),
            Err(KyrkError::NoDataSource(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Accept an uploaded CSV. Only allowed while no CSV is on disk. It is
    /// parsed before it replaces any earlier upload, so a broken file leaves
    /// the session as it was.
    pub async fn upload(&self, name: &str, bytes: Vec<u8>) -> Result<DatasetSummary> {
        if let Some(existing) = self.disk_source()? {
            return Err(KyrkError::DataSourcePresent(existing.display_name()));
        }
        if bytes.is_empty() {
            return Err(KyrkError::Query("Uploaded file is empty".to_string()));
        }
        let source = CsvSource::Upload {
            name: name.to_string(),
            bytes,
        };
        let dataset = self.cache.get_or_load(&source, self.config.variant)?;

        let received_at = Utc::now();
        info!("Upload {} accepted at {}", source.display_name(), received_at);
        *self.upload.write().await = Some(Upload {
            source: source.clone(),
            received_at,
        });
        let mut summary = DatasetSummary::new(&source, &dataset);
        summary.uploaded_at = Some(received_at);
        Ok(summary)
    }

    /// Answer one question. Missing or unreadable data is returned as an
    /// error; anything that goes wrong after that becomes `Answer::Error` so
    /// the next question can be asked right away.
    pub async fn ask(&self, question: &str) -> Result<Answer> {
        let (_, dataset) = self.dataset().await?;

        let outcome = self
            .dispatcher
            .dispatch(&dataset, question)
            .await
            .and_then(|result| render(&result));

        Ok(match outcome {
            Ok(rendered) => Answer::Ok { rendered },
            Err(e) => {
                warn!("Question failed: {}", e);
                Answer::Error {
                    error: e.to_string(),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::{QueryPlan, QueryRequest};
    use async_trait::async_trait;
    use std::fs;

    struct FixedEngine(QueryPlan);

    #[async_trait]
    impl QueryEngine for FixedEngine {
        async fn plan(&self, _request: &QueryRequest<'_>) -> Result<QueryPlan> {
            Ok(self.0.clone())
        }
    }

    fn session_in(dir: &std::path::Path, plan: QueryPlan) -> AppSession {
        let config = AppConfig {
            data_dir: dir.to_path_buf(),
            ..AppConfig::default()
        };
        AppSession::new(config, Arc::new(FixedEngine(plan)))
    }

    #[tokio::test]
    async fn test_ask_renders_table() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("KYRK_RESULTS.csv"),
            "YEAR,Gender,NAME,POSITION\n2024,m,John Doe,1\n2024,f,Jane Roe,1\n",
        )
        .unwrap();
        let session = session_in(
            dir.path(),
            QueryPlan::Table {
                sql: r#"SELECT "YEAR", "Gender", "NAME", "POSITION" FROM results"#.into(),
            },
        );

        match session.ask("Who won 2024?").await.unwrap() {
            Answer::Ok {
                rendered: Rendered::Table { rows, csv, .. },
            } => {
                assert_eq!(rows.len(), 2);
                assert!(csv.starts_with("YEAR,Gender,NAME,POSITION\n"));
            }
            other => panic!("unexpected answer {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_query_failure_keeps_session_usable() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("race.csv"), "NAME\nA\n").unwrap();
        let session = session_in(
            dir.path(),
            QueryPlan::Table {
                sql: r#"SELECT "MISSING" FROM results"#.into(),
            },
        );

        let first = session.ask("broken").await.unwrap();
        assert!(matches!(first, Answer::Error { .. }));
        let second = session.ask("broken again").await.unwrap();
        assert!(matches!(second, Answer::Error { .. }));
    }

    #[tokio::test]
    async fn test_no_data_source_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let session = session_in(dir.path(), QueryPlan::Text { answer: "x".into() });
        let err = session.ask("anything").await.unwrap_err();
        assert!(err.is_startup_fatal());
    }

    #[tokio::test]
    async fn test_upload_feeds_the_session() {
        let dir = tempfile::tempdir().unwrap();
        let session = session_in(
            dir.path(),
            QueryPlan::Scalar {
                sql: "SELECT COUNT(*) FROM results".into(),
            },
        );

        assert!(session.upload("empty.csv", Vec::new()).await.is_err());
        assert!(session.upload("bad.csv", b"A,B\n1\n".to_vec()).await.is_err());

        let summary = session
            .upload("race.csv", b"Runner,LAPS\nA,3\nB,4\n".to_vec())
            .await
            .unwrap();
        assert_eq!(summary.rows, 2);
        assert_eq!(summary.columns.len(), 3);
        let uploaded_at = summary.uploaded_at.unwrap();
        assert_eq!(session.summary().await.unwrap().uploaded_at, Some(uploaded_at));

        let answer = session.ask("How many runners?").await.unwrap();
        assert_eq!(
            answer,
            Answer::Ok {
                rendered: Rendered::Text { text: "2".into() }
            }
        );
    }

    #[tokio::test]
    async fn test_upload_refused_while_csv_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("KYRK_RESULTS.csv"), "NAME\nA\n").unwrap();
        let session = session_in(dir.path(), QueryPlan::Text { answer: "x".into() });

        let err = session
            .upload("mine.csv", b"NAME\nB\nC\nD\n".to_vec())
            .await
            .unwrap_err();
        assert!(matches!(err, KyrkError::DataSourcePresent(_)));
        assert!(err.to_string().contains("KYRK_RESULTS.csv"));

        let summary = session.summary().await.unwrap();
        assert_eq!(summary.rows, 1);
        assert!(summary.uploaded_at.is_none());
    }

    #[tokio::test]
    async fn test_upload_refused_with_csv_override() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data").join("race.txt");
        fs::create_dir(dir.path().join("data")).unwrap();
        fs::write(&path, "NAME\nA\n").unwrap();
        let config = AppConfig {
            data_dir: dir.path().to_path_buf(),
            csv_override: Some(path),
            ..AppConfig::default()
        };
        let session = AppSession::new(config, Arc::new(FixedEngine(QueryPlan::Text { answer: "x".into() })));

        let err = session.upload("mine.csv", b"NAME\nB\n".to_vec()).await.unwrap_err();
        assert!(matches!(err, KyrkError::DataSourcePresent(_)));
    }

    #[tokio::test]
    async fn test_answer_json_shape() {
        let answer = Answer::Ok {
            rendered: Rendered::Text { text: "2".into() },
        };
        let json = serde_json::to_value(&answer).unwrap();
        assert_eq!(json, serde_json::json!({"status": "ok", "kind": "text", "text": "2"}));

        let error = serde_json::to_value(Answer::Error { error: "boom".into() }).unwrap();
        assert_eq!(error, serde_json::json!({"status": "error", "error": "boom"}));
    }

    #[test]
    fn test_bootstrap_requires_credential() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig {
            data_dir: dir.path().to_path_buf(),
            secrets_file: dir.path().join("none.env"),
            ..AppConfig::default()
        };
        if std::env::var(API_KEY_VAR).is_ok() {
            return;
        }
        let err = AppSession::bootstrap(config, None).err().unwrap();
        assert!(matches!(err, KyrkError::MissingCredential(_)));
    }
}

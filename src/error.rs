use thiserror::Error;

#[derive(Error, Debug)]
pub enum KyrkError {
    #[error(
        "Add your OpenAI key:\n • set the env-var OPENAI_API_KEY\n   OR\n • add OPENAI_API_KEY to the secrets file {0}"
    )]
    MissingCredential(String),

    #[error("No CSV found in {0}. Rename your file to 'KYRK_RESULTS.csv' or upload it.")]
    NoDataSource(String),

    #[error("Results are already loaded from {0}. Remove or rename that file to use an upload instead.")]
    DataSourcePresent(String),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Polars error: {0}")]
    Polars(String),

    #[error("LLM error: {0}")]
    Llm(String),

    #[error("Query error: {0}")]
    Query(String),

    #[error("HTTP error: {0}")]
    Http(String),
}

impl KyrkError {
    /// Startup conditions halt the application; everything else only fails
    /// the current question.
    pub fn is_startup_fatal(&self) -> bool {
        matches!(self, KyrkError::MissingCredential(_) | KyrkError::NoDataSource(_))
    }
}

impl From<polars::error::PolarsError> for KyrkError {
    fn from(err: polars::error::PolarsError) -> Self {
        KyrkError::Polars(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, KyrkError>;

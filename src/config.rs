//! Runtime configuration and credential resolution

use crate::error::{KyrkError, Result};
use crate::llm::{DEFAULT_BASE_URL, DEFAULT_MODEL};
use crate::prompt::Variant;
use std::path::{Path, PathBuf};
use tracing::debug;

pub const API_KEY_VAR: &str = "OPENAI_API_KEY";
pub const DEFAULT_SECRETS_FILE: &str = "secrets.env";
pub const DEFAULT_PORT: u16 = 8501;
pub const DEFAULT_MAX_REQUEST_BYTES: usize = 10 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Directory searched for the results CSV
    pub data_dir: PathBuf,
    /// Explicit CSV file, bypassing the directory search
    pub csv_override: Option<PathBuf>,
    pub bind: String,
    pub port: u16,
    pub variant: Variant,
    pub model: String,
    pub base_url: String,
    pub secrets_file: PathBuf,
    pub max_request_bytes: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("."),
            csv_override: None,
            bind: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            variant: Variant::default(),
            model: DEFAULT_MODEL.to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
            secrets_file: PathBuf::from(DEFAULT_SECRETS_FILE),
            max_request_bytes: DEFAULT_MAX_REQUEST_BYTES,
        }
    }
}

impl AppConfig {
    /// Defaults with `OPENAI_MODEL` / `OPENAI_BASE_URL` applied.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(model) = non_empty(std::env::var("OPENAI_MODEL").ok()) {
            config.model = model;
        }
        if let Some(base_url) = non_empty(std::env::var("OPENAI_BASE_URL").ok()) {
            config.base_url = base_url;
        }
        config
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

/// The API key from the environment, else from the secrets file. Empty
/// values count as missing.
pub fn resolve_api_key(env_value: Option<String>, secrets_file: &Path) -> Result<String> {
    if let Some(key) = non_empty(env_value) {
        debug!("Using {} from environment", API_KEY_VAR);
        return Ok(key);
    }
    if let Some(key) = non_empty(read_secret(secrets_file, API_KEY_VAR)) {
        debug!("Using {} from {}", API_KEY_VAR, secrets_file.display());
        return Ok(key);
    }
    Err(KyrkError::MissingCredential(secrets_file.display().to_string()))
}

/// Look up `key` in an env-format secrets file without touching the
/// process environment.
pub fn read_secret(path: &Path, key: &str) -> Option<String> {
    let entries = dotenv::from_path_iter(path).ok()?;
    entries
        .filter_map(|entry| entry.ok())
        .find(|(k, _)| k == key)
        .map(|(_, v)| v)
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

use crate::error::{KyrkError, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

pub const DEFAULT_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// OpenAI-compatible chat-completions client
#[derive(Clone)]
pub struct LlmClient {
    api_key: String,
    base_url: String,
    model: String,
    http: reqwest::Client,
}

impl LlmClient {
    pub fn new(api_key: String, model: String, base_url: String) -> Self {
        Self {
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
            http: reqwest::Client::new(),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Send one system + user exchange and return the assistant's text.
    pub async fn chat(&self, system: &str, user: &str) -> Result<String> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": [ChatMessage::system(system), ChatMessage::user(user)],
            "temperature": 0,
        });
        debug!("LLM request to {} with model {}", self.base_url, self.model);

        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| KyrkError::Llm(format!("LLM API call failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(KyrkError::Llm(format!("LLM API error ({}): {}", status, error_text)));
        }

        let response_json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| KyrkError::Llm(format!("Failed to parse LLM response: {}", e)))?;

        extract_content(&response_json)
    }
}

/// Pull the first choice's message content out of a chat-completions body.
pub fn extract_content(response_json: &serde_json::Value) -> Result<String> {
    if let Some(error) = response_json.get("error") {
        return Err(KyrkError::Llm(format!("LLM API error: {}", error)));
    }

    let choice = response_json
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|c| c.first())
        .ok_or_else(|| KyrkError::Llm("No choices in LLM response".to_string()))?;

    match choice.get("finish_reason").and_then(|r| r.as_str()) {
        Some("content_filter") => {
            return Err(KyrkError::Llm(
                "LLM response was filtered by content policy".to_string(),
            ))
        }
        Some("length") => warn!("LLM response was truncated due to length limit"),
        _ => {}
    }

    let content = choice["message"]["content"]
        .as_str()
        .ok_or_else(|| KyrkError::Llm("No content in LLM response".to_string()))?;
    if content.trim().is_empty() {
        return Err(KyrkError::Llm("Empty content in LLM response".to_string()));
    }
    Ok(content.to_string())
}

/// Drop a surrounding Markdown code fence, if any.
pub fn strip_code_fences(text: &str) -> &str {
    text.trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim()
}

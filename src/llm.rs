use crate::config::LlmSettings;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};
use thiserror::Error;
use tracing::debug;

const SYSTEM_PROMPT: &str =
    "You are a precise responder for a housing-estate database assistant. Follow the requested output format exactly, no other text.";

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LlmError {
    #[error("LLM API call failed: {0}")]
    Request(String),

    #[error("LLM API returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("No content in LLM response")]
    MissingContent,

    #[error("LLM returned an empty response")]
    EmptyResponse,
}

/// Prompt submission capability consumed by the pipeline.
///
/// Implementations must signal failure through `LlmError` and never hand
/// back an empty string as a successful completion.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn complete(&self, prompt: &str, schema_context: &str) -> Result<String, LlmError>;
}

/// OpenAI-compatible chat-completions client (OpenAI, OpenRouter, Ollama).
#[derive(Clone)]
pub struct LlmClient {
    http: reqwest::Client,
    api_key: Option<String>,
    base_url: String,
    model: String,
}

impl LlmClient {
    pub fn new(api_key: Option<String>, model: String, base_url: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_key,
            base_url,
            model,
        }
    }

    pub fn from_settings(settings: &LlmSettings) -> Self {
        Self::new(
            settings.api_key.clone(),
            settings.model.clone(),
            settings.base_url.clone(),
        )
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

#[async_trait]
impl LanguageModel for LlmClient {
    async fn complete(&self, prompt: &str, schema_context: &str) -> Result<String, LlmError> {
        let system = if schema_context.is_empty() {
            SYSTEM_PROMPT.to_string()
        } else {
            format!("{}\n\nDATABASE SCHEMA:\n{}", SYSTEM_PROMPT, schema_context)
        };

        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": prompt}
            ],
            "temperature": 0.0,
            "max_tokens": 1000
        });

        let mut request = self
            .http
            .post(format!("{}/chat/completions", self.base_url.trim_end_matches('/')))
            .header("Content-Type", "application/json")
            .json(&body);
        if let Some(key) = &self.api_key {
            request = request.header("Authorization", format!("Bearer {}", key));
        }

        let response = request
            .send()
            .await
            .map_err(|e| LlmError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let response_json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| LlmError::Request(format!("Failed to parse LLM response: {}", e)))?;

        let content = response_json["choices"][0]["message"]["content"]
            .as_str()
            .ok_or(LlmError::MissingContent)?;

        if content.trim().is_empty() {
            return Err(LlmError::EmptyResponse);
        }
        debug!("LLM response ({} chars) from {}", content.len(), self.model);
        Ok(content.to_string())
    }
}

/// Connector that replays canned responses in order, for offline runs and tests.
///
/// Every prompt it receives is recorded. Once the script is exhausted it
/// reports `EmptyResponse`.
#[derive(Default)]
pub struct ScriptedModel {
    responses: Mutex<VecDeque<Result<String, LlmError>>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedModel {
    pub fn new<I, S>(responses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            responses: Mutex::new(responses.into_iter().map(|r| Ok(r.into())).collect()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Queue a failure to be returned by the next call.
    pub fn push_error(&self, error: LlmError) {
        self.responses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(Err(error));
    }

    pub fn push_response(&self, response: impl Into<String>) {
        self.responses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(Ok(response.into()));
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn call_count(&self) -> usize {
        self.prompts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    async fn complete(&self, prompt: &str, _schema_context: &str) -> Result<String, LlmError> {
        self.prompts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(prompt.to_string());
        let next = self
            .responses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        match next {
            Some(Ok(text)) if text.trim().is_empty() => Err(LlmError::EmptyResponse),
            Some(result) => result,
            None => Err(LlmError::EmptyResponse),
        }
    }
}

/// Strip markdown code fences the model may wrap around its answer.
pub fn strip_code_fences(response: &str) -> &str {
    let trimmed = response.trim();
    let without_open = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```sql"))
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    without_open
        .strip_suffix("```")
        .unwrap_or(without_open)
        .trim()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_model_replays_in_order() {
        let model = ScriptedModel::new(["first", "second"]);
        assert_eq!(model.complete("a", "").await.unwrap(), "first");
        assert_eq!(model.complete("b", "").await.unwrap(), "second");
        assert_eq!(model.complete("c", "").await, Err(LlmError::EmptyResponse));
        assert_eq!(model.prompts(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_scripted_model_never_returns_blank_text() {
        let model = ScriptedModel::new(["   "]);
        assert_eq!(model.complete("q", "").await, Err(LlmError::EmptyResponse));
    }

    #[test]
    fn test_strip_code_fences() {
        assert_eq!(strip_code_fences("```json\n{\"a\": 1}\n```"), "{\"a\": 1}");
        assert_eq!(strip_code_fences("```sql\nSELECT 1\n```"), "SELECT 1");
        assert_eq!(strip_code_fences("  SELECT 1  "), "SELECT 1");
    }
}

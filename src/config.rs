//! Pipeline configuration
//!
//! Values come from the environment (after `.env` is loaded by the binary),
//! falling back to conservative defaults.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Upper bound on intent-parsing attempts: the first call plus one re-prompt.
pub const MAX_PARSE_ATTEMPTS: u8 = 2;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid value for {key}: '{value}'")]
    InvalidValue { key: String, value: String },

    #[error("Unsupported LLM provider: {0}")]
    UnsupportedProvider(String),

    #[error("{0} is required when using the {1} provider")]
    MissingApiKey(&'static str, &'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmProvider {
    OpenAi,
    OpenRouter,
    Ollama,
}

impl FromStr for LlmProvider {
    type Err = ConfigError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "openai" => Ok(LlmProvider::OpenAi),
            "openrouter" => Ok(LlmProvider::OpenRouter),
            "ollama" => Ok(LlmProvider::Ollama),
            other => Err(ConfigError::UnsupportedProvider(other.to_string())),
        }
    }
}

impl LlmProvider {
    fn default_base_url(&self) -> &'static str {
        match self {
            LlmProvider::OpenAi => "https://api.openai.com/v1",
            LlmProvider::OpenRouter => "https://openrouter.ai/api/v1",
            LlmProvider::Ollama => "http://localhost:11434/v1",
        }
    }

    fn default_model(&self) -> &'static str {
        match self {
            LlmProvider::OpenAi => "gpt-4o-mini",
            LlmProvider::OpenRouter => "openai/gpt-4o-mini",
            LlmProvider::Ollama => "llama3.2",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmSettings {
    pub provider: LlmProvider,
    #[serde(skip_serializing, default)]
    pub api_key: Option<String>,
    pub model: String,
    pub base_url: String,
}

impl Default for LlmSettings {
    fn default() -> Self {
        let provider = LlmProvider::OpenAi;
        Self {
            provider,
            api_key: None,
            model: provider.default_model().to_string(),
            base_url: provider.default_base_url().to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub database_path: PathBuf,
    pub llm: LlmSettings,
    /// Bounded wait for each language-model call
    pub llm_timeout: Duration,
    /// Bounded wait for each database call
    pub query_timeout: Duration,
    /// Minimum similarity for a fuzzy schema substitution (0.0-1.0)
    pub fuzzy_threshold: f64,
    /// LIMIT applied when the question does not ask for one
    pub default_limit: u32,
    /// Largest LIMIT accepted on aggregation-free multi-table queries
    pub row_ceiling: u32,
    /// Rows materialized per execution
    pub max_result_rows: usize,
    pub max_display_rows: usize,
    pub max_parse_attempts: u8,
    /// Use the language model to narrate multi-row aggregate results
    pub narrative_summary: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("data/agency/agency_data.db"),
            llm: LlmSettings::default(),
            llm_timeout: Duration::from_secs(10),
            query_timeout: Duration::from_secs(30),
            fuzzy_threshold: 0.90,
            default_limit: 50,
            row_ceiling: 500,
            max_result_rows: 1000,
            max_display_rows: 10,
            max_parse_attempts: MAX_PARSE_ATTEMPTS,
            narrative_summary: false,
        }
    }
}

impl PipelineConfig {
    /// Build configuration from process environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup (environment, test maps).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let provider = match lookup("LLM_PROVIDER") {
            Some(value) => value.parse::<LlmProvider>()?,
            None => defaults.llm.provider,
        };

        let (key_var, model_var) = match provider {
            LlmProvider::OpenAi => (Some("OPENAI_API_KEY"), "OPENAI_MODEL"),
            LlmProvider::OpenRouter => (Some("OPENROUTER_API_KEY"), "OPENROUTER_MODEL"),
            LlmProvider::Ollama => (None, "OLLAMA_MODEL"),
        };
        let api_key = key_var.and_then(|k| lookup(k)).filter(|k| !k.trim().is_empty());
        if provider == LlmProvider::OpenRouter && api_key.is_none() {
            return Err(ConfigError::MissingApiKey("OPENROUTER_API_KEY", "openrouter"));
        }

        let llm = LlmSettings {
            provider,
            api_key,
            model: lookup(model_var).unwrap_or_else(|| provider.default_model().to_string()),
            base_url: lookup("OPENAI_BASE_URL")
                .unwrap_or_else(|| provider.default_base_url().to_string()),
        };

        let fuzzy_threshold = parse_or(&lookup, "FUZZY_MATCH_THRESHOLD", defaults.fuzzy_threshold)?;
        if !(0.0..=1.0).contains(&fuzzy_threshold) {
            return Err(ConfigError::InvalidValue {
                key: "FUZZY_MATCH_THRESHOLD".to_string(),
                value: fuzzy_threshold.to_string(),
            });
        }

        let max_parse_attempts: u8 =
            parse_or(&lookup, "MAX_PARSE_ATTEMPTS", defaults.max_parse_attempts)?;

        Ok(Self {
            database_path: lookup("DATABASE_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.database_path),
            llm,
            llm_timeout: Duration::from_secs(parse_or(
                &lookup,
                "LLM_TIMEOUT_SECS",
                defaults.llm_timeout.as_secs(),
            )?),
            query_timeout: Duration::from_secs(parse_or(
                &lookup,
                "QUERY_TIMEOUT_SECS",
                defaults.query_timeout.as_secs(),
            )?),
            fuzzy_threshold,
            default_limit: parse_or(&lookup, "QUERY_DEFAULT_LIMIT", defaults.default_limit)?,
            row_ceiling: parse_or(&lookup, "QUERY_ROW_CEILING", defaults.row_ceiling)?,
            max_result_rows: parse_or(&lookup, "MAX_RESULT_ROWS", defaults.max_result_rows)?,
            max_display_rows: parse_or(&lookup, "MAX_DISPLAY_ROWS", defaults.max_display_rows)?,
            max_parse_attempts: max_parse_attempts.clamp(1, MAX_PARSE_ATTEMPTS),
            narrative_summary: parse_or(&lookup, "NARRATIVE_SUMMARY", defaults.narrative_summary)?,
        })
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        Some(raw) => raw.trim().parse::<T>().map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            value: raw,
        }),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_environment_is_empty() {
        let config = PipelineConfig::from_lookup(lookup_from(&[])).unwrap();
        assert_eq!(config.default_limit, 50);
        assert_eq!(config.max_parse_attempts, 2);
        assert_eq!(config.llm.provider, LlmProvider::OpenAi);
        assert!((config.fuzzy_threshold - 0.9).abs() < f64::EPSILON);
    }

    #[test]
    fn test_openrouter_requires_api_key() {
        let result = PipelineConfig::from_lookup(lookup_from(&[("LLM_PROVIDER", "openrouter")]));
        assert!(matches!(result, Err(ConfigError::MissingApiKey(_, _))));
    }

    #[test]
    fn test_invalid_number_is_rejected() {
        let result = PipelineConfig::from_lookup(lookup_from(&[("QUERY_ROW_CEILING", "lots")]));
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn test_parse_attempts_are_clamped() {
        let config =
            PipelineConfig::from_lookup(lookup_from(&[("MAX_PARSE_ATTEMPTS", "9")])).unwrap();
        assert_eq!(config.max_parse_attempts, MAX_PARSE_ATTEMPTS);
    }

    #[test]
    fn test_ollama_uses_local_endpoint() {
        let config = PipelineConfig::from_lookup(lookup_from(&[
            ("LLM_PROVIDER", "ollama"),
            ("OLLAMA_MODEL", "qwen2.5"),
        ]))
        .unwrap();
        assert_eq!(config.llm.model, "qwen2.5");
        assert!(config.llm.base_url.starts_with("http://localhost"));
        assert!(config.llm.api_key.is_none());
    }
}

use crate::chunking::{ChunkingConfig, DEFAULT_CHUNK_TOKENS, DEFAULT_OVERLAP_TOKENS};
use crate::serializer::{SerializerConfig, DEFAULT_MIN_CALL_INTERVAL};
use std::time::Duration;

pub const DEFAULT_MODEL_ENDPOINT: &str = "https://api.mistral.ai/v1";
pub const DEFAULT_CHAT_MODEL: &str = "mistral-small-latest";
pub const DEFAULT_OCR_MODEL: &str = "pixtral-12b-2409";
pub const DEFAULT_TOP_K: usize = 5;

pub const ENV_ENDPOINT: &str = "DOCKET_MODEL_API_URL";
pub const ENV_API_KEY: &str = "DOCKET_MODEL_API_KEY";
pub const ENV_CHAT_MODEL: &str = "DOCKET_MODEL_CHAT";
pub const ENV_OCR_MODEL: &str = "DOCKET_MODEL_OCR";

/// Connection settings for the model service. Absent configuration puts the
/// whole pipeline in model-free mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelConfig {
    pub endpoint: String,
    pub api_key: String,
    pub chat_model: String,
    pub ocr_model: String,
}

impl ModelConfig {
    /// Returns `None` when no usable api key is given. Blank values count as
    /// absent.
    pub fn from_parts(endpoint: Option<String>, api_key: Option<String>) -> Option<Self> {
        let api_key = non_blank(api_key)?;
        Some(Self {
            endpoint: non_blank(endpoint).unwrap_or_else(|| DEFAULT_MODEL_ENDPOINT.to_string()),
            api_key,
            chat_model: DEFAULT_CHAT_MODEL.to_string(),
            ocr_model: DEFAULT_OCR_MODEL.to_string(),
        })
    }

    pub fn from_env() -> Option<Self> {
        let var = |name: &str| std::env::var(name).ok();
        let mut config = Self::from_parts(var(ENV_ENDPOINT), var(ENV_API_KEY))?;
        if let Some(chat) = non_blank(var(ENV_CHAT_MODEL)) {
            config.chat_model = chat;
        }
        if let Some(ocr) = non_blank(var(ENV_OCR_MODEL)) {
            config.ocr_model = ocr;
        }
        Some(config)
    }

    pub fn with_models(mut self, chat_model: impl Into<String>, ocr_model: impl Into<String>) -> Self {
        self.chat_model = chat_model.into();
        self.ocr_model = ocr_model.into();
        self
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Upper bounds for each kind of model call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelTimeouts {
    pub ocr: Duration,
    pub classification: Duration,
    pub structured: Duration,
    pub generation: Duration,
}

impl Default for ModelTimeouts {
    fn default() -> Self {
        Self {
            ocr: Duration::from_secs(120),
            classification: Duration::from_secs(45),
            structured: Duration::from_secs(90),
            generation: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub structured_attempts: u32,
    /// Wait before retrying a rate-limited call; doubles per attempt.
    pub rate_limit_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            structured_attempts: 2,
            rate_limit_backoff: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        self.rate_limit_backoff * 2u32.saturating_pow(attempt.saturating_sub(1))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineOptions {
    pub chunking: ChunkingConfig,
    pub top_k: usize,
    pub min_call_interval: Duration,
    pub timeouts: ModelTimeouts,
    pub retry: RetryPolicy,
    pub workers_per_stage: usize,
    pub max_deliveries: u32,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            chunking: ChunkingConfig {
                size_tokens: DEFAULT_CHUNK_TOKENS,
                overlap_tokens: DEFAULT_OVERLAP_TOKENS,
            },
            top_k: DEFAULT_TOP_K,
            min_call_interval: DEFAULT_MIN_CALL_INTERVAL,
            timeouts: ModelTimeouts::default(),
            retry: RetryPolicy::default(),
            workers_per_stage: 2,
            max_deliveries: 3,
        }
    }
}

impl PipelineOptions {
    pub fn serializer(&self) -> SerializerConfig {
        SerializerConfig {
            min_interval: self.min_call_interval,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_or_blank_key_means_not_configured() {
        assert!(ModelConfig::from_parts(None, None).is_none());
        assert!(ModelConfig::from_parts(Some("https://x".to_string()), Some("  ".to_string())).is_none());
    }

    #[test]
    fn blank_endpoint_uses_default() {
        let config = ModelConfig::from_parts(Some(" ".to_string()), Some(" key ".to_string())).unwrap();
        assert_eq!(config.endpoint, DEFAULT_MODEL_ENDPOINT);
        assert_eq!(config.api_key, "key");
    }

    #[test]
    fn defaults_match_documented_values() {
        let options = PipelineOptions::default();
        assert_eq!(options.chunking.size_tokens, 500);
        assert_eq!(options.chunking.overlap_tokens, 50);
        assert_eq!(options.top_k, 5);
        assert_eq!(options.min_call_interval, Duration::from_secs(6));
        assert_eq!(options.timeouts.ocr, Duration::from_secs(120));
        assert_eq!(options.retry.structured_attempts, 2);
        assert_eq!(options.max_deliveries, 3);
    }

    #[test]
    fn backoff_doubles_per_attempt() {
        let retry = RetryPolicy::default();
        assert_eq!(retry.backoff_for(1), Duration::from_secs(10));
        assert_eq!(retry.backoff_for(2), Duration::from_secs(20));
        assert_eq!(retry.backoff_for(3), Duration::from_secs(40));
    }
}

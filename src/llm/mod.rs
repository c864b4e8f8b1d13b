pub mod anthropic;
pub mod client;
pub mod openai;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::{Credential, LlmConfig};
use crate::error::ConfigError;

pub use anthropic::AnthropicClient;
pub use client::LlmClient;
pub use openai::OpenAiClient;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Message {
    pub role: String,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// LLM response with metadata
#[derive(Debug)]
pub struct LlmResponse {
    pub text: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
}

/// Per-model client settings.
#[derive(Debug, Clone)]
pub struct ModelSettings {
    pub model: String,
    pub api_key: Credential,
    pub base_url: Option<String>,
    pub max_tokens: u32,
    pub reasoning_effort: Option<String>,
}

/// Builds the client for one model of the configured provider.
pub fn build_client(
    config: &LlmConfig,
    model: &str,
    credential: &Credential,
    reasoning_effort: Option<String>,
) -> Result<Arc<dyn LlmClient>, ConfigError> {
    let settings = ModelSettings {
        model: model.to_string(),
        api_key: credential.clone(),
        base_url: config.base_url.clone(),
        max_tokens: config.max_tokens_per_request,
        reasoning_effort,
    };
    match config.provider.as_str() {
        "openai" => Ok(Arc::new(OpenAiClient::new(settings))),
        "anthropic" => Ok(Arc::new(AnthropicClient::new(settings))),
        other => Err(ConfigError::UnsupportedProvider(other.to_string())),
    }
}

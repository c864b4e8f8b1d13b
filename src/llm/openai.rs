//! OpenAI Chat Completions provider.
//!
//! Calls `POST {base}/v1/chat/completions`.
//!
//! Differences from Anthropic:
//! - System prompt is sent as a `role: "system"` message (not a top-level field).
//! - Reasoning models (`o1`, `o3`, ...) take `max_completion_tokens` and an
//!   optional `reasoning_effort`; `max_tokens` is rejected for them.
//! - Token usage: `prompt_tokens` / `completion_tokens`.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::client::LlmClient;
use super::{LlmResponse, Message, ModelSettings};

/// Default OpenAI API base URL.
const DEFAULT_OPENAI_URL: &str = "https://api.openai.com";

// ── Request types ────────────────────────────────────────

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<Message>,
    max_completion_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    reasoning_effort: Option<String>,
}

// ── Response types ───────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

// ── OpenAiClient ────────────────────────────────────────

/// Client for the OpenAI Chat Completions API.
pub struct OpenAiClient {
    client: Client,
    settings: ModelSettings,
    base_url: String,
}

impl OpenAiClient {
    pub fn new(settings: ModelSettings) -> Self {
        let base_url = settings
            .base_url
            .clone()
            .unwrap_or_else(|| DEFAULT_OPENAI_URL.to_string())
            .trim_end_matches('/')
            .to_string();
        Self {
            client: Client::new(),
            settings,
            base_url,
        }
    }

    fn is_reasoning_model(&self) -> bool {
        let model = self.settings.model.as_str();
        model.starts_with('o') && model.chars().nth(1).is_some_and(|c| c.is_ascii_digit())
    }

    fn build_request(&self, system_prompt: &str, messages: &[Message]) -> ChatRequest {
        let mut chat_messages = Vec::with_capacity(messages.len() + 1);
        if !system_prompt.is_empty() {
            chat_messages.push(Message {
                role: "system".to_string(),
                content: system_prompt.to_string(),
            });
        }
        chat_messages.extend_from_slice(messages);

        ChatRequest {
            model: self.settings.model.clone(),
            messages: chat_messages,
            max_completion_tokens: self.settings.max_tokens,
            reasoning_effort: if self.is_reasoning_model() {
                self.settings.reasoning_effort.clone()
            } else {
                None
            },
        }
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn complete(&self, system_prompt: &str, messages: &[Message]) -> Result<LlmResponse> {
        let request = self.build_request(system_prompt, messages);

        debug!(
            "Calling OpenAI API ({}) with {} messages",
            self.settings.model,
            messages.len()
        );

        let response = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .bearer_auth(self.settings.api_key.expose())
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("OpenAI API error ({status}): {body}");
        }

        let resp: ChatResponse = response.json().await?;
        let text = resp
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("OpenAI API returned no choices"))?
            .message
            .content
            .unwrap_or_default();

        let (input_tokens, output_tokens) = resp
            .usage
            .map(|u| (u.prompt_tokens, u.completion_tokens))
            .unwrap_or((0, 0));

        info!("LLM response: {input_tokens} in / {output_tokens} out tokens");

        Ok(LlmResponse {
            text,
            input_tokens,
            output_tokens,
        })
    }

    fn description(&self) -> String {
        format!("openai ({})", self.settings.model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Credential;

    fn client(model: &str) -> OpenAiClient {
        OpenAiClient::new(ModelSettings {
            model: model.to_string(),
            api_key: Credential::new("sk-test"),
            base_url: None,
            max_tokens: 4096,
            reasoning_effort: Some("high".to_string()),
        })
    }

    #[test]
    fn test_description_and_default_url() {
        let c = client("gpt-4o");
        assert_eq!(c.description(), "openai (gpt-4o)");
        assert_eq!(c.base_url, "https://api.openai.com");
    }

    #[test]
    fn test_reasoning_model_detection() {
        assert!(client("o3-mini").is_reasoning_model());
        assert!(client("o1").is_reasoning_model());
        assert!(!client("gpt-4o").is_reasoning_model());
        assert!(!client("omni").is_reasoning_model());
    }

    #[test]
    fn test_request_includes_system_message() {
        let request = client("gpt-4o").build_request("You are terse.", &[Message::user("Hi")]);
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["messages"][0]["role"], "system");
        assert_eq!(json["messages"][0]["content"], "You are terse.");
        assert_eq!(json["messages"][1]["role"], "user");
        assert_eq!(json["max_completion_tokens"], 4096);
        // reasoning effort only goes to reasoning models
        assert!(json.get("reasoning_effort").is_none());
    }

    #[test]
    fn test_request_reasoning_effort_for_o_series() {
        let request = client("o3-mini").build_request("", &[Message::user("Hi")]);
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["reasoning_effort"], "high");
        // empty system prompt is omitted
        assert_eq!(json["messages"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_response_parsing() {
        let json = r#"{
            "choices": [{"index": 0, "message": {"role": "assistant", "content": "42"}}],
            "usage": {"prompt_tokens": 12, "completion_tokens": 3, "total_tokens": 15}
        }"#;
        let resp: ChatResponse = serde_json::from_str(json).unwrap();
        assert_eq!(resp.choices[0].message.content.as_deref(), Some("42"));
        assert_eq!(resp.usage.unwrap().prompt_tokens, 12);
    }

    #[test]
    fn test_response_parsing_null_content() {
        let json = r#"{"choices": [{"message": {"role": "assistant", "content": null}}]}"#;
        let resp: ChatResponse = serde_json::from_str(json).unwrap();
        assert!(resp.choices[0].message.content.is_none());
        assert!(resp.usage.is_none());
    }
}

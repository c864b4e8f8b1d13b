//! `LlmClient` trait: abstraction over LLM backends.
//!
//! Providers (OpenAI, Anthropic) implement this trait so the pipeline
//! stages can be configured to use any supported backend via the
//! `[llm] provider` config field.

use anyhow::Result;
use async_trait::async_trait;

use super::{LlmResponse, Message};

/// Abstraction over LLM backends.
///
/// Each provider translates the shared message type into its own wire
/// format and normalizes responses back into [`LlmResponse`]. Calls are
/// fallible and not idempotent; callers never retry implicitly.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Sends a conversation to the LLM and returns the response.
    async fn complete(&self, system_prompt: &str, messages: &[Message]) -> Result<LlmResponse>;

    /// Human-readable description of the provider and model.
    ///
    /// Used in log output, e.g. `"openai (o3-mini)"`.
    fn description(&self) -> String;
}

//! Generation service boundary.
//!
//! Wraps an [`LlmClient`] with a timeout and turns context blocks plus an
//! instruction into a single request. Every call is sent as-is: no dedup,
//! no retry.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use super::context::Context;
use crate::error::GenerationError;
use crate::llm::{LlmClient, Message};

pub struct Generator {
    client: Arc<dyn LlmClient>,
    timeout: Duration,
}

impl Generator {
    pub fn new(client: Arc<dyn LlmClient>, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    pub fn description(&self) -> String {
        self.client.description()
    }

    /// `generate(context, instruction) -> text`.
    ///
    /// The rendered context precedes the instruction in one user message.
    /// Blank responses are reported as [`GenerationError::Empty`].
    pub async fn generate(
        &self,
        system_prompt: &str,
        context: &Context,
        instruction: &str,
    ) -> Result<String, GenerationError> {
        let prompt = if context.is_empty() {
            instruction.to_string()
        } else {
            format!("{}\n\n{instruction}", context.render())
        };
        debug!(
            "Generation request to {}: {} context blocks, {} bytes",
            self.client.description(),
            context.len(),
            prompt.len()
        );

        let messages = [Message::user(prompt)];
        let response = tokio::time::timeout(
            self.timeout,
            self.client.complete(system_prompt, &messages),
        )
        .await
        .map_err(|_| GenerationError::Timeout {
            seconds: self.timeout.as_secs(),
        })?
        .map_err(|e| GenerationError::Failed(format!("{e:#}")))?;

        if response.text.trim().is_empty() {
            return Err(GenerationError::Empty);
        }
        Ok(response.text)
    }
}

//! LLM client module for interacting with language models.
//!
//! The orchestration core only needs one capability from a model: given a
//! prompt, return a text completion. This module keeps a small chat-shaped
//! trait so providers can be swapped, with OpenRouter as the primary
//! implementation, and wraps it in [`Completer`] for the prompt-in/text-out
//! contract used by the planner, the finalizer, and the LLM-backed tools.

mod error;
mod openrouter;
#[cfg(test)]
pub(crate) mod scripted;

pub use error::{CompletionError, FailureKind, RetryPolicy};
pub use openrouter::OpenRouterClient;

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub content: Option<String>,
    /// `length` means the model hit its token limit mid-answer.
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ChatOptions {
    pub temperature: Option<f64>,
    pub max_tokens: Option<u64>,
}

/// A chat-completion backend.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn chat_completion(
        &self,
        model: &str,
        messages: &[ChatMessage],
        options: ChatOptions,
    ) -> anyhow::Result<ChatResponse>;
}

/// Prompt-in / text-out handle over an [`LlmClient`] bound to one model.
///
/// No latency guarantee is made here; callers wrap `complete` in the
/// per-task cancellation and stall guard.
#[derive(Clone)]
pub struct Completer {
    llm: Arc<dyn LlmClient>,
    model: String,
}

impl Completer {
    pub fn new(llm: Arc<dyn LlmClient>, model: impl Into<String>) -> Self {
        Self {
            llm,
            model: model.into(),
        }
    }

    /// Send `prompt` (with an optional system preamble) and return the text.
    ///
    /// Sampling is greedy. An empty completion is an error, since every
    /// caller parses the text.
    pub async fn complete(&self, system: Option<&str>, prompt: &str) -> anyhow::Result<String> {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = system {
            messages.push(ChatMessage::system(system));
        }
        messages.push(ChatMessage::user(prompt));

        tracing::debug!(
            model = %self.model,
            prompt_chars = prompt.len(),
            "Sending completion request"
        );

        let options = ChatOptions {
            temperature: Some(0.0),
            max_tokens: None,
        };
        let response = self
            .llm
            .chat_completion(&self.model, &messages, options)
            .await
            .with_context(|| format!("completion from {} failed", self.model))?;

        if response.finish_reason.as_deref() == Some("length") {
            tracing::warn!(model = %self.model, "Completion was cut off at the token limit");
        }
        match response.content {
            Some(content) if !content.trim().is_empty() => Ok(content),
            _ => Err(anyhow::anyhow!(
                "Model {} returned an empty completion",
                self.model
            )),
        }
    }
}

impl std::fmt::Debug for Completer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Completer")
            .field("model", &self.model)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::scripted::{Reply, ScriptedLlm};
    use super::*;

    #[tokio::test]
    async fn complete_sends_system_and_user_messages() {
        let llm = Arc::new(ScriptedLlm::new(vec!["hello".to_string()]));
        let completer = Completer::new(llm.clone(), "test/model");

        let out = completer
            .complete(Some("be terse"), "say hi")
            .await
            .expect("completion");
        assert_eq!(out, "hello");

        let prompts = llm.prompts();
        assert_eq!(prompts.len(), 1);
        assert_eq!(prompts[0], "say hi");
    }

    #[tokio::test]
    async fn complete_rejects_empty_content() {
        let llm = Arc::new(ScriptedLlm::new(vec!["   ".to_string()]));
        let completer = Completer::new(llm, "test/model");
        assert!(completer.complete(None, "x").await.is_err());
    }

    #[tokio::test]
    async fn backend_failures_name_the_model() {
        let llm = Arc::new(ScriptedLlm::with_replies(vec![Reply::Fail("HTTP 503".to_string())]));
        let completer = Completer::new(llm, "test/model");
        let err = completer.complete(None, "x").await.unwrap_err();
        let message = format!("{:#}", err);
        assert!(message.contains("test/model"));
        assert!(message.contains("HTTP 503"));
    }
}

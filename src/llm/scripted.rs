//! Scripted in-process LLM client for tests.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use super::{ChatMessage, ChatOptions, ChatResponse, LlmClient, Role};

/// One scripted reply.
#[derive(Debug, Clone)]
pub(crate) enum Reply {
    Text(String),
    /// Reply after a delay.
    Delayed(Duration, String),
    /// Never reply; the caller must cancel.
    Hang,
    Fail(String),
}

/// Replies are handed out in order; running out is an error.
pub(crate) struct ScriptedLlm {
    replies: Mutex<VecDeque<Reply>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedLlm {
    pub(crate) fn new(replies: Vec<String>) -> Self {
        Self::with_replies(replies.into_iter().map(Reply::Text).collect())
    }

    pub(crate) fn with_replies(replies: Vec<Reply>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// User prompts received so far, in call order.
    pub(crate) fn prompts(&self) -> Vec<String> {
        self.prompts.lock().expect("prompts lock").clone()
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn chat_completion(
        &self,
        _model: &str,
        messages: &[ChatMessage],
        _options: ChatOptions,
    ) -> anyhow::Result<ChatResponse> {
        if let Some(user) = messages.iter().rev().find(|m| m.role == Role::User) {
            self.prompts
                .lock()
                .expect("prompts lock")
                .push(user.content.clone());
        }

        let reply = self.replies.lock().expect("replies lock").pop_front();
        let content = match reply {
            Some(Reply::Text(text)) => text,
            Some(Reply::Delayed(delay, text)) => {
                tokio::time::sleep(delay).await;
                text
            }
            Some(Reply::Hang) => {
                futures::future::pending::<()>().await;
                unreachable!()
            }
            Some(Reply::Fail(message)) => return Err(anyhow::anyhow!(message)),
            None => return Err(anyhow::anyhow!("scripted LLM ran out of replies")),
        };

        Ok(ChatResponse {
            content: Some(content),
            finish_reason: Some("stop".to_string()),
        })
    }
}

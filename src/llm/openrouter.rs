//! Chat completions over an OpenAI-compatible HTTP endpoint, OpenRouter by
//! default.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::error::{CompletionError, RetryPolicy};
use super::{ChatMessage, ChatOptions, ChatResponse, LlmClient};

const OPENROUTER_API_URL: &str = "https://openrouter.ai/api/v1/chat/completions";

pub struct OpenRouterClient {
    http: Client,
    api_key: String,
    endpoint: String,
    retry: RetryPolicy,
}

impl OpenRouterClient {
    pub fn new(api_key: String) -> Self {
        Self {
            http: Client::new(),
            api_key,
            endpoint: OPENROUTER_API_URL.to_string(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Point the client at another chat completions URL.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    async fn send_once(&self, request: &WireRequest<'_>) -> Result<ChatResponse, CompletionError> {
        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .header("X-Title", "autoreport-agent")
            .json(request)
            .send()
            .await
            .map_err(|e| CompletionError::unreachable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = retry_after(response.headers());
            let body = response.text().await.unwrap_or_default();
            return Err(CompletionError::from_status(status.as_u16(), body, retry_after));
        }

        let body = response
            .text()
            .await
            .map_err(|e| CompletionError::unreachable(e.to_string()))?;
        parse_completion(&body)
    }
}

fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

fn parse_completion(body: &str) -> Result<ChatResponse, CompletionError> {
    let wire: WireResponse = serde_json::from_str(body)
        .map_err(|e| CompletionError::malformed(format!("{}: {}", e, crate::util::truncate_chars(body, 200))))?;
    if let Some(usage) = wire.usage {
        tracing::debug!(
            prompt_tokens = usage.prompt_tokens,
            completion_tokens = usage.completion_tokens,
            "Completion usage"
        );
    }
    let choice = wire
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| CompletionError::malformed("no choices in response"))?;
    Ok(ChatResponse {
        content: choice.message.content,
        finish_reason: choice.finish_reason,
    })
}

#[async_trait]
impl LlmClient for OpenRouterClient {
    async fn chat_completion(
        &self,
        model: &str,
        messages: &[ChatMessage],
        options: ChatOptions,
    ) -> anyhow::Result<ChatResponse> {
        let request = WireRequest {
            model,
            messages,
            temperature: options.temperature,
            max_tokens: options.max_tokens,
        };

        let started = Instant::now();
        let mut attempt = 0;
        loop {
            let error = match self.send_once(&request).await {
                Ok(response) => return Ok(response),
                Err(error) => error,
            };
            let Some(delay) = self.retry.next_delay(&error, attempt, started.elapsed()) else {
                return Err(error.into());
            };
            attempt += 1;
            tracing::warn!(
                model,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "Completion failed, retrying: {}",
                error
            );
            tokio::time::sleep(delay).await;
        }
    }
}

#[derive(Debug, Serialize)]
struct WireRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    choices: Vec<WireChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct WireChoice {
    message: WireMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
}

//! OpenRouter transport
//!
//! Chat completions over the OpenAI-compatible wire format, with bounded
//! retries for rate limits, server errors and dropped connections.

use super::agentic::{run_tool_loop, ChatRequest, ChatTransport, Message, ResponseMessage};
use super::{CompletionRequest, LlmClient};
use crate::config::Settings;
use crate::util::truncate;
use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::Engine;
use serde::Deserialize;
use std::time::Duration;

const REQUEST_TIMEOUT_SECS: u64 = 120;

/// Rate limit retry configuration
const MAX_ATTEMPTS: u32 = 3;
const INITIAL_BACKOFF_SECS: u64 = 2;
const BACKOFF_MULTIPLIER: u64 = 2;
/// Longer server-requested waits are ignored in favour of backoff
const MAX_RETRY_AFTER_SECS: u64 = 300;

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ErrorResponse {
    error: ApiError,
}

#[derive(Deserialize)]
struct ApiError {
    message: String,
}

/// OpenRouter chat-completions client (OpenAI-compatible wire format)
pub struct OpenRouterClient {
    http: reqwest::Client,
    api_key: String,
    url: String,
    model: String,
    max_tokens: u32,
}

impl OpenRouterClient {
    pub fn new(
        api_key: impl Into<String>,
        url: impl Into<String>,
        model: impl Into<String>,
        max_tokens: u32,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self {
            http,
            api_key: api_key.into(),
            url: url.into(),
            model: model.into(),
            max_tokens,
        })
    }

    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let api_key = settings.openrouter_api_key().ok_or_else(|| {
            anyhow::anyhow!(
                "No OpenRouter API key configured. Set OPENROUTER_API_KEY or store one in the system keychain."
            )
        })?;
        Self::new(
            api_key,
            settings.llm_api_url.clone(),
            settings.model.clone(),
            settings.max_tokens,
        )
    }
}

/// Extract a retry-after hint from an error body, in seconds.
fn parse_retry_after(text: &str) -> Option<u64> {
    let text_lower = text.to_lowercase();
    let pos = text_lower.find("retry")?;
    text_lower[pos..]
        .split_whitespace()
        .skip(1)
        .take(5)
        .filter_map(|word| {
            word.trim_matches(|c: char| !c.is_ascii_digit())
                .parse::<u64>()
                .ok()
        })
        .find(|secs| is_usable_wait(*secs))
}

/// `Retry-After` header in its delay-seconds form.
fn parse_retry_after_header(value: &str) -> Option<u64> {
    value.trim().parse::<u64>().ok().filter(|secs| is_usable_wait(*secs))
}

fn is_usable_wait(secs: u64) -> bool {
    secs > 0 && secs < MAX_RETRY_AFTER_SECS
}

fn backoff_secs(attempt: u32) -> u64 {
    INITIAL_BACKOFF_SECS * BACKOFF_MULTIPLIER.pow(attempt.saturating_sub(1))
}

fn is_retryable(status: reqwest::StatusCode) -> bool {
    status.as_u16() == 429 || status.is_server_error()
}

fn describe_failure(status: reqwest::StatusCode, body: &str) -> String {
    let detail = serde_json::from_str::<ErrorResponse>(body)
        .map(|e| e.error.message)
        .unwrap_or_else(|_| truncate(body, 200));
    match status.as_u16() {
        401 => "Invalid OpenRouter API key".to_string(),
        429 => format!("Rate limited by OpenRouter: {}", detail),
        500..=599 => format!(
            "OpenRouter server error ({}). The service may be temporarily unavailable.",
            status
        ),
        _ => format!("API error {}: {}", status, detail),
    }
}

/// Encode PNG bytes as an inline data URL
pub fn png_data_url(bytes: &[u8]) -> String {
    format!(
        "data:image/png;base64,{}",
        base64::engine::general_purpose::STANDARD.encode(bytes)
    )
}

#[async_trait]
impl ChatTransport for OpenRouterClient {
    /// Send one request, retrying rate limits, server errors and transport
    /// failures with exponential backoff.
    async fn send(&self, request: &ChatRequest) -> Result<ResponseMessage> {
        let mut attempt = 0;
        loop {
            attempt += 1;

            let outcome = self
                .http
                .post(&self.url)
                .header("Content-Type", "application/json")
                .header("HTTP-Referer", "https://github.com/bug-agent")
                .header("X-Title", "bug-agent")
                .header("Authorization", format!("Bearer {}", self.api_key))
                .json(request)
                .send()
                .await;

            let (reason, hint) = match outcome {
                Ok(response) => {
                    let status = response.status();
                    let header_hint = response
                        .headers()
                        .get(reqwest::header::RETRY_AFTER)
                        .and_then(|v| v.to_str().ok())
                        .and_then(parse_retry_after_header);
                    match response.text().await {
                        Ok(text) if status.is_success() => {
                            let parsed: ChatResponse =
                                serde_json::from_str(&text).with_context(|| {
                                    format!(
                                        "Failed to parse OpenRouter response: {}",
                                        truncate(&text, 200)
                                    )
                                })?;
                            return parsed
                                .choices
                                .into_iter()
                                .next()
                                .map(|c| c.message)
                                .ok_or_else(|| anyhow::anyhow!("No response from model"));
                        }
                        Ok(text) if is_retryable(status) => {
                            let hint = header_hint.or_else(|| parse_retry_after(&text));
                            (describe_failure(status, &text), hint)
                        }
                        Ok(text) => anyhow::bail!("{}", describe_failure(status, &text)),
                        Err(err) => (format!("Failed to read response body: {}", err), None),
                    }
                }
                Err(err) => (format!("Request failed: {}", err), None),
            };

            if attempt >= MAX_ATTEMPTS {
                anyhow::bail!("{} (gave up after {} attempts)", reason, attempt);
            }

            let wait = hint.unwrap_or_else(|| backoff_secs(attempt));
            tracing::warn!(
                attempt,
                max_attempts = MAX_ATTEMPTS,
                wait_secs = wait,
                reason = %reason,
                "LLM request failed, retrying"
            );
            tokio::time::sleep(Duration::from_secs(wait)).await;
        }
    }
}

#[async_trait]
impl LlmClient for OpenRouterClient {
    async fn complete(&self, request: CompletionRequest<'_>) -> Result<String> {
        let user = if request.images.is_empty() {
            Message::user(request.user)
        } else {
            let urls = request.images.iter().map(|b| png_data_url(b)).collect();
            Message::user_with_images(request.user, urls)
        };
        let messages = vec![Message::system(request.system), user];

        match request.tools.filter(|t| !t.is_empty()) {
            Some(registry) => {
                run_tool_loop(self, &self.model, self.max_tokens, messages, registry).await
            }
            None => {
                let chat = ChatRequest {
                    model: self.model.clone(),
                    messages,
                    max_tokens: self.max_tokens,
                    stream: false,
                    tools: None,
                };
                let reply = self.send(&chat).await?;
                Ok(reply.content.unwrap_or_default())
            }
        }
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

//! OpenAI-compatible chat completions client used by the LLM oracles.
//!
//! Works against any `/chat/completions` endpoint (OpenAI, LM Studio, Ollama,
//! vLLM). The API key is read from the configured environment variable on
//! every request so rotated keys are picked up without a restart.

use super::heuristic::truncate_chars;
use crate::config::LlmConfig;
use crate::{Result, TracegateError};
use regex::Regex;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

const RETRY_BASE_DELAY_MS: u64 = 200;
const RETRY_MAX_DELAY_MS: u64 = 5_000;
const MAX_ERROR_DETAIL_CHARS: usize = 500;

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
    temperature: f32,
    stream: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

/// Chat completions client with retry and `<think>` stripping
pub struct LlmClient {
    client: Client,
    config: LlmConfig,
    think_re: Regex,
}

impl LlmClient {
    pub fn new(config: LlmConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .connect_timeout(Duration::from_secs(15))
            .user_agent(concat!("tracegate/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| TracegateError::Config(format!("http client: {e}")))?;
        let think_re = Regex::new(r"(?s)<think>.*?</think>")
            .map_err(|e| TracegateError::Config(e.to_string()))?;

        debug!(
            "LLM client: base_url={}, model={}, decision_model={}",
            config.base_url,
            config.model,
            config.decision_model()
        );

        Ok(Self {
            client,
            config,
            think_re,
        })
    }

    pub fn config(&self) -> &LlmConfig {
        &self.config
    }

    /// Send a system + user prompt to `model`, retrying transient failures
    /// with exponential backoff. Reasoning blocks are removed from the reply.
    pub async fn complete(&self, model: &str, system_prompt: &str, user_prompt: &str) -> Result<String> {
        debug!("Calling LLM ({}) with prompt length: {}", model, user_prompt.len());

        let attempts = self.config.max_retry_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.send_chat_request(model, system_prompt, user_prompt).await {
                Ok(content) => {
                    let response = self.strip_thinking(&content);
                    debug!("LLM response: {}", response);
                    return Ok(response);
                }
                Err(AttemptError::Transient(reason)) if attempt < attempts => {
                    let delay = backoff_delay(attempt);
                    warn!(
                        "LLM request failed (attempt {}/{}): {}; retrying in {:?}",
                        attempt, attempts, reason, delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e.into_oracle_error()),
            }
        }
    }

    /// Remove `<think>...</think>` blocks (and an unterminated leading one)
    pub fn strip_thinking(&self, content: &str) -> String {
        let stripped = self.think_re.replace_all(content, "");
        if stripped.trim_start().starts_with("<think>") {
            return String::new();
        }
        stripped.trim().to_string()
    }

    async fn send_chat_request(
        &self,
        model: &str,
        system_prompt: &str,
        user_prompt: &str,
    ) -> std::result::Result<String, AttemptError> {
        let url = format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'));

        let request = ChatRequest {
            model,
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: system_prompt.to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: user_prompt.to_string(),
                },
            ],
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
            stream: false,
        };

        let mut req_builder = self.client.post(&url).json(&request);
        if let Ok(key) = std::env::var(&self.config.api_key_env) {
            let key = key.trim();
            if !key.is_empty() {
                req_builder = req_builder.bearer_auth(key);
            }
        }

        let response = req_builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AttemptError::from_status(status, &body));
        }

        let chat_response: ChatResponse = response.json().await?;
        chat_response
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| AttemptError::Permanent("response had no choices".to_string()))
    }
}

/// Outcome of one failed request, classified once where the failure is seen
#[derive(Debug, PartialEq, Eq)]
enum AttemptError {
    /// Worth another attempt: timeouts, dropped connections, 429 and 5xx
    Transient(String),
    Permanent(String),
}

impl AttemptError {
    fn from_status(status: StatusCode, body: &str) -> Self {
        let message = match error_detail(body) {
            Some(detail) => format!("HTTP {status}: {detail}"),
            None => format!("HTTP {status}"),
        };
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            AttemptError::Transient(message)
        } else {
            AttemptError::Permanent(message)
        }
    }

    fn into_oracle_error(self) -> TracegateError {
        match self {
            AttemptError::Transient(msg) | AttemptError::Permanent(msg) => {
                TracegateError::OracleUnavailable(msg)
            }
        }
    }
}

impl From<reqwest::Error> for AttemptError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() || e.is_connect() || e.is_request() {
            AttemptError::Transient(e.to_string())
        } else if e.is_decode() {
            AttemptError::Permanent(format!("malformed response: {e}"))
        } else {
            AttemptError::Permanent(e.to_string())
        }
    }
}

/// Doubling delay from `RETRY_BASE_DELAY_MS`, capped at `RETRY_MAX_DELAY_MS`
fn backoff_delay(attempt: u32) -> Duration {
    let factor = 1u64 << attempt.saturating_sub(1).min(16);
    Duration::from_millis(RETRY_BASE_DELAY_MS.saturating_mul(factor).min(RETRY_MAX_DELAY_MS))
}

/// Human-readable part of an error body, if it has one
fn error_detail(body: &str) -> Option<String> {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return None;
    }
    let detail = serde_json::from_str::<serde_json::Value>(trimmed)
        .ok()
        .and_then(|value| {
            ["/error/message", "/error", "/message"]
                .iter()
                .find_map(|path| value.pointer(path)?.as_str().map(str::to_string))
        })
        .unwrap_or_else(|| trimmed.to_string());
    Some(truncate_chars(&detail, MAX_ERROR_DETAIL_CHARS))
}

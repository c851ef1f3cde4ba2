//! DeepSeek adapter (OpenAI-compatible `chat/completions`).
//!
//! Implements the `relay-core` [`CompletionClient`] port. One call here is one
//! attempt; retries and per-attempt timeouts live in the core adapter.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use relay_core::{
    config::Config,
    errors::Error,
    model::{
        client::CompletionClient,
        types::{CompletionError, CompletionRequest, WireMessage},
    },
    Result,
};

/// Longest slice of an error body carried into logs.
const ERROR_BODY_PREVIEW: usize = 200;

#[derive(Clone, Debug)]
pub struct DeepSeekClient {
    api_url: String,
    api_key: String,
    http: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct ChatPayload<'a> {
    model: &'a str,
    messages: Vec<WireMessage>,
    temperature: f32,
    max_tokens: u32,
    stream: bool,
}

impl DeepSeekClient {
    pub fn new(
        api_url: impl Into<String>,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::External(format!("http client build failed: {e}")))?;
        Ok(Self {
            api_url: api_url.into(),
            api_key: api_key.into(),
            http,
        })
    }

    pub fn from_config(cfg: &Config) -> Result<Self> {
        Self::new(
            cfg.deepseek_api_url.clone(),
            cfg.deepseek_api_key.clone(),
            cfg.request_timeout,
        )
    }
}

fn build_payload(req: &CompletionRequest) -> ChatPayload<'_> {
    ChatPayload {
        model: &req.model,
        messages: req.wire_messages(),
        temperature: req.temperature,
        max_tokens: req.max_tokens,
        stream: false,
    }
}

fn map_transport_error(e: reqwest::Error) -> CompletionError {
    if e.is_timeout() {
        CompletionError::Timeout
    } else {
        CompletionError::NetworkError(e.to_string())
    }
}

/// `Retry-After` in delta-seconds. HTTP-date values are ignored.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    let secs = value.trim().parse::<f64>().ok()?;
    if !secs.is_finite() || secs < 0.0 {
        return None;
    }
    Some(Duration::from_secs_f64(secs))
}

/// Prefer the OpenAI-style `{"error":{"message":..}}`; fall back to a body preview.
fn error_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| {
            v.pointer("/error/message")
                .and_then(|m| m.as_str())
                .map(str::to_string)
        })
        .unwrap_or_else(|| body.chars().take(ERROR_BODY_PREVIEW).collect())
}

/// Map a non-success HTTP status to the completion error taxonomy.
pub fn classify_status(status: u16, retry_after: Option<Duration>, body: &str) -> CompletionError {
    let message = error_message(body);
    match status {
        401 | 403 => CompletionError::AuthError(message),
        429 => CompletionError::RateLimited { retry_after },
        500..=599 => CompletionError::ServerError {
            status: Some(status),
            message,
        },
        _ => CompletionError::Rejected { status, message },
    }
}

/// Extract `choices[0].message.content`; a missing or blank reply is a server fault.
pub fn parse_completion_body(v: &serde_json::Value) -> std::result::Result<String, CompletionError> {
    let content = v
        .pointer("/choices/0/message/content")
        .and_then(|c| c.as_str())
        .unwrap_or("");

    if content.trim().is_empty() {
        return Err(CompletionError::ServerError {
            status: Some(200),
            message: "completion returned no content".to_string(),
        });
    }
    Ok(content.to_string())
}

#[async_trait]
impl CompletionClient for DeepSeekClient {
    fn name(&self) -> &'static str {
        "deepseek"
    }

    async fn complete(
        &self,
        req: &CompletionRequest,
    ) -> std::result::Result<String, CompletionError> {
        let resp = self
            .http
            .post(&self.api_url)
            .bearer_auth(&self.api_key)
            .json(&build_payload(req))
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = resp.status();
        if !status.is_success() {
            let retry_after = resp
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|h| h.to_str().ok())
                .and_then(parse_retry_after);
            let body = resp.text().await.unwrap_or_default();
            let err = classify_status(status.as_u16(), retry_after, &body);
            tracing::debug!(status = status.as_u16(), kind = err.kind(), "deepseek request failed");
            return Err(err);
        }

        let v: serde_json::Value = resp.json().await.map_err(|e| {
            if e.is_timeout() {
                CompletionError::Timeout
            } else {
                CompletionError::ServerError {
                    status: Some(status.as_u16()),
                    message: format!("invalid response body: {e}"),
                }
            }
        })?;

        if let Some(usage) = v.get("usage") {
            tracing::debug!(
                prompt_tokens = usage.get("prompt_tokens").and_then(|n| n.as_u64()),
                completion_tokens = usage.get("completion_tokens").and_then(|n| n.as_u64()),
                "deepseek usage"
            );
        }

        parse_completion_body(&v)
    }
}

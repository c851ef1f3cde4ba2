use std::time::Duration;

use serde::Serialize;

use crate::domain::Turn;

/// Normalized request for a single completion call.
#[derive(Clone, Debug)]
pub struct CompletionRequest {
    pub system_prompt: Option<String>,
    pub messages: Vec<Turn>,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

/// One role-tagged message on the OpenAI-compatible wire format.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct WireMessage {
    pub role: &'static str,
    pub content: String,
}

impl CompletionRequest {
    /// Messages in send order: system prompt first (if any), then turns oldest first.
    pub fn wire_messages(&self) -> Vec<WireMessage> {
        let mut out = Vec::with_capacity(self.messages.len() + 1);
        if let Some(sys) = &self.system_prompt {
            out.push(WireMessage {
                role: "system",
                content: sys.clone(),
            });
        }
        out.extend(self.messages.iter().map(|t| WireMessage {
            role: t.role().as_wire(),
            content: t.text().to_string(),
        }));
        out
    }
}

/// Failure of a single completion attempt.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum CompletionError {
    #[error("completion timed out")]
    Timeout,

    #[error("rate limited by completion service")]
    RateLimited { retry_after: Option<Duration> },

    #[error("completion service error ({status:?}): {message}")]
    ServerError {
        status: Option<u16>,
        message: String,
    },

    #[error("completion service rejected credentials: {0}")]
    AuthError(String),

    #[error("network error: {0}")]
    NetworkError(String),

    /// Request refused for a reason retrying cannot fix (bad request, no balance, unknown model).
    #[error("completion request rejected ({status}): {message}")]
    Rejected { status: u16, message: String },
}

impl CompletionError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CompletionError::Timeout
                | CompletionError::RateLimited { .. }
                | CompletionError::ServerError { .. }
                | CompletionError::NetworkError(_)
        )
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            CompletionError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }

    /// Short stable name for logs and audit events.
    pub fn kind(&self) -> &'static str {
        match self {
            CompletionError::Timeout => "timeout",
            CompletionError::RateLimited { .. } => "rate_limited",
            CompletionError::ServerError { .. } => "server_error",
            CompletionError::AuthError(_) => "auth_error",
            CompletionError::NetworkError(_) => "network_error",
            CompletionError::Rejected { .. } => "rejected",
        }
    }
}

/// Final outcome of a retried completion that never succeeded.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("completion failed after {attempts} attempt(s): {error}")]
pub struct RetryFailure {
    pub error: CompletionError,
    pub attempts: u32,
}

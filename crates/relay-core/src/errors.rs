use crate::model::types::CompletionError;

/// Core error type for the relay.
///
/// Adapter crates should map their specific errors into this type so the
/// dispatcher can handle failures consistently (user-facing message vs retryable).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("completion error: {0}")]
    Completion(#[from] CompletionError),

    #[error("external error: {0}")]
    External(String),
}

pub type Result<T> = std::result::Result<T, Error>;

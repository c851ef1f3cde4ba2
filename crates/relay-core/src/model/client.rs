use async_trait::async_trait;

use super::types::{CompletionError, CompletionRequest};

/// Port for a chat-completion backend (DeepSeek today; any OpenAI-compatible API fits).
///
/// Implementations perform exactly one attempt; retries and timeouts are the
/// adapter's job.
#[async_trait]
pub trait CompletionClient: Send + Sync {
    fn name(&self) -> &'static str;

    async fn complete(&self, req: &CompletionRequest) -> Result<String, CompletionError>;
}

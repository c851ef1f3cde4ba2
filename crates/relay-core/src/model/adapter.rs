use std::{sync::Arc, time::Duration};

use crate::{config::Config, domain::Turn, personas::Persona};

use super::{
    client::CompletionClient,
    retry::{RetryPolicy, Sleeper, TokioSleeper},
    types::{CompletionError, CompletionRequest, RetryFailure},
};

/// Static request parameters shared by every call.
#[derive(Clone, Debug)]
pub struct CompletionSettings {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub timeout: Duration,
    /// Upper bound on context + new text, in characters.
    pub context_char_budget: usize,
}

impl CompletionSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            model: cfg.model.clone(),
            temperature: cfg.temperature,
            max_tokens: cfg.max_tokens,
            timeout: cfg.request_timeout,
            context_char_budget: cfg.context_char_budget,
        }
    }
}

/// Retry-wrapped front for a [`CompletionClient`].
pub struct CompletionAdapter {
    client: Arc<dyn CompletionClient>,
    settings: CompletionSettings,
    policy: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
}

impl CompletionAdapter {
    pub fn new(
        client: Arc<dyn CompletionClient>,
        settings: CompletionSettings,
        policy: RetryPolicy,
    ) -> Self {
        Self::with_sleeper(client, settings, policy, Arc::new(TokioSleeper))
    }

    pub fn with_sleeper(
        client: Arc<dyn CompletionClient>,
        settings: CompletionSettings,
        policy: RetryPolicy,
        sleeper: Arc<dyn Sleeper>,
    ) -> Self {
        Self {
            client,
            settings,
            policy,
            sleeper,
        }
    }

    /// Build the outbound request: persona system prompt, budgeted context, new text last.
    pub fn build_request(
        &self,
        context: &[Turn],
        new_user_text: &str,
        persona: Option<&Persona>,
    ) -> CompletionRequest {
        let mut messages = fit_context(context, new_user_text, self.settings.context_char_budget);
        messages.push(Turn::user(new_user_text));

        CompletionRequest {
            system_prompt: persona.map(|p| p.system_prompt.to_string()),
            messages,
            model: self.settings.model.clone(),
            temperature: persona
                .and_then(|p| p.temperature)
                .unwrap_or(self.settings.temperature),
            max_tokens: persona
                .and_then(|p| p.max_tokens)
                .unwrap_or(self.settings.max_tokens),
        }
    }

    /// Run one completion with timeout + retries. Never holds any caller state.
    pub async fn complete(
        &self,
        context: &[Turn],
        new_user_text: &str,
        persona: Option<&Persona>,
    ) -> Result<String, RetryFailure> {
        let req = self.build_request(context, new_user_text, persona);
        tracing::debug!(
            backend = self.client.name(),
            messages = req.messages.len(),
            dropped = context.len() + 1 - req.messages.len(),
            "sending completion request"
        );

        let mut attempts: u32 = 0;
        loop {
            attempts += 1;
            let err = match self.attempt(&req).await {
                Ok(text) => return Ok(text),
                Err(err) => err,
            };

            let Some(delay) = self.policy.delay_for(attempts, &err) else {
                if err.is_retryable() {
                    tracing::warn!(attempts, error = %err, "completion retries exhausted");
                }
                return Err(RetryFailure {
                    error: err,
                    attempts,
                });
            };

            tracing::warn!(
                attempt = attempts,
                max_retries = self.policy.max_retries,
                kind = err.kind(),
                delay_ms = delay.as_millis() as u64,
                "completion attempt failed, retrying"
            );
            self.sleeper.sleep(delay).await;
        }
    }

    async fn attempt(&self, req: &CompletionRequest) -> Result<String, CompletionError> {
        match tokio::time::timeout(self.settings.timeout, self.client.complete(req)).await {
            Ok(res) => res,
            Err(_) => Err(CompletionError::Timeout),
        }
    }
}

/// Drop the oldest context turns until context + new text fits `budget` characters.
///
/// The new text itself is never truncated and the most recent turns are kept.
pub fn fit_context(context: &[Turn], new_user_text: &str, budget: usize) -> Vec<Turn> {
    let mut remaining = budget.saturating_sub(new_user_text.chars().count());
    let mut kept = 0usize;

    for turn in context.iter().rev() {
        let len = turn.char_len();
        if len > remaining {
            break;
        }
        remaining -= len;
        kept += 1;
    }

    context[context.len() - kept..].to_vec()
}

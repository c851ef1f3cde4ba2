//! Per-message orchestration: access, rate limit, context, completion, delivery.

use std::{sync::Arc, time::Duration};

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::{
    config::Config,
    conversation::ConversationStore,
    domain::{ChatId, Turn, UserId},
    messaging::{
        port::MessagingPort,
        split::split_message,
        types::{ChatAction, InlineButton, InlineKeyboard, TextMessage},
    },
    model::{
        adapter::{CompletionAdapter, CompletionSettings},
        client::CompletionClient,
        retry::RetryPolicy,
        types::{CompletionError, RetryFailure},
    },
    personas::{self, Persona, PERSONAS},
    rate_limit::RateLimiter,
    security::{Access, AccessPolicy},
    utils::{AuditEvent, AuditLogger},
    Result,
};

/// Telegram shows "typing..." for about five seconds per action.
const TYPING_INTERVAL: Duration = Duration::from_secs(4);

pub const CALLBACK_PERSONA_PREFIX: &str = "persona:";
pub const CALLBACK_CLEAR: &str = "clear";
pub const CALLBACK_CURRENT: &str = "current";
pub const CALLBACK_HELP: &str = "help";

pub struct Dispatcher {
    cfg: Arc<Config>,
    rate_limiter: RateLimiter,
    conversations: ConversationStore,
    selected: DashMap<UserId, &'static Persona>,
    access: AccessPolicy,
    /// One FIFO worker per user; the sender is the user's place in line.
    queues: DashMap<UserId, mpsc::UnboundedSender<TextMessage>>,
    completion: CompletionAdapter,
    messenger: Arc<dyn MessagingPort>,
    audit: AuditLogger,
}

impl Dispatcher {
    pub fn new(
        cfg: Arc<Config>,
        completion: CompletionAdapter,
        messenger: Arc<dyn MessagingPort>,
        audit: AuditLogger,
    ) -> Self {
        Self {
            rate_limiter: RateLimiter::new(
                cfg.rate_limit_enabled,
                cfg.rate_limit_requests,
                cfg.rate_limit_window,
            ),
            conversations: ConversationStore::new(cfg.max_history),
            selected: DashMap::new(),
            access: AccessPolicy::new(cfg.allowed_users.clone(), cfg.access_passcode.clone()),
            queues: DashMap::new(),
            completion,
            messenger,
            audit,
            cfg,
        }
    }

    /// Standard wiring: retry policy, completion settings and audit log from `cfg`.
    pub fn from_config(
        cfg: Arc<Config>,
        client: Arc<dyn CompletionClient>,
        messenger: Arc<dyn MessagingPort>,
    ) -> Self {
        let completion = CompletionAdapter::new(
            client,
            CompletionSettings::from_config(&cfg),
            RetryPolicy::from_config(&cfg),
        );
        let audit = AuditLogger::new(cfg.audit_log_path.clone(), cfg.audit_log_json);
        Self::new(cfg, completion, messenger, audit)
    }

    pub fn conversations(&self) -> &ConversationStore {
        &self.conversations
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    pub fn messenger(&self) -> Arc<dyn MessagingPort> {
        self.messenger.clone()
    }

    pub fn is_authorized(&self, user_id: UserId) -> bool {
        self.access.is_authorized(user_id)
    }

    pub fn persona_for(&self, user_id: UserId) -> &'static Persona {
        self.selected
            .get(&user_id)
            .map(|p| *p)
            .unwrap_or_else(personas::default_persona)
    }

    // ============== Messages ==============

    /// Queue a message behind the user's earlier ones, without waiting.
    ///
    /// The send happens synchronously under the user's map entry, so the order
    /// of `enqueue` calls is the order of processing. Each user's worker runs
    /// [`Dispatcher::on_message`] for one message at a time; different users
    /// run concurrently. Must be called from within a tokio runtime.
    pub fn enqueue(self: &Arc<Self>, msg: TextMessage) {
        let user_id = msg.user_id;
        let mut tx = self
            .queues
            .entry(user_id)
            .or_insert_with(|| self.spawn_queue(user_id));

        if let Err(mpsc::error::SendError(msg)) = tx.send(msg) {
            // The worker died (a panic mid-exchange); replace it.
            tracing::warn!(user_id = user_id.0, "user queue worker gone, restarting");
            *tx = self.spawn_queue(user_id);
            if tx.send(msg).is_err() {
                tracing::error!(user_id = user_id.0, "dropping message: user queue unavailable");
            }
        }
    }

    fn spawn_queue(self: &Arc<Self>, user_id: UserId) -> mpsc::UnboundedSender<TextMessage> {
        let (tx, mut rx) = mpsc::unbounded_channel::<TextMessage>();
        let this = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Err(e) = this.on_message(msg).await {
                    tracing::warn!(user_id = user_id.0, error = %e, "message handling failed");
                }
            }
        });
        tx
    }

    /// Handle one message end to end. Callers that need per-user ordering go
    /// through [`Dispatcher::enqueue`].
    pub async fn on_message(&self, msg: TextMessage) -> Result<()> {
        let chat_id = msg.chat_id;
        let user_id = msg.user_id;
        let username = msg.username_or_unknown();

        match self.access.check_message(user_id, &msg.text) {
            Access::Granted => {}
            Access::JustAuthenticated => {
                tracing::info!(user_id = user_id.0, "user authenticated with passcode");
                self.audit.record(AuditEvent::auth(user_id, username, true));
                return self
                    .messenger
                    .send_text(chat_id, "✅ Access granted. Send me a message to get started.")
                    .await;
            }
            Access::PasscodeRequired => {
                self.audit.record(AuditEvent::auth(user_id, username, false));
                return self
                    .messenger
                    .send_text(chat_id, "🔒 Please send the access passcode to use this bot.")
                    .await;
            }
            Access::Denied => {
                self.audit.record(AuditEvent::auth(user_id, username, false));
                return self
                    .messenger
                    .send_text(chat_id, "Unauthorized. Contact the bot owner for access.")
                    .await;
            }
        }

        let text = msg.text.trim();
        if text.is_empty() {
            return Ok(());
        }

        let (allowed, retry_after) = self.rate_limiter.check(user_id);
        if !allowed {
            let wait = retry_after.unwrap_or_default();
            tracing::info!(
                user_id = user_id.0,
                retry_after_ms = wait.as_millis() as u64,
                "rate limit exceeded"
            );
            self.audit
                .record(AuditEvent::rate_limit(user_id, username, wait.as_secs_f64()));
            let msg = format!(
                "⏳ Rate limited. Please wait {} seconds.",
                wait_seconds(wait)
            );
            return self.messenger.send_text(chat_id, &msg).await;
        }

        let len = text.chars().count();
        if len > self.cfg.max_input_length {
            let msg = format!(
                "❌ Message too long ({len} characters). Please keep it under {} characters.",
                self.cfg.max_input_length
            );
            return self.messenger.send_text(chat_id, &msg).await;
        }

        let persona = self.persona_for(user_id);
        let context = self.conversations.get_context(user_id);
        self.conversations.append(user_id, Turn::user(text));

        let typing = TypingIndicator::start(self.messenger.clone(), chat_id);
        let result = self.completion.complete(&context, text, Some(persona)).await;
        typing.stop().await;

        match result {
            Ok(reply) => {
                self.conversations
                    .append(user_id, Turn::assistant(reply.clone()));
                self.audit.record(AuditEvent::message(
                    user_id, username, persona.id, text, &reply,
                ));
                self.deliver(chat_id, &reply).await
            }
            Err(failure) => {
                self.log_failure(user_id, &failure);
                self.audit.record(AuditEvent::error(
                    user_id,
                    username,
                    &failure.error.to_string(),
                    Some(failure.attempts),
                ));
                self.messenger
                    .send_text(chat_id, failure_message(&failure.error))
                    .await
            }
        }
    }

    fn log_failure(&self, user_id: UserId, failure: &RetryFailure) {
        match &failure.error {
            CompletionError::AuthError(_) => tracing::error!(
                user_id = user_id.0,
                error = %failure.error,
                "completion backend rejected credentials; check DEEPSEEK_API_KEY"
            ),
            err => tracing::warn!(
                user_id = user_id.0,
                attempts = failure.attempts,
                kind = err.kind(),
                error = %err,
                "completion failed"
            ),
        }
    }

    /// Send `text` in order, split at the messenger's (and configured) length limit.
    pub async fn deliver(&self, chat_id: ChatId, text: &str) -> Result<()> {
        let limit = self
            .cfg
            .max_message_length
            .min(self.messenger.capabilities().max_message_len);
        for chunk in split_message(text, limit) {
            self.messenger.send_text(chat_id, &chunk).await?;
        }
        Ok(())
    }

    // ============== Commands ==============

    /// Returns `false` (after notifying the user) if they may not use commands.
    async fn ensure_authorized(&self, chat_id: ChatId, user_id: UserId) -> Result<bool> {
        if self.access.is_authorized(user_id) {
            return Ok(true);
        }
        let notice = if self.cfg.access_passcode.is_some()
            && (self.cfg.allowed_users.is_empty() || self.cfg.allowed_users.contains(&user_id.0))
        {
            "🔒 Please send the access passcode to use this bot."
        } else {
            "Unauthorized. Contact the bot owner for access."
        };
        self.messenger.send_text(chat_id, notice).await?;
        Ok(false)
    }

    pub async fn on_reset(&self, chat_id: ChatId, user_id: UserId, username: &str) -> Result<()> {
        if !self.ensure_authorized(chat_id, user_id).await? {
            return Ok(());
        }
        self.conversations.clear(user_id);
        self.audit.record(AuditEvent::reset(user_id, username));
        tracing::info!(user_id = user_id.0, "conversation cleared");
        self.messenger
            .send_text(chat_id, "🗑️ Conversation history cleared.")
            .await
    }

    /// Switch persona and clear history. Unknown ids get the list of valid ones.
    pub async fn select_persona(
        &self,
        chat_id: ChatId,
        user_id: UserId,
        id: &str,
    ) -> Result<Option<&'static Persona>> {
        if !self.ensure_authorized(chat_id, user_id).await? {
            return Ok(None);
        }

        let Some(persona) = personas::find(id) else {
            let ids = PERSONAS.iter().map(|p| p.id).collect::<Vec<_>>().join(", ");
            let msg = if id.trim().is_empty() {
                format!("Usage: /model <id>\nAvailable: {ids}")
            } else {
                format!("❌ Unknown model '{}'. Available: {ids}", id.trim())
            };
            self.messenger.send_text(chat_id, &msg).await?;
            return Ok(None);
        };

        self.selected.insert(user_id, persona);
        self.conversations.clear(user_id);
        tracing::info!(user_id = user_id.0, persona = persona.id, "persona selected");

        let msg = format!(
            "Switched to {}\n{}\n\nConversation history cleared.",
            persona.label(),
            persona.description
        );
        self.messenger.send_text(chat_id, &msg).await?;
        Ok(Some(persona))
    }

    pub async fn describe_current(&self, chat_id: ChatId, user_id: UserId) -> Result<()> {
        if !self.ensure_authorized(chat_id, user_id).await? {
            return Ok(());
        }
        let persona = self.persona_for(user_id);
        let rate = self.rate_limiter.status(user_id);
        let mut msg = format!(
            "Current model: {}\n{}\n\nHistory: {}/{} messages",
            persona.label(),
            persona.description,
            self.conversations.len(user_id),
            self.conversations.max_history()
        );
        if self.cfg.rate_limit_enabled {
            msg.push_str(&format!(
                "\nRequests: {}/{} per {}s",
                rate.used,
                rate.max,
                rate.window.as_secs()
            ));
        }
        self.messenger.send_text(chat_id, &msg).await
    }

    pub async fn help(&self, chat_id: ChatId, user_id: UserId) -> Result<()> {
        if !self.ensure_authorized(chat_id, user_id).await? {
            return Ok(());
        }
        self.messenger.send_text(chat_id, &help_text()).await
    }

    pub async fn welcome(&self, chat_id: ChatId, user_id: UserId, username: &str) -> Result<()> {
        if !self.ensure_authorized(chat_id, user_id).await? {
            return Ok(());
        }
        let persona = self.persona_for(user_id);
        let msg = format!(
            "👋 Hello {username}!\n\nSend me a message and I'll answer it.\n\
Current model: {}\n\nUse /models to pick a specialist and /help for all commands.",
            persona.label()
        );
        self.messenger.send_text(chat_id, &msg).await
    }

    pub async fn list_personas(&self, chat_id: ChatId, user_id: UserId) -> Result<()> {
        if !self.ensure_authorized(chat_id, user_id).await? {
            return Ok(());
        }
        let current = self.persona_for(user_id);
        if self.messenger.capabilities().supports_inline_keyboards {
            return self
                .messenger
                .send_inline_keyboard(chat_id, "Choose a model:", persona_keyboard(current))
                .await;
        }

        let mut msg = String::from("Available models:");
        for p in PERSONAS {
            let marker = if p.id == current.id { " ✓" } else { "" };
            msg.push_str(&format!("\n{} ({}){marker}", p.label(), p.id));
        }
        msg.push_str("\n\nSwitch with /model <id>.");
        self.messenger.send_text(chat_id, &msg).await
    }
}

fn wait_seconds(wait: Duration) -> u64 {
    wait.as_secs_f64().ceil().max(1.0) as u64
}

/// User-facing text for a completion that never succeeded.
pub fn failure_message(err: &CompletionError) -> &'static str {
    match err {
        CompletionError::AuthError(_) => {
            "⚠️ The AI service rejected the bot's credentials. Please contact the bot owner."
        }
        CompletionError::Rejected { status: 402, .. } => {
            "⚠️ The AI service account has insufficient balance. Please contact the bot owner."
        }
        CompletionError::Rejected { .. } => {
            "⚠️ The AI service could not process this request. Try rephrasing or /clear the conversation."
        }
        _ => "⚠️ The AI service is temporarily unavailable. Please try again in a moment.",
    }
}

pub fn persona_keyboard(current: &Persona) -> InlineKeyboard {
    let mut buttons: Vec<InlineButton> = PERSONAS
        .iter()
        .map(|p| {
            let mut label = p.label();
            if p.id == current.id {
                label.push_str(" ✓");
            }
            InlineButton::new(label, format!("{CALLBACK_PERSONA_PREFIX}{}", p.id))
        })
        .collect();
    buttons.push(InlineButton::new("📋 Current model", CALLBACK_CURRENT));
    buttons.push(InlineButton::new("❓ Help", CALLBACK_HELP));
    buttons.push(InlineButton::new("🗑️ Clear conversation", CALLBACK_CLEAR));
    InlineKeyboard::new(buttons)
}

fn help_text() -> String {
    let mut out = String::from(
        "Commands:\n\
/start - welcome message\n\
/help - this help\n\
/models - choose a specialist model\n\
/model <id> - switch model by id\n\
/current - show current model and usage\n\
/clear - clear conversation history\n\nModels:",
    );
    for p in PERSONAS {
        out.push_str(&format!("\n{} {} ({})", p.emoji, p.name, p.id));
    }
    out
}

/// Repeats the typing action until stopped.
struct TypingIndicator {
    stop_tx: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl TypingIndicator {
    fn start(messenger: Arc<dyn MessagingPort>, chat_id: ChatId) -> Self {
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            if !messenger.capabilities().supports_chat_actions {
                return;
            }
            let mut tick = tokio::time::interval(TYPING_INTERVAL);
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = tick.tick() => {
                        if let Err(e) = messenger.send_chat_action(chat_id, ChatAction::Typing).await {
                            tracing::debug!(error = %e, "typing indicator failed");
                        }
                    }
                }
            }
        });
        Self { stop_tx, task }
    }

    /// Never waits on an in-flight chat action (it may be sleeping out flood control).
    async fn stop(self) {
        let _ = self.stop_tx.send(());
        self.task.abort();
        let _ = self.task.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::test_config;
    use crate::domain::Role;
    use crate::messaging::types::MessagingCapabilities;
    use crate::model::adapter::tests::{policy, settings, RecordingSleeper, ScriptedClient};
    use crate::model::types::CompletionRequest;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    #[derive(Clone, Debug, PartialEq)]
    enum Sent {
        Text(String),
        Keyboard(String, InlineKeyboard),
    }

    #[derive(Default)]
    struct FakeMessenger {
        sent: StdMutex<Vec<Sent>>,
        text_only: bool,
        stall_chat_actions: bool,
    }

    impl FakeMessenger {
        fn texts(&self) -> Vec<String> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .filter_map(|s| match s {
                    Sent::Text(t) => Some(t.clone()),
                    Sent::Keyboard(..) => None,
                })
                .collect()
        }
    }

    #[async_trait]
    impl MessagingPort for FakeMessenger {
        fn capabilities(&self) -> MessagingCapabilities {
            MessagingCapabilities {
                supports_chat_actions: true,
                supports_inline_keyboards: !self.text_only,
                max_message_len: 4096,
            }
        }

        async fn send_text(&self, _chat_id: ChatId, text: &str) -> Result<()> {
            self.sent.lock().unwrap().push(Sent::Text(text.to_string()));
            Ok(())
        }

        async fn send_chat_action(&self, _chat_id: ChatId, _action: ChatAction) -> Result<()> {
            if self.stall_chat_actions {
                // Like a request stuck behind Telegram flood control.
                std::future::pending::<()>().await;
            }
            Ok(())
        }

        async fn send_inline_keyboard(
            &self,
            _chat_id: ChatId,
            text: &str,
            keyboard: InlineKeyboard,
        ) -> Result<()> {
            self.sent
                .lock()
                .unwrap()
                .push(Sent::Keyboard(text.to_string(), keyboard));
            Ok(())
        }

        async fn answer_callback_query(&self, _id: &str, _text: Option<&str>) -> Result<()> {
            Ok(())
        }
    }

    const CHAT: ChatId = ChatId(100);
    const USER: UserId = UserId(7);

    fn msg(text: &str) -> TextMessage {
        TextMessage {
            chat_id: CHAT,
            user_id: USER,
            username: Some("alice".to_string()),
            text: text.to_string(),
        }
    }

    fn dispatcher_with(
        cfg: Config,
        client: Arc<dyn CompletionClient>,
    ) -> (Dispatcher, Arc<FakeMessenger>) {
        dispatcher_on(cfg, client, FakeMessenger::default())
    }

    fn dispatcher_on(
        cfg: Config,
        client: Arc<dyn CompletionClient>,
        messenger: FakeMessenger,
    ) -> (Dispatcher, Arc<FakeMessenger>) {
        let messenger = Arc::new(messenger);
        let completion = CompletionAdapter::with_sleeper(
            client,
            settings(),
            policy(),
            Arc::new(RecordingSleeper::default()),
        );
        let d = Dispatcher::new(
            Arc::new(cfg),
            completion,
            messenger.clone(),
            AuditLogger::disabled(),
        );
        (d, messenger)
    }

    fn roles(d: &Dispatcher) -> Vec<Role> {
        d.conversations()
            .get_context(USER)
            .iter()
            .map(|t| t.role())
            .collect()
    }

    #[tokio::test]
    async fn successful_exchange_is_stored_and_delivered() {
        let client = Arc::new(ScriptedClient::new(vec![Ok("hi there".to_string())]));
        let (d, messenger) = dispatcher_with(test_config(), client.clone());

        d.on_message(msg("  hello  ")).await.unwrap();

        assert_eq!(messenger.texts(), vec!["hi there".to_string()]);
        assert_eq!(
            d.conversations().get_context(USER),
            vec![Turn::user("hello"), Turn::assistant("hi there")]
        );
        let req = client.requests.lock().unwrap()[0].clone();
        assert_eq!(
            req.system_prompt.as_deref(),
            Some(personas::default_persona().system_prompt)
        );
    }

    #[tokio::test]
    async fn persistent_server_error_sends_one_failure_and_keeps_user_turn() {
        let client = Arc::new(ScriptedClient::new(vec![Err(CompletionError::ServerError {
            status: Some(500),
            message: "boom".into(),
        })]));
        let (d, messenger) = dispatcher_with(test_config(), client.clone());

        d.on_message(msg("hello")).await.unwrap();

        assert_eq!(client.calls(), 4);
        assert_eq!(
            messenger.texts(),
            vec![failure_message(&CompletionError::Timeout).to_string()]
        );
        assert_eq!(roles(&d), vec![Role::User]);
    }

    #[tokio::test]
    async fn auth_error_is_not_retried() {
        let client = Arc::new(ScriptedClient::new(vec![Err(CompletionError::AuthError(
            "bad key".into(),
        ))]));
        let (d, messenger) = dispatcher_with(test_config(), client.clone());

        d.on_message(msg("hello")).await.unwrap();

        assert_eq!(client.calls(), 1);
        assert!(messenger.texts()[0].contains("credentials"));
    }

    #[tokio::test]
    async fn rate_limited_message_never_reaches_backend_or_history() {
        let mut cfg = test_config();
        cfg.rate_limit_requests = 1;
        let client = Arc::new(ScriptedClient::new(vec![Ok("ok".to_string())]));
        let (d, messenger) = dispatcher_with(cfg, client.clone());

        d.on_message(msg("one")).await.unwrap();
        d.on_message(msg("two")).await.unwrap();

        assert_eq!(client.calls(), 1);
        assert_eq!(d.conversations().len(USER), 2);
        let texts = messenger.texts();
        assert_eq!(texts.len(), 2);
        assert!(texts[1].starts_with("⏳ Rate limited"));
    }

    #[tokio::test]
    async fn over_long_input_counts_against_limit_but_is_not_stored() {
        let mut cfg = test_config();
        cfg.max_input_length = 5;
        let client = Arc::new(ScriptedClient::new(vec![Ok("ok".to_string())]));
        let (d, messenger) = dispatcher_with(cfg, client.clone());

        d.on_message(msg("far too long")).await.unwrap();

        assert_eq!(client.calls(), 0);
        assert!(d.conversations().is_empty(USER));
        assert_eq!(d.rate_limiter().status(USER).used, 1);
        assert!(messenger.texts()[0].contains("too long"));
    }

    #[tokio::test]
    async fn long_reply_is_chunked_in_order() {
        let mut cfg = test_config();
        cfg.max_message_length = 10;
        let reply = "aaaa bbbb cccc dddd";
        let client = Arc::new(ScriptedClient::new(vec![Ok(reply.to_string())]));
        let (d, messenger) = dispatcher_with(cfg, client);

        d.on_message(msg("hello")).await.unwrap();

        let texts = messenger.texts();
        assert!(texts.len() > 1);
        assert_eq!(texts.concat(), reply);
        assert!(texts.iter().all(|t| t.chars().count() <= 10));
    }

    #[tokio::test]
    async fn persona_switch_clears_history_and_changes_prompt() {
        let client = Arc::new(ScriptedClient::new(vec![Ok("ok".to_string())]));
        let (d, messenger) = dispatcher_with(test_config(), client.clone());

        d.on_message(msg("hello")).await.unwrap();
        assert_eq!(d.conversations().len(USER), 2);

        let chosen = d.select_persona(CHAT, USER, "Property").await.unwrap();
        assert_eq!(chosen.map(|p| p.id), Some("property"));
        assert!(d.conversations().is_empty(USER));

        d.on_message(msg("again")).await.unwrap();
        let req = client.requests.lock().unwrap()[1].clone();
        assert_eq!(
            req.system_prompt.as_deref(),
            personas::find("property").map(|p| p.system_prompt)
        );
        assert_eq!(req.messages, vec![Turn::user("again")]);

        assert!(d.select_persona(CHAT, USER, "nope").await.unwrap().is_none());
        assert!(messenger.texts().last().unwrap().contains("scam_search"));
        assert_eq!(d.persona_for(USER).id, "property");
    }

    #[tokio::test]
    async fn reset_clears_history() {
        let client = Arc::new(ScriptedClient::new(vec![Ok("ok".to_string())]));
        let (d, _messenger) = dispatcher_with(test_config(), client);

        d.on_message(msg("hello")).await.unwrap();
        d.on_reset(CHAT, USER, "alice").await.unwrap();

        assert!(d.conversations().get_context(USER).is_empty());
    }

    #[tokio::test]
    async fn passcode_gate_then_normal_flow() {
        let mut cfg = test_config();
        cfg.access_passcode = Some("s3cret".to_string());
        let client = Arc::new(ScriptedClient::new(vec![Ok("ok".to_string())]));
        let (d, messenger) = dispatcher_with(cfg, client.clone());

        d.on_message(msg("hello")).await.unwrap();
        d.help(CHAT, USER).await.unwrap();
        d.on_message(msg("s3cret")).await.unwrap();
        d.on_message(msg("hello")).await.unwrap();

        let texts = messenger.texts();
        assert!(texts[0].contains("passcode"));
        assert!(texts[1].contains("passcode"));
        assert!(texts[2].contains("Access granted"));
        assert_eq!(texts[3], "ok");
        assert_eq!(client.calls(), 1);
        // The passcode itself is never stored as conversation.
        assert_eq!(
            d.conversations().get_context(USER),
            vec![Turn::user("hello"), Turn::assistant("ok")]
        );
    }

    #[tokio::test]
    async fn allow_list_denies_strangers() {
        let mut cfg = test_config();
        cfg.allowed_users = vec![1];
        let client = Arc::new(ScriptedClient::new(vec![Ok("ok".to_string())]));
        let (d, messenger) = dispatcher_with(cfg, client.clone());

        d.on_message(msg("hello")).await.unwrap();

        assert_eq!(client.calls(), 0);
        assert!(messenger.texts()[0].starts_with("Unauthorized"));
    }

    #[tokio::test]
    async fn models_keyboard_marks_current_persona() {
        let client = Arc::new(ScriptedClient::new(vec![]));
        let (d, messenger) = dispatcher_with(test_config(), client);

        d.list_personas(CHAT, USER).await.unwrap();

        let sent = messenger.sent.lock().unwrap().clone();
        let Sent::Keyboard(_, kb) = &sent[0] else {
            panic!("expected keyboard, got {sent:?}");
        };
        let data: Vec<_> = kb.buttons.iter().map(|b| b.callback_data.as_str()).collect();
        assert_eq!(kb.buttons.len(), PERSONAS.len() + 3);
        assert_eq!(data[0], "persona:financial");
        assert!(kb.buttons[0].label.ends_with('✓'));
        assert!(!kb.buttons[1].label.ends_with('✓'));
        assert_eq!(
            data[PERSONAS.len()..],
            [CALLBACK_CURRENT, CALLBACK_HELP, CALLBACK_CLEAR]
        );
    }

    #[tokio::test]
    async fn models_fall_back_to_text_without_inline_keyboards() {
        let client = Arc::new(ScriptedClient::new(vec![]));
        let messenger = FakeMessenger {
            text_only: true,
            ..FakeMessenger::default()
        };
        let (d, messenger) = dispatcher_on(test_config(), client, messenger);

        d.list_personas(CHAT, USER).await.unwrap();

        let sent = messenger.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 1);
        let Sent::Text(text) = &sent[0] else {
            panic!("expected plain text, got {sent:?}");
        };
        for p in PERSONAS {
            assert!(text.contains(p.id), "missing {}", p.id);
        }
        assert!(text.contains("(financial) ✓"));
        assert!(text.contains("/model"));
    }

    #[tokio::test]
    async fn stalled_typing_action_does_not_hold_up_the_reply() {
        let client = Arc::new(ScriptedClient::new(vec![Ok("ok".to_string())]));
        let messenger = FakeMessenger {
            stall_chat_actions: true,
            ..FakeMessenger::default()
        };
        let (d, messenger) = dispatcher_on(test_config(), client, messenger);

        tokio::time::timeout(Duration::from_secs(5), d.on_message(msg("hello")))
            .await
            .expect("exchange blocked on the typing indicator")
            .unwrap();

        assert_eq!(messenger.texts(), vec!["ok".to_string()]);
    }

    /// Echoes the newest user text after yielding, so concurrent callers interleave.
    struct YieldingEcho {
        requests: StdMutex<Vec<CompletionRequest>>,
    }

    #[async_trait]
    impl CompletionClient for YieldingEcho {
        fn name(&self) -> &'static str {
            "echo"
        }

        async fn complete(
            &self,
            req: &CompletionRequest,
        ) -> std::result::Result<String, CompletionError> {
            self.requests.lock().unwrap().push(req.clone());
            for _ in 0..5 {
                tokio::task::yield_now().await;
            }
            let last = req.messages.last().map(|t| t.text()).unwrap_or_default();
            Ok(format!("echo {last}"))
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn queued_messages_run_in_arrival_order_per_user() {
        const N: usize = 40;
        let mut cfg = test_config();
        cfg.rate_limit_enabled = false;
        let client = Arc::new(YieldingEcho {
            requests: StdMutex::new(Vec::new()),
        });
        let (d, _messenger) = dispatcher_with(cfg, client.clone());
        let d = Arc::new(d);

        let other = UserId(8);
        for i in 0..N {
            d.enqueue(msg(&format!("m{i}")));
            d.enqueue(TextMessage {
                user_id: other,
                ..msg(&format!("o{i}"))
            });
        }

        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while client.requests.lock().unwrap().len() < 2 * N {
            assert!(tokio::time::Instant::now() < deadline, "queues did not drain");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let requests = client.requests.lock().unwrap().clone();
        for prefix in ["m", "o"] {
            let ours: Vec<_> = requests
                .iter()
                .filter(|r| match r.messages.last() {
                    Some(t) => t.text().starts_with(prefix),
                    None => false,
                })
                .collect();
            assert_eq!(ours.len(), N);
            for (i, req) in ours.iter().enumerate() {
                let turns = &req.messages;
                assert_eq!(turns[turns.len() - 1], Turn::user(format!("{prefix}{i}")));
                if i > 0 {
                    assert_eq!(
                        turns[turns.len() - 2],
                        Turn::assistant(format!("echo {prefix}{}", i - 1))
                    );
                }
            }
        }
    }

    #[test]
    fn wait_is_rounded_up_to_whole_seconds() {
        assert_eq!(wait_seconds(Duration::from_millis(200)), 1);
        assert_eq!(wait_seconds(Duration::from_millis(58_100)), 59);
        assert_eq!(wait_seconds(Duration::ZERO), 1);
    }
}

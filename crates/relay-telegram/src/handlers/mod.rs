//! Telegram update handlers.
//!
//! Each handler turns a teloxide update into a call on the core dispatcher.
//! Dispatcher errors are logged here; nothing is propagated to teloxide.

use std::sync::Arc;

use teloxide::{
    prelude::*,
    types::{CallbackQuery, Message},
};

use relay_core::domain::{ChatId, UserId};

use crate::router::AppState;

mod callback;
mod commands;
mod text;

pub async fn handle_callback(q: CallbackQuery, state: Arc<AppState>) -> ResponseResult<()> {
    callback::handle_callback(q, state).await
}

pub async fn handle_message(msg: Message, state: Arc<AppState>) -> ResponseResult<()> {
    let Some(user) = msg.from() else {
        return Ok(());
    };
    let chat_id = ChatId(msg.chat.id.0);
    let user_id = UserId(user.id.0 as i64);

    if let Some(text) = msg.text() {
        if text.starts_with('/') {
            return commands::handle_command(&msg, text, state).await;
        }
        return text::handle_text(&msg, text, state).await;
    }

    // Photos, voice, stickers...: text only.
    if state.dispatcher.is_authorized(user_id) {
        let res = state
            .dispatcher
            .messenger()
            .send_text(chat_id, "I can only handle text messages.")
            .await;
        log_failure("unsupported", res);
    }
    Ok(())
}

fn username_of(user: &teloxide::types::User) -> Option<String> {
    user.username.clone()
}

fn log_failure(what: &str, res: relay_core::Result<()>) {
    if let Err(e) = res {
        tracing::warn!(handler = what, error = %e, "telegram handler failed");
    }
}

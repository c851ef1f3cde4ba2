use std::sync::Arc;

use teloxide::prelude::*;

use relay_core::{
    domain::{ChatId, UserId},
    messaging::types::TextMessage,
};

use super::username_of;
use crate::router::AppState;

/// Hand the message to the sender's queue and return at once, so commands from
/// the same chat are not held behind a completion. Queueing happens before
/// this returns, which keeps a user's messages in the order Telegram sent them.
pub async fn handle_text(msg: &Message, text: &str, state: Arc<AppState>) -> ResponseResult<()> {
    let Some(user) = msg.from() else {
        return Ok(());
    };
    if text.trim().is_empty() {
        return Ok(());
    }

    let inbound = TextMessage {
        chat_id: ChatId(msg.chat.id.0),
        user_id: UserId(user.id.0 as i64),
        username: username_of(user),
        text: text.to_string(),
    };

    state.dispatcher.enqueue(inbound);
    Ok(())
}

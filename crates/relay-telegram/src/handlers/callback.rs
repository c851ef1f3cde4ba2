use std::sync::Arc;

use teloxide::prelude::*;

use relay_core::{
    dispatcher::{CALLBACK_CLEAR, CALLBACK_CURRENT, CALLBACK_HELP, CALLBACK_PERSONA_PREFIX},
    domain::{ChatId, UserId},
};

use super::{log_failure, username_of};
use crate::router::AppState;

#[derive(Debug, PartialEq, Eq)]
enum CallbackAction<'a> {
    Persona(&'a str),
    Current,
    Help,
    Clear,
}

fn parse_callback(data: &str) -> Option<CallbackAction<'_>> {
    match data {
        CALLBACK_CLEAR => return Some(CallbackAction::Clear),
        CALLBACK_CURRENT => return Some(CallbackAction::Current),
        CALLBACK_HELP => return Some(CallbackAction::Help),
        _ => {}
    }
    data.strip_prefix(CALLBACK_PERSONA_PREFIX)
        .filter(|id| !id.is_empty())
        .map(CallbackAction::Persona)
}

pub async fn handle_callback(q: CallbackQuery, state: Arc<AppState>) -> ResponseResult<()> {
    let messenger = state.dispatcher.messenger();
    let cb_id = q.id.clone();
    let data = q.data.clone().unwrap_or_default();

    // Always answer the callback so the client stops its spinner.
    let (Some(chat), Some(action)) = (q.message.as_ref().map(|m| m.chat.id), parse_callback(&data))
    else {
        log_failure("callback", messenger.answer_callback_query(&cb_id, None).await);
        return Ok(());
    };

    let chat_id = ChatId(chat.0);
    let user_id = UserId(q.from.id.0 as i64);
    let username = username_of(&q.from).unwrap_or_else(|| "unknown".to_string());
    let d = &state.dispatcher;

    let answer = match action {
        CallbackAction::Persona(id) => match d.select_persona(chat_id, user_id, id).await {
            Ok(Some(p)) => Some(format!("Switched to {}", p.name)),
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(error = %e, "persona switch failed");
                None
            }
        },
        CallbackAction::Current => {
            log_failure("callback", d.describe_current(chat_id, user_id).await);
            None
        }
        CallbackAction::Help => {
            log_failure("callback", d.help(chat_id, user_id).await);
            None
        }
        CallbackAction::Clear => {
            log_failure("callback", d.on_reset(chat_id, user_id, &username).await);
            Some("Cleared".to_string())
        }
    };

    log_failure(
        "callback",
        messenger
            .answer_callback_query(&cb_id, answer.as_deref())
            .await,
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_callback_data() {
        assert_eq!(parse_callback("clear"), Some(CallbackAction::Clear));
        assert_eq!(parse_callback("current"), Some(CallbackAction::Current));
        assert_eq!(parse_callback("help"), Some(CallbackAction::Help));
        assert_eq!(
            parse_callback("persona:scam_search"),
            Some(CallbackAction::Persona("scam_search"))
        );
        assert_eq!(parse_callback("persona:"), None);
        assert_eq!(parse_callback("askuser:1:2"), None);
    }
}

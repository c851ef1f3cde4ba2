use std::sync::Arc;

use teloxide::prelude::*;

use relay_core::domain::{ChatId, UserId};

use super::{log_failure, username_of};
use crate::router::AppState;

#[derive(Clone, Debug, PartialEq, Eq)]
enum BotCommand {
    Start,
    Help,
    Clear,
    Models,
    Model(String),
    Current,
    Unknown(String),
}

fn parse_command(text: &str) -> (String, String) {
    // Telegram may send `/cmd@botname arg1 ...`
    let mut parts = text.trim().splitn(2, char::is_whitespace);
    let first = parts.next().unwrap_or("").trim();
    let rest = parts.next().unwrap_or("").trim().to_string();

    let cmd = first
        .trim_start_matches('/')
        .split('@')
        .next()
        .unwrap_or("")
        .to_lowercase();

    (cmd, rest)
}

fn parse_bot_command(text: &str) -> BotCommand {
    let (cmd, arg) = parse_command(text);
    match cmd.as_str() {
        "start" => BotCommand::Start,
        "help" => BotCommand::Help,
        "clear" | "reset" => BotCommand::Clear,
        "models" => BotCommand::Models,
        // `/model` with no id shows the picker.
        "model" if arg.is_empty() => BotCommand::Models,
        "model" => BotCommand::Model(arg),
        "current" => BotCommand::Current,
        _ => BotCommand::Unknown(cmd),
    }
}

pub async fn handle_command(
    msg: &Message,
    text: &str,
    state: Arc<AppState>,
) -> ResponseResult<()> {
    let Some(user) = msg.from() else {
        return Ok(());
    };
    let chat_id = ChatId(msg.chat.id.0);
    let user_id = UserId(user.id.0 as i64);
    let username = username_of(user).unwrap_or_else(|| "unknown".to_string());
    let d = &state.dispatcher;

    let command = parse_bot_command(text);
    tracing::debug!(user_id = user_id.0, ?command, "command");

    let res = match command {
        BotCommand::Start => d.welcome(chat_id, user_id, &username).await,
        BotCommand::Help => d.help(chat_id, user_id).await,
        BotCommand::Clear => d.on_reset(chat_id, user_id, &username).await,
        BotCommand::Models => d.list_personas(chat_id, user_id).await,
        BotCommand::Model(id) => d.select_persona(chat_id, user_id, &id).await.map(|_| ()),
        BotCommand::Current => d.describe_current(chat_id, user_id).await,
        BotCommand::Unknown(name) => {
            d.messenger()
                .send_text(chat_id, &format!("Unknown command /{name}. Use /help."))
                .await
        }
    };
    log_failure("command", res);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bot_suffix_and_args() {
        assert_eq!(
            parse_command("/Model@relay_bot  financial "),
            ("model".to_string(), "financial".to_string())
        );
        assert_eq!(parse_command("/start"), ("start".to_string(), String::new()));
    }

    #[test]
    fn maps_commands_and_aliases() {
        assert_eq!(parse_bot_command("/reset"), BotCommand::Clear);
        assert_eq!(parse_bot_command("/clear@bot"), BotCommand::Clear);
        assert_eq!(parse_bot_command("/model"), BotCommand::Models);
        assert_eq!(
            parse_bot_command("/model property"),
            BotCommand::Model("property".to_string())
        );
        assert_eq!(
            parse_bot_command("/weather"),
            BotCommand::Unknown("weather".to_string())
        );
    }
}

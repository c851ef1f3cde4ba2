use std::sync::Arc;

use teloxide::{dispatching::Dispatcher, dptree, prelude::*, types::BotCommand};

use relay_core::{
    config::Config, dispatcher::Dispatcher as RelayDispatcher, messaging::port::MessagingPort,
    model::client::CompletionClient,
};

use crate::handlers;
use crate::TelegramMessenger;

#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<RelayDispatcher>,
}

fn command_menu() -> Vec<BotCommand> {
    vec![
        BotCommand::new("start", "Welcome message"),
        BotCommand::new("help", "List commands"),
        BotCommand::new("models", "Choose a specialist model"),
        BotCommand::new("current", "Show current model and usage"),
        BotCommand::new("clear", "Clear conversation history"),
    ]
}

pub async fn run_polling(cfg: Arc<Config>, client: Arc<dyn CompletionClient>) -> anyhow::Result<()> {
    let bot = Bot::new(cfg.telegram_bot_token.clone());

    // Fails fast on a bad token.
    let me = bot.get_me().await?;
    tracing::info!(
        bot = %me.username(),
        backend = client.name(),
        model = %cfg.model,
        rate_limit = cfg.rate_limit_enabled,
        max_requests = cfg.rate_limit_requests,
        window_secs = cfg.rate_limit_window.as_secs(),
        max_history = cfg.max_history,
        allowed_users = cfg.allowed_users.len(),
        passcode = cfg.access_passcode.is_some(),
        "relay started"
    );

    if let Err(e) = bot.set_my_commands(command_menu()).await {
        tracing::warn!(error = %e, "failed to register command menu");
    }

    let messenger: Arc<dyn MessagingPort> = Arc::new(TelegramMessenger::new(bot.clone()));
    let dispatcher = Arc::new(RelayDispatcher::from_config(cfg.clone(), client, messenger));
    let state = Arc::new(AppState { dispatcher });

    let handler = dptree::entry()
        .branch(Update::filter_callback_query().endpoint(handlers::handle_callback))
        .branch(Update::filter_message().endpoint(handlers::handle_message));

    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![state])
        .build()
        .dispatch()
        .await;

    tracing::info!("relay stopped");
    Ok(())
}

use std::sync::Arc;

use relay_core::config::Config;
use relay_deepseek::DeepSeekClient;

#[tokio::main]
async fn main() -> Result<(), relay_core::Error> {
    relay_core::logging::init("relay")?;

    let cfg = match Config::load() {
        Ok(cfg) => Arc::new(cfg),
        Err(e) => {
            tracing::error!(error = %e, "invalid configuration");
            return Err(e);
        }
    };

    let client = Arc::new(DeepSeekClient::from_config(&cfg)?);

    relay_telegram::router::run_polling(cfg, client)
        .await
        .map_err(|e| relay_core::Error::External(format!("telegram bot failed: {e}")))?;

    Ok(())
}

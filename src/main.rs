use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

use reverie::config::BotConfig;
use reverie::runtime::BotRuntime;
use reverie::telegram::TelegramBot;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,reverie=debug")),
        )
        .init();

    let config = BotConfig::load();

    let token = config
        .telegram_bot_token
        .clone()
        .context("TELEGRAM_BOT_TOKEN is not set (env var or reverie_config.toml)")?;

    let runtime = BotRuntime::bootstrap(config).context("failed to bootstrap bot runtime")?;

    let bot = TelegramBot::new(
        &token,
        runtime.controller.clone(),
        runtime.config.telegram_allowed_chat_id,
        runtime.config.telegram_poll_timeout_secs,
    );
    let relay = bot.spawn_notice_relay(runtime.notices.clone());

    tracing::info!("Reverie starting...");

    let transport = tokio::spawn(bot.run());

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("Shutdown signal received, stopping...");

    // The transport and relay both pin the controller (and with it the
    // queue's submit side); they must stop before the worker can drain.
    transport.abort();
    relay.abort();
    runtime.shutdown().await;

    Ok(())
}

//! Dispel backend agent

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use dispel_backend::{Args, BackendConfig, SessionManager, console::GrpcConsole};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = BackendConfig::try_from(Args::parse())?;
    let console = GrpcConsole::connect_lazy(&config.console_url, config.console_timeout)
        .with_context(|| format!("console endpoint {}", config.console_url))?;
    tracing::info!(console = %config.console_url, lobby = %config.lobby_url, "Starting backend");

    let manager = SessionManager::new(Arc::new(console), config);
    let listener = manager.start().await.context("binding game socket")?;
    let server = tokio::spawn(manager.clone().listen(listener));

    tokio::signal::ctrl_c().await?;
    manager.shutdown().await;
    server.await??;
    Ok(())
}

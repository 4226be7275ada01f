//! Dispel relay server

use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use clap::Parser;
use dispel_relay::RelayServer;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(version, about = "Relay forwarding game traffic between dispel backends")]
struct Args {
    /// Address the relay accepts backend connections on.
    #[arg(long, env = "DISPEL_RELAY_BIND", default_value = "0.0.0.0:9999")]
    bind: SocketAddr,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let listener = TcpListener::bind(args.bind)
        .await
        .with_context(|| format!("binding relay on {}", args.bind))?;

    let cancel = CancellationToken::new();
    let server = tokio::spawn(Arc::new(RelayServer::new()).serve(listener, cancel.clone()));

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down relay");
    cancel.cancel();
    server.await??;
    Ok(())
}

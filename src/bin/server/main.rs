//! chat-relay-server: routes `recipient:message` frames between logged-in
//! users and appends every delivery to a chat log.
//!
//! Ctrl-C stops accepting, drains all sessions and closes the log.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chat_relay::{ChatLog, ChatServer, ServerConfig, ServerContext};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "chat-relay-server", version, about = "Multi-client chat relay")]
struct Args {
    /// TOML config file; defaults are used when it does not exist
    #[arg(long, env = "CHAT_RELAY_CONFIG", default_value = "chat-relay.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("chat_relay=info,chat_relay_server=info")),
        )
        .init();

    let config = ServerConfig::load_or_default(&args.config)
        .with_context(|| format!("Failed to load {}", args.config.display()))?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.port,
        log = %config.log_path.display(),
        "chat-relay server starting"
    );

    let chat_log = ChatLog::open(&config.log_path)
        .await
        .with_context(|| format!("Failed to open chat log {}", config.log_path.display()))?;

    let ctx = Arc::new(ServerContext::new(&config, chat_log));
    let server = ChatServer::bind(&config, Arc::clone(&ctx)).await?;

    tokio::spawn(watch_interrupts(ctx.shutdown_token()));

    server.run().await?;
    Ok(())
}

/// Turns Ctrl-C into a shutdown request. Later interrupts are only logged,
/// so a second Ctrl-C cannot tear resources down twice.
async fn watch_interrupts(shutdown: CancellationToken) {
    loop {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Error waiting for interrupt signal");
            return;
        }

        if shutdown.is_cancelled() {
            warn!("Shutdown already in progress");
        } else {
            info!("Interrupt received");
            shutdown.cancel();
        }
    }
}

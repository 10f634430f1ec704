use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use channelgate_xmpp::{Gateway, GatewayConfig};
use clap::Parser;
use tracing::info;

mod server;
mod telemetry;

/// HTTP gateway to federated XMPP Pub-Sub channels.
#[derive(Debug, Parser)]
#[command(name = "channelgate-server", version, about)]
struct Args {
    /// TOML configuration file, overlaid by CHANNELGATE__* variables
    #[arg(short, long, env = "CHANNELGATE_CONFIG")]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, env = "CHANNELGATE_LOG_JSON")]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    telemetry::init(args.json_logs)
        .map_err(|e| anyhow::anyhow!("Failed to init telemetry: {}", e))?;

    info!("Channelgate starting...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = GatewayConfig::load(args.config.as_deref())
        .context("Failed to load gateway configuration")?;
    config.log_config();

    let listen = config.http.listen.clone();
    let gateway = Arc::new(Gateway::with_default_connector(config));

    server::start(Arc::clone(&gateway), &listen).await?;

    gateway.shutdown().await;
    info!("Shutdown complete");
    Ok(())
}

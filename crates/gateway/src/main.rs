// strand-gateway: standalone entry point.

use anyhow::Context;
use clap::Parser;
use strand_gateway::config::{GatewayArgs, GatewayConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = GatewayConfig::from_args(GatewayArgs::parse());

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(&config.log_filter).unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!(ws_addr = %config.ws_addr, tcp_addr = %config.tcp_addr, "starting strand gateway");
    strand_gateway::runtime::run(config).await.context("gateway terminated unexpectedly")
}

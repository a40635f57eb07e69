//! The standalone Host Gateway server binary: an authenticated HTTP
//! command executor with per-bridge allowlists (§4.2).

use clap::Parser;
use ciana_parrot::gateway::start_server;
use ciana_parrot::AppConfig;

/// CianaParrot host gateway: authenticated subprocess executor.
#[derive(Debug, Parser)]
#[command(name = "ciana-parrot-gateway", version)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "ciana-parrot.toml")]
    config: std::path::PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    ciana_parrot::observability::init_tracing("ciana_parrot=info");

    let cli = Cli::parse();
    let config = AppConfig::load(&cli.config).map_err(|err| {
        tracing::error!(error = %err, "failed to load configuration");
        err
    })?;
    let gateway_config = config.to_gateway_config()?;
    let bind: std::net::SocketAddr = config.gateway.bind.parse()?;

    let bridge_count = gateway_config.bridges.len();
    let (listener, addr, router) = start_server(gateway_config, bind).await?;
    tracing::info!(%addr, bridges = bridge_count, "gateway listening");
    axum::serve(listener, router).await?;
    Ok(())
}

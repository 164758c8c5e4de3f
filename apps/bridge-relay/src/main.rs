use anyhow::Result;
use bridge_relay::{server, Cli, RelayConfig};
use clap::Parser;
use tracing::{info, warn};

mod telemetry;

#[tokio::main]
async fn main() -> Result<()> {
    let telemetry = telemetry::Telemetry::init()?;

    let cli = Cli::parse();
    let config = RelayConfig::try_from(cli)?;
    info!(
        listen_addr = %config.listen_addr,
        queue_depth = config.queue_depth,
        token_enforced = config.access_token.is_some(),
        "starting bridge relay"
    );
    if config.access_token.is_none() {
        warn!("BRIDGE_RELAY_ACCESS_TOKEN not set; connection tokens are accepted without validation");
    }

    server::run(config, Some(telemetry.metrics_handle())).await
}

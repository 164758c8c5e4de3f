use std::{net::SocketAddr, time::Duration};

use clap::Parser;
use thiserror::Error;

use crate::registry::DEFAULT_QUEUE_DEPTH;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub listen_addr: SocketAddr,
    /// When set, connections must present this exact `token`.
    pub access_token: Option<String>,
    pub queue_depth: usize,
    pub shutdown_grace: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 5011)),
            access_token: None,
            queue_depth: DEFAULT_QUEUE_DEPTH,
            shutdown_grace: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Parser)]
#[command(
    name = "bridge-relay",
    author,
    version,
    about = "Signaling relay between native and web peers"
)]
pub struct Cli {
    /// Address to bind the websocket listener to.
    #[arg(long, env = "BRIDGE_RELAY_LISTEN_ADDR", default_value = "0.0.0.0:5011")]
    pub listen_addr: String,

    /// Shared token every connection must present. Unset means tokens are
    /// accepted without validation.
    #[arg(long, env = "BRIDGE_RELAY_ACCESS_TOKEN")]
    pub access_token: Option<String>,

    /// Outbound frames buffered per connection before new frames are dropped.
    #[arg(long, env = "BRIDGE_RELAY_QUEUE_DEPTH", default_value_t = DEFAULT_QUEUE_DEPTH)]
    pub queue_depth: usize,

    /// Grace period applied during shutdown.
    #[arg(long, env = "BRIDGE_RELAY_SHUTDOWN_GRACE_SECS", default_value_t = 2)]
    pub shutdown_grace_secs: u64,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid listen address {value:?}: {source}")]
    ListenAddr {
        value: String,
        source: std::net::AddrParseError,
    },
    #[error("queue depth must be at least 1")]
    QueueDepth,
}

impl TryFrom<Cli> for RelayConfig {
    type Error = ConfigError;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let listen_addr = cli
            .listen_addr
            .parse()
            .map_err(|source| ConfigError::ListenAddr {
                value: cli.listen_addr.clone(),
                source,
            })?;
        if cli.queue_depth == 0 {
            return Err(ConfigError::QueueDepth);
        }
        Ok(RelayConfig {
            listen_addr,
            access_token: cli.access_token.filter(|token| !token.is_empty()),
            queue_depth: cli.queue_depth,
            shutdown_grace: Duration::from_secs(cli.shutdown_grace_secs),
        })
    }
}

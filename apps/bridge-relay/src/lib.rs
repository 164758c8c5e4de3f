//! Signaling relay: classifies websocket connections as native, web or
//! unclassified and forwards every text frame from one side to all
//! connections on the other side, untouched.

pub mod config;
pub mod registry;
pub mod server;

pub use config::{Cli, RelayConfig};
pub use registry::{ConnectionId, DispatchMetrics, RelayRegistry};
pub use server::RelayState;

//! Endpoint side of the bridge: a [`Session`] sequences description and
//! candidate exchange over a signaling [`link`], drives a pluggable
//! [`NegotiationEngine`], and runs the data channel [`keepalive`].

pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod keepalive;
pub mod link;
#[cfg(any(test, feature = "test-support"))]
pub mod mock;
pub mod session;

pub use config::{IceServer, SessionConfig};
pub use engine::{
    Connectivity, DataChannel, EngineEvents, EngineFactory, NegotiationEngine, SdpKind,
    SessionDescription,
};
pub use error::{EngineError, LinkError, SessionError, StateError};
pub use event::{EngineEvent, SessionEvent, SessionUpdate};
pub use keepalive::Keepalive;
pub use link::{Connector, LinkInbound, TransportLink};
pub use session::{Session, SessionState};

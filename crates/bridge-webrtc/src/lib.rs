//! [`NegotiationEngine`](bridge_session::NegotiationEngine) backed by a
//! webrtc-rs peer connection.

mod candidate;
mod config;
mod engine;

pub use candidate::{candidate_from_init, candidate_to_init};
pub use config::RtcConfig;
pub use engine::{WebRtcDataChannel, WebRtcEngineFactory};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum WebRtcError {
    #[error(transparent)]
    Webrtc(#[from] webrtc::Error),
}

//! Shared wire definitions for the bridge relay and its endpoints.
//! Keeping the tilde envelope, the candidate attribute line and the
//! keepalive frames in one crate lets the relay log what it forwards
//! without pulling in the session runtime.

mod candidate;
mod envelope;
mod heartbeat;
mod peer;

pub use candidate::{CandidateKind, IceCandidateAttribute};
pub use envelope::{Envelope, IceCandidate, DELIMITER};
pub use heartbeat::Heartbeat;
pub use peer::PeerClass;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("empty frame")]
    Empty,
    #[error("unknown envelope kind '{0}'")]
    UnknownKind(String),
    #[error("{kind} frame needs at least {expected} fields, got {actual}")]
    MissingFields {
        kind: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("{kind} frame takes {expected} fields, got {actual}")]
    TrailingFields {
        kind: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("candidate line has {0} tokens, need 8")]
    ShortCandidate(usize),
    #[error("invalid {field}: '{value}'")]
    InvalidField { field: &'static str, value: String },
}

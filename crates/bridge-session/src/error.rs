use bridge_proto::ParseError;
use thiserror::Error;

use crate::session::SessionState;

/// Failure of the signaling link itself.
#[derive(Debug, Clone, Error)]
pub enum LinkError {
    #[error("link connect failed: {0}")]
    Connect(String),
    #[error("link closed")]
    Closed,
    #[error("link send failed: {0}")]
    Send(String),
}

/// The negotiation engine (or its data channel) refused an operation.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error("engine setup failed: {0}")]
    Setup(String),
    #[error("engine rejected description: {0}")]
    Description(String),
    #[error("engine rejected candidate: {0}")]
    Candidate(String),
    #[error("data channel error: {0}")]
    Channel(String),
    #[error("engine closed")]
    Closed,
}

/// Operation not valid for the session's current resources or state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateError {
    #[error("negotiation engine already created; hang up before creating another")]
    EngineExists,
    #[error("negotiation engine not created")]
    NoEngine,
    #[error("data channel already created")]
    ChannelExists,
    #[error("data channel not created")]
    NoChannel,
    #[error("signaling link not connected")]
    NotConnected,
    #[error("session failed; hang up before retrying")]
    Failed,
    #[error("cannot {operation} while {state:?}")]
    InvalidState {
        operation: &'static str,
        state: SessionState,
    },
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    State(#[from] StateError),
    #[error("transport error: {0}")]
    Transport(#[from] LinkError),
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),
    #[error("protocol parse error: {0}")]
    Parse(#[from] ParseError),
    #[error("invalid configuration: {0}")]
    Config(String),
}

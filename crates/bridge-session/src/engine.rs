use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bridge_proto::IceCandidate;
use tokio::sync::mpsc;

use crate::error::EngineError;
use crate::event::{EngineEvent, SessionEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpKind {
    Offer,
    Answer,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Peer-to-peer connectivity as reported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl fmt::Display for Connectivity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Connectivity::New => "new",
            Connectivity::Connecting => "connecting",
            Connectivity::Connected => "connected",
            Connectivity::Disconnected => "disconnected",
            Connectivity::Failed => "failed",
            Connectivity::Closed => "closed",
        };
        f.write_str(text)
    }
}

/// Handle an engine uses to report asynchronous events back to its session.
///
/// Every event is tagged with the engine generation so the session can drop
/// reports from an engine it has already torn down.
#[derive(Clone)]
pub struct EngineEvents {
    engine: u64,
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl EngineEvents {
    pub(crate) fn new(engine: u64, tx: mpsc::UnboundedSender<SessionEvent>) -> Self {
        Self { engine, tx }
    }

    /// An event handle that is not attached to any session, for driving an
    /// engine on its own.
    pub fn detached() -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(0, tx), rx)
    }

    pub fn engine_id(&self) -> u64 {
        self.engine
    }

    /// Returns false once the owning session has gone away.
    pub fn emit(&self, event: EngineEvent) -> bool {
        self.tx
            .send(SessionEvent::Engine {
                engine: self.engine,
                event,
            })
            .is_ok()
    }
}

impl fmt::Debug for EngineEvents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineEvents")
            .field("engine", &self.engine)
            .finish()
    }
}

/// Description/candidate negotiation machinery, e.g. a WebRTC peer connection.
#[async_trait]
pub trait NegotiationEngine: Send + Sync {
    /// Creates an offer, installs it as the local description and returns it.
    async fn create_local_offer(&self) -> Result<SessionDescription, EngineError>;

    /// Creates an answer to the applied remote offer, installs it as the local
    /// description and returns it.
    async fn create_local_answer(&self) -> Result<SessionDescription, EngineError>;

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), EngineError>;

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), EngineError>;

    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>, EngineError>;

    async fn close(&self) -> Result<(), EngineError>;
}

#[async_trait]
pub trait EngineFactory: Send + Sync {
    async fn create(&self, events: EngineEvents) -> Result<Box<dyn NegotiationEngine>, EngineError>;
}

/// Bidirectional text channel carried by the peer-to-peer connection.
#[async_trait]
pub trait DataChannel: Send + Sync {
    fn label(&self) -> &str;

    async fn send_text(&self, text: &str) -> Result<(), EngineError>;

    async fn close(&self) -> Result<(), EngineError>;
}

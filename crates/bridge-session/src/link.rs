use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::LinkError;
use crate::event::SessionEvent;

pub mod websocket;

pub use websocket::WebSocketConnector;

/// Opens signaling links. One link per [`Connector::connect`] call.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connects to `uri`. Inbound frames and the eventual close are reported
    /// through `inbound` for as long as the link lives.
    async fn connect(
        &self,
        uri: &str,
        inbound: LinkInbound,
    ) -> Result<Box<dyn TransportLink>, LinkError>;
}

/// Outbound half of a connected signaling link.
#[async_trait]
pub trait TransportLink: Send + Sync {
    async fn send(&self, text: String) -> Result<(), LinkError>;

    /// Closes the link. Calling it again is a no-op.
    async fn close(&self);
}

/// Sink for one link's inbound frames, tagged with the link generation.
#[derive(Clone, Debug)]
pub struct LinkInbound {
    link: u64,
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl LinkInbound {
    pub(crate) fn new(link: u64, tx: mpsc::UnboundedSender<SessionEvent>) -> Self {
        Self { link, tx }
    }

    pub fn detached() -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(0, tx), rx)
    }

    pub fn link_id(&self) -> u64 {
        self.link
    }

    /// Returns false once nobody is listening any more.
    pub fn frame(&self, frame: String) -> bool {
        self.tx
            .send(SessionEvent::Signal {
                link: self.link,
                frame,
            })
            .is_ok()
    }

    pub fn closed(&self, reason: Option<String>) {
        let _ = self.tx.send(SessionEvent::LinkClosed {
            link: self.link,
            reason,
        });
    }
}

use std::sync::Arc;
use std::time::Duration;

use bridge_proto::IceCandidate;

use crate::engine::{Connectivity, DataChannel};

/// Everything the session consumer reacts to, on one queue.
///
/// `link` and `engine` carry the generation of the resource that produced the
/// event; events from a replaced resource are dropped.
pub enum SessionEvent {
    Signal { link: u64, frame: String },
    LinkClosed { link: u64, reason: Option<String> },
    Engine { engine: u64, event: EngineEvent },
    AnswerDeadline { engine: u64 },
}

pub enum EngineEvent {
    Connectivity(Connectivity),
    LocalCandidate(IceCandidate),
    ChannelOpen(Arc<dyn DataChannel>),
    ChannelMessage(String),
    ChannelClosed,
}

impl std::fmt::Debug for EngineEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineEvent::Connectivity(state) => f.debug_tuple("Connectivity").field(state).finish(),
            EngineEvent::LocalCandidate(candidate) => {
                f.debug_tuple("LocalCandidate").field(candidate).finish()
            }
            EngineEvent::ChannelOpen(channel) => {
                f.debug_tuple("ChannelOpen").field(&channel.label()).finish()
            }
            EngineEvent::ChannelMessage(text) => {
                f.debug_tuple("ChannelMessage").field(text).finish()
            }
            EngineEvent::ChannelClosed => f.write_str("ChannelClosed"),
        }
    }
}

/// Observable progress of a session, fanned out to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionUpdate {
    Connectivity(Connectivity),
    ChannelOpen { label: String },
    ChannelClosed,
    Message(String),
    Latency(Duration),
    Failed(String),
    LinkLost(Option<String>),
    /// An inbound frame or event was discarded.
    Dropped(String),
    PeerNull,
}

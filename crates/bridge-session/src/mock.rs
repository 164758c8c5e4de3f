//! In-process stand-ins for the engine and the signaling link.
//!
//! [`MockFabric`] hands out engine factories whose engines can reach each
//! other: once an engine holds both descriptions it reports itself connected
//! and opens its data channels on the engine named in the remote description.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bridge_proto::{CandidateKind, IceCandidate, IceCandidateAttribute};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::engine::{
    Connectivity, DataChannel, EngineEvents, EngineFactory, NegotiationEngine, SdpKind,
    SessionDescription,
};
use crate::error::{EngineError, LinkError};
use crate::event::EngineEvent;
use crate::link::{Connector, LinkInbound, TransportLink};

const ORIGIN_MARKER: &str = "o=mock ";

#[derive(Clone, Default)]
pub struct MockFabric {
    inner: Arc<FabricInner>,
}

#[derive(Default)]
struct FabricInner {
    engines: Mutex<HashMap<u64, Arc<MockEngineState>>>,
    next_id: AtomicU64,
}

impl MockFabric {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn factory(&self) -> MockEngineFactory {
        MockEngineFactory {
            fabric: self.clone(),
            created: Mutex::new(Vec::new()),
            reject_descriptions: Arc::new(AtomicBool::new(false)),
            stall_descriptions: Arc::new(AtomicBool::new(false)),
        }
    }

    fn engine(&self, id: u64) -> Option<Arc<MockEngineState>> {
        self.inner.engines.lock().get(&id).cloned()
    }
}

pub struct MockEngineFactory {
    fabric: MockFabric,
    created: Mutex<Vec<MockEngineHandle>>,
    reject_descriptions: Arc<AtomicBool>,
    stall_descriptions: Arc<AtomicBool>,
}

impl MockEngineFactory {
    /// Engines created from now on (and already created ones) refuse every
    /// remote description.
    pub fn reject_remote_descriptions(&self) {
        self.reject_descriptions.store(true, Ordering::SeqCst);
    }

    /// `set_remote_description` never completes on any engine of this factory.
    pub fn stall_remote_descriptions(&self) {
        self.stall_descriptions.store(true, Ordering::SeqCst);
    }

    pub fn engines(&self) -> Vec<MockEngineHandle> {
        self.created.lock().clone()
    }

    pub fn last(&self) -> Option<MockEngineHandle> {
        self.created.lock().last().cloned()
    }
}

#[async_trait]
impl EngineFactory for MockEngineFactory {
    async fn create(&self, events: EngineEvents) -> Result<Box<dyn NegotiationEngine>, EngineError> {
        let id = self.fabric.inner.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let state = Arc::new(MockEngineState {
            id,
            events,
            fabric: self.fabric.clone(),
            reject_descriptions: self.reject_descriptions.clone(),
            stall_descriptions: self.stall_descriptions.clone(),
            stalled: AtomicBool::new(false),
            inner: Mutex::new(EngineInner::default()),
        });
        self.fabric.inner.engines.lock().insert(id, state.clone());
        self.created.lock().push(MockEngineHandle {
            state: state.clone(),
        });
        Ok(Box::new(MockEngine { state }))
    }
}

#[derive(Default)]
struct EngineInner {
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    peer: Option<u64>,
    candidates: Vec<IceCandidate>,
    channels: Vec<Arc<MockDataChannel>>,
    connected: bool,
    closed: bool,
}

struct MockEngineState {
    id: u64,
    events: EngineEvents,
    fabric: MockFabric,
    reject_descriptions: Arc<AtomicBool>,
    stall_descriptions: Arc<AtomicBool>,
    stalled: AtomicBool,
    inner: Mutex<EngineInner>,
}

impl MockEngineState {
    fn description(&self, kind: SdpKind) -> SessionDescription {
        let sdp = format!("v=0\r\n{ORIGIN_MARKER}{} 0 IN IP4 127.0.0.1\r\ns=-\r\n", self.id);
        SessionDescription { kind, sdp }
    }

    fn host_candidate(&self) -> Option<IceCandidate> {
        let attribute = IceCandidateAttribute::new(
            &self.id.to_string(),
            1,
            "udp",
            2_130_706_431,
            "127.0.0.1",
            50_000u16.wrapping_add(self.id as u16),
            CandidateKind::Host,
        )
        .ok()?;
        Some(IceCandidate {
            attribute,
            sdp_mid: "0".into(),
            sdp_mline_index: 0,
        })
    }

    fn install_local(&self, kind: SdpKind) -> Result<SessionDescription, EngineError> {
        let description = self.description(kind);
        {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Err(EngineError::Closed);
            }
            if kind == SdpKind::Answer
                && inner.remote.as_ref().map(|remote| remote.kind) != Some(SdpKind::Offer)
            {
                return Err(EngineError::Description(
                    "no remote offer to answer".into(),
                ));
            }
            inner.local = Some(description.clone());
        }
        if let Some(candidate) = self.host_candidate() {
            self.events.emit(EngineEvent::LocalCandidate(candidate));
        }
        self.maybe_connect();
        Ok(description)
    }

    fn maybe_connect(&self) {
        let (peer, channels) = {
            let mut inner = self.inner.lock();
            if inner.connected || inner.closed || inner.local.is_none() || inner.remote.is_none()
            {
                return;
            }
            inner.connected = true;
            (inner.peer, inner.channels.clone())
        };
        self.events
            .emit(EngineEvent::Connectivity(Connectivity::Connected));

        let Some(peer) = peer.and_then(|id| self.fabric.engine(id)) else {
            return;
        };
        for local in channels {
            let remote = Arc::new(MockDataChannel::new(&local.label));
            remote.attach(self.events.clone());
            local.attach(peer.events.clone());
            peer.inner.lock().channels.push(remote.clone());
            self.events.emit(EngineEvent::ChannelOpen(local));
            peer.events.emit(EngineEvent::ChannelOpen(remote));
        }
    }
}

fn origin_id(sdp: &str) -> Option<u64> {
    let start = sdp.find(ORIGIN_MARKER)? + ORIGIN_MARKER.len();
    sdp[start..].split_whitespace().next()?.parse().ok()
}

struct MockEngine {
    state: Arc<MockEngineState>,
}

#[async_trait]
impl NegotiationEngine for MockEngine {
    async fn create_local_offer(&self) -> Result<SessionDescription, EngineError> {
        self.state.install_local(SdpKind::Offer)
    }

    async fn create_local_answer(&self) -> Result<SessionDescription, EngineError> {
        self.state.install_local(SdpKind::Answer)
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), EngineError> {
        if self.state.reject_descriptions.load(Ordering::SeqCst) {
            return Err(EngineError::Description("rejected by mock".into()));
        }
        if self.state.stall_descriptions.load(Ordering::SeqCst) {
            self.state.stalled.store(true, Ordering::SeqCst);
            std::future::pending::<()>().await;
        }
        let peer = origin_id(&description.sdp)
            .ok_or_else(|| EngineError::Description("missing mock origin line".into()))?;
        {
            let mut inner = self.state.inner.lock();
            if inner.closed {
                return Err(EngineError::Closed);
            }
            inner.peer = Some(peer);
            inner.remote = Some(description);
        }
        self.state.maybe_connect();
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), EngineError> {
        let mut inner = self.state.inner.lock();
        if inner.remote.is_none() {
            return Err(EngineError::Candidate(
                "candidate before remote description".into(),
            ));
        }
        inner.candidates.push(candidate.clone());
        Ok(())
    }

    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>, EngineError> {
        let channel = Arc::new(MockDataChannel::new(label));
        let mut inner = self.state.inner.lock();
        if inner.closed {
            return Err(EngineError::Closed);
        }
        inner.channels.push(channel.clone());
        Ok(channel as Arc<dyn DataChannel>)
    }

    async fn close(&self) -> Result<(), EngineError> {
        let channels = {
            let mut inner = self.state.inner.lock();
            inner.closed = true;
            std::mem::take(&mut inner.channels)
        };
        for channel in channels {
            channel.closed.store(true, Ordering::SeqCst);
        }
        self.state.fabric.inner.engines.lock().remove(&self.state.id);
        Ok(())
    }
}

/// Test-side view of an engine created by [`MockEngineFactory`].
#[derive(Clone)]
pub struct MockEngineHandle {
    state: Arc<MockEngineState>,
}

impl MockEngineHandle {
    pub fn id(&self) -> u64 {
        self.state.id
    }

    pub fn emit(&self, event: EngineEvent) -> bool {
        self.state.events.emit(event)
    }

    pub fn local_description(&self) -> Option<SessionDescription> {
        self.state.inner.lock().local.clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.state.inner.lock().remote.clone()
    }

    pub fn candidates(&self) -> Vec<IceCandidate> {
        self.state.inner.lock().candidates.clone()
    }

    pub fn channel(&self, label: &str) -> Option<Arc<MockDataChannel>> {
        self.state
            .inner
            .lock()
            .channels
            .iter()
            .find(|channel| channel.label == label)
            .cloned()
    }

    pub fn is_connected(&self) -> bool {
        self.state.inner.lock().connected
    }

    pub fn is_closed(&self) -> bool {
        self.state.inner.lock().closed
    }

    /// A `set_remote_description` call is parked forever.
    pub fn is_stalled(&self) -> bool {
        self.state.stalled.load(Ordering::SeqCst)
    }
}

pub struct MockDataChannel {
    label: String,
    remote: Mutex<Option<EngineEvents>>,
    sent: Mutex<Vec<String>>,
    closed: AtomicBool,
}

impl MockDataChannel {
    pub fn new(label: &str) -> Self {
        Self {
            label: label.to_string(),
            remote: Mutex::new(None),
            sent: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Routes this channel's sends to the engine behind `remote`.
    pub fn attach(&self, remote: EngineEvents) {
        *self.remote.lock() = Some(remote);
    }

    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DataChannel for MockDataChannel {
    fn label(&self) -> &str {
        &self.label
    }

    async fn send_text(&self, text: &str) -> Result<(), EngineError> {
        if self.is_closed() {
            return Err(EngineError::Channel("channel closed".into()));
        }
        self.sent.lock().push(text.to_string());
        if let Some(remote) = self.remote.lock().as_ref() {
            remote.emit(EngineEvent::ChannelMessage(text.to_string()));
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), EngineError> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            if let Some(remote) = self.remote.lock().take() {
                remote.emit(EngineEvent::ChannelClosed);
            }
        }
        Ok(())
    }
}

/// A signaling link that the test drives from the other end through
/// [`MemoryRemote`].
pub fn memory_link() -> (MemoryConnector, MemoryRemote) {
    let (accepts_tx, accepts_rx) = mpsc::unbounded_channel();
    let refuse = Arc::new(AtomicBool::new(false));
    let connects = Arc::new(AtomicUsize::new(0));
    (
        MemoryConnector {
            accepts: accepts_tx,
            refuse: refuse.clone(),
            connects: connects.clone(),
        },
        MemoryRemote {
            accepts: accepts_rx,
            current: None,
            refuse,
            connects,
        },
    )
}

pub struct MemoryConnector {
    accepts: mpsc::UnboundedSender<MemoryAccepted>,
    refuse: Arc<AtomicBool>,
    connects: Arc<AtomicUsize>,
}

struct MemoryAccepted {
    uri: String,
    inbound: LinkInbound,
    outbound: mpsc::UnboundedReceiver<String>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(
        &self,
        uri: &str,
        inbound: LinkInbound,
    ) -> Result<Box<dyn TransportLink>, LinkError> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(LinkError::Connect("connection refused".into()));
        }
        self.connects.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));
        self.accepts
            .send(MemoryAccepted {
                uri: uri.to_string(),
                inbound,
                outbound: rx,
                closed: closed.clone(),
            })
            .map_err(|_| LinkError::Connect("remote end dropped".into()))?;
        Ok(Box::new(MemoryLink {
            tx: Mutex::new(Some(tx)),
            closed,
        }))
    }
}

struct MemoryLink {
    tx: Mutex<Option<mpsc::UnboundedSender<String>>>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl TransportLink for MemoryLink {
    async fn send(&self, text: String) -> Result<(), LinkError> {
        match self.tx.lock().as_ref() {
            Some(tx) => tx.send(text).map_err(|_| LinkError::Closed),
            None => Err(LinkError::Closed),
        }
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.tx.lock().take();
    }
}

pub struct MemoryRemote {
    accepts: mpsc::UnboundedReceiver<MemoryAccepted>,
    current: Option<MemoryAccepted>,
    refuse: Arc<AtomicBool>,
    connects: Arc<AtomicUsize>,
}

impl MemoryRemote {
    /// Waits for the next link and returns the URI it was opened with.
    pub async fn accept(&mut self) -> Option<String> {
        let accepted = self.accepts.recv().await?;
        let uri = accepted.uri.clone();
        self.current = Some(accepted);
        Some(uri)
    }

    /// Next frame the session sent on the current link. `None` once that
    /// link is closed.
    pub async fn recv(&mut self) -> Option<String> {
        if self.current.is_none() {
            self.accept().await?;
        }
        self.current.as_mut()?.outbound.recv().await
    }

    /// Delivers a frame to the session as if the relay forwarded it.
    pub fn send(&self, frame: impl Into<String>) -> bool {
        self.current
            .as_ref()
            .map(|link| link.inbound.frame(frame.into()))
            .unwrap_or(false)
    }

    /// Drops the current link from the remote side.
    pub fn hang_up(&mut self) {
        if let Some(link) = self.current.take() {
            link.inbound.closed(Some("remote hang up".into()));
        }
    }

    pub fn link_closed_locally(&self) -> bool {
        self.current
            .as_ref()
            .map(|link| link.closed.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    pub fn refuse_connections(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

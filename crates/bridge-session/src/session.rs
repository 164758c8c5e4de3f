use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bridge_proto::{Envelope, Heartbeat, IceCandidate};
use parking_lot::Mutex as SyncMutex;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::engine::{
    Connectivity, DataChannel, EngineEvents, EngineFactory, NegotiationEngine, SessionDescription,
};
use crate::error::{EngineError, LinkError, SessionError, StateError};
use crate::event::{EngineEvent, SessionEvent, SessionUpdate};
use crate::keepalive::{self, Keepalive};
use crate::link::{Connector, LinkInbound, TransportLink};

const UPDATE_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Idle,
    Connecting,
    Offering,
    Negotiating,
    Connected,
    Failed,
    Closed,
}

impl SessionState {
    /// Position along the negotiation path. Idle and Closed are only reached
    /// through teardown.
    fn rank(self) -> u8 {
        match self {
            SessionState::Idle | SessionState::Closed => 0,
            SessionState::Connecting => 1,
            SessionState::Offering => 2,
            SessionState::Negotiating => 3,
            SessionState::Connected => 4,
            SessionState::Failed => 5,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            SessionState::Idle => "idle",
            SessionState::Connecting => "connecting",
            SessionState::Offering => "offering",
            SessionState::Negotiating => "negotiating",
            SessionState::Connected => "connected",
            SessionState::Failed => "failed",
            SessionState::Closed => "closed",
        };
        f.write_str(text)
    }
}

struct Attached<T> {
    id: u64,
    value: T,
}

#[derive(Default)]
struct Inner {
    link: Option<Attached<Box<dyn TransportLink>>>,
    engine: Option<Attached<Box<dyn NegotiationEngine>>>,
    channel: Option<Arc<dyn DataChannel>>,
    pinger: Option<JoinHandle<()>>,
    answer_watchdog: Option<JoinHandle<()>>,
    pending_candidates: Vec<IceCandidate>,
    remote_description: bool,
    awaiting_answer: bool,
}

impl Inner {
    fn link_id(&self) -> Option<u64> {
        self.link.as_ref().map(|link| link.id)
    }

    fn engine_id(&self) -> Option<u64> {
        self.engine.as_ref().map(|engine| engine.id)
    }

    fn reset_negotiation(&mut self) {
        self.pending_candidates.clear();
        self.remote_description = false;
        self.awaiting_answer = false;
        if let Some(watchdog) = self.answer_watchdog.take() {
            watchdog.abort();
        }
    }
}

struct Shared {
    config: SessionConfig,
    uri: String,
    connector: Arc<dyn Connector>,
    engines: Arc<dyn EngineFactory>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    events_rx: Mutex<mpsc::UnboundedReceiver<SessionEvent>>,
    inner: Mutex<Inner>,
    /// Kept outside `inner` so hangup can cancel a handler that is parked
    /// inside an engine call while holding `inner`.
    consumer: SyncMutex<Option<JoinHandle<()>>>,
    state: watch::Sender<SessionState>,
    updates: broadcast::Sender<SessionUpdate>,
    keepalive: Arc<Keepalive>,
    generation: AtomicU64,
}

/// One endpoint's negotiation with its remote peer.
///
/// Cloning is cheap; clones drive the same session. Dropping the last clone
/// stops the background consumer.
#[derive(Clone)]
pub struct Session {
    shared: Arc<Shared>,
    _owner: Arc<Owner>,
}

struct Owner {
    shared: Arc<Shared>,
}

impl Drop for Owner {
    fn drop(&mut self) {
        if let Some(consumer) = self.shared.consumer.lock().take() {
            consumer.abort();
        }
        if let Ok(mut inner) = self.shared.inner.try_lock() {
            if let Some(pinger) = inner.pinger.take() {
                pinger.abort();
            }
        }
    }
}

impl Session {
    pub fn new(
        config: SessionConfig,
        connector: Arc<dyn Connector>,
        engines: Arc<dyn EngineFactory>,
    ) -> Result<Self, SessionError> {
        let uri = config.signaling_uri()?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(SessionState::Idle);
        let (updates, _) = broadcast::channel(UPDATE_CAPACITY);
        let shared = Arc::new(Shared {
            config,
            uri,
            connector,
            engines,
            events_tx,
            events_rx: Mutex::new(events_rx),
            inner: Mutex::new(Inner::default()),
            consumer: SyncMutex::new(None),
            state,
            updates,
            keepalive: Arc::new(Keepalive::new(Instant::now())),
            generation: AtomicU64::new(0),
        });
        Ok(Self {
            _owner: Arc::new(Owner {
                shared: shared.clone(),
            }),
            shared,
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.shared.config
    }

    pub fn state(&self) -> SessionState {
        *self.shared.state.borrow()
    }

    pub fn state_watch(&self) -> watch::Receiver<SessionState> {
        self.shared.state.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionUpdate> {
        self.shared.updates.subscribe()
    }

    /// Latest keepalive round trip, if a pong has been seen.
    pub fn latency(&self) -> Option<Duration> {
        self.shared.keepalive.last_rtt()
    }

    /// Opens the signaling link and makes sure the consumer runs. A live
    /// link is closed first; frames still queued from it are discarded.
    pub async fn connect(&self) -> Result<(), SessionError> {
        let shared = &self.shared;
        let mut inner = shared.inner.lock().await;
        if let Some(link) = inner.link.take() {
            info!(link = link.id, "restarting signaling link");
            link.value.close().await;
        }

        let id = shared.next_generation();
        let inbound = LinkInbound::new(id, shared.events_tx.clone());
        let link = shared.connector.connect(&shared.uri, inbound).await?;
        info!(
            link = id,
            class = %shared.config.class,
            uid = %shared.config.uid,
            "signaling link up"
        );
        inner.link = Some(Attached { id, value: link });
        self.ensure_consumer();

        if matches!(
            shared.current_state(),
            SessionState::Idle | SessionState::Closed
        ) {
            shared.set_state(SessionState::Connecting);
        }
        Ok(())
    }

    /// Closes the signaling link only. The engine and data channel stay up
    /// and their events are still handled.
    pub async fn disconnect(&self) {
        let mut inner = self.shared.inner.lock().await;
        if let Some(link) = inner.link.take() {
            link.value.close().await;
            info!(link = link.id, "signaling link closed");
        }
    }

    pub async fn create_engine(&self) -> Result<(), SessionError> {
        let shared = &self.shared;
        let mut inner = shared.inner.lock().await;
        if inner.engine.is_some() {
            return Err(StateError::EngineExists.into());
        }
        let id = shared.next_generation();
        let engine = shared
            .engines
            .create(EngineEvents::new(id, shared.events_tx.clone()))
            .await?;
        inner.engine = Some(Attached { id, value: engine });
        inner.reset_negotiation();
        self.ensure_consumer();
        info!(engine = id, "negotiation engine created");
        Ok(())
    }

    /// Creates the data channel on the engine, labelled from the config.
    pub async fn create_data_channel(&self) -> Result<(), SessionError> {
        let shared = &self.shared;
        let mut inner = shared.inner.lock().await;
        let Some(engine) = inner.engine.as_ref() else {
            return Err(StateError::NoEngine.into());
        };
        if inner.channel.is_some() {
            return Err(StateError::ChannelExists.into());
        }
        let label = shared.config.channel_label.as_str();
        match engine.value.create_data_channel(label).await {
            Ok(channel) => {
                inner.channel = Some(channel);
                info!(label, "data channel created");
                Ok(())
            }
            Err(err) => Err(shared.fail(err).into()),
        }
    }

    /// Creates a local offer and sends it to the remote side.
    pub async fn create_offer(&self) -> Result<(), SessionError> {
        let shared = &self.shared;
        let mut inner = shared.inner.lock().await;
        let Some(engine) = inner.engine.as_ref() else {
            return Err(StateError::NoEngine.into());
        };
        let Some(link) = inner.link.as_ref() else {
            return Err(StateError::NotConnected.into());
        };
        match shared.current_state() {
            SessionState::Connecting | SessionState::Connected => {}
            SessionState::Failed => return Err(StateError::Failed.into()),
            state => {
                return Err(StateError::InvalidState {
                    operation: "create an offer",
                    state,
                }
                .into())
            }
        }

        let engine_id = engine.id;
        let offer = match engine.value.create_local_offer().await {
            Ok(offer) => offer,
            Err(err) => return Err(shared.fail(err).into()),
        };
        link.value
            .send(Envelope::Offer { sdp: offer.sdp }.encode())
            .await?;
        inner.awaiting_answer = true;
        shared.advance(SessionState::Offering);
        info!(engine = engine_id, "offer sent");

        if let Some(timeout) = shared.config.answer_timeout {
            if let Some(previous) = inner.answer_watchdog.take() {
                previous.abort();
            }
            let events = shared.events_tx.clone();
            inner.answer_watchdog = Some(tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                let _ = events.send(SessionEvent::AnswerDeadline { engine: engine_id });
            }));
        }
        Ok(())
    }

    pub async fn send_message(&self, text: &str) -> Result<(), SessionError> {
        let channel = self
            .shared
            .inner
            .lock()
            .await
            .channel
            .clone()
            .ok_or(StateError::NoChannel)?;
        channel.send_text(text).await?;
        info!(">>> {text}");
        Ok(())
    }

    /// Tears everything down and leaves the session `Closed`. Safe to call
    /// repeatedly, on a session that never connected, and while the consumer
    /// is in the middle of a negotiation step.
    pub async fn hangup(&self) {
        let shared = &self.shared;
        self.stop_consumer().await;
        let mut inner = shared.inner.lock().await;
        if inner.engine.is_some() {
            if let Some(link) = inner.link.as_ref() {
                // tell the far side our engine is gone
                let _ = link.value.send(Envelope::PeerNull.encode()).await;
            }
        }
        shared.teardown(&mut inner).await;
        shared.set_state(SessionState::Closed);
    }

    fn ensure_consumer(&self) {
        let mut consumer = self.shared.consumer.lock();
        if consumer.as_ref().map_or(true, |task| task.is_finished()) {
            *consumer = Some(tokio::spawn(consume(self.shared.clone())));
        }
    }

    /// Aborts the consumer and waits for it to let go of `inner`.
    async fn stop_consumer(&self) {
        let consumer = self.shared.consumer.lock().take();
        if let Some(consumer) = consumer {
            consumer.abort();
            let _ = consumer.await;
            debug!("session consumer stopped");
        }
    }
}

/// Applies link frames and engine reports in arrival order until aborted.
async fn consume(shared: Arc<Shared>) {
    let mut events = shared.events_rx.lock().await;
    debug!("session consumer started");
    while let Some(event) = events.recv().await {
        let mut inner = shared.inner.lock().await;
        shared.handle(&mut inner, event).await;
    }
}

impl Shared {
    fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn current_state(&self) -> SessionState {
        *self.state.borrow()
    }

    fn set_state(&self, next: SessionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            info!(from = %previous, to = %next, "session state");
        }
    }

    /// Moves forward along the negotiation path. Lower-ranked targets are
    /// ignored and Failed is sticky.
    fn advance(&self, next: SessionState) {
        let current = self.current_state();
        if current == SessionState::Failed {
            debug!(target_state = %next, "session failed; transition ignored");
            return;
        }
        if next.rank() > current.rank() {
            self.set_state(next);
        }
    }

    fn fail(&self, err: EngineError) -> EngineError {
        warn!(error = %err, "session failed");
        self.set_state(SessionState::Failed);
        self.publish(SessionUpdate::Failed(err.to_string()));
        err
    }

    fn publish(&self, update: SessionUpdate) {
        let _ = self.updates.send(update);
    }

    fn dropped(&self, reason: String) {
        debug!(%reason, "dropped");
        self.publish(SessionUpdate::Dropped(reason));
    }

    async fn teardown(&self, inner: &mut Inner) {
        if let Some(pinger) = inner.pinger.take() {
            pinger.abort();
        }
        inner.reset_negotiation();
        if let Some(channel) = inner.channel.take() {
            if let Err(err) = channel.close().await {
                debug!(error = %err, "data channel close failed");
            }
        }
        if let Some(engine) = inner.engine.take() {
            if let Err(err) = engine.value.close().await {
                debug!(engine = engine.id, error = %err, "engine close failed");
            }
        }
        if let Some(link) = inner.link.take() {
            link.value.close().await;
        }
    }

    async fn handle(&self, inner: &mut Inner, event: SessionEvent) {
        match event {
            SessionEvent::Signal { link, frame } => {
                if Some(link) != inner.link_id() {
                    debug!(link, "frame from a closed link dropped");
                    return;
                }
                match Envelope::decode(&frame) {
                    Ok(envelope) => self.on_envelope(inner, envelope).await,
                    Err(err) => {
                        warn!(error = %err, "undecodable signaling frame");
                        self.dropped(format!("parse: {err}"));
                    }
                }
            }
            SessionEvent::LinkClosed { link, reason } => {
                if Some(link) != inner.link_id() {
                    return;
                }
                // the peer-to-peer side keeps running without signaling
                warn!(link, ?reason, "signaling link lost");
                inner.link.take();
                self.publish(SessionUpdate::LinkLost(reason));
            }
            SessionEvent::Engine { engine, event } => {
                if Some(engine) != inner.engine_id() {
                    debug!(engine, ?event, "event from replaced engine dropped");
                    return;
                }
                self.on_engine_event(inner, event).await;
            }
            SessionEvent::AnswerDeadline { engine } => {
                if Some(engine) == inner.engine_id() && inner.awaiting_answer {
                    inner.awaiting_answer = false;
                    inner.answer_watchdog.take();
                    self.fail(EngineError::Description("no answer before deadline".into()));
                }
            }
        }
    }

    async fn on_envelope(&self, inner: &mut Inner, envelope: Envelope) {
        let kind = envelope.kind();
        if let Envelope::PeerNull = envelope {
            info!(
                pending_candidates = inner.pending_candidates.len(),
                "remote engine gone; tearing down"
            );
            self.publish(SessionUpdate::PeerNull);
            self.teardown(inner).await;
            self.set_state(SessionState::Idle);
            return;
        }
        if inner.engine.is_none() {
            warn!(kind, "{}", StateError::NoEngine);
            self.dropped(format!("{kind}: {}", StateError::NoEngine));
            return;
        }
        if self.current_state() == SessionState::Failed {
            self.dropped(format!("{kind}: {}", StateError::Failed));
            return;
        }

        let outcome = match envelope {
            Envelope::Offer { sdp } => self.on_offer(inner, sdp).await,
            Envelope::Answer { sdp } => self.on_answer(inner, sdp).await,
            Envelope::Candidate(candidate) => self.on_candidate(inner, candidate).await,
            Envelope::PeerNull => Ok(()),
        };
        match outcome {
            Ok(()) => {}
            Err(SessionError::Engine(err)) => {
                self.fail(err);
            }
            Err(err) => {
                warn!(kind, error = %err, "signaling frame not applied");
                self.dropped(format!("{kind}: {err}"));
            }
        }
    }

    async fn on_offer(&self, inner: &mut Inner, sdp: String) -> Result<(), SessionError> {
        let engine = inner.engine.as_ref().ok_or(StateError::NoEngine)?;
        engine
            .value
            .set_remote_description(SessionDescription::offer(sdp))
            .await?;
        inner.remote_description = true;
        inner.awaiting_answer = false;
        self.flush_candidates(inner).await?;

        let engine = inner.engine.as_ref().ok_or(StateError::NoEngine)?;
        let answer = engine.value.create_local_answer().await?;
        let link = inner.link.as_ref().ok_or(LinkError::Closed)?;
        link.value
            .send(Envelope::Answer { sdp: answer.sdp }.encode())
            .await?;
        self.advance(SessionState::Negotiating);
        info!("answer sent");
        Ok(())
    }

    async fn on_answer(&self, inner: &mut Inner, sdp: String) -> Result<(), SessionError> {
        if !inner.awaiting_answer {
            return Err(StateError::InvalidState {
                operation: "apply an answer",
                state: self.current_state(),
            }
            .into());
        }
        let engine = inner.engine.as_ref().ok_or(StateError::NoEngine)?;
        engine
            .value
            .set_remote_description(SessionDescription::answer(sdp))
            .await?;
        inner.remote_description = true;
        inner.awaiting_answer = false;
        if let Some(watchdog) = inner.answer_watchdog.take() {
            watchdog.abort();
        }
        self.flush_candidates(inner).await?;
        self.advance(SessionState::Connected);
        info!("answer applied");
        Ok(())
    }

    async fn on_candidate(
        &self,
        inner: &mut Inner,
        candidate: IceCandidate,
    ) -> Result<(), SessionError> {
        if !inner.remote_description {
            debug!(candidate = %candidate.attribute, "candidate buffered until remote description");
            inner.pending_candidates.push(candidate);
            return Ok(());
        }
        let engine = inner.engine.as_ref().ok_or(StateError::NoEngine)?;
        engine.value.add_ice_candidate(&candidate).await?;
        debug!(candidate = %candidate.attribute, "remote candidate added");
        Ok(())
    }

    async fn flush_candidates(&self, inner: &mut Inner) -> Result<(), SessionError> {
        let pending = std::mem::take(&mut inner.pending_candidates);
        if pending.is_empty() {
            return Ok(());
        }
        let engine = inner.engine.as_ref().ok_or(StateError::NoEngine)?;
        debug!(count = pending.len(), "flushing buffered candidates");
        for candidate in &pending {
            engine.value.add_ice_candidate(candidate).await?;
        }
        Ok(())
    }

    async fn on_engine_event(&self, inner: &mut Inner, event: EngineEvent) {
        match event {
            EngineEvent::Connectivity(connectivity) => {
                info!(%connectivity, "peer connectivity");
                self.publish(SessionUpdate::Connectivity(connectivity));
                match connectivity {
                    Connectivity::Connected => self.advance(SessionState::Connected),
                    Connectivity::Failed => {
                        self.fail(EngineError::Setup("peer connection failed".into()));
                    }
                    _ => {}
                }
            }
            EngineEvent::LocalCandidate(candidate) => {
                let Some(link) = inner.link.as_ref() else {
                    self.dropped("local candidate: no signaling link".into());
                    return;
                };
                let frame = Envelope::Candidate(candidate).encode();
                if let Err(err) = link.value.send(frame).await {
                    warn!(error = %err, "failed to send local candidate");
                }
            }
            EngineEvent::ChannelOpen(channel) => {
                let label = channel.label().to_string();
                info!(%label, "data channel open");
                let channel = match inner.channel.as_ref() {
                    Some(existing) if existing.label() != label => {
                        warn!(%label, "second data channel ignored");
                        return;
                    }
                    _ => {
                        inner.channel = Some(channel.clone());
                        channel
                    }
                };
                if let Some(interval) = self.config.keepalive_interval {
                    if let Some(previous) = inner.pinger.take() {
                        previous.abort();
                    }
                    inner.pinger = Some(keepalive::spawn_pinger(
                        self.keepalive.clone(),
                        channel,
                        interval,
                    ));
                }
                self.publish(SessionUpdate::ChannelOpen { label });
            }
            EngineEvent::ChannelMessage(text) => self.on_channel_message(inner, text).await,
            EngineEvent::ChannelClosed => {
                info!("data channel closed");
                if let Some(pinger) = inner.pinger.take() {
                    pinger.abort();
                }
                inner.channel.take();
                self.publish(SessionUpdate::ChannelClosed);
            }
        }
    }

    async fn on_channel_message(&self, inner: &mut Inner, text: String) {
        match Heartbeat::recognize(&text) {
            Some(Ok(Heartbeat::Pong(micros))) => {
                let rtt = self.keepalive.observe_pong_at(micros, Instant::now());
                debug!(rtt_ms = rtt.as_secs_f64() * 1000.0, "keepalive");
                self.publish(SessionUpdate::Latency(rtt));
            }
            Some(Ok(ping)) => {
                let (Some(reply), Some(channel)) = (ping.reply(), inner.channel.as_ref()) else {
                    return;
                };
                if let Err(err) = channel.send_text(&reply.to_string()).await {
                    debug!(error = %err, "keepalive reply failed");
                }
            }
            Some(Err(err)) => {
                debug!(error = %err, "malformed keepalive frame");
                self.dropped(format!("keepalive: {err}"));
            }
            None => {
                info!("<<< {text}");
                self.publish(SessionUpdate::Message(text));
            }
        }
    }
}

use std::{
    borrow::Cow,
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use axum::extract::ws::{close_code, CloseFrame, Message};
use bridge_proto::PeerClass;
use metrics::counter;
use parking_lot::RwLock;
use serde::Serialize;
use slab::Slab;
use tokio::sync::mpsc::{self, error::TrySendError};

pub const DEFAULT_QUEUE_DEPTH: usize = 64;

/// Relay-wide connection identity: the client's `uid` plus a serial number
/// that only ever grows, so repeated uids still get distinct identities.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId(String);

impl ConnectionId {
    fn new(uid: &str, serial: u64) -> Self {
        Self(format!("{uid}-{serial}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone)]
pub struct RelayRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    tables: RwLock<RelayTables>,
    queue_depth: usize,
    next_serial: AtomicU64,
    totals: Totals,
}

#[derive(Default)]
struct Totals {
    connections: AtomicU64,
    frames: AtomicU64,
    bytes: AtomicU64,
    dropped: AtomicU64,
    evicted: AtomicU64,
}

/// All three class tables and the identity index. A connection lives in
/// exactly one table; every mutation takes the single write lock.
#[derive(Default)]
struct RelayTables {
    native: Slab<ConnectionEntry>,
    web: Slab<ConnectionEntry>,
    unclassified: Slab<ConnectionEntry>,
    index: HashMap<ConnectionId, (PeerClass, usize)>,
}

impl RelayTables {
    fn table(&self, class: PeerClass) -> &Slab<ConnectionEntry> {
        match class {
            PeerClass::Native => &self.native,
            PeerClass::Web => &self.web,
            PeerClass::Unclassified => &self.unclassified,
        }
    }

    fn table_mut(&mut self, class: PeerClass) -> &mut Slab<ConnectionEntry> {
        match class {
            PeerClass::Native => &mut self.native,
            PeerClass::Web => &mut self.web,
            PeerClass::Unclassified => &mut self.unclassified,
        }
    }

    fn remove(&mut self, id: &ConnectionId) -> Option<PeerClass> {
        let (class, key) = self.index.remove(id)?;
        let table = self.table_mut(class);
        if table.get(key).is_some_and(|entry| &entry.id == id) {
            table.remove(key);
        }
        Some(class)
    }
}

struct ConnectionEntry {
    id: ConnectionId,
    sender: mpsc::Sender<Message>,
}

pub struct Registration {
    pub id: ConnectionId,
    pub class: PeerClass,
    pub receiver: mpsc::Receiver<Message>,
    /// Connections in the same class table, this one included.
    pub active_in_class: usize,
}

pub struct Removal {
    pub class: PeerClass,
    pub active_in_class: usize,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchMetrics {
    pub delivered: usize,
    pub bytes: usize,
    pub dropped: usize,
    pub closed: usize,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RegistrySnapshot {
    pub native: usize,
    pub web: usize,
    pub unclassified: usize,
    pub total_connections: u64,
    pub frames_relayed: u64,
    pub bytes_relayed: u64,
    pub frames_dropped: u64,
    pub connections_evicted: u64,
}

impl RegistrySnapshot {
    pub fn active(&self) -> usize {
        self.native + self.web + self.unclassified
    }
}

impl Default for RelayRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_DEPTH)
    }
}

impl RelayRegistry {
    pub fn new(queue_depth: usize) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                tables: RwLock::new(RelayTables::default()),
                queue_depth: queue_depth.max(1),
                next_serial: AtomicU64::new(0),
                totals: Totals::default(),
            }),
        }
    }

    pub fn register(&self, uid: &str, class: PeerClass) -> Registration {
        let (tx, rx) = mpsc::channel(self.inner.queue_depth);
        let serial = self.inner.next_serial.fetch_add(1, Ordering::Relaxed);
        let id = ConnectionId::new(uid, serial);

        let active_in_class = {
            let mut tables = self.inner.tables.write();
            let key = tables.table_mut(class).insert(ConnectionEntry {
                id: id.clone(),
                sender: tx,
            });
            tables.index.insert(id.clone(), (class, key));
            tables.table(class).len()
        };
        self.inner.totals.connections.fetch_add(1, Ordering::Relaxed);

        Registration {
            id,
            class,
            receiver: rx,
            active_in_class,
        }
    }

    /// Removes a connection. `None` when it was already gone, e.g. evicted
    /// by a dispatch that found its queue closed.
    pub fn unregister(&self, id: &ConnectionId) -> Option<Removal> {
        let mut tables = self.inner.tables.write();
        let class = tables.remove(id)?;
        Some(Removal {
            class,
            active_in_class: tables.table(class).len(),
        })
    }

    /// Forwards `message` to every connection of the class opposite to
    /// `from`. Recipients are snapshotted under the read lock and sent to
    /// after it is released; a full queue drops the frame for that recipient
    /// only, a closed queue evicts the recipient.
    pub fn dispatch(&self, from: PeerClass, message: Message) -> DispatchMetrics {
        let target = from.fan_out_target();
        let recipients: Vec<(ConnectionId, mpsc::Sender<Message>)> = {
            let tables = self.inner.tables.read();
            tables
                .table(target)
                .iter()
                .map(|(_, entry)| (entry.id.clone(), entry.sender.clone()))
                .collect()
        };

        let mut metrics = DispatchMetrics::default();
        let bytes = message_len(&message);
        let mut closed = Vec::new();
        for (id, sender) in recipients {
            match sender.try_send(message.clone()) {
                Ok(()) => {
                    metrics.delivered += 1;
                    metrics.bytes += bytes;
                }
                Err(TrySendError::Full(_)) => {
                    metrics.dropped += 1;
                    counter!(
                        "bridge_relay_flow_control_drops_total",
                        1,
                        "class" => target.label()
                    );
                }
                Err(TrySendError::Closed(_)) => {
                    metrics.closed += 1;
                    closed.push(id);
                }
            }
        }

        if !closed.is_empty() {
            let mut tables = self.inner.tables.write();
            for id in &closed {
                tables.remove(id);
            }
            counter!(
                "bridge_relay_evictions_total",
                closed.len() as u64,
                "class" => target.label()
            );
        }

        let totals = &self.inner.totals;
        totals
            .frames
            .fetch_add(metrics.delivered as u64, Ordering::Relaxed);
        totals.bytes.fetch_add(metrics.bytes as u64, Ordering::Relaxed);
        totals
            .dropped
            .fetch_add(metrics.dropped as u64, Ordering::Relaxed);
        totals
            .evicted
            .fetch_add(metrics.closed as u64, Ordering::Relaxed);
        metrics
    }

    /// Queues a close frame on every registered connection. Returns how
    /// many accepted it.
    pub fn close_all(&self, reason: &'static str) -> usize {
        let senders: Vec<mpsc::Sender<Message>> = {
            let tables = self.inner.tables.read();
            [&tables.native, &tables.web, &tables.unclassified]
                .into_iter()
                .flat_map(|table| table.iter().map(|(_, entry)| entry.sender.clone()))
                .collect()
        };
        senders
            .into_iter()
            .filter(|sender| {
                sender
                    .try_send(Message::Close(Some(CloseFrame {
                        code: close_code::AWAY,
                        reason: Cow::Borrowed(reason),
                    })))
                    .is_ok()
            })
            .count()
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        let (native, web, unclassified) = {
            let tables = self.inner.tables.read();
            (tables.native.len(), tables.web.len(), tables.unclassified.len())
        };
        let totals = &self.inner.totals;
        RegistrySnapshot {
            native,
            web,
            unclassified,
            total_connections: totals.connections.load(Ordering::Relaxed),
            frames_relayed: totals.frames.load(Ordering::Relaxed),
            bytes_relayed: totals.bytes.load(Ordering::Relaxed),
            frames_dropped: totals.dropped.load(Ordering::Relaxed),
            connections_evicted: totals.evicted.load(Ordering::Relaxed),
        }
    }
}

fn message_len(message: &Message) -> usize {
    match message {
        Message::Text(text) => text.len(),
        Message::Binary(bytes) => bytes.len(),
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(frame: &str) -> Message {
        Message::Text(frame.to_string())
    }

    fn received(registration: &mut Registration) -> Vec<String> {
        let mut frames = Vec::new();
        while let Ok(message) = registration.receiver.try_recv() {
            if let Message::Text(text) = message {
                frames.push(text);
            }
        }
        frames
    }

    #[test_timeout::timeout]
    fn fan_out_reaches_only_the_opposite_class() {
        let registry = RelayRegistry::default();
        let mut native_a = registry.register("1", PeerClass::Native);
        let mut native_b = registry.register("2", PeerClass::Native);
        let mut web = registry.register("1", PeerClass::Web);
        let mut stray = registry.register("9", PeerClass::Unclassified);

        let metrics = registry.dispatch(PeerClass::Web, text("offer~v=0"));
        assert_eq!(metrics.delivered, 2);
        assert_eq!(metrics.bytes, 2 * "offer~v=0".len());
        assert_eq!(received(&mut native_a), vec!["offer~v=0"]);
        assert_eq!(received(&mut native_b), vec!["offer~v=0"]);
        assert!(received(&mut web).is_empty());
        assert!(received(&mut stray).is_empty());

        registry.dispatch(PeerClass::Native, text("answer~v=0"));
        assert_eq!(received(&mut web), vec!["answer~v=0"]);
        assert!(received(&mut native_a).is_empty());
        assert!(received(&mut native_b).is_empty());
        assert!(received(&mut stray).is_empty());
    }

    #[test_timeout::timeout]
    fn unclassified_senders_reach_native_only() {
        let registry = RelayRegistry::default();
        let mut native = registry.register("1", PeerClass::Native);
        let mut web = registry.register("1", PeerClass::Web);

        let metrics = registry.dispatch(PeerClass::Unclassified, text("pcnull~"));

        assert_eq!(metrics.delivered, 1);
        assert_eq!(received(&mut native), vec!["pcnull~"]);
        assert!(received(&mut web).is_empty());
    }

    #[test_timeout::timeout]
    fn repeated_uids_get_distinct_identities() {
        let registry = RelayRegistry::default();
        let first = registry.register("7", PeerClass::Web);
        let second = registry.register("7", PeerClass::Web);

        assert_ne!(first.id, second.id);
        assert!(first.id.as_str().starts_with('7'));
        assert_eq!(second.active_in_class, 2);
        assert_eq!(registry.snapshot().web, 2);
    }

    #[test_timeout::timeout]
    fn closed_recipient_is_evicted_without_affecting_others() {
        let registry = RelayRegistry::default();
        let gone = registry.register("1", PeerClass::Web);
        let mut alive = registry.register("2", PeerClass::Web);
        let gone_id = gone.id.clone();
        drop(gone.receiver);

        let metrics = registry.dispatch(PeerClass::Native, text("candidate~a~0~0"));

        assert_eq!(metrics.delivered, 1);
        assert_eq!(metrics.closed, 1);
        assert_eq!(received(&mut alive), vec!["candidate~a~0~0"]);
        assert!(registry.unregister(&gone_id).is_none());

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.web, 1);
        assert_eq!(snapshot.connections_evicted, 1);
    }

    #[test_timeout::timeout]
    fn full_queue_drops_for_that_recipient_only() {
        let registry = RelayRegistry::new(1);
        let mut slow = registry.register("1", PeerClass::Native);
        let mut fast = registry.register("2", PeerClass::Native);

        registry.dispatch(PeerClass::Web, text("one"));
        assert_eq!(received(&mut fast), vec!["one"]);

        let metrics = registry.dispatch(PeerClass::Web, text("two"));
        assert_eq!(metrics.delivered, 1);
        assert_eq!(metrics.dropped, 1);
        assert_eq!(received(&mut slow), vec!["one"]);
        assert_eq!(received(&mut fast), vec!["two"]);
        assert_eq!(registry.snapshot().native, 2);
    }

    #[test_timeout::timeout]
    fn unregister_reports_remaining_class_size() {
        let registry = RelayRegistry::default();
        let a = registry.register("1", PeerClass::Native);
        let _b = registry.register("2", PeerClass::Native);

        let removal = registry.unregister(&a.id).unwrap();
        assert_eq!(removal.class, PeerClass::Native);
        assert_eq!(removal.active_in_class, 1);
        assert!(registry.unregister(&a.id).is_none());
    }

    #[test_timeout::timeout]
    fn slot_reuse_does_not_confuse_eviction() {
        let registry = RelayRegistry::default();
        let first = registry.register("1", PeerClass::Web);
        let first_id = first.id.clone();
        registry.unregister(&first_id);
        drop(first);
        let mut second = registry.register("1", PeerClass::Web);

        // stale identity must not remove the connection now holding the slot
        assert!(registry.unregister(&first_id).is_none());
        registry.dispatch(PeerClass::Native, text("hello"));
        assert_eq!(received(&mut second), vec!["hello"]);
    }

    #[test_timeout::timeout]
    fn close_all_queues_a_close_frame_everywhere() {
        let registry = RelayRegistry::default();
        let mut native = registry.register("1", PeerClass::Native);
        let mut stray = registry.register("2", PeerClass::Unclassified);

        assert_eq!(registry.close_all("shutting down"), 2);
        assert!(matches!(
            native.receiver.try_recv(),
            Ok(Message::Close(Some(_)))
        ));
        assert!(matches!(stray.receiver.try_recv(), Ok(Message::Close(_))));
    }
}

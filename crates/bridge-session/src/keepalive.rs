//! Data channel round-trip measurement.
//!
//! The sending side stamps `ping <micros>` with microseconds since its own
//! session start; the peer echoes the number back as `pong <micros>`. Both
//! readings come from the same clock, so the difference is a round trip.

use std::sync::Arc;
use std::time::Duration;

use bridge_proto::Heartbeat;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::debug;

use crate::engine::DataChannel;

#[derive(Debug)]
pub struct Keepalive {
    origin: Instant,
    last_rtt: Mutex<Option<Duration>>,
}

impl Keepalive {
    pub fn new(origin: Instant) -> Self {
        Self {
            origin,
            last_rtt: Mutex::new(None),
        }
    }

    pub fn ping_at(&self, now: Instant) -> Heartbeat {
        Heartbeat::Ping(self.micros_at(now))
    }

    /// Records the round trip for a pong carrying `micros` received at `now`.
    pub fn observe_pong_at(&self, micros: u64, now: Instant) -> Duration {
        let rtt = Duration::from_micros(self.micros_at(now).saturating_sub(micros));
        *self.last_rtt.lock() = Some(rtt);
        rtt
    }

    pub fn last_rtt(&self) -> Option<Duration> {
        *self.last_rtt.lock()
    }

    fn micros_at(&self, now: Instant) -> u64 {
        let elapsed = now.saturating_duration_since(self.origin);
        u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX)
    }
}

/// Sends a ping on `channel` every `interval` until aborted or the channel
/// refuses a send.
pub fn spawn_pinger(
    keepalive: Arc<Keepalive>,
    channel: Arc<dyn DataChannel>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let ping = keepalive.ping_at(Instant::now());
            if let Err(err) = channel.send_text(&ping.to_string()).await {
                debug!(channel = channel.label(), error = %err, "keepalive stopped");
                break;
            }
        }
    })
}

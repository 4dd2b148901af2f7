//! Event Broadcaster: per-application fan-out of graph-change
//! events. Each subscriber gets a bounded view of one application's event
//! stream; a slow subscriber never blocks the writer — it falls behind and
//! loses the oldest events instead, with the loss counted rather than
//! hidden. A periodic liveness ping prunes subscribers that stop reading
//! entirely.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use innominatus_domain::GraphEvent;
use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

/// Per-subscriber buffer size: how many events a lagging subscriber
/// may fall behind by before the broadcaster starts dropping its oldest.
pub const DEFAULT_BUFFER: usize = 256;
const PING_INTERVAL: Duration = Duration::from_secs(30);
/// A subscriber that misses this many consecutive pings is pruned from the
/// registry (the underlying channel keeps running regardless — pruning
/// only removes bookkeeping, it never closes a receiver out from under a
/// caller still holding one).
const MAX_MISSED_PINGS: u64 = 2;

/// Wire payload and internal liveness ping share one channel per
/// application so pings don't require a second subscription.
#[derive(Debug, Clone)]
enum Envelope {
    Event(GraphEvent),
    Ping(u64),
}

struct AppChannel {
    sender: broadcast::Sender<Envelope>,
    /// subscriber id -> last ping sequence it acknowledged, shared with
    /// that subscriber's `Subscription` so an ack lands without re-entering
    /// the `channels` lock from inside `recv()`.
    liveness: HashMap<Uuid, Arc<AtomicU64>>,
    ping_seq: u64,
}

impl AppChannel {
    fn new(buffer: usize) -> Self {
        let (sender, _) = broadcast::channel(buffer);
        Self {
            sender,
            liveness: HashMap::new(),
            ping_seq: 0,
        }
    }
}

/// A live view onto one application's event stream, returned by
/// [`EventBroadcaster::subscribe`].
pub struct Subscription {
    receiver: broadcast::Receiver<Envelope>,
    dropped: Arc<AtomicU64>,
    /// Last ping sequence this subscriber has observed; shared with the
    /// owning `AppChannel.liveness` entry so `tick_liveness` sees the ack
    /// the moment `recv()` processes a `Ping`.
    acked: Arc<AtomicU64>,
}

impl Subscription {
    /// Waits for the next graph event, transparently acking liveness
    /// pings and counting (without surfacing) any buffer overflow as
    /// `dropped_events`. Returns `None` once the broadcaster itself is
    /// gone.
    pub async fn recv(&mut self) -> Option<GraphEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(Envelope::Event(event)) => return Some(event),
                Ok(Envelope::Ping(seq)) => self.acked.store(seq, Ordering::Relaxed),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    self.dropped.fetch_add(missed, Ordering::Relaxed);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Count of events this subscriber has lost to buffer overflow since
    /// it subscribed. Grows monotonically; publishing never blocks on a
    /// slow reader.
    #[must_use]
    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// The process-wide event broadcaster singleton, its lifecycle tied to
/// the engine. [`GraphManager`](crate::graph::GraphManager) publishes through
/// it; the HTTP/WS layer (out of scope here) subscribes through it.
pub struct EventBroadcaster {
    channels: Mutex<HashMap<String, AppChannel>>,
    buffer: usize,
    /// Total subscribers pruned for missing two consecutive pings, across
    /// every application, for diagnostics/tests — the only externally
    /// observable effect of a prune.
    pruned_total: AtomicU64,
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER)
    }
}

impl EventBroadcaster {
    #[must_use]
    pub fn new(buffer: usize) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            buffer,
            pruned_total: AtomicU64::new(0),
        }
    }

    /// Publishes `event` to every current subscriber of `app_name`. A
    /// writer never blocks on a slow reader: `broadcast::Sender::send`
    /// only fails when there are zero receivers, which is not an error
    /// here (events are still retained for the next subscriber up to the
    /// buffer size).
    pub async fn publish(&self, app_name: &str, event: GraphEvent) {
        let mut channels = self.channels.lock().await;
        let channel = channels
            .entry(app_name.to_string())
            .or_insert_with(|| AppChannel::new(self.buffer));
        let _ = channel.sender.send(Envelope::Event(event));
    }

    /// Subscribes to `app_name`'s event stream, creating its channel on
    /// first use.
    pub async fn subscribe(&self, app_name: &str) -> Subscription {
        let mut channels = self.channels.lock().await;
        let channel = channels
            .entry(app_name.to_string())
            .or_insert_with(|| AppChannel::new(self.buffer));
        let id = Uuid::new_v4();
        let acked = Arc::new(AtomicU64::new(channel.ping_seq));
        channel.liveness.insert(id, Arc::clone(&acked));
        Subscription {
            receiver: channel.sender.subscribe(),
            dropped: Arc::new(AtomicU64::new(0)),
            acked,
        }
    }

    /// Current subscriber count for `app_name`, for diagnostics/tests.
    pub async fn subscriber_count(&self, app_name: &str) -> usize {
        self.channels
            .lock()
            .await
            .get(app_name)
            .map_or(0, |c| c.sender.receiver_count())
    }

    /// Runs the periodic liveness ping until `cancellation` fires: every
    /// 30s, pings every known application channel and prunes
    /// subscriber bookkeeping that has missed two consecutive pings.
    pub async fn run_liveness(&self, cancellation: CancellationToken) {
        let mut interval = tokio::time::interval(PING_INTERVAL);
        loop {
            tokio::select! {
                _ = interval.tick() => self.tick_liveness().await,
                () = cancellation.cancelled() => break,
            }
        }
    }

    async fn tick_liveness(&self) {
        let mut channels = self.channels.lock().await;
        for (app_name, channel) in channels.iter_mut() {
            channel.ping_seq += 1;
            let seq = channel.ping_seq;
            let _ = channel.sender.send(Envelope::Ping(seq));

            let before = channel.liveness.len();
            channel.liveness.retain(|_, acked| {
                seq.saturating_sub(acked.load(Ordering::Relaxed)) < MAX_MISSED_PINGS
            });
            let pruned = before - channel.liveness.len();
            if pruned > 0 {
                self.pruned_total.fetch_add(pruned as u64, Ordering::Relaxed);
                debug!(app = %app_name, pruned, "dropped unresponsive subscribers");
            }
        }
    }

    /// Subscribers pruned for missing two consecutive liveness pings, across
    /// every application, since this broadcaster started.
    #[must_use]
    pub fn pruned_count(&self) -> u64 {
        self.pruned_total.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn sample_event() -> GraphEvent {
        GraphEvent::GraphUpdated {
            timestamp: Utc::now(),
            node_count: 1,
            edge_count: 0,
        }
    }

    #[tokio::test]
    async fn subscriber_receives_published_event() {
        let broadcaster = EventBroadcaster::new(DEFAULT_BUFFER);
        let mut sub = broadcaster.subscribe("blog").await;
        broadcaster.publish("blog", sample_event()).await;
        let event = sub.recv().await.unwrap();
        assert!(matches!(event, GraphEvent::GraphUpdated { .. }));
    }

    #[tokio::test]
    async fn publish_with_no_subscribers_does_not_block() {
        let broadcaster = EventBroadcaster::new(DEFAULT_BUFFER);
        broadcaster.publish("blog", sample_event()).await;
    }

    #[tokio::test]
    async fn overflow_counts_as_dropped_not_blocked() {
        let broadcaster = EventBroadcaster::new(2);
        let mut sub = broadcaster.subscribe("blog").await;
        for _ in 0..5 {
            broadcaster.publish("blog", sample_event()).await;
        }
        let _ = sub.recv().await;
        assert!(sub.dropped_events() > 0);
    }

    #[tokio::test]
    async fn subscriber_count_tracks_active_subscriptions() {
        let broadcaster = EventBroadcaster::new(DEFAULT_BUFFER);
        assert_eq!(broadcaster.subscriber_count("blog").await, 0);
        let _sub = broadcaster.subscribe("blog").await;
        assert_eq!(broadcaster.subscriber_count("blog").await, 1);
    }

    #[tokio::test]
    async fn liveness_tick_pings_without_disrupting_events() {
        let broadcaster = EventBroadcaster::new(DEFAULT_BUFFER);
        let mut sub = broadcaster.subscribe("blog").await;
        broadcaster.tick_liveness().await;
        broadcaster.publish("blog", sample_event()).await;
        let event = sub.recv().await.unwrap();
        assert!(matches!(event, GraphEvent::GraphUpdated { .. }));
    }

    #[tokio::test]
    async fn liveness_prunes_subscriber_that_stops_polling() {
        let broadcaster = EventBroadcaster::new(DEFAULT_BUFFER);
        let mut responsive = broadcaster.subscribe("blog").await;
        let _idle = broadcaster.subscribe("blog").await;

        // First tick: both subscribers are still within budget. The
        // responsive one acks by draining the ping on its way to an event.
        broadcaster.tick_liveness().await;
        broadcaster.publish("blog", sample_event()).await;
        assert!(responsive.recv().await.is_some());
        assert_eq!(broadcaster.pruned_count(), 0);

        // Second tick: the idle subscriber has now missed two consecutive
        // pings and is pruned; the still-polling one survives.
        broadcaster.tick_liveness().await;
        broadcaster.publish("blog", sample_event()).await;
        assert!(responsive.recv().await.is_some());
        assert_eq!(broadcaster.pruned_count(), 1);
    }
}

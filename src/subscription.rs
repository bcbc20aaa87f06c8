//! Change feed subscription lifecycle.
//!
//! ```text
//! Idle -> Connecting -> Streaming -> Closed
//!             |            |
//!             v            v
//!         Reconnecting <---+
//! ```
//!
//! A background task owns the feed connection, normalizes notifications
//! and forwards them as [`FeedSignal`]s. After any transport loss it
//! reconnects and announces [`FeedSignal::Reconnected`] before the first
//! event of the new connection; the consumer is expected to re-fetch,
//! because nothing missed in between is replayed.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backend::ChangeFeed;
use crate::config::FeedConfig;
use crate::error::{Error, Result};
use crate::events::{normalize_or_drop, ChangeEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Idle,
    Connecting,
    Streaming,
    Reconnecting,
    Closed,
}

impl fmt::Display for SubscriptionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SubscriptionState::Idle => "idle",
            SubscriptionState::Connecting => "connecting",
            SubscriptionState::Streaming => "streaming",
            SubscriptionState::Reconnecting => "reconnecting",
            SubscriptionState::Closed => "closed",
        };
        f.write_str(label)
    }
}

/// What the feed reader hands to the consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedSignal {
    Event(ChangeEvent),
    /// A new connection is up; anything missed while down is gone.
    Reconnected,
    /// Reconnect attempts are exhausted. No further signals follow.
    Failed(String),
}

/// Consumer end of a running subscription.
#[derive(Debug)]
pub struct Subscription {
    rx: mpsc::Receiver<FeedSignal>,
    closed: Arc<AtomicBool>,
}

impl Subscription {
    /// Next signal. Returns `None` once the subscription is stopped, even if
    /// signals are still queued.
    pub async fn recv(&mut self) -> Option<FeedSignal> {
        if self.is_closed() {
            return None;
        }
        let signal = self.rx.recv().await?;
        if self.is_closed() {
            return None;
        }
        Some(signal)
    }

    /// A signal that is already queued, without waiting.
    pub fn try_recv(&mut self) -> Option<FeedSignal> {
        if self.is_closed() {
            return None;
        }
        self.rx.try_recv().ok()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

pub struct SubscriptionManager {
    feed: Arc<dyn ChangeFeed>,
    config: FeedConfig,
    state: Arc<watch::Sender<SubscriptionState>>,
    closed: Arc<AtomicBool>,
    reader: Option<JoinHandle<()>>,
    forwarder: Option<JoinHandle<()>>,
}

impl SubscriptionManager {
    pub fn new(feed: Arc<dyn ChangeFeed>, config: FeedConfig) -> Self {
        let (state, _) = watch::channel(SubscriptionState::Idle);
        Self {
            feed,
            config,
            state: Arc::new(state),
            closed: Arc::new(AtomicBool::new(false)),
            reader: None,
            forwarder: None,
        }
    }

    pub fn state(&self) -> SubscriptionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SubscriptionState> {
        self.state.subscribe()
    }

    /// Spawn the feed reader. Only valid from `Idle`.
    pub fn start(&mut self) -> Result<Subscription> {
        let current = self.state();
        if current != SubscriptionState::Idle {
            return Err(Error::FeedFailed(format!(
                "subscription cannot start from state '{current}'"
            )));
        }

        let (tx, rx) = mpsc::channel(self.config.channel_capacity.max(1));
        self.state.send_replace(SubscriptionState::Connecting);
        self.reader = Some(tokio::spawn(run_feed(
            self.feed.clone(),
            self.config.clone(),
            tx,
            self.state.clone(),
            self.closed.clone(),
        )));
        debug!("subscription started");

        Ok(Subscription {
            rx,
            closed: self.closed.clone(),
        })
    }

    /// Like [`start`](Self::start), delivering each signal to `on_signal`.
    pub fn start_with<F>(&mut self, mut on_signal: F) -> Result<()>
    where
        F: FnMut(FeedSignal) + Send + 'static,
    {
        let mut subscription = self.start()?;
        self.forwarder = Some(tokio::spawn(async move {
            while let Some(signal) = subscription.recv().await {
                on_signal(signal);
            }
        }));
        Ok(())
    }

    /// Close the subscription. Nothing is delivered once this returns.
    pub async fn stop(&mut self) {
        self.close();
        for handle in [self.forwarder.take(), self.reader.take()].into_iter().flatten() {
            let _ = handle.await;
        }
    }

    fn close(&mut self) {
        self.closed.store(true, Ordering::Release);
        if let Some(handle) = &self.forwarder {
            handle.abort();
        }
        if let Some(handle) = &self.reader {
            handle.abort();
        }
        if self.state() != SubscriptionState::Closed {
            self.state.send_replace(SubscriptionState::Closed);
            debug!("subscription closed");
        }
    }
}

impl Drop for SubscriptionManager {
    fn drop(&mut self) {
        self.close();
    }
}

async fn run_feed(
    feed: Arc<dyn ChangeFeed>,
    config: FeedConfig,
    tx: mpsc::Sender<FeedSignal>,
    state: Arc<watch::Sender<SubscriptionState>>,
    closed: Arc<AtomicBool>,
) {
    let mut connected_before = false;
    let mut failures: u32 = 0;
    // Connections in a row that ended before delivering anything.
    let mut idle_drops: u32 = 0;

    while !closed.load(Ordering::Acquire) && !tx.is_closed() {
        match feed.connect().await {
            Ok(mut connection) => {
                let announce = connected_before || failures > 0;
                failures = 0;
                connected_before = true;
                state.send_replace(SubscriptionState::Streaming);
                info!(reconnected = announce, "change feed connected");

                if announce && tx.send(FeedSignal::Reconnected).await.is_err() {
                    break;
                }
                let mut delivered = false;
                while let Some(raw) = connection.recv().await {
                    delivered = true;
                    let Some(event) = normalize_or_drop(&raw) else {
                        continue;
                    };
                    if tx.send(FeedSignal::Event(event)).await.is_err() {
                        break;
                    }
                }
                if closed.load(Ordering::Acquire) || tx.is_closed() {
                    break;
                }
                state.send_replace(SubscriptionState::Reconnecting);
                if delivered {
                    idle_drops = 0;
                    warn!("change feed connection lost; reconnecting");
                    continue;
                }
                idle_drops += 1;
                let delay = config.reconnect_backoff(idle_drops.min(config.max_reconnect_attempts.max(1)));
                warn!(
                    drops = idle_drops,
                    delay_ms = delay.as_millis() as u64,
                    "change feed connection dropped before delivering; backing off"
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => {
                failures += 1;
                if failures > config.max_reconnect_attempts {
                    warn!(attempts = failures, error = %err, "change feed gave up");
                    state.send_replace(SubscriptionState::Closed);
                    let _ = tx.send(FeedSignal::Failed(err.to_string())).await;
                    return;
                }
                let delay = config.reconnect_backoff(failures);
                warn!(
                    attempt = failures,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "change feed connect failed; retrying"
                );
                state.send_replace(SubscriptionState::Reconnecting);
                tokio::time::sleep(delay).await;
            }
        }
    }
    state.send_replace(SubscriptionState::Closed);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MemoryBackend, TaskBackend};
    use crate::events::RawNotification;
    use crate::task::TaskDraft;
    use serde_json::json;
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(5);

    fn fast_config() -> FeedConfig {
        FeedConfig {
            channel_capacity: 8,
            reconnect_backoff_ms: 1,
            max_reconnect_attempts: 3,
        }
    }

    async fn streaming(manager: &SubscriptionManager) {
        let mut state = manager.watch_state();
        tokio::time::timeout(WAIT, state.wait_for(|s| *s == SubscriptionState::Streaming))
            .await
            .expect("timed out waiting for streaming")
            .expect("state sender alive");
    }

    async fn next(subscription: &mut Subscription) -> Option<FeedSignal> {
        tokio::time::timeout(WAIT, subscription.recv())
            .await
            .expect("timed out waiting for signal")
    }

    #[tokio::test]
    async fn forwards_normalized_events() {
        let backend = Arc::new(MemoryBackend::new());
        let mut manager = SubscriptionManager::new(backend.clone(), fast_config());
        let mut subscription = manager.start().expect("start");
        streaming(&manager).await;

        backend
            .publish_raw(RawNotification::insert(json!({"title": "no id"})))
            .await;
        let created = backend
            .create_task(&TaskDraft::new("hello"))
            .await
            .expect("create");

        match next(&mut subscription).await {
            Some(FeedSignal::Event(ChangeEvent::Created(task))) => assert_eq!(task.id, created.id),
            other => panic!("unexpected signal {other:?}"),
        }
    }

    #[tokio::test]
    async fn start_twice_is_rejected() {
        let backend = Arc::new(MemoryBackend::new());
        let mut manager = SubscriptionManager::new(backend, fast_config());
        let _subscription = manager.start().expect("start");
        assert!(manager.start().is_err());
    }

    #[tokio::test]
    async fn stop_drops_queued_signals() {
        let backend = Arc::new(MemoryBackend::new());
        let mut manager = SubscriptionManager::new(backend.clone(), fast_config());
        let mut subscription = manager.start().expect("start");
        streaming(&manager).await;

        backend.create_task(&TaskDraft::new("one")).await.expect("create");
        tokio::time::sleep(Duration::from_millis(20)).await;
        manager.stop().await;

        assert_eq!(manager.state(), SubscriptionState::Closed);
        assert_eq!(subscription.recv().await, None);
        assert_eq!(backend.connection_count().await, 0);
    }

    #[tokio::test]
    async fn transport_loss_announces_reconnect() {
        let backend = Arc::new(MemoryBackend::new());
        let mut manager = SubscriptionManager::new(backend.clone(), fast_config());
        let mut subscription = manager.start().expect("start");
        streaming(&manager).await;

        backend.disconnect_all().await;
        assert_eq!(next(&mut subscription).await, Some(FeedSignal::Reconnected));
        assert_eq!(manager.state(), SubscriptionState::Streaming);

        backend.create_task(&TaskDraft::new("after")).await.expect("create");
        assert!(matches!(
            next(&mut subscription).await,
            Some(FeedSignal::Event(ChangeEvent::Created(_)))
        ));
    }

    #[tokio::test]
    async fn connections_dropped_at_once_reconnect_with_backoff() {
        let backend = Arc::new(MemoryBackend::new());
        backend.drop_next_connections(2).await;
        let config = FeedConfig {
            reconnect_backoff_ms: 40,
            ..fast_config()
        };
        let started = tokio::time::Instant::now();
        let mut manager = SubscriptionManager::new(backend.clone(), config);
        let mut subscription = manager.start().expect("start");

        // 40ms after the first drop, 80ms after the second.
        assert_eq!(next(&mut subscription).await, Some(FeedSignal::Reconnected));
        assert_eq!(next(&mut subscription).await, Some(FeedSignal::Reconnected));
        assert!(started.elapsed() >= Duration::from_millis(120));

        streaming(&manager).await;
        assert_eq!(backend.connection_count().await, 1);
    }

    #[tokio::test]
    async fn late_first_connection_is_announced() {
        let backend = Arc::new(MemoryBackend::new());
        backend.fail_next_connects(2).await;
        let mut manager = SubscriptionManager::new(backend, fast_config());
        let mut subscription = manager.start().expect("start");
        assert_eq!(next(&mut subscription).await, Some(FeedSignal::Reconnected));
    }

    #[tokio::test]
    async fn exhausted_reconnects_fail() {
        let backend = Arc::new(MemoryBackend::new());
        backend.fail_next_connects(10).await;
        let mut manager = SubscriptionManager::new(backend, fast_config());
        let mut subscription = manager.start().expect("start");

        assert!(matches!(next(&mut subscription).await, Some(FeedSignal::Failed(_))));
        assert_eq!(next(&mut subscription).await, None);
        assert_eq!(manager.state(), SubscriptionState::Closed);
    }

    #[tokio::test]
    async fn closure_receives_signals_until_stopped() {
        let backend = Arc::new(MemoryBackend::new());
        let mut manager = SubscriptionManager::new(backend.clone(), fast_config());
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        manager
            .start_with(move |signal| {
                let _ = seen_tx.send(signal);
            })
            .expect("start");
        streaming(&manager).await;

        backend.create_task(&TaskDraft::new("one")).await.expect("create");
        let first = tokio::time::timeout(WAIT, seen_rx.recv())
            .await
            .expect("timed out")
            .expect("signal");
        assert!(matches!(first, FeedSignal::Event(_)));

        manager.stop().await;
        backend.create_task(&TaskDraft::new("two")).await.expect("create");
        assert_eq!(seen_rx.recv().await, None);
    }
}

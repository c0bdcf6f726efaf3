//! The broadcaster: consume loop, fan-out lanes and lifecycle.
//!
//! ```text
//! ChangeStream ─▶ consume loop ─┬─▶ lane(A) ─▶ deliver ─▶ inbox A
//!                               ├─▶ lane(B) ─▶ deliver ─▶ inbox B
//!                               └─▶ lane(C) ─▶ deliver ─▶ inbox C
//! ```
//!
//! Each subscriber gets one lane: a bounded queue drained by a single task, so
//! events reach a given subscriber in feed order while a slow subscriber only
//! ever stalls its own lane. A full lane drops the event for that subscriber.
//!
//! Lifecycle: `Idle → Running → Draining → Stopped`. Every exit from
//! [`Broadcaster::start`] unsubscribes (and closes) all subscribers.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use feedcast_feed::{ChangeFeedAdapter, ChangeRecord, SnapshotSource};
use feedcast_shared::{BroadcastConfig, FeedcastError, Result, SubscriberId};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::deliverer::{BoundedDeliverer, DeliveryError};
use crate::event::Event;
use crate::registry::SubscriberRegistry;
use crate::subscriber::{self, Inbox, Subscriber};

// ---------------------------------------------------------------------------
// Publisher
// ---------------------------------------------------------------------------

/// Registration interface exposed to downstream handlers.
pub trait Publisher: Send + Sync {
    /// Start delivering events to `subscriber`. Idempotent.
    fn subscribe(&self, subscriber: Subscriber);

    /// Stop delivering to `id` and close its inbox. Idempotent.
    fn unsubscribe(&self, id: SubscriberId);
}

/// Lifecycle of a [`Broadcaster`]. There is no way back to `Running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcastState {
    Idle,
    Running,
    Draining,
    Stopped,
}

// ---------------------------------------------------------------------------
// Hub: state shared with lane tasks
// ---------------------------------------------------------------------------

struct Hub {
    registry: SubscriberRegistry,
    deliverer: BoundedDeliverer,
}

impl Hub {
    fn remove(&self, id: SubscriberId) {
        self.registry.unsubscribe(id);
        self.deliverer.forget(id);
    }
}

struct Lane {
    tx: mpsc::Sender<Arc<Event>>,
    task: JoinHandle<()>,
}

fn spawn_lane(
    hub: Arc<Hub>,
    subscriber: Subscriber,
    capacity: usize,
    timeout: Duration,
    cancel: CancellationToken,
) -> Lane {
    let (tx, mut rx) = mpsc::channel::<Arc<Event>>(capacity.max(1));

    let task = tokio::spawn(async move {
        let id = subscriber.id();
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                next = rx.recv() => next,
            };
            let Some(event) = next else { break };

            let delivered = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                delivered = hub.deliverer.deliver(&subscriber, event, timeout) => delivered,
            };
            match delivered {
                Ok(()) => {}
                Err(err @ DeliveryError::ThresholdExceeded { .. }) => {
                    warn!(subscriber = %id, %err, "removing unresponsive subscriber");
                    hub.remove(id);
                    break;
                }
                Err(err @ DeliveryError::Closed(_)) => {
                    debug!(subscriber = %id, %err, "subscriber went away");
                    hub.remove(id);
                    break;
                }
            }
        }
        hub.deliverer.forget(id);
    });

    Lane { tx, task }
}

/// Wait for a lane task. Returns `false` if it panicked or was aborted.
async fn join_lane(task: JoinHandle<()>) -> bool {
    match task.await {
        Ok(()) => true,
        Err(err) => {
            warn!(%err, "delivery lane ended abnormally");
            false
        }
    }
}

// ---------------------------------------------------------------------------
// Broadcaster
// ---------------------------------------------------------------------------

/// Fans one change feed out to every registered subscriber.
pub struct Broadcaster<S> {
    name: String,
    feed: Mutex<Option<ChangeFeedAdapter<S>>>,
    hub: Arc<Hub>,
    config: BroadcastConfig,
    state: Mutex<BroadcastState>,
}

impl<S: SnapshotSource> Broadcaster<S> {
    /// Create an idle broadcaster over `feed`.
    pub fn new(name: impl Into<String>, feed: ChangeFeedAdapter<S>, config: BroadcastConfig) -> Self {
        Self {
            name: name.into(),
            feed: Mutex::new(Some(feed)),
            hub: Arc::new(Hub {
                registry: SubscriberRegistry::new(),
                deliverer: BoundedDeliverer::new(config.failure_threshold),
            }),
            config,
            state: Mutex::new(BroadcastState::Idle),
        }
    }

    /// Name used in logs.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current lifecycle state.
    pub fn state(&self) -> BroadcastState {
        *self.state.lock()
    }

    /// Number of registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.hub.registry.len()
    }

    /// Create a subscriber handle and its inbox.
    /// The handle still has to be passed to [`Publisher::subscribe`].
    pub fn channel(&self) -> (Subscriber, Inbox) {
        subscriber::channel()
    }

    /// Consume the feed until it closes or `cancel` fires.
    ///
    /// Returns `Ok(())` when the feed closes normally, the feed's terminal error
    /// when it trips, and [`FeedcastError::Cancelled`] on cancellation. Every
    /// subscriber is unsubscribed before this returns.
    #[instrument(skip_all, fields(broadcaster = %self.name))]
    pub async fn start(&self, cancel: CancellationToken) -> Result<()> {
        let feed = {
            let mut state = self.state.lock();
            if *state != BroadcastState::Idle {
                return Err(FeedcastError::AlreadyStarted);
            }
            let feed = self.feed.lock().take().ok_or(FeedcastError::AlreadyStarted)?;
            *state = BroadcastState::Running;
            feed
        };

        let lanes_cancel = cancel.child_token();
        let mut lanes: HashMap<SubscriberId, Lane> = HashMap::new();
        let mut stream = feed.spawn(cancel.clone());
        info!("broadcaster running");

        let outcome = loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => break Err(FeedcastError::Cancelled),
                next = stream.next() => next,
            };
            let Some(record) = next else {
                break Ok(());
            };

            let terminal = match &record {
                ChangeRecord::Error(err) => Some(err.clone()),
                ChangeRecord::Change { document, .. } => {
                    debug!(document = %document.path, "publishing change");
                    None
                }
            };
            self.publish(&mut lanes, Arc::new(Event::from(record)), &lanes_cancel);

            if let Some(err) = terminal {
                warn!(%err, "change feed failed");
                break Err(FeedcastError::Feed(err));
            }
        };

        *self.state.lock() = BroadcastState::Draining;
        self.drain(lanes, lanes_cancel, matches!(outcome, Err(FeedcastError::Cancelled)))
            .await;

        let closed = self.hub.registry.unsubscribe_all();
        self.hub.deliverer.reset();
        *self.state.lock() = BroadcastState::Stopped;
        info!(closed, "broadcaster stopped");

        outcome
    }

    /// Queue `event` on the lane of every current subscriber.
    fn publish(
        &self,
        lanes: &mut HashMap<SubscriberId, Lane>,
        event: Arc<Event>,
        cancel: &CancellationToken,
    ) {
        let mut live = HashSet::new();

        self.hub.registry.for_each(|subscriber| {
            let id = subscriber.id();
            live.insert(id);

            let lane = lanes.entry(id).or_insert_with(|| {
                spawn_lane(
                    Arc::clone(&self.hub),
                    subscriber.clone(),
                    self.config.lane_capacity,
                    self.config.delivery_timeout,
                    cancel.clone(),
                )
            });
            match lane.tx.try_send(Arc::clone(&event)) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!(subscriber = %id, "delivery lane full, dropping event");
                }
                // The lane already removed its subscriber.
                Err(TrySendError::Closed(_)) => {}
            }
        });

        // Lanes of departed subscribers finish on their own once their sender drops.
        lanes.retain(|id, _| live.contains(id));
    }

    /// Let lanes flush what they hold, within one delivery timeout, unless cancelled.
    async fn drain(
        &self,
        lanes: HashMap<SubscriberId, Lane>,
        lanes_cancel: CancellationToken,
        cancelled: bool,
    ) {
        if !cancelled {
            let tasks: Vec<JoinHandle<()>> = lanes.into_values().map(|lane| lane.task).collect();
            let flushed = tokio::time::timeout(self.config.delivery_timeout, async {
                for task in tasks {
                    join_lane(task).await;
                }
            })
            .await;
            if flushed.is_err() {
                debug!("lanes still busy after drain window");
            }
        }
        lanes_cancel.cancel();
    }
}

impl<S: SnapshotSource> Publisher for Broadcaster<S> {
    fn subscribe(&self, subscriber: Subscriber) {
        let state = self.state.lock();
        if matches!(*state, BroadcastState::Draining | BroadcastState::Stopped) {
            debug!(subscriber = %subscriber.id(), "broadcaster stopping, closing new subscriber");
            subscriber.close();
            return;
        }
        self.hub.registry.subscribe(subscriber);
    }

    fn unsubscribe(&self, id: SubscriberId) {
        self.hub.remove(id);
    }
}

//! Timeout-bounded delivery with per-subscriber failure counting.
//!
//! A delivery that times out is dropped for that subscriber and counted. The
//! producer only hears about it once the subscriber has timed out
//! `failure_threshold` times, at which point the subscriber should be removed.
//! Successful deliveries do not clear the count; only [`BoundedDeliverer::forget`]
//! and [`BoundedDeliverer::reset`] do.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use feedcast_shared::SubscriberId;
use parking_lot::Mutex;
use tracing::warn;

use crate::event::Event;
use crate::subscriber::{SendOutcome, Subscriber};

/// Permanent delivery failure for one subscriber.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    /// The subscriber timed out too many times.
    #[error("subscriber {id} timed out {failures} times")]
    ThresholdExceeded { id: SubscriberId, failures: u32 },

    /// The subscriber's inbox is gone or its handle was closed.
    #[error("subscriber {0} is closed")]
    Closed(SubscriberId),
}

/// Delivers events to subscribers and isolates chronically slow ones.
pub struct BoundedDeliverer {
    failure_threshold: u32,
    failures: Mutex<HashMap<SubscriberId, u32>>,
}

impl BoundedDeliverer {
    /// Create a deliverer tripping after `failure_threshold` timeouts per subscriber.
    pub fn new(failure_threshold: u32) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Hand `event` to `subscriber`, waiting at most `timeout`.
    ///
    /// A timeout below the threshold still returns `Ok`: the event is simply lost
    /// for this subscriber.
    pub async fn deliver(
        &self,
        subscriber: &Subscriber,
        event: Arc<Event>,
        timeout: Duration,
    ) -> Result<(), DeliveryError> {
        let id = subscriber.id();
        match subscriber.send_timeout(event, timeout).await {
            SendOutcome::Delivered => Ok(()),
            SendOutcome::Closed => Err(DeliveryError::Closed(id)),
            // Removed while the send was pending; do not resurrect its counter.
            SendOutcome::TimedOut if subscriber.is_closed() => Err(DeliveryError::Closed(id)),
            SendOutcome::TimedOut => {
                let failures = {
                    let mut counts = self.failures.lock();
                    let count = counts.entry(id).or_insert(0);
                    *count += 1;
                    *count
                };
                if failures >= self.failure_threshold {
                    return Err(DeliveryError::ThresholdExceeded { id, failures });
                }
                warn!(
                    subscriber = %id,
                    failures,
                    threshold = self.failure_threshold,
                    "delivery timed out, event dropped for subscriber"
                );
                Ok(())
            }
        }
    }

    /// Current timeout count for `id`.
    pub fn failures(&self, id: SubscriberId) -> u32 {
        self.failures.lock().get(&id).copied().unwrap_or(0)
    }

    /// Drop the counter of a removed subscriber.
    pub fn forget(&self, id: SubscriberId) {
        self.failures.lock().remove(&id);
    }

    /// Drop every counter.
    pub fn reset(&self) {
        self.failures.lock().clear();
    }
}

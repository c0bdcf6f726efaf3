//! Downstream handler loop.
//!
//! Every enrichment workflow consumes a broadcaster the same way: subscribe,
//! handle events until the subscription ends, bail out on a feed error, and
//! unsubscribe on the way out. [`consume`] is that loop.

use std::future::Future;
use std::sync::Arc;

use feedcast_shared::{FeedcastError, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::broadcaster::Publisher;
use crate::event::Event;
use crate::subscriber::{Inbox, Subscriber};

/// Subscribe `subscriber` to `publisher` and run `handler` for each event.
///
/// Returns the number of handled events once the subscription is closed,
/// [`FeedcastError::Feed`] when an error event arrives (the feed is no longer
/// live), or [`FeedcastError::Cancelled`]. The subscriber is always unsubscribed
/// before returning.
pub async fn consume<P, F, Fut>(
    publisher: &P,
    subscriber: Subscriber,
    mut inbox: Inbox,
    cancel: CancellationToken,
    mut handler: F,
) -> Result<u64>
where
    P: Publisher + ?Sized,
    F: FnMut(Arc<Event>) -> Fut,
    Fut: Future<Output = ()>,
{
    let id = subscriber.id();
    publisher.subscribe(subscriber);

    let mut handled: u64 = 0;
    let outcome = loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => break Err(FeedcastError::Cancelled),
            next = inbox.recv() => next,
        };
        let Some(event) = next else {
            debug!(subscriber = %id, handled, "subscription closed");
            break Ok(handled);
        };

        if let Some(err) = &event.error {
            error!(subscriber = %id, %err, "feed reported an error");
            break Err(FeedcastError::Feed(err.clone()));
        }

        handler(event).await;
        handled += 1;
    };

    publisher.unsubscribe(id);
    outcome
}

//! Subscriber handles and inboxes.
//!
//! [`channel`] mints a [`SubscriberId`] and returns the two halves of a
//! subscription: the cloneable [`Subscriber`] handle that is registered with a
//! publisher, and the [`Inbox`] the downstream handler drains.
//!
//! Hand-off is a rendezvous. A send only completes once the inbox has taken the
//! event, so a handler that stops reading makes every send time out. An event
//! whose sender gave up is skipped by the inbox. Closing the handle is a one-way
//! switch after which the inbox reports the end of the subscription.

use std::sync::Arc;
use std::time::Duration;

use feedcast_shared::SubscriberId;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::event::Event;

/// Create a subscriber handle and its inbox.
pub fn channel() -> (Subscriber, Inbox) {
    let id = SubscriberId::new();
    let (tx, rx) = mpsc::channel(1);
    let closed = CancellationToken::new();

    let subscriber = Subscriber {
        id,
        outbox: Arc::new(Outbox {
            tx,
            closed: closed.clone(),
        }),
    };
    let inbox = Inbox { id, rx, closed };
    (subscriber, inbox)
}

/// An event in flight, acknowledged by the inbox when taken.
struct Handoff {
    event: Arc<Event>,
    taken: oneshot::Sender<()>,
}

struct Outbox {
    tx: mpsc::Sender<Handoff>,
    closed: CancellationToken,
}

/// Result of one timed hand-off into an inbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SendOutcome {
    Delivered,
    TimedOut,
    Closed,
}

/// Sending side of a subscription. Identity is the [`SubscriberId`].
#[derive(Clone)]
pub struct Subscriber {
    id: SubscriberId,
    outbox: Arc<Outbox>,
}

impl Subscriber {
    /// Identity of this subscription.
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Whether the handle was closed or the inbox dropped.
    pub fn is_closed(&self) -> bool {
        self.outbox.closed.is_cancelled() || self.outbox.tx.is_closed()
    }

    /// Close the subscription. Returns `false` if it was already closed.
    pub(crate) fn close(&self) -> bool {
        if self.outbox.closed.is_cancelled() {
            return false;
        }
        self.outbox.closed.cancel();
        true
    }

    /// Offer one event, waiting at most `timeout` for the inbox to take it.
    pub(crate) async fn send_timeout(&self, event: Arc<Event>, timeout: Duration) -> SendOutcome {
        if self.outbox.closed.is_cancelled() {
            return SendOutcome::Closed;
        }

        let (taken, mut ack) = oneshot::channel();
        let outcome = tokio::select! {
            biased;
            _ = self.outbox.closed.cancelled() => SendOutcome::Closed,
            handed = tokio::time::timeout(timeout, async {
                if self.outbox.tx.send(Handoff { event, taken }).await.is_err() {
                    return SendOutcome::Closed;
                }
                match (&mut ack).await {
                    Ok(()) => SendOutcome::Delivered,
                    Err(_) => SendOutcome::Closed,
                }
            }) => handed.unwrap_or(SendOutcome::TimedOut),
        };

        if outcome == SendOutcome::Delivered {
            return outcome;
        }
        // Withdraw the offer; the inbox may have taken it just before we gave up.
        ack.close();
        match ack.try_recv() {
            Ok(()) => SendOutcome::Delivered,
            Err(_) => outcome,
        }
    }
}

impl std::fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscriber")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Receiving side of a subscription, owned by the downstream handler.
pub struct Inbox {
    id: SubscriberId,
    rx: mpsc::Receiver<Handoff>,
    closed: CancellationToken,
}

impl Inbox {
    /// Identity of the subscription this inbox belongs to.
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Next event; `None` once the subscription is closed.
    pub async fn recv(&mut self) -> Option<Arc<Event>> {
        tokio::select! {
            biased;
            event = take(&mut self.rx) => event,
            _ = self.closed.cancelled() => None,
        }
    }

    /// Whether the subscription has been closed by its publisher.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

/// Take the next event whose sender is still waiting for it.
async fn take(rx: &mut mpsc::Receiver<Handoff>) -> Option<Arc<Event>> {
    while let Some(handoff) = rx.recv().await {
        if handoff.taken.send(()).is_ok() {
            return Some(handoff.event);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use feedcast_shared::DocumentSnapshot;

    fn event(id: &str) -> Arc<Event> {
        Arc::new(Event::change(DocumentSnapshot::new(
            "products",
            id,
            serde_json::json!({}),
        )))
    }

    #[tokio::test]
    async fn delivers_into_a_waiting_inbox() {
        let (subscriber, mut inbox) = channel();
        assert_eq!(subscriber.id(), inbox.id());

        let reader = tokio::spawn(async move { inbox.recv().await });
        let outcome = subscriber
            .send_timeout(event("a"), Duration::from_secs(1))
            .await;
        assert_eq!(outcome, SendOutcome::Delivered);

        let received = reader.await.unwrap().expect("event");
        assert_eq!(received.document.as_ref().unwrap().id, "a");
    }

    #[tokio::test(start_paused = true)]
    async fn idle_inbox_times_out_from_the_first_event() {
        let (subscriber, _inbox) = channel();
        let timeout = Duration::from_millis(50);
        for id in ["a", "b", "c"] {
            assert_eq!(
                subscriber.send_timeout(event(id), timeout).await,
                SendOutcome::TimedOut
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_events_are_skipped() {
        let (subscriber, mut inbox) = channel();
        assert_eq!(
            subscriber
                .send_timeout(event("stale"), Duration::from_millis(50))
                .await,
            SendOutcome::TimedOut
        );

        let reader = tokio::spawn(async move { inbox.recv().await });
        assert_eq!(
            subscriber
                .send_timeout(event("fresh"), Duration::from_millis(50))
                .await,
            SendOutcome::Delivered
        );
        let received = reader.await.unwrap().expect("event");
        assert_eq!(received.document.as_ref().unwrap().id, "fresh");
    }

    #[tokio::test]
    async fn close_ends_the_inbox() {
        let (subscriber, mut inbox) = channel();

        assert!(subscriber.close());
        assert!(!subscriber.close(), "second close is a no-op");
        assert!(inbox.is_closed());

        assert!(inbox.recv().await.is_none());
        assert_eq!(
            subscriber
                .send_timeout(event("b"), Duration::from_millis(10))
                .await,
            SendOutcome::Closed
        );
    }

    #[tokio::test(start_paused = true)]
    async fn close_interrupts_a_pending_send() {
        let (subscriber, _inbox) = channel();
        let sender = subscriber.clone();
        let pending = tokio::spawn(async move {
            sender.send_timeout(event("a"), Duration::from_secs(60)).await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        subscriber.close();
        assert_eq!(pending.await.unwrap(), SendOutcome::Closed);
    }

    #[tokio::test]
    async fn dropped_inbox_reads_as_closed() {
        let (subscriber, inbox) = channel();
        drop(inbox);
        assert!(subscriber.is_closed());
        assert_eq!(
            subscriber
                .send_timeout(event("a"), Duration::from_millis(10))
                .await,
            SendOutcome::Closed
        );
    }
}

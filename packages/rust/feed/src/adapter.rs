//! Two-stage change feed adapter with a circuit breaker.
//!
//! ```text
//! SnapshotSource ──(reader)──▶ pipe ──(filter)──▶ ChangeStream
//! ```
//!
//! The **reader** stage pulls raw snapshots from the store and hands them to the
//! pipe, retrying a hand-off that exceeds `inner_retry_timeout` until the
//! `inner_retry_budget` is spent. The **filter** stage keeps only changes of the
//! requested kind that reference an existing document, and gives each record at
//! most `delivery_timeout` to be accepted downstream before dropping it.
//!
//! Upstream errors feed a counter. Cancellation-flavoured errors close the feed
//! quietly; anything else is logged and counted, and once the count passes
//! `error_tolerance_cap` a single [`ChangeRecord::Error`] is emitted and the feed
//! closes. Every wait in both stages races the cancellation token.

use std::time::Duration;

use feedcast_shared::{
    ChangeKind, DocumentSnapshot, FeedConfig, FeedError, Result, SourceError,
};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::query::FeedQuery;
use crate::source::{ChangeSource, Snapshot, SnapshotSource};

type SourceItem = std::result::Result<Snapshot, SourceError>;

/// Buffer of the adapter's output channel.
const OUTPUT_CAPACITY: usize = 1;

// ---------------------------------------------------------------------------
// ChangeRecord / ChangeStream
// ---------------------------------------------------------------------------

/// One item of the adapted feed: either an observed change or the terminal error.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeRecord {
    /// A change of the requested kind to an existing document.
    Change {
        kind: ChangeKind,
        document: DocumentSnapshot,
    },
    /// The feed failed permanently; nothing follows this record.
    Error(FeedError),
}

/// Receiving end of an adapted feed. Ends when the feed closes.
pub struct ChangeStream {
    rx: mpsc::Receiver<ChangeRecord>,
}

impl ChangeStream {
    /// Wait for the next record; `None` once the feed has closed.
    pub async fn next(&mut self) -> Option<ChangeRecord> {
        self.rx.recv().await
    }
}

// ---------------------------------------------------------------------------
// ChangeFeedAdapter
// ---------------------------------------------------------------------------

/// Wraps a [`SnapshotSource`] into a [`ChangeStream`] of one change kind.
pub struct ChangeFeedAdapter<S> {
    source: S,
    kind: ChangeKind,
    config: FeedConfig,
}

impl<S: SnapshotSource> ChangeFeedAdapter<S> {
    /// Adapt an already-open snapshot stream, forwarding only `kind` changes.
    pub fn new(source: S, kind: ChangeKind, config: FeedConfig) -> Self {
        Self {
            source,
            kind,
            config,
        }
    }

    /// Open a listener for `query` on `store` and adapt it.
    pub fn open<C>(store: &C, query: &FeedQuery, config: FeedConfig) -> Result<Self>
    where
        C: ChangeSource<Listener = S>,
    {
        let source = store.listen(query)?;
        info!(
            collection = %query.collection,
            kind = %query.kind,
            filters = query.filters.len(),
            "opened change feed"
        );
        Ok(Self::new(source, query.kind, config))
    }

    /// Change kind this adapter forwards.
    pub fn kind(&self) -> ChangeKind {
        self.kind
    }

    /// Start both stages on the current runtime and return the adapted stream.
    pub fn spawn(self, cancel: CancellationToken) -> ChangeStream {
        let (pipe_tx, pipe_rx) = mpsc::channel(self.config.pipe_capacity.max(1));
        let (out_tx, out_rx) = mpsc::channel(OUTPUT_CAPACITY);

        tokio::spawn(read_snapshots(
            self.source,
            pipe_tx,
            cancel.clone(),
            self.config.inner_retry_budget,
            self.config.inner_retry_timeout,
        ));
        tokio::spawn(filter_changes(
            pipe_rx,
            out_tx,
            self.kind,
            self.config,
            cancel,
        ));

        ChangeStream { rx: out_rx }
    }
}

/// Reader stage: source → pipe, with bounded hand-off retries.
#[instrument(skip_all, fields(budget = retry_budget))]
async fn read_snapshots<S: SnapshotSource>(
    mut source: S,
    pipe: mpsc::Sender<SourceItem>,
    cancel: CancellationToken,
    retry_budget: u32,
    retry_timeout: Duration,
) {
    let mut timeouts: u32 = 0;

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            next = source.next_snapshot() => next,
        };
        let Some(mut item) = next else {
            debug!("snapshot source completed");
            return;
        };

        loop {
            let sent = tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                sent = pipe.send_timeout(item, retry_timeout) => sent,
            };
            match sent {
                Ok(()) => break,
                Err(SendTimeoutError::Timeout(unsent)) => {
                    timeouts += 1;
                    if timeouts > retry_budget {
                        error!(timeouts, "snapshot hand-off retries exhausted, stopping reader");
                        return;
                    }
                    warn!(timeouts, "timed out handing a snapshot to the filter stage, retrying");
                    item = unsent;
                }
                // Filter stage is gone; nobody is left to read.
                Err(SendTimeoutError::Closed(_)) => return,
            }
        }
    }
}

/// Outcome of offering one record downstream.
enum Offer {
    Accepted,
    Dropped,
    Stopped,
}

async fn offer(
    out: &mpsc::Sender<ChangeRecord>,
    record: ChangeRecord,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Offer {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Offer::Stopped,
        sent = out.send_timeout(record, timeout) => match sent {
            Ok(()) => Offer::Accepted,
            Err(SendTimeoutError::Timeout(_)) => {
                warn!(timeout_ms = timeout.as_millis() as u64, "timed out delivering a change, dropping it");
                Offer::Dropped
            }
            Err(SendTimeoutError::Closed(_)) => Offer::Stopped,
        },
    }
}

/// Filter stage: pipe → output, with the error circuit breaker.
#[instrument(skip_all, fields(kind = %kind, cap = config.error_tolerance_cap))]
async fn filter_changes(
    mut pipe: mpsc::Receiver<SourceItem>,
    out: mpsc::Sender<ChangeRecord>,
    kind: ChangeKind,
    config: FeedConfig,
    cancel: CancellationToken,
) {
    // Counted over the whole stream; successful snapshots do not clear it.
    let mut errors: u32 = 0;

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            next = pipe.recv() => next,
        };
        let Some(item) = next else {
            debug!("snapshot pipe closed, closing feed");
            return;
        };

        let snapshot = match item {
            Ok(snapshot) => snapshot,
            Err(err) if err.is_cancellation() => {
                debug!(%err, "source cancelled, closing feed");
                return;
            }
            Err(err) => {
                errors += 1;
                error!(%err, errors, "error reading snapshots");
                if errors <= config.error_tolerance_cap {
                    continue;
                }
                let record = ChangeRecord::Error(FeedError::ToleranceExceeded { errors, last: err });
                offer(&out, record, config.delivery_timeout, &cancel).await;
                return;
            }
        };

        for change in snapshot.changes {
            if change.kind != kind {
                continue;
            }
            // Changes without a live document are noise, not errors.
            let Some(document) = change.document.filter(|doc| doc.exists) else {
                continue;
            };

            let record = ChangeRecord::Change {
                kind: change.kind,
                document,
            };
            if let Offer::Stopped = offer(&out, record, config.delivery_timeout, &cancel).await {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use crate::query::Op;
    use crate::source::RawChange;
    use serde_json::json;
    use std::collections::VecDeque;
    use tokio::sync::oneshot;

    /// Source replaying a fixed script, then completing or hanging.
    struct ScriptedSource {
        items: VecDeque<SourceItem>,
        hang_when_done: bool,
        _dropped: Option<oneshot::Sender<()>>,
    }

    impl ScriptedSource {
        fn completing(items: Vec<SourceItem>) -> Self {
            Self {
                items: items.into(),
                hang_when_done: false,
                _dropped: None,
            }
        }

        fn hanging(items: Vec<SourceItem>) -> (Self, oneshot::Receiver<()>) {
            let (tx, rx) = oneshot::channel();
            let source = Self {
                items: items.into(),
                hang_when_done: true,
                _dropped: Some(tx),
            };
            (source, rx)
        }
    }

    impl SnapshotSource for ScriptedSource {
        async fn next_snapshot(&mut self) -> Option<SourceItem> {
            match self.items.pop_front() {
                Some(item) => Some(item),
                None if self.hang_when_done => std::future::pending().await,
                None => None,
            }
        }
    }

    fn change(kind: ChangeKind, id: &str) -> RawChange {
        RawChange {
            kind,
            document: Some(DocumentSnapshot::new("products", id, json!({"id": id}))),
        }
    }

    fn added(id: &str) -> SourceItem {
        Ok(Snapshot::new(vec![change(ChangeKind::Added, id)]))
    }

    fn failure(msg: &str) -> SourceItem {
        Err(SourceError::Unavailable(msg.into()))
    }

    async fn collect(mut stream: ChangeStream) -> Vec<ChangeRecord> {
        let mut records = Vec::new();
        while let Some(record) = stream.next().await {
            records.push(record);
        }
        records
    }

    fn ids(records: &[ChangeRecord]) -> Vec<String> {
        records
            .iter()
            .filter_map(|r| match r {
                ChangeRecord::Change { document, .. } => Some(document.id.clone()),
                ChangeRecord::Error(_) => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn forwards_only_requested_kind_with_live_documents() {
        let snapshot = Snapshot::new(vec![
            change(ChangeKind::Added, "a"),
            change(ChangeKind::Modified, "b"),
            change(ChangeKind::Removed, "c"),
            RawChange {
                kind: ChangeKind::Added,
                document: None,
            },
            RawChange {
                kind: ChangeKind::Added,
                document: Some(DocumentSnapshot::missing("products", "ghost")),
            },
            change(ChangeKind::Added, "d"),
        ]);
        let source = ScriptedSource::completing(vec![Ok(snapshot)]);
        let adapter = ChangeFeedAdapter::new(source, ChangeKind::Added, FeedConfig::default());

        let records = collect(adapter.spawn(CancellationToken::new())).await;
        assert_eq!(ids(&records), vec!["a", "d"]);
        assert!(records.iter().all(|r| matches!(
            r,
            ChangeRecord::Change { kind: ChangeKind::Added, .. }
        )));
    }

    #[tokio::test]
    async fn modified_feed_ignores_additions() {
        let snapshot = Snapshot::new(vec![
            change(ChangeKind::Added, "a"),
            change(ChangeKind::Modified, "b"),
        ]);
        let source = ScriptedSource::completing(vec![Ok(snapshot)]);
        let adapter = ChangeFeedAdapter::new(source, ChangeKind::Modified, FeedConfig::default());

        let records = collect(adapter.spawn(CancellationToken::new())).await;
        assert_eq!(ids(&records), vec!["b"]);
    }

    #[tokio::test]
    async fn trips_after_tolerance_cap_is_exceeded() {
        let config = FeedConfig {
            error_tolerance_cap: 2,
            ..FeedConfig::default()
        };
        let source = ScriptedSource::completing(vec![
            failure("one"),
            failure("two"),
            failure("three"),
            added("never-seen"),
        ]);
        let adapter = ChangeFeedAdapter::new(source, ChangeKind::Added, config);

        let records = collect(adapter.spawn(CancellationToken::new())).await;
        assert_eq!(
            records,
            vec![ChangeRecord::Error(FeedError::ToleranceExceeded {
                errors: 3,
                last: SourceError::Unavailable("three".into()),
            })]
        );
    }

    #[tokio::test]
    async fn errors_count_across_successful_snapshots() {
        let config = FeedConfig {
            error_tolerance_cap: 2,
            ..FeedConfig::default()
        };
        let source = ScriptedSource::completing(vec![
            failure("one"),
            added("a"),
            failure("two"),
            added("b"),
            failure("three"),
            added("never-seen"),
        ]);
        let adapter = ChangeFeedAdapter::new(source, ChangeKind::Added, config);

        let records = collect(adapter.spawn(CancellationToken::new())).await;
        assert_eq!(ids(&records), vec!["a", "b"]);
        assert_eq!(records.len(), 3);
        assert_eq!(
            records[2],
            ChangeRecord::Error(FeedError::ToleranceExceeded {
                errors: 3,
                last: SourceError::Unavailable("three".into()),
            })
        );
    }

    #[tokio::test]
    async fn cancellation_errors_close_quietly() {
        let source = ScriptedSource::completing(vec![
            added("a"),
            Err(SourceError::classify("rpc error: context canceled")),
            added("b"),
        ]);
        let adapter = ChangeFeedAdapter::new(source, ChangeKind::Added, FeedConfig::default());

        let records = collect(adapter.spawn(CancellationToken::new())).await;
        assert_eq!(ids(&records), vec!["a"]);
    }

    #[tokio::test]
    async fn cancel_token_closes_a_silent_feed() {
        let (source, dropped) = ScriptedSource::hanging(vec![added("a")]);
        let adapter = ChangeFeedAdapter::new(source, ChangeKind::Added, FeedConfig::default());
        let cancel = CancellationToken::new();
        let mut stream = adapter.spawn(cancel.clone());

        assert!(matches!(stream.next().await, Some(ChangeRecord::Change { .. })));
        cancel.cancel();
        assert!(stream.next().await.is_none());
        // The reader releases the source once cancelled.
        assert!(dropped.await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_consumer_loses_records_instead_of_blocking() {
        let snapshot = Snapshot::new(vec![
            change(ChangeKind::Added, "a"),
            change(ChangeKind::Added, "b"),
            change(ChangeKind::Added, "c"),
        ]);
        let source = ScriptedSource::completing(vec![Ok(snapshot)]);
        let adapter = ChangeFeedAdapter::new(source, ChangeKind::Added, FeedConfig::default());
        let stream = adapter.spawn(CancellationToken::new());

        // "a" sits in the output buffer; "b" and "c" each wait a minute and are dropped.
        tokio::time::sleep(Duration::from_secs(150)).await;
        let records = collect(stream).await;
        assert_eq!(ids(&records), vec!["a"]);
    }

    #[tokio::test(start_paused = true)]
    async fn reader_gives_up_after_retry_budget() {
        let config = FeedConfig {
            delivery_timeout: Duration::from_secs(1000),
            inner_retry_budget: 1,
            inner_retry_timeout: Duration::from_secs(10),
            ..FeedConfig::default()
        };
        let (source, dropped) =
            ScriptedSource::hanging(vec![added("1"), added("2"), added("3"), added("4")]);
        let adapter = ChangeFeedAdapter::new(source, ChangeKind::Added, config);
        let stream = adapter.spawn(CancellationToken::new());

        // Nobody reads: "1" is buffered, "2" blocks the filter, "3" fills the pipe,
        // and "4" times out twice before the reader stops.
        let released = tokio::time::timeout(Duration::from_secs(60), dropped).await;
        assert!(released.is_ok(), "reader should release the source");

        let records = collect(stream).await;
        assert_eq!(ids(&records), vec!["1", "2", "3"]);
    }

    #[tokio::test]
    async fn opens_from_a_change_source() {
        let store = MemoryStore::new();
        store.insert("products", "old", json!({"sentimentAnalized": false}));
        let query = FeedQuery::added_in("products").filter("sentimentAnalized", Op::Equal, false);

        let adapter = ChangeFeedAdapter::open(&store, &query, FeedConfig::default())
            .expect("open feed");
        assert_eq!(adapter.kind(), ChangeKind::Added);
        let stream = adapter.spawn(CancellationToken::new());

        store.insert("products", "new", json!({"sentimentAnalized": false}));
        store.insert("products", "done", json!({"sentimentAnalized": true}));
        store.close();

        let records = collect(stream).await;
        assert_eq!(ids(&records), vec!["old", "new"]);
    }
}

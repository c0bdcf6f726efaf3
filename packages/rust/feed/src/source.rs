//! Traits and raw types a watched document store provides.

use std::future::Future;

use chrono::{DateTime, Utc};
use feedcast_shared::{ChangeKind, DocumentSnapshot, Result, SourceError};

use crate::query::FeedQuery;

/// One change inside a snapshot, exactly as the store reported it.
#[derive(Debug, Clone)]
pub struct RawChange {
    /// What happened to the document.
    pub kind: ChangeKind,
    /// The document read; stores may omit it for some change types.
    pub document: Option<DocumentSnapshot>,
}

/// One batch of changes delivered by the store at a point in time.
#[derive(Debug, Clone)]
pub struct Snapshot {
    /// Changes since the previous snapshot, in store order.
    pub changes: Vec<RawChange>,
    /// When the store produced the snapshot.
    pub read_at: DateTime<Utc>,
}

impl Snapshot {
    /// Build a snapshot stamped with the current time.
    pub fn new(changes: Vec<RawChange>) -> Self {
        Self {
            changes,
            read_at: Utc::now(),
        }
    }
}

/// A live stream of snapshots for one query.
///
/// `None` means the store completed the stream normally; an error does not end it.
pub trait SnapshotSource: Send + 'static {
    /// Wait for the next snapshot.
    fn next_snapshot(
        &mut self,
    ) -> impl Future<Output = Option<std::result::Result<Snapshot, SourceError>>> + Send;
}

/// A store that can open snapshot streams for a [`FeedQuery`].
///
/// Predicates in the query are evaluated by the store, never by the adapter.
pub trait ChangeSource: Send + Sync {
    /// Listener type produced by [`ChangeSource::listen`].
    type Listener: SnapshotSource;

    /// Open a live snapshot stream for `query`.
    fn listen(&self, query: &FeedQuery) -> Result<Self::Listener>;
}

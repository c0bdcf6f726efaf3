//! In-process document store that speaks the [`ChangeSource`] protocol.
//!
//! Every mutation is pushed synchronously to each live listener as a one-change
//! snapshot, so tests and local replays see exactly the change stream a remote
//! store would produce for the same sequence of writes.

use std::collections::BTreeMap;
use std::sync::Arc;

use feedcast_shared::{ChangeKind, DocumentSnapshot, FeedcastError, Result, SourceError};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

use crate::query::FeedQuery;
use crate::source::{ChangeSource, RawChange, Snapshot, SnapshotSource};

type SourceItem = std::result::Result<Snapshot, SourceError>;

struct ListenerSlot {
    query: FeedQuery,
    tx: mpsc::UnboundedSender<SourceItem>,
}

#[derive(Default)]
struct StoreState {
    collections: BTreeMap<String, BTreeMap<String, Value>>,
    listeners: Vec<ListenerSlot>,
    closed: bool,
}

impl StoreState {
    fn snapshot_of(&self, collection: &str, id: &str) -> Option<DocumentSnapshot> {
        self.collections
            .get(collection)
            .and_then(|docs| docs.get(id))
            .map(|data| DocumentSnapshot::new(collection, id, data.clone()))
    }

    /// Push the effect of one write to every listener it concerns.
    fn notify(&mut self, before: Option<DocumentSnapshot>, after: Option<DocumentSnapshot>) {
        self.listeners.retain(|slot| {
            let was_in = before.as_ref().is_some_and(|d| slot.query.matches(d));
            let is_in = after.as_ref().is_some_and(|d| slot.query.matches(d));
            let change = match (was_in, is_in) {
                (false, true) => RawChange {
                    kind: ChangeKind::Added,
                    document: after.clone(),
                },
                (true, true) => RawChange {
                    kind: ChangeKind::Modified,
                    document: after.clone(),
                },
                (true, false) => RawChange {
                    kind: ChangeKind::Removed,
                    document: before.clone(),
                },
                (false, false) => return true,
            };
            slot.tx.send(Ok(Snapshot::new(vec![change]))).is_ok()
        });
    }
}

/// A thread-safe, cloneable in-memory document store.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<StoreState>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or overwrite a document.
    pub fn insert(&self, collection: &str, id: &str, data: Value) {
        let mut state = self.state.lock();
        let before = state.snapshot_of(collection, id);
        state
            .collections
            .entry(collection.to_string())
            .or_default()
            .insert(id.to_string(), data);
        let after = state.snapshot_of(collection, id);
        state.notify(before, after);
    }

    /// Merge the top-level fields of `patch` into an existing document.
    pub fn update(&self, collection: &str, id: &str, patch: Value) -> Result<()> {
        let Value::Object(fields) = patch else {
            return Err(FeedcastError::validation("update patch must be a JSON object"));
        };

        let mut state = self.state.lock();
        let before = state.snapshot_of(collection, id);
        let doc = state
            .collections
            .get_mut(collection)
            .and_then(|docs| docs.get_mut(id))
            .ok_or_else(|| {
                FeedcastError::validation(format!("document {collection}/{id} not found"))
            })?;

        match doc {
            Value::Object(existing) => existing.extend(fields),
            other => *other = Value::Object(fields),
        }

        let after = state.snapshot_of(collection, id);
        state.notify(before, after);
        Ok(())
    }

    /// Delete a document. Returns whether it existed.
    pub fn remove(&self, collection: &str, id: &str) -> bool {
        let mut state = self.state.lock();
        let before = state.snapshot_of(collection, id);
        let existed = state
            .collections
            .get_mut(collection)
            .and_then(|docs| docs.remove(id))
            .is_some();
        if existed {
            state.notify(before, None);
        }
        existed
    }

    /// Read a document.
    pub fn get(&self, collection: &str, id: &str) -> Option<DocumentSnapshot> {
        self.state.lock().snapshot_of(collection, id)
    }

    /// Deliver a read error to every live listener.
    pub fn inject_error(&self, error: SourceError) {
        self.state
            .lock()
            .listeners
            .retain(|slot| slot.tx.send(Err(error.clone())).is_ok());
    }

    /// Complete every listener normally; later listens complete immediately.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.listeners.clear();
        debug!("memory store closed");
    }

    /// Number of listeners still attached.
    pub fn listener_count(&self) -> usize {
        self.state.lock().listeners.len()
    }
}

impl ChangeSource for MemoryStore {
    type Listener = MemoryListener;

    fn listen(&self, query: &FeedQuery) -> Result<MemoryListener> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock();

        // The first snapshot carries the current result set, like a remote store.
        let existing: Vec<RawChange> = state
            .collections
            .get(&query.collection)
            .into_iter()
            .flat_map(|docs| docs.iter())
            .map(|(id, data)| DocumentSnapshot::new(&query.collection, id.as_str(), data.clone()))
            .filter(|doc| query.matches(doc))
            .map(|doc| RawChange {
                kind: ChangeKind::Added,
                document: Some(doc),
            })
            .collect();
        let _ = tx.send(Ok(Snapshot::new(existing)));

        if !state.closed {
            state.listeners.push(ListenerSlot {
                query: query.clone(),
                tx,
            });
        }
        Ok(MemoryListener { rx })
    }
}

/// Snapshot stream handed out by [`MemoryStore::listen`].
pub struct MemoryListener {
    rx: mpsc::UnboundedReceiver<SourceItem>,
}

impl SnapshotSource for MemoryListener {
    async fn next_snapshot(&mut self) -> Option<SourceItem> {
        self.rx.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::Op;
    use serde_json::json;

    fn pending_query() -> FeedQuery {
        FeedQuery::added_in("products").filter("sentimentAnalized", Op::Equal, false)
    }

    async fn next_change(listener: &mut MemoryListener) -> RawChange {
        let snapshot = listener
            .next_snapshot()
            .await
            .expect("listener open")
            .expect("snapshot");
        assert_eq!(snapshot.changes.len(), 1);
        snapshot.changes.into_iter().next().unwrap()
    }

    #[tokio::test]
    async fn first_snapshot_lists_matching_documents() {
        let store = MemoryStore::new();
        store.insert("products", "a", json!({"sentimentAnalized": false}));
        store.insert("products", "b", json!({"sentimentAnalized": true}));
        store.insert("orders", "c", json!({"sentimentAnalized": false}));

        let mut listener = store.listen(&pending_query()).expect("listen");
        let first = listener.next_snapshot().await.unwrap().unwrap();
        assert_eq!(first.changes.len(), 1);
        assert_eq!(first.changes[0].kind, ChangeKind::Added);
        assert_eq!(first.changes[0].document.as_ref().unwrap().id, "a");
    }

    #[tokio::test]
    async fn writes_map_to_change_kinds() {
        let store = MemoryStore::new();
        let mut listener = store.listen(&pending_query()).expect("listen");
        let _initial = listener.next_snapshot().await;

        store.insert("products", "p-1", json!({"sentimentAnalized": false, "name": "kettle"}));
        assert_eq!(next_change(&mut listener).await.kind, ChangeKind::Added);

        store
            .update("products", "p-1", json!({"name": "teapot"}))
            .expect("update");
        let change = next_change(&mut listener).await;
        assert_eq!(change.kind, ChangeKind::Modified);
        assert_eq!(change.document.unwrap().field("name"), Some(&json!("teapot")));

        // Leaving the filter's result set is a removal.
        store
            .update("products", "p-1", json!({"sentimentAnalized": true}))
            .expect("update");
        assert_eq!(next_change(&mut listener).await.kind, ChangeKind::Removed);

        store.insert("products", "p-2", json!({"sentimentAnalized": false}));
        assert_eq!(next_change(&mut listener).await.kind, ChangeKind::Added);
        assert!(store.remove("products", "p-2"));
        assert_eq!(next_change(&mut listener).await.kind, ChangeKind::Removed);
        assert!(!store.remove("products", "p-2"));
    }

    #[tokio::test]
    async fn errors_and_close_reach_listeners() {
        let store = MemoryStore::new();
        let mut listener = store.listen(&pending_query()).expect("listen");
        let _initial = listener.next_snapshot().await;

        store.inject_error(SourceError::Unavailable("backend down".into()));
        let item = listener.next_snapshot().await.expect("listener open");
        assert_eq!(
            item.unwrap_err(),
            SourceError::Unavailable("backend down".into())
        );

        store.close();
        assert!(listener.next_snapshot().await.is_none());
        assert_eq!(store.listener_count(), 0);
    }

    #[tokio::test]
    async fn update_missing_document_fails() {
        let store = MemoryStore::new();
        let err = store
            .update("products", "nope", json!({"a": 1}))
            .unwrap_err();
        assert!(err.to_string().contains("products/nope"));
        assert!(store.update("products", "nope", json!(3)).is_err());
    }
}

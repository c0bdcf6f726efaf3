//! Core domain types shared by the feed and the broadcaster.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// ChangeKind
// ---------------------------------------------------------------------------

/// The kind of change a store reports for a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    /// The document entered the query's result set.
    Added,
    /// The document changed but stayed in the result set.
    Modified,
    /// The document left the result set (deleted or no longer matching).
    Removed,
}

impl std::fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Added => "added",
            Self::Modified => "modified",
            Self::Removed => "removed",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for ChangeKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "added" => Ok(Self::Added),
            "modified" => Ok(Self::Modified),
            "removed" => Ok(Self::Removed),
            other => Err(format!("unknown change kind '{other}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// DocumentSnapshot
// ---------------------------------------------------------------------------

/// A point-in-time read of one document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentSnapshot {
    /// Full path, `<collection>/<id>`.
    pub path: String,
    /// Document identifier within its collection.
    pub id: String,
    /// False when the snapshot describes a document that no longer exists.
    pub exists: bool,
    /// Document fields.
    #[serde(default)]
    pub data: serde_json::Value,
    /// When the snapshot was read from the store.
    pub read_at: DateTime<Utc>,
}

impl DocumentSnapshot {
    /// Snapshot of an existing document.
    pub fn new(collection: &str, id: impl Into<String>, data: serde_json::Value) -> Self {
        let id = id.into();
        Self {
            path: format!("{collection}/{id}"),
            id,
            exists: true,
            data,
            read_at: Utc::now(),
        }
    }

    /// Snapshot of a document that has been deleted.
    pub fn missing(collection: &str, id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            path: format!("{collection}/{id}"),
            id,
            exists: false,
            data: serde_json::Value::Null,
            read_at: Utc::now(),
        }
    }

    /// Look up a field by dotted path (`"stats.views"`).
    pub fn field(&self, path: &str) -> Option<&serde_json::Value> {
        path.split('.')
            .try_fold(&self.data, |value, segment| value.get(segment))
    }
}

// ---------------------------------------------------------------------------
// SubscriberId
// ---------------------------------------------------------------------------

/// Opaque identity of a subscriber, minted when its handle is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriberId(pub Uuid);

impl SubscriberId {
    /// Generate a new time-sortable subscriber identifier.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for SubscriberId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

//! JSON-lines replay scripts.
//!
//! One operation per line, tagged by `op`:
//!
//! ```text
//! {"op":"insert","collection":"products","id":"p1","data":{"sentimentAnalized":false}}
//! {"op":"update","collection":"products","id":"p1","data":{"sentimentAnalized":true}}
//! {"op":"remove","collection":"products","id":"p1"}
//! {"op":"error","message":"rpc error: code = Unavailable"}
//! {"op":"sleep","ms":250}
//! ```
//!
//! Blank lines and lines starting with `#` are skipped.

use std::time::Duration;

use feedcast_feed::MemoryStore;
use feedcast_shared::{FeedcastError, Result, SourceError};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

/// One scripted store mutation.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub(crate) enum ScriptOp {
    Insert {
        collection: String,
        id: String,
        #[serde(default = "empty_object")]
        data: Value,
    },
    Update {
        collection: String,
        id: String,
        data: Value,
    },
    Remove {
        collection: String,
        id: String,
    },
    /// Read error pushed to every listener.
    Error { message: String },
    Sleep { ms: u64 },
}

fn empty_object() -> Value {
    Value::Object(Default::default())
}

/// Parse a whole script, reporting the first bad line.
pub(crate) fn parse(text: &str) -> Result<Vec<ScriptOp>> {
    text.lines()
        .enumerate()
        .filter(|(_, line)| {
            let line = line.trim();
            !line.is_empty() && !line.starts_with('#')
        })
        .map(|(idx, line)| {
            serde_json::from_str(line)
                .map_err(|e| FeedcastError::parse(format!("script line {}: {e}", idx + 1)))
        })
        .collect()
}

impl ScriptOp {
    /// Apply this operation to `store`.
    pub(crate) async fn apply(&self, store: &MemoryStore) -> Result<()> {
        debug!(op = ?self, "applying script op");
        match self {
            Self::Insert {
                collection,
                id,
                data,
            } => store.insert(collection, id, data.clone()),
            Self::Update {
                collection,
                id,
                data,
            } => store.update(collection, id, data.clone())?,
            Self::Remove { collection, id } => {
                if !store.remove(collection, id) {
                    debug!(collection, id, "remove of a missing document");
                }
            }
            Self::Error { message } => store.inject_error(SourceError::classify(message.clone())),
            Self::Sleep { ms } => tokio::time::sleep(Duration::from_millis(*ms)).await,
        }
        Ok(())
    }
}

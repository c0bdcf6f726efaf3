//! The unit broadcast to subscribers.

use chrono::{DateTime, Utc};
use feedcast_feed::ChangeRecord;
use feedcast_shared::{DocumentSnapshot, FeedError};

/// One broadcast item. Shared between subscribers as `Arc<Event>`, never mutated.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    /// The changed document, absent on error events.
    pub document: Option<DocumentSnapshot>,
    /// Set when the feed failed; the broadcaster stops after this event.
    pub error: Option<FeedError>,
    /// When the broadcaster took the item off the feed.
    pub published_at: DateTime<Utc>,
}

impl Event {
    /// Event carrying a changed document.
    pub fn change(document: DocumentSnapshot) -> Self {
        Self {
            document: Some(document),
            error: None,
            published_at: Utc::now(),
        }
    }

    /// Event carrying a terminal feed error.
    pub fn failure(error: FeedError) -> Self {
        Self {
            document: None,
            error: Some(error),
            published_at: Utc::now(),
        }
    }

    /// Whether this event reports a feed failure.
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

impl From<ChangeRecord> for Event {
    fn from(record: ChangeRecord) -> Self {
        match record {
            ChangeRecord::Change { document, .. } => Self::change(document),
            ChangeRecord::Error(error) => Self::failure(error),
        }
    }
}

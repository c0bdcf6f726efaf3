//! Error types for feedcast.
//!
//! Library crates use [`FeedcastError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.
//!
//! Two narrower types travel through the pipeline itself: [`SourceError`] is what a
//! snapshot source reports, and [`FeedError`] is the terminal failure a change feed
//! hands to its consumers before closing.

use std::path::PathBuf;

/// Top-level error type for all feedcast operations.
#[derive(Debug, thiserror::Error)]
pub enum FeedcastError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Script or payload parsing error.
    #[error("parse error: {message}")]
    Parse { message: String },

    /// Data validation error (bad query, unknown pipeline, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },

    /// The change feed failed permanently.
    #[error("feed error: {0}")]
    Feed(#[from] FeedError),

    /// The cancellation signal fired.
    #[error("operation cancelled")]
    Cancelled,

    /// A broadcaster can only be started once.
    #[error("broadcaster already started")]
    AlreadyStarted,
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, FeedcastError>;

impl FeedcastError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a parse error from any displayable message.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

// ---------------------------------------------------------------------------
// SourceError
// ---------------------------------------------------------------------------

/// An error reported by a snapshot source while reading the next snapshot.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SourceError {
    /// The source observed its own cancellation.
    #[error("context canceled")]
    Cancelled,

    /// The source gave up waiting on the store.
    #[error("context deadline exceeded")]
    DeadlineExceeded,

    /// The store could not be reached or rejected the listen.
    #[error("source unavailable: {0}")]
    Unavailable(String),

    /// Any other failure the source could not classify.
    #[error("source error: {0}")]
    Internal(String),
}

impl SourceError {
    /// Classify an opaque error message coming out of a store client.
    ///
    /// Store clients rarely wrap cancellation structurally, so the only reliable
    /// signal is the message text.
    pub fn classify(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_ascii_lowercase();
        if lower.contains("context canceled") || lower.contains("cancelled") {
            Self::Cancelled
        } else if lower.contains("deadline exceeded") {
            Self::DeadlineExceeded
        } else {
            Self::Internal(message)
        }
    }

    /// Whether this error means "stop quietly" rather than "something broke".
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled | Self::DeadlineExceeded)
    }
}

// ---------------------------------------------------------------------------
// FeedError
// ---------------------------------------------------------------------------

/// Terminal failure of a change feed, delivered once before the feed closes.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FeedError {
    /// Upstream kept failing past the configured tolerance cap.
    #[error("upstream failed {errors} times, last error: {last}")]
    ToleranceExceeded { errors: u32, last: SourceError },
}

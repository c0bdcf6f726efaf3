//! Shared types, error model, and configuration for feedcast.
//!
//! This crate is the foundation depended on by all other feedcast crates.
//! It provides:
//! - [`FeedcastError`]: the unified error type, plus [`SourceError`] and [`FeedError`]
//! - Domain types ([`ChangeKind`], [`DocumentSnapshot`], [`SubscriberId`])
//! - Configuration ([`AppConfig`], [`FeedConfig`], [`BroadcastConfig`], config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, BroadcastConfig, BroadcastSettings, FeedConfig, FeedSettings, FilterEntry,
    PipelineEntry, config_dir, config_file_path, init_config, load_config, load_config_from,
};
pub use error::{FeedError, FeedcastError, Result, SourceError};
pub use types::{ChangeKind, DocumentSnapshot, SubscriberId};

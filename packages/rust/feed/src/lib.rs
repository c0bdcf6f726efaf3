//! Change feed plumbing for feedcast.
//!
//! Turns a store's push-style snapshot stream into an ordered, finite sequence of
//! [`ChangeRecord`]s guarded by a circuit breaker and bounded hand-off timeouts.
//!
//! - [`source`]: the traits a document store implements to be watched
//! - [`query`]: the query descriptor (collection, change kind, predicates)
//! - [`memory`]: an in-process document store implementing [`ChangeSource`]
//! - [`adapter`]: the two-stage [`ChangeFeedAdapter`]

pub mod adapter;
pub mod memory;
pub mod query;
pub mod source;

pub use adapter::{ChangeFeedAdapter, ChangeRecord, ChangeStream};
pub use memory::{MemoryListener, MemoryStore};
pub use query::{FeedQuery, Op, Where};
pub use source::{ChangeSource, RawChange, Snapshot, SnapshotSource};

//! Event distribution for feedcast.
//!
//! This crate turns one adapted change feed into a multi-consumer broadcast with
//! per-subscriber failure isolation:
//! - [`subscriber`]: subscriber handles and their inboxes
//! - [`registry`]: the live subscriber set
//! - [`deliverer`]: timeout-bounded delivery with a per-subscriber failure counter
//! - [`broadcaster`]: the consume loop, fan-out lanes and lifecycle
//! - [`consumer`]: the downstream handler loop

pub mod broadcaster;
pub mod consumer;
pub mod deliverer;
pub mod event;
pub mod registry;
pub mod subscriber;

pub use broadcaster::{BroadcastState, Broadcaster, Publisher};
pub use consumer::consume;
pub use deliverer::{BoundedDeliverer, DeliveryError};
pub use event::Event;
pub use registry::SubscriberRegistry;
pub use subscriber::{Inbox, Subscriber};

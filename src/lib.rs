//! # Courier
//!
//! `courier` moves messages between parts of one process with at-least-once
//! delivery. Every delivered [`Message`] must be acked or nacked; a nack
//! makes the transport deliver it again.
//!
//! ## Core Modules
//!
//! - `message`: the message type, its acknowledgement cell and [`Scope`].
//! - `pubsub`: the `Publisher` / `Subscriber` contracts and decorators.
//! - `broker`: an in-memory implementation of both contracts.
//! - `router`: binds subscriptions to handler functions with middleware,
//!   plugins and graceful shutdown.
//! - `cqrs`: typed command and event buses and processors on top of the router.
//! - `metrics`: decorators and middleware reporting through the `metrics` facade.
//! - `persistence`: the per-topic message log used by a persistent broker.
//! - `config`: layered settings loading.
//! - `utils`: errors, logging and synchronisation helpers.

pub mod broker;
pub mod config;
pub mod cqrs;
pub mod message;
pub mod metrics;
pub mod persistence;
pub mod pubsub;
pub mod router;
pub mod utils;

pub use broker::{BrokerConfig, InMemoryBroker};
pub use message::{AckState, Message, Metadata, Scope};
pub use pubsub::{Publisher, Subscriber, Subscription};
pub use router::{Handler, Router, RouterConfig};
pub use utils::error::{Error, Result};

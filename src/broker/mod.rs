//! The `broker` module implements the in-memory pub/sub transport.
//!
//! [`InMemoryBroker`] is both a [`Publisher`](crate::pubsub::Publisher) and a
//! [`Subscriber`](crate::pubsub::Subscriber). Every subscriber of a topic gets
//! its own copy of each published message and keeps receiving fresh copies
//! until one of them is acked.

pub mod engine;
pub mod topic;

pub use engine::{BrokerConfig, InMemoryBroker};

#[cfg(test)]
mod tests;

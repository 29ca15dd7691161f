//! Publisher and Subscriber capability contracts.
//!
//! Every transport (the in-memory broker included) and every decorator
//! implements these two traits. The router and the CQRS layer only ever talk
//! to `Arc<dyn Publisher>` / `Arc<dyn Subscriber>`, so any transport can be
//! swapped in.

pub mod decorator;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::message::{Message, Scope};
use crate::utils::error::Result;

pub use decorator::{
    MessageTransformPublisher, MessageTransformSubscriber, PublisherDecorator,
    SubscriberDecorator, message_transform_publisher, message_transform_subscriber,
};

/// Lazy stream of deliveries; it ends when the subscription is closed.
pub type Subscription = mpsc::Receiver<Message>;

#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publishes `messages` to `topic`.
    ///
    /// Fails if the underlying transport rejects the messages (for example
    /// because it has been closed).
    async fn publish(&self, topic: &str, messages: Vec<Message>) -> Result<()>;

    /// Releases the publisher.
    async fn close(&self) -> Result<()>;

    /// Implementation name, used in routing context and metric labels.
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

#[async_trait]
pub trait Subscriber: Send + Sync {
    /// Subscribes to `topic`.
    ///
    /// The returned stream is closed when `scope` is cancelled or the
    /// subscriber is closed. Every received message must be acked or nacked.
    async fn subscribe(&self, scope: Scope, topic: &str) -> Result<Subscription>;

    /// Releases the subscriber and closes all its subscriptions.
    async fn close(&self) -> Result<()>;

    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

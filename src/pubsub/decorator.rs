//! Publisher/Subscriber decorators.
//!
//! A decorator is a `capability -> capability` transform applied once when a
//! router handler is bound. Decorated values keep the full contract of the
//! value they wrap, including `close`.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::trace;

use super::{Publisher, Subscriber, Subscription};
use crate::message::{Message, Scope};
use crate::utils::error::Result;

pub type PublisherDecorator =
    Arc<dyn Fn(Arc<dyn Publisher>) -> Result<Arc<dyn Publisher>> + Send + Sync>;

pub type SubscriberDecorator =
    Arc<dyn Fn(Arc<dyn Subscriber>) -> Result<Arc<dyn Subscriber>> + Send + Sync>;

type Transform = Arc<dyn Fn(&mut Message) + Send + Sync>;

/// Applies `transform` to every message before it reaches the wrapped publisher.
pub struct MessageTransformPublisher {
    inner: Arc<dyn Publisher>,
    transform: Transform,
}

impl MessageTransformPublisher {
    pub fn new(
        inner: Arc<dyn Publisher>,
        transform: impl Fn(&mut Message) + Send + Sync + 'static,
    ) -> Self {
        Self {
            inner,
            transform: Arc::new(transform),
        }
    }
}

#[async_trait]
impl Publisher for MessageTransformPublisher {
    async fn publish(&self, topic: &str, mut messages: Vec<Message>) -> Result<()> {
        for msg in &mut messages {
            (self.transform)(msg);
        }
        self.inner.publish(topic, messages).await
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}

/// Applies `transform` to every message received from the wrapped subscriber.
pub struct MessageTransformSubscriber {
    inner: Arc<dyn Subscriber>,
    transform: Transform,
}

impl MessageTransformSubscriber {
    pub fn new(
        inner: Arc<dyn Subscriber>,
        transform: impl Fn(&mut Message) + Send + Sync + 'static,
    ) -> Self {
        Self {
            inner,
            transform: Arc::new(transform),
        }
    }
}

#[async_trait]
impl Subscriber for MessageTransformSubscriber {
    async fn subscribe(&self, scope: Scope, topic: &str) -> Result<Subscription> {
        let mut upstream = self.inner.subscribe(scope, topic).await?;
        let (tx, rx) = mpsc::channel(1);
        let transform = Arc::clone(&self.transform);
        let topic = topic.to_string();

        tokio::spawn(async move {
            while let Some(mut msg) = upstream.recv().await {
                transform(&mut msg);
                if tx.send(msg).await.is_err() {
                    break;
                }
            }
            trace!(topic = %topic, "Transform subscription closed");
        });

        Ok(rx)
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}

pub fn message_transform_publisher(
    transform: impl Fn(&mut Message) + Send + Sync + 'static,
) -> PublisherDecorator {
    let transform: Transform = Arc::new(transform);
    Arc::new(move |publisher: Arc<dyn Publisher>| -> Result<Arc<dyn Publisher>> {
        let transform = Arc::clone(&transform);
        Ok(Arc::new(MessageTransformPublisher {
            inner: publisher,
            transform,
        }) as Arc<dyn Publisher>)
    })
}

pub fn message_transform_subscriber(
    transform: impl Fn(&mut Message) + Send + Sync + 'static,
) -> SubscriberDecorator {
    let transform: Transform = Arc::new(transform);
    Arc::new(move |subscriber: Arc<dyn Subscriber>| -> Result<Arc<dyn Subscriber>> {
        let transform = Arc::clone(&transform);
        Ok(Arc::new(MessageTransformSubscriber {
            inner: subscriber,
            transform,
        }) as Arc<dyn Subscriber>)
    })
}

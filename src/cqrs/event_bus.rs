use std::sync::Arc;

use serde::Serialize;
use tracing::trace;

use super::GenerateTopicFn;
use super::marshaler::Marshaler;
use crate::message::Scope;
use crate::pubsub::Publisher;
use crate::utils::error::{Error, Result};

/// Publishes events to the topic of their name.
pub struct EventBus<M> {
    publisher: Arc<dyn Publisher>,
    generate_topic: GenerateTopicFn,
    marshaler: M,
}

impl<M: Marshaler> EventBus<M> {
    pub fn builder() -> EventBusBuilder<M> {
        EventBusBuilder::new()
    }

    /// Marshals `event` and publishes it to the topic generated from its name.
    pub async fn publish<E>(&self, scope: &Scope, event: &E) -> Result<()>
    where
        E: Serialize + Sync,
    {
        let event_name = self.marshaler.name::<E>();
        let topic = (self.generate_topic)(&event_name);

        let mut msg = self.marshaler.marshal(event)?;
        msg.set_scope(scope.clone());
        trace!(event_name = %event_name, topic = %topic, uuid = %msg.uuid, "Publishing event");

        self.publisher.publish(&topic, vec![msg]).await
    }
}

pub struct EventBusBuilder<M> {
    publisher: Option<Arc<dyn Publisher>>,
    generate_topic: Option<GenerateTopicFn>,
    marshaler: Option<M>,
}

impl<M: Marshaler> EventBusBuilder<M> {
    pub fn new() -> Self {
        Self {
            publisher: None,
            generate_topic: None,
            marshaler: None,
        }
    }

    pub fn with_publisher(mut self, publisher: Arc<dyn Publisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    /// Maps an event name to the topic it is published on.
    pub fn with_generate_topic(
        mut self,
        generate_topic: impl Fn(&str) -> String + Send + Sync + 'static,
    ) -> Self {
        self.generate_topic = Some(Arc::new(generate_topic));
        self
    }

    pub fn with_marshaler(mut self, marshaler: M) -> Self {
        self.marshaler = Some(marshaler);
        self
    }

    pub fn build(self) -> Result<EventBus<M>> {
        Ok(EventBus {
            publisher: self
                .publisher
                .ok_or(Error::MissingCollaborator("publisher"))?,
            generate_topic: self
                .generate_topic
                .ok_or(Error::MissingCollaborator("generate_topic"))?,
            marshaler: self
                .marshaler
                .ok_or(Error::MissingCollaborator("marshaler"))?,
        })
    }
}

impl<M: Marshaler> Default for EventBusBuilder<M> {
    fn default() -> Self {
        Self::new()
    }
}

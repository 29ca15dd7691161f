use std::sync::Arc;

use serde::Serialize;
use tracing::trace;

use super::GenerateTopicFn;
use super::marshaler::Marshaler;
use crate::message::Scope;
use crate::pubsub::Publisher;
use crate::utils::error::{Error, Result};

/// Sends commands to the topic of their name.
pub struct CommandBus<M> {
    publisher: Arc<dyn Publisher>,
    generate_topic: GenerateTopicFn,
    marshaler: M,
}

impl<M: Marshaler> CommandBus<M> {
    pub fn builder() -> CommandBusBuilder<M> {
        CommandBusBuilder::new()
    }

    /// Marshals `command` and publishes it to the topic generated from its name.
    pub async fn send<C>(&self, scope: &Scope, command: &C) -> Result<()>
    where
        C: Serialize + Sync,
    {
        let command_name = self.marshaler.name::<C>();
        let topic = (self.generate_topic)(&command_name);

        let mut msg = self.marshaler.marshal(command)?;
        msg.set_scope(scope.clone());
        trace!(command_name = %command_name, topic = %topic, uuid = %msg.uuid, "Sending command");

        self.publisher.publish(&topic, vec![msg]).await
    }
}

pub struct CommandBusBuilder<M> {
    publisher: Option<Arc<dyn Publisher>>,
    generate_topic: Option<GenerateTopicFn>,
    marshaler: Option<M>,
}

impl<M: Marshaler> CommandBusBuilder<M> {
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

    /// Maps a command name to the topic it is published on.
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

    pub fn build(self) -> Result<CommandBus<M>> {
        Ok(CommandBus {
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

impl<M: Marshaler> Default for CommandBusBuilder<M> {
    fn default() -> Self {
        Self::new()
    }
}

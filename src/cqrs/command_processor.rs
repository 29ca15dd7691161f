use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use tracing::{debug, trace};

use super::marshaler::Marshaler;
use super::{GenerateTopicFn, SubscriberConstructor};
use crate::message::{Message, Scope};
use crate::pubsub::Subscriber;
use crate::router::{NoPublishHandlerFunc, Router};
use crate::utils::error::{Error, Result};

/// Handles one command type.
///
/// A command has exactly one handler; the handler's error is the outcome of
/// the message carrying the command.
#[async_trait]
pub trait CommandHandler: Send + Sync + 'static {
    type Command: DeserializeOwned + Send + 'static;

    /// Unique name, used as the router handler name.
    fn handler_name(&self) -> &str;

    async fn handle(&self, scope: &Scope, command: Self::Command) -> Result<()>;
}

/// Command handler backed by a closure, see [`command_handler`].
pub struct FnCommandHandler<C, F> {
    name: String,
    handle: F,
    _command: PhantomData<fn() -> C>,
}

/// Builds a [`CommandHandler`] from an async closure.
pub fn command_handler<C, F, Fut>(handler_name: &str, handle: F) -> FnCommandHandler<C, F>
where
    C: DeserializeOwned + Send + 'static,
    F: Fn(Scope, C) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    FnCommandHandler {
        name: handler_name.to_string(),
        handle,
        _command: PhantomData,
    }
}

#[async_trait]
impl<C, F, Fut> CommandHandler for FnCommandHandler<C, F>
where
    C: DeserializeOwned + Send + 'static,
    F: Fn(Scope, C) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    type Command = C;

    fn handler_name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, scope: &Scope, command: C) -> Result<()> {
        (self.handle)(scope.clone(), command).await
    }
}

struct CommandRoute {
    handler_name: String,
    command_name: String,
    handler_func: NoPublishHandlerFunc,
}

/// Registers command handlers as router handlers.
pub struct CommandProcessor<M> {
    routes: Vec<CommandRoute>,
    generate_topic: GenerateTopicFn,
    subscriber_constructor: SubscriberConstructor,
    marshaler: Arc<M>,
}

impl<M: Marshaler> CommandProcessor<M> {
    pub fn builder() -> CommandProcessorBuilder<M> {
        CommandProcessorBuilder::new()
    }

    /// Adds a handler; fails if another handler already handles its command.
    pub fn add_handler<H: CommandHandler>(&mut self, handler: H) -> Result<()> {
        let command_name = self.marshaler.name::<H::Command>();
        if let Some(existing) = self
            .routes
            .iter()
            .find(|route| route.command_name == command_name)
        {
            return Err(Error::DuplicateCommandHandler {
                command_name,
                handler_name: existing.handler_name.clone(),
            });
        }

        let handler_name = handler.handler_name().to_string();
        debug!(handler_name = %handler_name, command_name = %command_name, "Adding command handler");
        let handler_func = route_command(Arc::new(handler), Arc::clone(&self.marshaler), command_name.clone());
        self.routes.push(CommandRoute {
            handler_name,
            command_name,
            handler_func,
        });
        Ok(())
    }

    /// Names of the registered handlers, in registration order.
    pub fn handler_names(&self) -> Vec<&str> {
        self.routes
            .iter()
            .map(|route| route.handler_name.as_str())
            .collect()
    }

    /// The router handler function built for `handler_name`.
    pub fn handler_func(&self, handler_name: &str) -> Option<NoPublishHandlerFunc> {
        self.routes
            .iter()
            .find(|route| route.handler_name == handler_name)
            .map(|route| Arc::clone(&route.handler_func))
    }

    /// Adds one no-publish router handler per command handler, each with its
    /// own subscriber.
    pub fn add_handlers_to_router(&self, router: &Router) -> Result<()> {
        for route in &self.routes {
            let topic = (self.generate_topic)(&route.command_name);
            let subscriber = (self.subscriber_constructor)(&route.handler_name)?;
            debug!(
                handler_name = %route.handler_name,
                topic = %topic,
                "Adding CQRS command handler to router"
            );
            router.add_no_publish_handler(
                &route.handler_name,
                &topic,
                subscriber,
                Arc::clone(&route.handler_func),
            )?;
        }
        Ok(())
    }
}

fn route_command<H, M>(handler: Arc<H>, marshaler: Arc<M>, command_name: String) -> NoPublishHandlerFunc
where
    H: CommandHandler,
    M: Marshaler,
{
    Arc::new(move |msg: Message| {
        let handler = Arc::clone(&handler);
        let marshaler = Arc::clone(&marshaler);
        let command_name = command_name.clone();
        async move {
            let message_name = marshaler.name_from_message(&msg);
            if message_name != command_name {
                trace!(
                    uuid = %msg.uuid,
                    expected = %command_name,
                    received = %message_name,
                    "Received different command type than expected, ignoring"
                );
                return Ok(());
            }

            let command: H::Command = marshaler.unmarshal(&msg)?;
            handler.handle(msg.scope(), command).await
        }
        .boxed()
    })
}

pub struct CommandProcessorBuilder<M> {
    generate_topic: Option<GenerateTopicFn>,
    subscriber_constructor: Option<SubscriberConstructor>,
    marshaler: Option<M>,
}

impl<M: Marshaler> CommandProcessorBuilder<M> {
    pub fn new() -> Self {
        Self {
            generate_topic: None,
            subscriber_constructor: None,
            marshaler: None,
        }
    }

    /// Maps a command name to the topic its handler subscribes to.
    pub fn with_generate_topic(
        mut self,
        generate_topic: impl Fn(&str) -> String + Send + Sync + 'static,
    ) -> Self {
        self.generate_topic = Some(Arc::new(generate_topic));
        self
    }

    /// Creates the subscriber of each handler, given the handler name.
    pub fn with_subscriber_constructor(
        mut self,
        constructor: impl Fn(&str) -> Result<Arc<dyn Subscriber>> + Send + Sync + 'static,
    ) -> Self {
        self.subscriber_constructor = Some(Arc::new(constructor));
        self
    }

    pub fn with_marshaler(mut self, marshaler: M) -> Self {
        self.marshaler = Some(marshaler);
        self
    }

    pub fn build(self) -> Result<CommandProcessor<M>> {
        Ok(CommandProcessor {
            routes: Vec::new(),
            generate_topic: self
                .generate_topic
                .ok_or(Error::MissingCollaborator("generate_topic"))?,
            subscriber_constructor: self
                .subscriber_constructor
                .ok_or(Error::MissingCollaborator("subscriber_constructor"))?,
            marshaler: Arc::new(
                self.marshaler
                    .ok_or(Error::MissingCollaborator("marshaler"))?,
            ),
        })
    }
}

impl<M: Marshaler> Default for CommandProcessorBuilder<M> {
    fn default() -> Self {
        Self::new()
    }
}

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

/// Reacts to one event type. An event may have any number of handlers.
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    type Event: DeserializeOwned + Send + 'static;

    fn handler_name(&self) -> &str;

    async fn handle(&self, scope: &Scope, event: Self::Event) -> Result<()>;
}

pub struct FnEventHandler<E, F> {
    name: String,
    handle: F,
    _event: PhantomData<fn() -> E>,
}

/// Builds an [`EventHandler`] from an async closure.
pub fn event_handler<E, F, Fut>(handler_name: &str, handle: F) -> FnEventHandler<E, F>
where
    E: DeserializeOwned + Send + 'static,
    F: Fn(Scope, E) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    FnEventHandler {
        name: handler_name.to_string(),
        handle,
        _event: PhantomData,
    }
}

#[async_trait]
impl<E, F, Fut> EventHandler for FnEventHandler<E, F>
where
    E: DeserializeOwned + Send + 'static,
    F: Fn(Scope, E) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    type Event = E;

    fn handler_name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, scope: &Scope, event: E) -> Result<()> {
        (self.handle)(scope.clone(), event).await
    }
}

struct EventRoute {
    handler_name: String,
    event_name: String,
    handler_func: NoPublishHandlerFunc,
}

/// Registers event handlers as router handlers, one subscription each.
pub struct EventProcessor<M> {
    routes: Vec<EventRoute>,
    generate_topic: GenerateTopicFn,
    subscriber_constructor: SubscriberConstructor,
    marshaler: Arc<M>,
    ack_on_unknown_event: bool,
}

impl<M: Marshaler> EventProcessor<M> {
    pub fn builder() -> EventProcessorBuilder<M> {
        EventProcessorBuilder::new()
    }

    pub fn add_handler<H: EventHandler>(&mut self, handler: H) -> Result<()> {
        let event_name = self.marshaler.name::<H::Event>();
        let handler_name = handler.handler_name().to_string();
        debug!(handler_name = %handler_name, event_name = %event_name, "Adding event handler");

        let handler_func = route_event(
            Arc::new(handler),
            Arc::clone(&self.marshaler),
            event_name.clone(),
            self.ack_on_unknown_event,
        );
        self.routes.push(EventRoute {
            handler_name,
            event_name,
            handler_func,
        });
        Ok(())
    }

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

    pub fn add_handlers_to_router(&self, router: &Router) -> Result<()> {
        for route in &self.routes {
            let topic = (self.generate_topic)(&route.event_name);
            let subscriber = (self.subscriber_constructor)(&route.handler_name)?;
            debug!(
                handler_name = %route.handler_name,
                topic = %topic,
                "Adding CQRS event handler to router"
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

fn route_event<H, M>(
    handler: Arc<H>,
    marshaler: Arc<M>,
    event_name: String,
    ack_on_unknown_event: bool,
) -> NoPublishHandlerFunc
where
    H: EventHandler,
    M: Marshaler,
{
    Arc::new(move |msg: Message| {
        let handler = Arc::clone(&handler);
        let marshaler = Arc::clone(&marshaler);
        let event_name = event_name.clone();
        async move {
            let message_name = marshaler.name_from_message(&msg);
            if message_name != event_name {
                if !ack_on_unknown_event {
                    return Err(Error::handler(format!(
                        "received unexpected event type {message_name}, expected {event_name}"
                    )));
                }
                trace!(
                    uuid = %msg.uuid,
                    expected = %event_name,
                    received = %message_name,
                    "Received different event type than expected, ignoring"
                );
                return Ok(());
            }

            let event: H::Event = marshaler.unmarshal(&msg)?;
            handler.handle(msg.scope(), event).await
        }
        .boxed()
    })
}

pub struct EventProcessorBuilder<M> {
    generate_topic: Option<GenerateTopicFn>,
    subscriber_constructor: Option<SubscriberConstructor>,
    marshaler: Option<M>,
    ack_on_unknown_event: bool,
}

impl<M: Marshaler> EventProcessorBuilder<M> {
    pub fn new() -> Self {
        Self {
            generate_topic: None,
            subscriber_constructor: None,
            marshaler: None,
            ack_on_unknown_event: true,
        }
    }

    /// Maps an event name to the topic its handlers subscribe to.
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

    /// When `false`, an event of another type on a handler's topic fails the
    /// message instead of being acked and skipped.
    pub fn with_ack_on_unknown_event(mut self, ack: bool) -> Self {
        self.ack_on_unknown_event = ack;
        self
    }

    pub fn build(self) -> Result<EventProcessor<M>> {
        Ok(EventProcessor {
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
            ack_on_unknown_event: self.ack_on_unknown_event,
        })
    }
}

impl<M: Marshaler> Default for EventProcessorBuilder<M> {
    fn default() -> Self {
        Self::new()
    }
}

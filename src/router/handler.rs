//! Router handlers: registration state, startup and the per-message loop.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use futures::FutureExt;
use futures::future::BoxFuture;
use tracing::{debug, error, info, trace, warn};

use super::context::RoutingContext;
use super::{HandlerFunc, HandlerMiddleware, Router};
use crate::message::{Message, Scope};
use crate::pubsub::{Publisher, Subscriber, Subscription, message_transform_subscriber};
use crate::utils::error::{Error, Result};
use crate::utils::sync::{Flag, WaitGuard};

pub(crate) struct HandlerState {
    pub name: String,
    pub subscribe_topic: String,
    subscriber: Arc<dyn Subscriber>,
    subscriber_name: &'static str,
    publish: Option<(String, Arc<dyn Publisher>)>,
    publisher_name: Option<&'static str>,
    handler_func: HandlerFunc,
    starting: AtomicBool,
    started: Flag,
    stopped: Flag,
    /// Scope of the handler's subscription; cancelling it stops the handler.
    stop_scope: Mutex<Option<Scope>>,
}

impl HandlerState {
    pub fn new(
        name: &str,
        subscribe_topic: &str,
        subscriber: Arc<dyn Subscriber>,
        publish: Option<(String, Arc<dyn Publisher>)>,
        handler_func: HandlerFunc,
    ) -> Self {
        // names are taken before decoration so they identify the transport
        let subscriber_name = subscriber.name();
        let publisher_name = publish.as_ref().map(|(_, publisher)| publisher.name());
        Self {
            name: name.to_string(),
            subscribe_topic: subscribe_topic.to_string(),
            subscriber,
            subscriber_name,
            publish,
            publisher_name,
            handler_func,
            starting: AtomicBool::new(false),
            started: Flag::new(),
            stopped: Flag::new(),
            stop_scope: Mutex::new(None),
        }
    }

    pub fn is_started(&self) -> bool {
        self.starting.load(Ordering::SeqCst)
    }

    fn routing_context(&self) -> RoutingContext {
        RoutingContext {
            handler_name: self.name.clone(),
            publisher_name: self.publisher_name,
            subscriber_name: self.subscriber_name,
            subscribe_topic: self.subscribe_topic.clone(),
            publish_topic: self.publish.as_ref().map(|(topic, _)| topic.clone()),
        }
    }
}

/// Handle to a handler registered on a [`Router`].
#[derive(Clone)]
pub struct Handler {
    router: Router,
    state: Arc<HandlerState>,
}

impl Handler {
    pub(super) fn new(router: Router, state: Arc<HandlerState>) -> Self {
        Self { router, state }
    }

    pub fn name(&self) -> &str {
        &self.state.name
    }

    /// Adds middleware applied only to this handler, after router level
    /// middleware registered before it. Takes effect when the handler starts.
    pub fn add_middleware(&self, middlewares: impl IntoIterator<Item = HandlerMiddleware>) {
        debug!(handler_name = %self.state.name, "Adding middleware to handler");
        self.router
            .push_middlewares(Some(&self.state.name), middlewares);
    }

    /// Resolves once the handler subscribed and started processing.
    pub fn started(&self) -> BoxFuture<'static, ()> {
        self.state.started.wait()
    }

    /// Resolves once the handler's subscription ended.
    pub fn stopped(&self) -> BoxFuture<'static, ()> {
        self.state.stopped.wait()
    }

    pub fn is_stopped(&self) -> bool {
        self.state.stopped.is_set()
    }

    /// Stops the handler by cancelling its subscription.
    pub fn stop(&self) {
        let scope = self
            .state
            .stop_scope
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match scope {
            Some(scope) => {
                debug!(handler_name = %self.state.name, "Stopping handler");
                scope.cancel();
            }
            None => warn!(handler_name = %self.state.name, "Handler is not started"),
        }
    }
}

/// What a started handler needs to process one message.
struct Runtime {
    routing: RoutingContext,
    publish: Option<(String, Arc<dyn Publisher>)>,
}

impl Runtime {
    async fn publish_produced(&self, produced: Vec<Message>) -> Result<()> {
        if produced.is_empty() {
            return Ok(());
        }
        let Some((topic, publisher)) = &self.publish else {
            return Err(Error::OutputInNoPublishHandler);
        };

        for msg in produced {
            trace!(
                handler_name = %self.routing.handler_name,
                topic = %topic,
                uuid = %msg.uuid,
                "Sending produced message"
            );
            publisher.publish(topic, vec![msg]).await?;
        }
        Ok(())
    }
}

pub(super) async fn start(router: &Router, state: Arc<HandlerState>, scope: &Scope) -> Result<()> {
    if state.starting.swap(true, Ordering::SeqCst) {
        return Ok(());
    }

    let routing = state.routing_context();
    let decorated = decorate(router, &state, &routing);
    let (publish, subscriber) = match decorated {
        Ok(decorated) => decorated,
        Err(err) => {
            state.starting.store(false, Ordering::SeqCst);
            return Err(err);
        }
    };

    debug!(
        handler_name = %state.name,
        topic = %state.subscribe_topic,
        "Subscribing to topic"
    );
    let handler_scope = scope.child();
    let messages = match subscriber
        .subscribe(handler_scope.clone(), &state.subscribe_topic)
        .await
    {
        Ok(messages) => messages,
        Err(err) => {
            handler_scope.cancel();
            state.starting.store(false, Ordering::SeqCst);
            error!(
                handler_name = %state.name,
                topic = %state.subscribe_topic,
                error = %err,
                "Cannot subscribe topic"
            );
            return Err(err);
        }
    };

    *state
        .stop_scope
        .lock()
        .unwrap_or_else(PoisonError::into_inner) = Some(handler_scope.clone());
    let registration = router.inner.handlers_wg.add();
    router.inner.handlers_started.fetch_add(1, Ordering::SeqCst);

    let mut handler_func = Arc::clone(&state.handler_func);
    // the middleware added first ends up outermost
    for middleware in router.middlewares_for(&state.name).iter().rev() {
        handler_func = middleware(handler_func);
    }

    tokio::spawn(handle_close(
        router.clone(),
        subscriber,
        handler_scope,
        state.name.clone(),
    ));
    let runtime = Arc::new(Runtime { routing, publish });
    tokio::spawn(process(
        router.clone(),
        Arc::clone(&state),
        runtime,
        messages,
        handler_func,
        registration,
    ));

    state.started.set();
    Ok(())
}

type Decorated = (Option<(String, Arc<dyn Publisher>)>, Arc<dyn Subscriber>);

fn decorate(router: &Router, state: &HandlerState, routing: &RoutingContext) -> Result<Decorated> {
    let publish = match &state.publish {
        Some((topic, publisher)) => Some((
            topic.clone(),
            decorate_publisher(router, Arc::clone(publisher))?,
        )),
        None => None,
    };
    let subscriber = decorate_subscriber(router, state, routing.clone())?;
    Ok((publish, subscriber))
}

/// Publisher decorators are applied in reverse, so the first one registered
/// is the outermost wrapper.
fn decorate_publisher(router: &Router, publisher: Arc<dyn Publisher>) -> Result<Arc<dyn Publisher>> {
    let decorators = router
        .inner
        .publisher_decorators
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clone();
    decorators
        .iter()
        .rev()
        .try_fold(publisher, |publisher, decorator| decorator(publisher))
}

/// The routing context decorator goes first, so the registered decorators can
/// read the routing values.
fn decorate_subscriber(
    router: &Router,
    state: &HandlerState,
    routing: RoutingContext,
) -> Result<Arc<dyn Subscriber>> {
    let with_context = message_transform_subscriber(move |msg| routing.apply(msg));
    let decorators = router
        .inner
        .subscriber_decorators
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clone();

    let subscriber = with_context(Arc::clone(&state.subscriber))?;
    decorators
        .iter()
        .try_fold(subscriber, |subscriber, decorator| decorator(subscriber))
}

async fn handle_close(router: Router, subscriber: Arc<dyn Subscriber>, scope: Scope, name: String) {
    tokio::select! {
        _ = router.inner.closing.cancelled() => {
            debug!(handler_name = %name, "Waiting for subscriber to close");
            if let Err(err) = subscriber.close().await {
                error!(handler_name = %name, error = %err, "Failed to close subscriber");
            }
        }
        _ = scope.cancelled() => {}
    }
    scope.cancel();
}

async fn process(
    router: Router,
    state: Arc<HandlerState>,
    runtime: Arc<Runtime>,
    mut messages: Subscription,
    handler_func: HandlerFunc,
    registration: WaitGuard,
) {
    info!(
        handler_name = %state.name,
        topic = %state.subscribe_topic,
        "Starting handler"
    );

    while let Some(msg) = messages.recv().await {
        let in_flight = router.inner.in_flight_wg.add();
        tokio::spawn(handle_message(
            Arc::clone(&runtime),
            msg,
            Arc::clone(&handler_func),
            in_flight,
        ));
    }

    router.forget_handler(&state.name);
    state.stopped.set();
    debug!(handler_name = %state.name, "Handler stopped");
    drop(registration);
}

async fn handle_message(
    runtime: Arc<Runtime>,
    msg: Message,
    handler_func: HandlerFunc,
    _in_flight: WaitGuard,
) {
    let handler_name = runtime.routing.handler_name.as_str();
    trace!(handler_name = %handler_name, uuid = %msg.uuid, "Received message");

    let input = msg.clone();
    let outcome = AssertUnwindSafe(async move { handler_func(input).await })
        .catch_unwind()
        .await;

    let mut produced = match outcome {
        Ok(Ok(produced)) => produced,
        Ok(Err(err)) => {
            error!(handler_name = %handler_name, uuid = %msg.uuid, error = %err, "Handler returned error");
            msg.nack();
            return;
        }
        Err(panic) => {
            let err = Error::HandlerPanicked(panic_message(panic.as_ref()));
            error!(handler_name = %handler_name, uuid = %msg.uuid, error = %err, "Panic recovered in handler");
            msg.nack();
            return;
        }
    };

    for produced_msg in &mut produced {
        runtime.routing.apply(produced_msg);
    }
    if let Err(err) = runtime.publish_produced(produced).await {
        error!(handler_name = %handler_name, uuid = %msg.uuid, error = %err, "Publishing produced messages failed");
        msg.nack();
        return;
    }

    msg.ack();
    trace!(handler_name = %handler_name, uuid = %msg.uuid, "Message acked");
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

//! The `router` module binds subscriptions to handler functions.
//!
//! A [`Router`] owns a set of named handlers. Each handler reads messages from
//! one topic, runs them through the middleware chain and the handler
//! function, republishes the produced messages to its publish topic and acks
//! the input. Errors and panics nack the input, which makes the transport
//! redeliver it.
//!
//! Lifecycle:
//! - `run` starts every registered handler and blocks until the router is
//!   closed (explicitly, by cancelling the run scope, or because all handlers
//!   stopped and no new one was added within the idle grace period)
//! - `run_handlers` starts handlers added while the router is running
//! - `close` waits, bounded by `close_timeout`, for handlers and in-flight
//!   messages to finish

pub mod context;
mod handler;
pub mod middleware;
pub mod plugin;

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::Notify;
use tracing::{debug, error, info};

use crate::message::{Message, Scope};
use crate::pubsub::{Publisher, PublisherDecorator, Subscriber, SubscriberDecorator};
use crate::utils::error::{Error, Result};
use crate::utils::sync::{Flag, WaitGroup};

pub use handler::Handler;
use handler::HandlerState;

/// Processes one message and returns the messages to publish.
pub type HandlerFunc =
    Arc<dyn Fn(Message) -> BoxFuture<'static, Result<Vec<Message>>> + Send + Sync>;

/// Processes one message without producing output.
pub type NoPublishHandlerFunc = Arc<dyn Fn(Message) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Wraps a handler function with cross-cutting behaviour.
pub type HandlerMiddleware = Arc<dyn Fn(HandlerFunc) -> HandlerFunc + Send + Sync>;

/// Runs once when the router starts, before any handler is started.
pub type RouterPlugin = Arc<dyn Fn(&Router) -> Result<()> + Send + Sync>;

/// Builds a [`HandlerFunc`] from an async closure.
pub fn handler_func<F, Fut>(f: F) -> HandlerFunc
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Vec<Message>>> + Send + 'static,
{
    Arc::new(move |msg| f(msg).boxed())
}

/// Builds a [`NoPublishHandlerFunc`] from an async closure.
pub fn no_publish_handler_func<F, Fut>(f: F) -> NoPublishHandlerFunc
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move |msg| f(msg).boxed())
}

pub fn middleware_func<F>(f: F) -> HandlerMiddleware
where
    F: Fn(HandlerFunc) -> HandlerFunc + Send + Sync + 'static,
{
    Arc::new(f)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouterConfig {
    /// Upper bound on how long `close` waits for handlers to finish.
    pub close_timeout: Duration,

    /// Grace period before a router whose handlers all stopped closes itself.
    pub idle_shutdown: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            close_timeout: Duration::from_secs(30),
            idle_shutdown: Duration::from_secs(1),
        }
    }
}

impl RouterConfig {
    pub fn validate(&self) -> Result<()> {
        if self.close_timeout.is_zero() {
            return Err(Error::InvalidConfig(
                "router close_timeout must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

struct MiddlewareEntry {
    middleware: HandlerMiddleware,
    /// `None` for router level middleware.
    handler_name: Option<String>,
}

#[derive(Clone)]
pub struct Router {
    inner: Arc<RouterInner>,
}

struct RouterInner {
    config: RouterConfig,
    middlewares: Mutex<Vec<MiddlewareEntry>>,
    plugins: Mutex<Vec<RouterPlugin>>,
    publisher_decorators: Mutex<Vec<PublisherDecorator>>,
    subscriber_decorators: Mutex<Vec<SubscriberDecorator>>,
    handlers: Mutex<HashMap<String, Arc<HandlerState>>>,
    /// One guard per started handler loop.
    handlers_wg: WaitGroup,
    /// Handlers started since the router was created, stopped ones included.
    handlers_started: AtomicUsize,
    /// One guard per message being processed.
    in_flight_wg: WaitGroup,
    handler_added: Notify,
    /// Cancelled when closing starts.
    closing: Scope,
    closed: AtomicBool,
    /// Set once closing finished (or timed out).
    close_done: Flag,
    running: Flag,
    is_running: AtomicBool,
}

impl Router {
    pub fn new(config: RouterConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(RouterInner {
                config,
                middlewares: Mutex::new(Vec::new()),
                plugins: Mutex::new(Vec::new()),
                publisher_decorators: Mutex::new(Vec::new()),
                subscriber_decorators: Mutex::new(Vec::new()),
                handlers: Mutex::new(HashMap::new()),
                handlers_wg: WaitGroup::new(),
                handlers_started: AtomicUsize::new(0),
                in_flight_wg: WaitGroup::new(),
                handler_added: Notify::new(),
                closing: Scope::new().child(),
                closed: AtomicBool::new(false),
                close_done: Flag::new(),
                running: Flag::new(),
                is_running: AtomicBool::new(false),
            }),
        })
    }

    pub fn config(&self) -> &RouterConfig {
        &self.inner.config
    }

    /// Adds router level middleware, applied to every handler.
    ///
    /// Middleware added first wraps the others, so it runs first.
    pub fn add_middleware(&self, middlewares: impl IntoIterator<Item = HandlerMiddleware>) {
        debug!("Adding router middlewares");
        self.push_middlewares(None, middlewares);
    }

    fn push_middlewares(
        &self,
        handler_name: Option<&str>,
        middlewares: impl IntoIterator<Item = HandlerMiddleware>,
    ) {
        let mut entries = lock(&self.inner.middlewares);
        entries.extend(middlewares.into_iter().map(|middleware| MiddlewareEntry {
            middleware,
            handler_name: handler_name.map(str::to_string),
        }));
    }

    pub fn add_plugin(&self, plugins: impl IntoIterator<Item = RouterPlugin>) {
        debug!("Adding plugins");
        lock(&self.inner.plugins).extend(plugins);
    }

    /// Wraps every handler publisher; the decorator added first is outermost.
    pub fn add_publisher_decorators(
        &self,
        decorators: impl IntoIterator<Item = PublisherDecorator>,
    ) {
        debug!("Adding publisher decorators");
        lock(&self.inner.publisher_decorators).extend(decorators);
    }

    /// Wraps every handler subscriber; decorators are applied in order.
    pub fn add_subscriber_decorators(
        &self,
        decorators: impl IntoIterator<Item = SubscriberDecorator>,
    ) {
        debug!("Adding subscriber decorators");
        lock(&self.inner.subscriber_decorators).extend(decorators);
    }

    /// Registers a handler that republishes its output to `publish_topic`.
    ///
    /// Handlers added to a running router start on the next `run_handlers`.
    pub fn add_handler(
        &self,
        handler_name: &str,
        subscribe_topic: &str,
        subscriber: Arc<dyn Subscriber>,
        publish_topic: &str,
        publisher: Arc<dyn Publisher>,
        handler_func: HandlerFunc,
    ) -> Result<Handler> {
        self.register(HandlerState::new(
            handler_name,
            subscribe_topic,
            subscriber,
            Some((publish_topic.to_string(), publisher)),
            handler_func,
        ))
    }

    /// Registers a handler without a publisher.
    ///
    /// Output produced for such a handler (for example by a middleware) is
    /// an error and nacks the message.
    pub fn add_no_publish_handler(
        &self,
        handler_name: &str,
        subscribe_topic: &str,
        subscriber: Arc<dyn Subscriber>,
        handler_func: NoPublishHandlerFunc,
    ) -> Result<Handler> {
        let adapted: HandlerFunc = Arc::new(move |msg| {
            let handled = handler_func(msg);
            async move { handled.await.map(|()| Vec::<Message>::new()) }.boxed()
        });
        self.register(HandlerState::new(
            handler_name,
            subscribe_topic,
            subscriber,
            None,
            adapted,
        ))
    }

    fn register(&self, state: HandlerState) -> Result<Handler> {
        info!(
            handler_name = %state.name,
            topic = %state.subscribe_topic,
            "Adding handler"
        );
        let state = Arc::new(state);
        {
            let mut handlers = lock(&self.inner.handlers);
            if handlers.contains_key(&state.name) {
                return Err(Error::DuplicateHandlerName(state.name.clone()));
            }
            handlers.insert(state.name.clone(), Arc::clone(&state));
        }
        self.inner.handler_added.notify_waiters();

        Ok(Handler::new(self.clone(), state))
    }

    /// Names of the handlers registered and not yet stopped.
    pub fn handler_names(&self) -> Vec<String> {
        lock(&self.inner.handlers).keys().cloned().collect()
    }

    /// Starts all handlers and blocks until the router is closed.
    ///
    /// Cancelling `scope` closes the router. Returns the result of closing
    /// when this call initiated it.
    pub async fn run(&self, scope: Scope) -> Result<()> {
        if self.inner.is_running.swap(true, Ordering::SeqCst) {
            return Err(Error::RouterAlreadyRunning);
        }
        let run_scope = scope.child();

        debug!("Loading plugins");
        let plugins = lock(&self.inner.plugins).clone();
        for plugin in plugins {
            plugin(self)?;
        }

        self.run_handlers(run_scope.clone()).await?;
        self.inner.running.set();
        info!("Router is running");

        // a handler may already have stopped and left the map
        if self.inner.handlers_started.load(Ordering::SeqCst) > 0 {
            tokio::spawn(close_when_all_handlers_stopped(
                self.clone(),
                run_scope.clone(),
            ));
        }

        tokio::select! {
            _ = self.inner.closing.cancelled() => {}
            _ = run_scope.cancelled() => {
                debug!("Run scope cancelled, closing router");
            }
        }
        run_scope.cancel();

        let result = self.close().await;
        self.inner.close_done.wait().await;
        info!("All messages processed");
        result
    }

    /// Starts handlers that are registered but not yet started.
    ///
    /// Only valid while the router is running (or starting).
    pub async fn run_handlers(&self, scope: Scope) -> Result<()> {
        if !self.inner.is_running.load(Ordering::SeqCst) {
            return Err(Error::InvalidConfig(
                "run_handlers called on a router that is not running".to_string(),
            ));
        }
        if self.is_closed() {
            return Err(Error::Closed);
        }

        let pending: Vec<Arc<HandlerState>> = lock(&self.inner.handlers)
            .values()
            .filter(|state| !state.is_started())
            .cloned()
            .collect();
        if pending.is_empty() {
            return Ok(());
        }
        info!(count = pending.len(), "Running router handlers");

        for state in pending {
            handler::start(self, state, &scope).await?;
        }
        Ok(())
    }

    /// Resolves once the router has started all handlers registered before `run`.
    pub fn running(&self) -> BoxFuture<'static, ()> {
        self.inner.running.wait()
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.is_set()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Stops all handlers and waits for them, bounded by `close_timeout`.
    ///
    /// Idempotent; a timeout leaves the remaining tasks running.
    pub async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("Closing router");
        self.inner.closing.cancel();

        let close_timeout = self.inner.config.close_timeout;
        info!(timeout = ?close_timeout, "Waiting for messages");
        let drained = tokio::time::timeout(close_timeout, async {
            // every loop must finish before the in-flight count can only decrease
            self.inner.handlers_wg.wait().await;
            self.inner.in_flight_wg.wait().await;
        })
        .await;
        self.inner.close_done.set();

        match drained {
            Ok(()) => {
                info!("Router closed");
                Ok(())
            }
            Err(_) => {
                error!(timeout = ?close_timeout, "Router close timeout");
                Err(Error::CloseTimeout(close_timeout))
            }
        }
    }

    fn middlewares_for(&self, handler_name: &str) -> Vec<HandlerMiddleware> {
        lock(&self.inner.middlewares)
            .iter()
            .filter(|entry| {
                entry
                    .handler_name
                    .as_deref()
                    .is_none_or(|name| name == handler_name)
            })
            .map(|entry| Arc::clone(&entry.middleware))
            .collect()
    }

    fn forget_handler(&self, handler_name: &str) {
        lock(&self.inner.handlers).remove(handler_name);
    }
}

async fn close_when_all_handlers_stopped(router: Router, scope: Scope) {
    loop {
        tokio::select! {
            _ = router.inner.handlers_wg.wait() => {}
            _ = router.inner.closing.cancelled() => return,
        }

        let added = router.inner.handler_added.notified();
        tokio::select! {
            _ = added => continue,
            _ = tokio::time::sleep(router.inner.config.idle_shutdown) => {}
            _ = router.inner.closing.cancelled() => return,
        }
        if router.inner.handlers_wg.count() > 0 {
            continue;
        }

        if !scope.is_cancelled() {
            error!("All handlers stopped, closing router");
        }
        if let Err(err) = router.close().await {
            error!(error = %err, "Cannot close router");
        }
        return;
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

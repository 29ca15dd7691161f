//! Metrics for router handlers, publishers and subscribers
//!
//! Recorded through the `metrics` facade; nothing is exported unless the
//! application installs a recorder. Metric names are prefixed with the
//! builder's namespace and subsystem.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::FutureExt;
use ::metrics::{counter, histogram};

use crate::message::Message;
use crate::pubsub::{
    Publisher, PublisherDecorator, SubscriberDecorator, message_transform_subscriber,
};
use crate::router::context::{handler_name_from_scope, subscriber_name_from_scope};
use crate::router::{HandlerFunc, HandlerMiddleware, Router};
use crate::utils::error::Result;

const LABEL_HANDLER_NAME: &str = "handler_name";
const LABEL_PUBLISHER_NAME: &str = "publisher_name";
const LABEL_SUBSCRIBER_NAME: &str = "subscriber_name";
const LABEL_SUCCESS: &str = "success";
const LABEL_ACKED: &str = "acked";
const UNKNOWN: &str = "<unknown>";

#[derive(Debug, Clone, Default)]
pub struct MetricsBuilder {
    namespace: String,
    subsystem: String,
}

impl MetricsBuilder {
    pub fn new(namespace: impl Into<String>, subsystem: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            subsystem: subsystem.into(),
        }
    }

    /// Full metric name: namespace, subsystem and name joined by `_`.
    pub fn metric_name(&self, name: &str) -> String {
        [self.namespace.as_str(), self.subsystem.as_str(), name]
            .into_iter()
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join("_")
    }

    /// Wires the publisher and subscriber decorators and the handler
    /// middleware into `router`.
    pub fn add_metrics_router_decorator(&self, router: &Router) {
        router.add_publisher_decorators([self.decorate_publisher()]);
        router.add_subscriber_decorators([self.decorate_subscriber()]);
        router.add_middleware([self.handler_middleware()]);
    }

    /// Records how long each publish call takes.
    pub fn decorate_publisher(&self) -> PublisherDecorator {
        let metric = self.metric_name("publish_time_seconds");
        Arc::new(move |inner: Arc<dyn Publisher>| -> Result<Arc<dyn Publisher>> {
            Ok(Arc::new(PublisherMetrics {
                publisher_name: inner.name(),
                inner,
                metric: metric.clone(),
            }) as Arc<dyn Publisher>)
        })
    }

    /// Counts received messages, labelled by whether they were acked.
    pub fn decorate_subscriber(&self) -> SubscriberDecorator {
        let metric = self.metric_name("subscriber_messages_received_total");
        message_transform_subscriber(move |msg: &mut Message| {
            let handler_name = label(handler_name_from_scope(msg.scope()));
            let subscriber_name = label(subscriber_name_from_scope(msg.scope()));
            let metric = metric.clone();
            let settled = settlement(msg);
            tokio::spawn(async move {
                let Some(outcome) = settled.await else {
                    return;
                };
                counter!(
                    metric,
                    LABEL_HANDLER_NAME => handler_name,
                    LABEL_SUBSCRIBER_NAME => subscriber_name,
                    LABEL_ACKED => outcome
                )
                .increment(1);
            });
        })
    }

    /// Records handler execution time, labelled by success.
    pub fn handler_middleware(&self) -> HandlerMiddleware {
        let metric = self.metric_name("handler_execution_time_seconds");
        Arc::new(move |next: HandlerFunc| -> HandlerFunc {
            let metric = metric.clone();
            Arc::new(move |msg: Message| {
                let next = Arc::clone(&next);
                let metric = metric.clone();
                async move {
                    let handler_name = label(handler_name_from_scope(msg.scope()));
                    let started = Instant::now();
                    let result = next(msg).await;
                    histogram!(
                        metric,
                        LABEL_HANDLER_NAME => handler_name,
                        LABEL_SUCCESS => result.is_ok().to_string()
                    )
                    .record(started.elapsed().as_secs_f64());
                    result
                }
                .boxed()
            })
        })
    }
}

/// Resolves to `"acked"` or `"nacked"` once `msg` is settled, or to `None`
/// when its scope is cancelled first (the delivery was abandoned).
fn settlement(msg: &Message) -> impl Future<Output = Option<&'static str>> + Send + use<> {
    let acked = msg.acked();
    let nacked = msg.nacked();
    let scope = msg.scope().clone();
    async move {
        tokio::select! {
            biased;
            _ = acked => Some("acked"),
            _ = nacked => Some("nacked"),
            _ = scope.cancelled() => None,
        }
    }
}

fn label(value: Option<&str>) -> String {
    value.unwrap_or(UNKNOWN).to_string()
}

struct PublisherMetrics {
    inner: Arc<dyn Publisher>,
    publisher_name: &'static str,
    metric: String,
}

#[async_trait]
impl Publisher for PublisherMetrics {
    async fn publish(&self, topic: &str, messages: Vec<Message>) -> Result<()> {
        let handler_name = label(
            messages
                .first()
                .and_then(|msg| handler_name_from_scope(msg.scope())),
        );
        let started = Instant::now();
        let result = self.inner.publish(topic, messages).await;
        histogram!(
            self.metric.clone(),
            LABEL_PUBLISHER_NAME => self.publisher_name,
            LABEL_HANDLER_NAME => handler_name,
            LABEL_SUCCESS => result.is_ok().to_string()
        )
        .record(started.elapsed().as_secs_f64());
        result
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }

    fn name(&self) -> &'static str {
        self.publisher_name
    }
}

#[cfg(test)]
mod tests;

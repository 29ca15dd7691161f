//! Broker engine
//!
//! This module contains the in-memory broker, responsible for:
//! - managing topics and their subscriber sets
//! - fanning published messages out to every subscriber of a topic
//! - redelivering nacked messages until they are acked
//! - keeping a replay log of published messages in persistent mode
//!
//! Concurrency and usage notes:
//! - Subscriber set mutation is serialized by one broad lock; publishing takes
//!   it shared, subscribing and unsubscribing take it exclusively. Fan-out for a
//!   single topic is additionally serialized by a per-topic lock.
//! - Delivery to a subscriber happens in its own task, so a subscriber that
//!   never acks only stalls itself (and a publisher waiting for its ack in
//!   block-until-ack mode).

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use async_trait::async_trait;
use futures::future::join_all;
use tokio::sync::{Mutex, RwLock, mpsc};
use tracing::{debug, info, trace};

use crate::broker::topic::{Topic, TopicSubscriber};
use crate::message::{Message, Scope};
use crate::persistence::MessageLog;
use crate::pubsub::{Publisher, Subscriber, Subscription};
use crate::utils::error::{Error, Result};
use crate::utils::sync::WaitGroup;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BrokerConfig {
    /// Capacity of each subscription queue. Zero behaves as a single slot.
    pub output_buffer: usize,

    /// Keep every published message and replay the topic's history to new
    /// subscribers. The log is memory-resident and unbounded.
    pub persistent: bool,

    /// Make `publish` return only once every subscriber acked each message.
    pub block_publish_until_ack: bool,
}

/// Topic-based in-process pub/sub. Cloning gives another handle to the same
/// broker.
#[derive(Clone)]
pub struct InMemoryBroker {
    inner: Arc<BrokerInner>,
}

struct BrokerInner {
    config: BrokerConfig,
    topics: Arc<RwLock<HashMap<String, Topic>>>,
    topic_locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
    log: MessageLog,
    /// Cancelled when the broker starts closing.
    closing: Scope,
    closed: StdMutex<bool>,
    subscribers_wg: WaitGroup,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new(BrokerConfig::default())
    }
}

impl InMemoryBroker {
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                config,
                topics: Arc::new(RwLock::new(HashMap::new())),
                topic_locks: StdMutex::new(HashMap::new()),
                log: MessageLog::new(),
                closing: Scope::new().child(),
                closed: StdMutex::new(false),
                subscribers_wg: WaitGroup::new(),
            }),
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.inner.config
    }

    pub fn is_closed(&self) -> bool {
        *self
            .inner
            .closed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of subscribers currently registered on `topic`.
    pub async fn subscriber_count(&self, topic: &str) -> usize {
        self.inner.topics.read().await.get(topic).map_or(0, Topic::len)
    }

    /// Number of messages kept for replay on `topic`.
    pub fn persisted_count(&self, topic: &str) -> usize {
        self.inner.log.len(topic)
    }
}

impl BrokerInner {
    fn topic_lock(&self, topic: &str) -> Arc<Mutex<()>> {
        let mut locks = self
            .topic_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(topic.to_string()).or_default())
    }

    /// Starts one delivery task per subscriber in `topic`'s current snapshot.
    ///
    /// The returned handles finish once each subscriber acked (or closed).
    fn send_message(
        &self,
        topics: &HashMap<String, Topic>,
        topic: &str,
        msg: Message,
    ) -> Vec<tokio::task::JoinHandle<()>> {
        let subscribers = topics.get(topic).map(Topic::subscribers).unwrap_or_default();
        if subscribers.is_empty() {
            trace!(topic = %topic, uuid = %msg.uuid, "No subscribers to send message");
            return Vec::new();
        }

        let msg = Arc::new(msg);
        subscribers
            .into_iter()
            .map(|subscriber| {
                let msg = Arc::clone(&msg);
                tokio::spawn(async move { subscriber.send_message(&msg).await })
            })
            .collect()
    }

    async fn remove_subscriber(&self, subscriber: &TopicSubscriber) {
        let mut topics = self.topics.write().await;
        let topic_lock = self.topic_lock(&subscriber.topic);
        let _topic_guard = topic_lock.lock().await;

        let now_empty = match topics.get_mut(&subscriber.topic) {
            Some(topic) => {
                topic.unsubscribe(&subscriber.id);
                topic.is_empty()
            }
            None => false,
        };
        if now_empty {
            topics.remove(&subscriber.topic);
        }
        debug!(
            topic = %subscriber.topic,
            subscriber_uuid = %subscriber.id,
            "Subscriber removed"
        );
    }
}

#[async_trait]
impl Publisher for InMemoryBroker {
    async fn publish(&self, topic: &str, messages: Vec<Message>) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        let messages: Vec<Message> = messages.iter().map(Message::copy).collect();

        let topics = self.inner.topics.read().await;
        let topic_lock = self.inner.topic_lock(topic);
        let _topic_guard = topic_lock.lock().await;

        if self.inner.config.persistent {
            self.inner.log.append(topic, &messages);
        }

        for msg in messages {
            let uuid = msg.uuid.clone();
            let deliveries = self.inner.send_message(&topics, topic, msg);
            if !self.inner.config.block_publish_until_ack {
                continue;
            }

            trace!(topic = %topic, uuid = %uuid, "Waiting for subscribers to ack");
            tokio::select! {
                _ = join_all(deliveries) => {
                    trace!(topic = %topic, uuid = %uuid, "Message acked by subscribers");
                }
                _ = self.inner.closing.cancelled() => {
                    trace!(topic = %topic, uuid = %uuid, "Broker closing, stopped waiting for ack");
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        {
            let mut closed = self
                .inner
                .closed
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if *closed {
                return Ok(());
            }
            *closed = true;
        }
        self.inner.closing.cancel();

        debug!("Closing broker, waiting for subscribers");
        self.inner.subscribers_wg.wait().await;
        self.inner.log.clear();
        info!("Broker closed");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "InMemoryBroker"
    }
}

#[async_trait]
impl Subscriber for InMemoryBroker {
    async fn subscribe(&self, scope: Scope, topic: &str) -> Result<Subscription> {
        let registration = {
            let closed = self
                .inner
                .closed
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if *closed {
                return Err(Error::Closed);
            }
            self.inner.subscribers_wg.add()
        };

        let (output, subscription) = mpsc::channel(self.inner.config.output_buffer.max(1));
        let subscriber = Arc::new(TopicSubscriber::new(topic, &scope, output));

        let mut topics = Arc::clone(&self.inner.topics).write_owned().await;
        let topic_guard = self.inner.topic_lock(topic).lock_owned().await;

        // unregisters the subscriber once it is cancelled or the broker closes
        tokio::spawn({
            let inner = Arc::clone(&self.inner);
            let subscriber = Arc::clone(&subscriber);
            async move {
                tokio::select! {
                    _ = subscriber.cancelled() => {}
                    _ = inner.closing.cancelled() => {}
                }
                subscriber.close().await;
                inner.remove_subscriber(&subscriber).await;
                drop(registration);
            }
        });

        debug!(topic = %topic, subscriber_uuid = %subscriber.id, "Subscribing");

        if !self.inner.config.persistent {
            topics
                .entry(topic.to_string())
                .or_insert_with(|| Topic::new(topic))
                .subscribe(subscriber);
            return Ok(subscription);
        }

        let history = self.inner.log.load(topic);
        let topic = topic.to_string();
        tokio::spawn(async move {
            if !history.is_empty() {
                tokio::spawn({
                    let subscriber = Arc::clone(&subscriber);
                    async move {
                        trace!(
                            topic = %subscriber.topic,
                            count = history.len(),
                            "Replaying persisted messages"
                        );
                        for msg in &history {
                            subscriber.send_message(msg).await;
                        }
                    }
                });
            }
            topics
                .entry(topic.clone())
                .or_insert_with(|| Topic::new(&topic))
                .subscribe(subscriber);
            drop(topic_guard);
        });

        Ok(subscription)
    }

    async fn close(&self) -> Result<()> {
        Publisher::close(self).await
    }

    fn name(&self) -> &'static str {
        "InMemoryBroker"
    }
}

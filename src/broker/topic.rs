//! Topic management
//!
//! A `Topic` holds the live subscribers of a topic name. Each
//! `TopicSubscriber` owns the sending half of one subscription queue and runs
//! the per-subscriber delivery loop: send a fresh copy, wait for its ack or
//! nack, resend on nack.
//!
//! Concurrency note: callers must synchronize access to `Topic` (the broker
//! keeps topics behind its subscribers lock) when modifying subscriptions.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};
use tracing::trace;

use crate::message::{Message, Scope, new_uuid};

pub type SubscriberId = String;

#[derive(Default)]
pub struct Topic {
    pub name: String,
    subscribers: HashMap<SubscriberId, Arc<TopicSubscriber>>,
}

impl Topic {
    /// Create a new topic with the given name.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            subscribers: HashMap::new(),
        }
    }

    /// Add a subscriber to the topic. Re-adding the same subscriber is a no-op.
    pub fn subscribe(&mut self, subscriber: Arc<TopicSubscriber>) {
        self.subscribers
            .entry(subscriber.id.clone())
            .or_insert(subscriber);
    }

    /// Remove a subscriber from the topic.
    pub fn unsubscribe(&mut self, id: &str) {
        self.subscribers.remove(id);
    }

    pub fn contains(&self, id: &str) -> bool {
        self.subscribers.contains_key(id)
    }

    /// Snapshot of the current subscribers.
    pub fn subscribers(&self) -> Vec<Arc<TopicSubscriber>> {
        self.subscribers.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }
}

impl std::fmt::Debug for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Topic")
            .field("name", &self.name)
            .field("subscribers", &self.subscribers.len())
            .finish()
    }
}

/// One subscription to a topic.
pub struct TopicSubscriber {
    pub id: SubscriberId,
    pub topic: String,
    /// Child of the subscribe scope; cancelled when the subscriber closes.
    scope: Scope,
    /// `None` once closed. Held for the whole delivery of one message, so a
    /// subscriber receives one message at a time.
    sending: Mutex<Option<mpsc::Sender<Message>>>,
}

impl TopicSubscriber {
    pub fn new(topic: &str, scope: &Scope, output: mpsc::Sender<Message>) -> Self {
        Self {
            id: new_uuid(),
            topic: topic.to_string(),
            scope: scope.child(),
            sending: Mutex::new(Some(output)),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.scope.is_cancelled()
    }

    /// Resolves when the subscribe scope is cancelled or the subscriber closes.
    pub async fn cancelled(&self) {
        self.scope.cancelled().await
    }

    /// Delivers `msg` until a copy of it is acked or the subscriber closes.
    ///
    /// Every attempt sends a fresh copy; a nack triggers another attempt.
    pub async fn send_message(&self, msg: &Message) {
        let sending = self.sending.lock().await;
        let Some(output) = sending.as_ref() else {
            return;
        };

        let scope = self.scope.child();
        let mut attempt = 0u64;
        loop {
            attempt += 1;
            if self.is_closed() {
                break;
            }
            let mut delivery = msg.copy();
            delivery.set_scope(scope.clone());
            let acked = delivery.acked();
            let nacked = delivery.nacked();

            trace!(
                topic = %self.topic,
                uuid = %msg.uuid,
                subscriber_uuid = %self.id,
                attempt,
                "Sending message to subscriber"
            );
            tokio::select! {
                sent = output.send(delivery) => {
                    if sent.is_err() {
                        trace!(subscriber_uuid = %self.id, "Subscription dropped by consumer");
                        // unregisters the subscriber
                        self.scope.cancel();
                        break;
                    }
                }
                _ = self.scope.cancelled() => break,
            }

            tokio::select! {
                _ = acked => {
                    trace!(uuid = %msg.uuid, subscriber_uuid = %self.id, "Message acked");
                    break;
                }
                _ = nacked => {
                    trace!(uuid = %msg.uuid, subscriber_uuid = %self.id, "Message nacked, resending");
                }
                _ = self.scope.cancelled() => break,
            }
        }
        scope.cancel();
    }

    /// Stops the delivery loop and closes the subscription queue. Idempotent.
    pub async fn close(&self) {
        self.scope.cancel();
        // waits for an in-progress delivery to observe the cancellation
        let mut sending = self.sending.lock().await;
        if sending.take().is_some() {
            trace!(topic = %self.topic, subscriber_uuid = %self.id, "Subscriber closed");
        }
    }
}

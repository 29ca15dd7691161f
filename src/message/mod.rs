//! Message definitions
//!
//! `Message` is the atomic transfer unit moved between publishers,
//! subscribers and router handlers.
//!
//! Notes on fields:
//! - `uuid`: opaque identifier, a debugging aid; uniqueness is not required
//!   for correctness
//! - `metadata`: string map used for routing hints (payload type name,
//!   correlation id) without decoding the payload
//! - `payload`: immutable bytes
//!
//! Each message also owns a one-shot acknowledgement cell. Cloning a
//! `Message` gives another handle to the same delivery (acking the clone acks
//! the original). [`Message::copy`] creates an independent delivery with its
//! own acknowledgement cell and without the attached scope.

mod scope;

use std::collections::HashMap;
use std::collections::hash_map;
use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;
use tokio::sync::watch;
use uuid::Uuid;

pub use scope::Scope;

/// Generates a new random message identifier.
pub fn new_uuid() -> String {
    Uuid::new_v4().to_string()
}

/// Acknowledgement state of a single delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckState {
    Pending,
    Acked,
    Nacked,
}

/// Unordered string to string mapping carried by every message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata(HashMap<String, String>);

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.0.remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> hash_map::Iter<'_, String, String> {
        self.0.iter()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Metadata {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

#[derive(Clone)]
pub struct Message {
    pub uuid: String,
    pub metadata: Metadata,
    pub payload: Bytes,
    ack: Arc<watch::Sender<AckState>>,
    scope: Scope,
}

impl Message {
    pub fn new(uuid: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        let (ack, _) = watch::channel(AckState::Pending);
        Self {
            uuid: uuid.into(),
            metadata: Metadata::new(),
            payload: payload.into(),
            ack: Arc::new(ack),
            scope: Scope::new(),
        }
    }

    /// Sends the positive acknowledgement.
    ///
    /// Returns `false` only if the message was already negatively acknowledged.
    pub fn ack(&self) -> bool {
        self.settle(AckState::Acked)
    }

    /// Sends the negative acknowledgement.
    ///
    /// Returns `false` only if the message was already acknowledged.
    pub fn nack(&self) -> bool {
        self.settle(AckState::Nacked)
    }

    pub fn ack_state(&self) -> AckState {
        *self.ack.borrow()
    }

    /// Resolves once the message is acknowledged. Never resolves after a nack.
    pub fn acked(&self) -> BoxFuture<'static, ()> {
        self.wait_for(AckState::Acked)
    }

    /// Resolves once the message is negatively acknowledged.
    pub fn nacked(&self) -> BoxFuture<'static, ()> {
        self.wait_for(AckState::Nacked)
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    pub fn set_scope(&mut self, scope: Scope) {
        self.scope = scope;
    }

    /// Independent copy: same uuid, metadata and payload, fresh ack cell, no scope.
    pub fn copy(&self) -> Self {
        let mut copied = Self::new(self.uuid.clone(), self.payload.clone());
        copied.metadata = self.metadata.clone();
        copied
    }

    fn settle(&self, target: AckState) -> bool {
        let mut accepted = true;
        self.ack.send_if_modified(|state| match *state {
            AckState::Pending => {
                *state = target;
                true
            }
            current => {
                accepted = current == target;
                false
            }
        });
        accepted
    }

    fn wait_for(&self, target: AckState) -> BoxFuture<'static, ()> {
        let mut rx = self.ack.subscribe();
        Box::pin(async move {
            let settled = rx.wait_for(|state| *state == target).await.is_ok();
            if !settled {
                std::future::pending::<()>().await;
            }
        })
    }
}

impl PartialEq for Message {
    fn eq(&self, other: &Self) -> bool {
        self.uuid == other.uuid && self.metadata == other.metadata && self.payload == other.payload
    }
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("uuid", &self.uuid)
            .field("metadata", &self.metadata)
            .field("payload_len", &self.payload.len())
            .field("ack", &self.ack_state())
            .finish()
    }
}

/// Identifiers of a batch of messages, in order.
pub fn message_uuids(messages: &[Message]) -> Vec<&str> {
    messages.iter().map(|m| m.uuid.as_str()).collect()
}

#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use crate::message::Message;

/// Append-only in-memory log of published messages, keyed by topic.
#[derive(Debug, Default)]
pub struct MessageLog {
    topics: RwLock<HashMap<String, Vec<Message>>>,
}

impl MessageLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends messages to the topic's log, preserving their order.
    pub fn append(&self, topic: &str, messages: &[Message]) {
        let mut topics = self.topics.write().unwrap_or_else(PoisonError::into_inner);
        topics
            .entry(topic.to_string())
            .or_default()
            .extend(messages.iter().cloned());
    }

    /// Returns the topic's history in publish order.
    pub fn load(&self, topic: &str) -> Vec<Message> {
        let topics = self.topics.read().unwrap_or_else(PoisonError::into_inner);
        topics.get(topic).cloned().unwrap_or_default()
    }

    pub fn len(&self, topic: &str) -> usize {
        let topics = self.topics.read().unwrap_or_else(PoisonError::into_inner);
        topics.get(topic).map_or(0, Vec::len)
    }

    pub fn clear(&self) {
        self.topics
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

//! Routing context attached to messages by the router.
//!
//! Messages received by a handler, and messages it produces, carry the
//! handler's routing information in their scope so that middleware and
//! decorators can read it without access to the router.

use crate::message::{Message, Scope};

pub const HANDLER_NAME_KEY: &str = "handler_name";
pub const PUBLISHER_NAME_KEY: &str = "publisher_name";
pub const SUBSCRIBER_NAME_KEY: &str = "subscriber_name";
pub const SUBSCRIBE_TOPIC_KEY: &str = "subscribe_topic";
pub const PUBLISH_TOPIC_KEY: &str = "publish_topic";

/// Name of the handler that received or produced the message.
pub fn handler_name_from_scope(scope: &Scope) -> Option<&str> {
    scope.value(HANDLER_NAME_KEY)
}

/// Name of the publisher bound to the handler, if any.
pub fn publisher_name_from_scope(scope: &Scope) -> Option<&str> {
    scope.value(PUBLISHER_NAME_KEY)
}

pub fn subscriber_name_from_scope(scope: &Scope) -> Option<&str> {
    scope.value(SUBSCRIBER_NAME_KEY)
}

pub fn subscribe_topic_from_scope(scope: &Scope) -> Option<&str> {
    scope.value(SUBSCRIBE_TOPIC_KEY)
}

pub fn publish_topic_from_scope(scope: &Scope) -> Option<&str> {
    scope.value(PUBLISH_TOPIC_KEY)
}

#[derive(Debug, Clone, Default)]
pub(crate) struct RoutingContext {
    pub handler_name: String,
    pub publisher_name: Option<&'static str>,
    pub subscriber_name: &'static str,
    pub subscribe_topic: String,
    pub publish_topic: Option<String>,
}

impl RoutingContext {
    /// Adds the non-empty routing values to the message's scope.
    pub fn apply(&self, msg: &mut Message) {
        let mut scope = msg.scope().clone();
        let entries = [
            (HANDLER_NAME_KEY, Some(self.handler_name.as_str())),
            (PUBLISHER_NAME_KEY, self.publisher_name),
            (SUBSCRIBER_NAME_KEY, Some(self.subscriber_name)),
            (SUBSCRIBE_TOPIC_KEY, Some(self.subscribe_topic.as_str())),
            (PUBLISH_TOPIC_KEY, self.publish_topic.as_deref()),
        ];
        for (key, value) in entries {
            match value {
                Some(value) if !value.is_empty() => scope = scope.with_value(key, value),
                _ => {}
            }
        }
        msg.set_scope(scope);
    }
}

//! Cancelable scopes carrying cross-cutting key/value pairs.
//!
//! A [`Scope`] plays two roles: it carries string values (handler name,
//! topics, ...) attached to a message or a subscription, and it carries a
//! cancellation signal. Child scopes observe the cancellation of every
//! ancestor; cancelling a child never affects its parent.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::watch;

#[derive(Clone, Default)]
pub struct Scope {
    values: Arc<HashMap<String, String>>,
    signal: Option<Arc<CancelNode>>,
}

struct CancelNode {
    cancelled: watch::Sender<bool>,
    parent: Option<Arc<CancelNode>>,
}

impl Scope {
    /// A root scope without values that is never cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// A cancelable child that keeps this scope's values.
    pub fn child(&self) -> Self {
        let (cancelled, _) = watch::channel(false);
        Self {
            values: Arc::clone(&self.values),
            signal: Some(Arc::new(CancelNode {
                cancelled,
                parent: self.signal.clone(),
            })),
        }
    }

    /// A scope sharing this scope's cancellation with one more value set.
    pub fn with_value(&self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let mut values = HashMap::clone(&self.values);
        values.insert(key.into(), value.into());
        Self {
            values: Arc::new(values),
            signal: self.signal.clone(),
        }
    }

    pub fn value(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn values(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Cancels the nearest cancelable scope in this scope's chain.
    ///
    /// A root scope created by [`Scope::new`] cannot be cancelled.
    pub fn cancel(&self) {
        if let Some(node) = &self.signal {
            node.cancelled.send_replace(true);
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.nodes().any(|node| *node.cancelled.borrow())
    }

    /// Resolves once this scope or any of its ancestors is cancelled.
    pub async fn cancelled(&self) {
        let mut receivers: Vec<watch::Receiver<bool>> =
            self.nodes().map(|node| node.cancelled.subscribe()).collect();
        if receivers.is_empty() {
            return std::future::pending().await;
        }

        let waits = receivers.iter_mut().map(|rx| {
            Box::pin(async move {
                let _ = rx.wait_for(|cancelled| *cancelled).await.is_ok();
            })
        });
        futures::future::select_all(waits).await;
    }

    fn nodes(&self) -> impl Iterator<Item = &CancelNode> {
        std::iter::successors(self.signal.as_deref(), |node| node.parent.as_deref())
    }
}

impl std::fmt::Debug for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scope")
            .field("values", &self.values)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

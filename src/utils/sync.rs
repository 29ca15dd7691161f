//! Small synchronisation helpers shared by the broker and the router.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::{Notify, watch};

/// Counts outstanding tasks and lets callers wait until all of them finish.
///
/// Each task holds a [`WaitGuard`]; dropping the guard (including during a
/// panic unwind) marks the task as done.
#[derive(Clone, Default)]
pub struct WaitGroup {
    inner: Arc<WaitGroupInner>,
}

#[derive(Default)]
struct WaitGroupInner {
    count: AtomicUsize,
    notify: Notify,
}

/// Registration handle returned by [`WaitGroup::add`].
pub struct WaitGuard {
    inner: Arc<WaitGroupInner>,
}

impl WaitGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self) -> WaitGuard {
        self.inner.count.fetch_add(1, Ordering::SeqCst);
        WaitGuard {
            inner: Arc::clone(&self.inner),
        }
    }

    pub fn count(&self) -> usize {
        self.inner.count.load(Ordering::SeqCst)
    }

    /// Resolves once the counter reaches zero.
    pub async fn wait(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            // register before checking so a concurrent `done` cannot be missed
            notified.as_mut().enable();
            if self.count() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Waits for the counter to reach zero; returns `true` if `limit` elapsed first.
    pub async fn wait_timeout(&self, limit: Duration) -> bool {
        tokio::time::timeout(limit, self.wait()).await.is_err()
    }
}

impl Drop for WaitGuard {
    fn drop(&mut self) {
        if self.inner.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.inner.notify.notify_waiters();
        }
    }
}

/// One-way boolean signal: once set it stays set.
#[derive(Clone)]
pub struct Flag {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for Flag {
    fn default() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }
}

impl Flag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the flag; returns `false` if it was already set.
    pub fn set(&self) -> bool {
        !self.tx.send_replace(true)
    }

    pub fn is_set(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once the flag is set.
    pub fn wait(&self) -> BoxFuture<'static, ()> {
        let mut rx = self.tx.subscribe();
        Box::pin(async move {
            let _ = rx.wait_for(|set| *set).await.is_ok();
        })
    }
}

impl std::fmt::Debug for Flag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Flag").field(&self.is_set()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn wait_returns_immediately_when_empty() {
        let wg = WaitGroup::new();
        assert!(!wg.wait_timeout(Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn wait_blocks_until_guards_drop() {
        let wg = WaitGroup::new();
        let first = wg.add();
        let second = wg.add();
        assert_eq!(wg.count(), 2);

        drop(first);
        assert!(wg.wait_timeout(Duration::from_millis(20)).await);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            drop(second);
        });
        assert!(!wg.wait_timeout(Duration::from_secs(1)).await);
        assert_eq!(wg.count(), 0);
    }

    #[tokio::test]
    async fn flag_wakes_waiters_once_set() {
        let flag = Flag::new();
        let waiter = tokio::spawn(flag.wait());
        assert!(flag.set());
        assert!(!flag.set());
        assert!(flag.is_set());
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should be released")
            .unwrap();
        tokio::time::timeout(Duration::from_millis(50), flag.wait())
            .await
            .expect("an already set flag resolves immediately");
    }
}

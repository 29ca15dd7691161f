//! Built-in handler middleware.

use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tracing::{debug, warn};

use super::{HandlerFunc, HandlerMiddleware};
use crate::message::{Message, new_uuid};
use crate::utils::error::Error;

pub const CORRELATION_ID_KEY: &str = "correlation_id";

/// Correlation id of a message, if it carries one.
pub fn message_correlation_id(msg: &Message) -> Option<&str> {
    msg.metadata.get(CORRELATION_ID_KEY)
}

pub fn set_correlation_id(id: &str, msg: &mut Message) {
    if !msg.metadata.contains_key(CORRELATION_ID_KEY) {
        msg.metadata.set(CORRELATION_ID_KEY, id);
    }
}

/// Copies the input message's correlation id to every produced message.
///
/// Input without a correlation id gets a fresh one first.
pub fn correlation_id() -> HandlerMiddleware {
    Arc::new(|next: HandlerFunc| -> HandlerFunc {
        Arc::new(move |mut msg: Message| {
            let next = Arc::clone(&next);
            async move {
                if message_correlation_id(&msg).is_none() {
                    set_correlation_id(&new_uuid(), &mut msg);
                }
                let id = message_correlation_id(&msg).unwrap_or_default().to_string();

                let mut produced = next(msg).await?;
                for produced_msg in &mut produced {
                    set_correlation_id(&id, produced_msg);
                }
                Ok::<_, Error>(produced)
            }
            .boxed()
        })
    })
}

/// Acks the message before the handler runs.
///
/// The handler's outcome no longer affects delivery; an error only prevents
/// the produced messages from being published.
pub fn instant_ack() -> HandlerMiddleware {
    Arc::new(|next: HandlerFunc| -> HandlerFunc {
        Arc::new(move |msg: Message| {
            msg.ack();
            next(msg)
        })
    })
}

/// Fails the handler with [`Error::HandlerTimeout`] when it runs longer than `limit`.
pub fn timeout(limit: Duration) -> HandlerMiddleware {
    Arc::new(move |next: HandlerFunc| -> HandlerFunc {
        Arc::new(move |msg: Message| {
            let handled = next(msg);
            async move {
                tokio::time::timeout(limit, handled)
                    .await
                    .map_err(|_| Error::HandlerTimeout(limit))?
            }
            .boxed()
        })
    })
}

/// Re-runs a failing handler with exponential backoff before giving up.
#[derive(Debug, Clone)]
pub struct Retry {
    pub max_retries: u32,
    pub initial_interval: Duration,
    pub multiplier: f64,
    pub max_interval: Duration,
}

impl Default for Retry {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_interval: Duration::from_millis(100),
            multiplier: 2.0,
            max_interval: Duration::from_secs(10),
        }
    }
}

impl Retry {
    fn backoff(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry.saturating_sub(1)).unwrap_or(i32::MAX);
        let factor = self.multiplier.powi(exponent).max(1.0);
        // capped in f64 so huge multipliers never overflow Duration
        let secs = (self.initial_interval.as_secs_f64() * factor)
            .min(self.max_interval.as_secs_f64());
        Duration::try_from_secs_f64(secs).unwrap_or(self.max_interval)
    }

    pub fn middleware(self) -> HandlerMiddleware {
        let retry = Arc::new(self);
        Arc::new(move |next: HandlerFunc| -> HandlerFunc {
            let retry = Arc::clone(&retry);
            Arc::new(move |msg: Message| {
                let next = Arc::clone(&next);
                let retry = Arc::clone(&retry);
                async move {
                    let mut attempt = 0;
                    loop {
                        let err = match next(msg.clone()).await {
                            Ok(produced) => return Ok(produced),
                            Err(err) => err,
                        };
                        attempt += 1;
                        if attempt > retry.max_retries {
                            warn!(uuid = %msg.uuid, retries = retry.max_retries, error = %err, "Retries exhausted");
                            return Err(err);
                        }

                        let wait = retry.backoff(attempt);
                        debug!(uuid = %msg.uuid, attempt, wait = ?wait, error = %err, "Retrying handler");
                        tokio::select! {
                            _ = tokio::time::sleep(wait) => {}
                            _ = msg.scope().cancelled() => return Err(err),
                        }
                    }
                }
                .boxed()
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::message::AckState;
    use crate::router::handler_func;

    fn failing(times: u32, calls: Arc<AtomicU32>) -> HandlerFunc {
        handler_func(move |_msg: Message| {
            let calls = Arc::clone(&calls);
            async move {
                let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if call <= times {
                    Err(Error::handler(format!("failure {call}")))
                } else {
                    Ok(Vec::new())
                }
            }
        })
    }

    #[tokio::test]
    async fn test_correlation_id_is_propagated() {
        let handler = correlation_id()(handler_func(|_msg: Message| async {
            Ok(vec![Message::new("out", "")])
        }));

        let mut input = Message::new("in", "");
        input.metadata.set(CORRELATION_ID_KEY, "corr-1");
        let produced = handler(input).await.unwrap();
        assert_eq!(message_correlation_id(&produced[0]), Some("corr-1"));

        let produced = handler(Message::new("in", "")).await.unwrap();
        assert!(message_correlation_id(&produced[0]).is_some());
    }

    #[tokio::test]
    async fn test_retry_recovers_from_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let retry = Retry {
            max_retries: 3,
            initial_interval: Duration::from_millis(1),
            ..Default::default()
        };
        let handler = retry.middleware()(failing(2, Arc::clone(&calls)));

        handler(Message::new("1", "")).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_gives_up_after_max_retries() {
        let calls = Arc::new(AtomicU32::new(0));
        let retry = Retry {
            max_retries: 2,
            initial_interval: Duration::from_millis(1),
            ..Default::default()
        };
        let handler = retry.middleware()(failing(10, Arc::clone(&calls)));

        assert!(handler(Message::new("1", "")).await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_backoff_is_capped() {
        let retry = Retry {
            initial_interval: Duration::from_millis(100),
            multiplier: 10.0,
            max_interval: Duration::from_secs(1),
            ..Default::default()
        };
        assert_eq!(retry.backoff(1), Duration::from_millis(100));
        assert_eq!(retry.backoff(2), Duration::from_secs(1));
        assert_eq!(retry.backoff(5), Duration::from_secs(1));
    }

    #[test]
    fn test_backoff_with_huge_multiplier_stays_capped() {
        let retry = Retry {
            max_retries: 6,
            initial_interval: Duration::from_millis(100),
            multiplier: 1e10,
            max_interval: Duration::from_secs(1),
        };
        for attempt in 1..=6 {
            assert!(retry.backoff(attempt) <= Duration::from_secs(1));
        }
        assert_eq!(retry.backoff(4), Duration::from_secs(1));
        assert_eq!(retry.backoff(u32::MAX), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_retry_with_huge_multiplier_returns_handler_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let retry = Retry {
            max_retries: 5,
            initial_interval: Duration::from_millis(1),
            multiplier: 1e12,
            max_interval: Duration::from_millis(2),
        };
        let handler = retry.middleware()(failing(10, Arc::clone(&calls)));

        let err = tokio::time::timeout(Duration::from_secs(1), handler(Message::new("1", "")))
            .await
            .expect("retries should finish")
            .unwrap_err();
        assert!(matches!(err, Error::Handler(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn test_timeout_fails_slow_handlers() {
        let handler = timeout(Duration::from_millis(10))(handler_func(|_msg: Message| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(Vec::new())
        }));
        let err = handler(Message::new("1", "")).await.unwrap_err();
        assert!(matches!(err, Error::HandlerTimeout(_)));
    }

    #[tokio::test]
    async fn test_instant_ack_acks_before_handling() {
        let handler = instant_ack()(handler_func(|msg: Message| async move {
            assert_eq!(msg.ack_state(), AckState::Acked);
            Err(Error::handler("ignored"))
        }));
        let msg = Message::new("1", "");
        assert!(handler(msg.clone()).await.is_err());
        assert_eq!(msg.ack_state(), AckState::Acked);
    }
}

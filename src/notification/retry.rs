use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

use crate::cancel::{Cancellation, Interrupted};
use crate::notification::NotifyError;

/// Fixed-interval retry. `max_attempts: None` retries until success or
/// until the [`Cancellation`] trips.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub interval: Duration,
    pub max_attempts: Option<u32>,
}

impl RetryPolicy {
    pub fn unbounded(interval: Duration) -> Self {
        Self {
            interval,
            max_attempts: None,
        }
    }

    pub fn bounded(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts: Some(max_attempts.max(1)),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::unbounded(Duration::from_secs(1))
    }
}

#[derive(Debug, Error)]
pub enum RetryError {
    #[error("{operation} failed after {attempts} attempts: {source}")]
    Exhausted {
        operation: &'static str,
        attempts: u32,
        #[source]
        source: NotifyError,
    },

    #[error("{operation} failed: {source}")]
    Fatal {
        operation: &'static str,
        #[source]
        source: NotifyError,
    },

    #[error("{operation} abandoned: {source}")]
    Interrupted {
        operation: &'static str,
        #[source]
        source: Interrupted,
    },
}

/// Run a notifier call, retrying retryable failures with a fixed backoff.
///
/// Each attempt and each backoff is raced against `cancel`.
pub async fn request_with_retry<T, F, Fut>(
    operation: &'static str,
    policy: &RetryPolicy,
    cancel: &Cancellation,
    mut call: F,
) -> Result<T, RetryError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, NotifyError>>,
{
    let interrupted = |source| RetryError::Interrupted { operation, source };
    let mut attempt = 0u32;

    loop {
        attempt = attempt.saturating_add(1);

        match cancel.guard(call()).await.map_err(interrupted)? {
            Ok(value) => {
                if attempt > 1 {
                    debug!(operation, attempt, "notifier call succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) if !e.is_retryable() => {
                return Err(RetryError::Fatal {
                    operation,
                    source: e,
                });
            }
            Err(e) => {
                if policy.max_attempts.is_some_and(|max| attempt >= max) {
                    return Err(RetryError::Exhausted {
                        operation,
                        attempts: attempt,
                        source: e,
                    });
                }
                warn!(
                    operation,
                    attempt,
                    error = %e,
                    "notifier call failed, retrying in {:?}",
                    policy.interval
                );
                cancel.sleep(policy.interval).await.map_err(interrupted)?;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    fn api_error() -> NotifyError {
        NotifyError::Api {
            code: 502,
            description: "Bad Gateway".into(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_success_with_fixed_backoff() {
        let calls = AtomicU32::new(0);
        let start = Instant::now();

        let value = request_with_retry(
            "sendMessage",
            &RetryPolicy::unbounded(Duration::from_secs(1)),
            &Cancellation::never(),
            || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 4 {
                    Err(api_error())
                } else {
                    Ok(7)
                }
            },
        )
        .await
        .unwrap();

        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 5);
        assert_eq!(start.elapsed(), Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounded_policy_gives_up() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = request_with_retry(
            "editMessageText",
            &RetryPolicy::bounded(Duration::from_millis(100), 3),
            &Cancellation::never(),
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(NotifyError::Malformed("not json".into()))
            },
        )
        .await;

        assert!(matches!(result, Err(RetryError::Exhausted { attempts: 3, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_fatal_error_is_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = request_with_retry(
            "sendMessage",
            &RetryPolicy::default(),
            &Cancellation::never(),
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(NotifyError::InvalidChatId("---".into()))
            },
        )
        .await;

        assert!(matches!(result, Err(RetryError::Fatal { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_retry_stops_at_deadline() {
        let cancel = Cancellation::never().with_timeout(Duration::from_secs(10));
        let result: Result<(), _> = request_with_retry(
            "getUpdates",
            &RetryPolicy::default(),
            &cancel,
            || async { Err(api_error()) },
        )
        .await;

        assert!(matches!(
            result,
            Err(RetryError::Interrupted {
                source: Interrupted::DeadlineExceeded,
                ..
            })
        ));
    }
}

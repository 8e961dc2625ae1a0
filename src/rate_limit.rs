//! Token-bucket admission control for approval rounds.
//!
//! Tokens accrue continuously at `fill_rate` per second up to `capacity`
//! and are refilled lazily on every call, so no background timer is needed.
//! One [`RateLimiter`] is created at process start and shared by every
//! concurrent authentication attempt.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;

use crate::cancel::{Cancellation, Interrupted};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum RateLimitError {
    #[error("request for {requested} tokens can never be admitted by a bucket of capacity {capacity}")]
    ExceedsCapacity { requested: f64, capacity: f64 },

    #[error("token request must be a positive finite amount, got {requested}")]
    InvalidRequest { requested: f64 },

    #[error(transparent)]
    Interrupted(#[from] Interrupted),
}

/// Continuous token bucket. Not synchronized; see [`RateLimiter`].
#[derive(Debug, Clone)]
pub struct TokenBucket {
    capacity: f64,
    tokens: f64,
    fill_rate: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// A full bucket. Negative or non-finite inputs are clamped to zero.
    pub fn new(capacity: f64, fill_rate: f64) -> Self {
        Self::new_at(capacity, fill_rate, Instant::now())
    }

    pub fn new_at(capacity: f64, fill_rate: f64, now: Instant) -> Self {
        let capacity = sanitize(capacity);
        Self {
            capacity,
            tokens: capacity,
            fill_rate: sanitize(fill_rate),
            last_refill: now,
        }
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    pub fn fill_rate(&self) -> f64 {
        self.fill_rate
    }

    /// Current level without refilling.
    pub fn tokens(&self) -> f64 {
        self.tokens
    }

    pub fn try_consume(&mut self, n: f64) -> bool {
        self.try_consume_at(n, Instant::now())
    }

    /// Refill up to `now`, then take `n` tokens if available. A rejected
    /// call leaves the level untouched apart from the refill. Amounts that
    /// are not positive and finite are always rejected.
    pub fn try_consume_at(&mut self, n: f64, now: Instant) -> bool {
        self.refill(now);
        if !is_valid_amount(n) {
            return false;
        }
        if self.tokens >= n {
            self.tokens -= n;
            true
        } else {
            false
        }
    }

    /// Add tokens out of band, capped at capacity.
    pub fn grant(&mut self, n: f64) {
        self.tokens = (self.tokens + sanitize(n)).min(self.capacity);
    }

    fn refill(&mut self, now: Instant) {
        // A clock that appears to go backwards adds nothing.
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.fill_rate).min(self.capacity);
        if now > self.last_refill {
            self.last_refill = now;
        }
    }
}

fn is_valid_amount(n: f64) -> bool {
    n.is_finite() && n > 0.0
}

fn sanitize(value: f64) -> f64 {
    if value.is_finite() && value > 0.0 {
        value
    } else {
        0.0
    }
}

/// Process-wide handle around a [`TokenBucket`]. Cheap to clone; every clone
/// shares the same bucket behind a mutex.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    bucket: Arc<Mutex<TokenBucket>>,
}

impl RateLimiter {
    pub fn new(capacity: f64, fill_rate: f64) -> Self {
        Self::from_bucket(TokenBucket::new(capacity, fill_rate))
    }

    pub fn from_bucket(bucket: TokenBucket) -> Self {
        Self {
            bucket: Arc::new(Mutex::new(bucket)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TokenBucket> {
        // The bucket holds plain numbers; a panic mid-update cannot leave
        // it in a state worse than a stale refill time.
        self.bucket.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn try_consume(&self, n: f64) -> bool {
        self.lock().try_consume(n)
    }

    pub fn grant(&self, n: f64) {
        self.lock().grant(n);
    }

    pub fn available(&self) -> f64 {
        let mut bucket = self.lock();
        bucket.refill(Instant::now());
        bucket.tokens()
    }

    pub fn capacity(&self) -> f64 {
        self.lock().capacity()
    }

    /// Block until `n` tokens are admitted.
    ///
    /// Each rejected attempt invokes `on_limited` with the attempt number and
    /// then sleeps `interval` before retrying. There is no iteration bound;
    /// only `cancel` ends the wait early.
    pub async fn wait_for_token<F, Fut>(
        &self,
        n: f64,
        interval: Duration,
        cancel: &Cancellation,
        mut on_limited: F,
    ) -> Result<(), RateLimitError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = ()>,
    {
        if !is_valid_amount(n) {
            return Err(RateLimitError::InvalidRequest { requested: n });
        }
        let capacity = self.capacity();
        if n > capacity {
            return Err(RateLimitError::ExceedsCapacity {
                requested: n,
                capacity,
            });
        }

        let mut attempt = 0u32;
        loop {
            cancel.check()?;
            if self.try_consume(n) {
                if attempt > 0 {
                    tracing::debug!(attempts = attempt + 1, "rate limiter admitted after waiting");
                }
                return Ok(());
            }
            attempt = attempt.saturating_add(1);
            tracing::info!(attempt, "rate limited, waiting for a token");
            on_limited(attempt).await;
            cancel.sleep(interval).await?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_burst_then_one_per_second() {
        let t0 = Instant::now();
        let mut bucket = TokenBucket::new_at(3.0, 1.0, t0);

        assert!(bucket.try_consume_at(1.0, t0));
        assert!(bucket.try_consume_at(1.0, t0));
        assert!(bucket.try_consume_at(1.0, t0));
        assert!(!bucket.try_consume_at(1.0, t0));

        let t1 = t0 + Duration::from_secs(1);
        assert!(bucket.try_consume_at(1.0, t1));
        assert!(!bucket.try_consume_at(1.0, t1));
    }

    #[test]
    fn test_refill_is_fractional() {
        let t0 = Instant::now();
        let mut bucket = TokenBucket::new_at(1.0, 1.0, t0);
        assert!(bucket.try_consume_at(1.0, t0));

        assert!(!bucket.try_consume_at(1.0, t0 + Duration::from_millis(500)));
        assert!((bucket.tokens() - 0.5).abs() < 1e-9);
        assert!(bucket.try_consume_at(1.0, t0 + Duration::from_millis(1000)));
    }

    #[test]
    fn test_tokens_stay_within_bounds() {
        let t0 = Instant::now();
        let mut bucket = TokenBucket::new_at(3.0, 2.0, t0);
        let steps = [0u64, 0, 0, 0, 250, 0, 700, 5_000, 0, 0, 0, 0, 10, 990, 3];
        let amounts = [2.0, 1.0, -5.0, 1.0, f64::NAN, 0.0, f64::NEG_INFINITY, 1.0];
        let mut now = t0;
        for (i, step) in steps.iter().enumerate() {
            now += Duration::from_millis(*step);
            bucket.try_consume_at(amounts[i % amounts.len()], now);
            assert!(bucket.tokens() >= 0.0, "negative at step {i}");
            assert!(bucket.tokens() <= bucket.capacity(), "overfull at step {i}");
        }
    }

    #[test]
    fn test_non_positive_amounts_are_rejected() {
        let t0 = Instant::now();
        let mut bucket = TokenBucket::new_at(3.0, 1.0, t0);
        assert!(!bucket.try_consume_at(-5.0, t0));
        assert!(!bucket.try_consume_at(0.0, t0));
        assert!(!bucket.try_consume_at(f64::NAN, t0));
        assert!(!bucket.try_consume_at(f64::INFINITY, t0));
        assert_eq!(bucket.tokens(), 3.0);
    }

    #[test]
    fn test_long_idle_caps_at_capacity() {
        let t0 = Instant::now();
        let mut bucket = TokenBucket::new_at(3.0, 1.0, t0);
        for _ in 0..3 {
            assert!(bucket.try_consume_at(1.0, t0));
        }
        let later = t0 + Duration::from_secs(3600);
        assert!(bucket.try_consume_at(1.0, later));
        assert!((bucket.tokens() - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_zero_fill_rate_never_refills() {
        let t0 = Instant::now();
        let mut bucket = TokenBucket::new_at(1.0, 0.0, t0);
        assert!(bucket.try_consume_at(1.0, t0));
        assert!(!bucket.try_consume_at(1.0, t0 + Duration::from_secs(86_400)));
        bucket.grant(5.0);
        assert_eq!(bucket.tokens(), 1.0);
    }

    #[test]
    fn test_invalid_parameters_are_clamped() {
        let bucket = TokenBucket::new(f64::NAN, -1.0);
        assert_eq!(bucket.capacity(), 0.0);
        assert_eq!(bucket.fill_rate(), 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_token_reports_each_rejection() {
        let limiter = RateLimiter::new(1.0, 1.0);
        assert!(limiter.try_consume(1.0));

        let notices = Arc::new(Mutex::new(Vec::new()));
        let seen = notices.clone();
        let start = Instant::now();
        limiter
            .wait_for_token(1.0, Duration::from_millis(400), &Cancellation::never(), |attempt| {
                seen.lock().unwrap().push(attempt);
                async {}
            })
            .await
            .unwrap();

        // Rejected at 0ms, 400ms, 800ms; admitted at 1200ms.
        assert_eq!(*notices.lock().unwrap(), vec![1, 2, 3]);
        assert_eq!(start.elapsed(), Duration::from_millis(1200));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_token_unblocks_on_grant() {
        let limiter = RateLimiter::new(1.0, 0.0);
        assert!(limiter.try_consume(1.0));

        let waiter = {
            let limiter = limiter.clone();
            tokio::spawn(async move {
                limiter
                    .wait_for_token(1.0, Duration::from_secs(1), &Cancellation::never(), |_| async {})
                    .await
            })
        };

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(!waiter.is_finished());

        limiter.grant(1.0);
        waiter.await.unwrap().unwrap();
        assert_eq!(limiter.available(), 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_token_honours_deadline() {
        let limiter = RateLimiter::new(1.0, 0.0);
        assert!(limiter.try_consume(1.0));

        let cancel = Cancellation::never().with_timeout(Duration::from_secs(5));
        let result = limiter
            .wait_for_token(1.0, Duration::from_secs(1), &cancel, |_| async {})
            .await;
        assert_eq!(
            result,
            Err(RateLimitError::Interrupted(Interrupted::DeadlineExceeded))
        );
    }

    #[tokio::test]
    async fn test_oversized_request_is_rejected_up_front() {
        let limiter = RateLimiter::new(2.0, 1.0);
        let result = limiter
            .wait_for_token(3.0, Duration::from_secs(1), &Cancellation::never(), |_| async {})
            .await;
        assert!(matches!(result, Err(RateLimitError::ExceedsCapacity { .. })));
        assert_eq!(limiter.available(), 2.0);
    }

    #[tokio::test]
    async fn test_negative_request_is_rejected_up_front() {
        let limiter = RateLimiter::new(2.0, 1.0);
        let result = limiter
            .wait_for_token(-1.0, Duration::from_secs(1), &Cancellation::never(), |_| async {})
            .await;
        assert!(matches!(result, Err(RateLimitError::InvalidRequest { .. })));
        assert!(!limiter.try_consume(-1.0));
        assert_eq!(limiter.available(), 2.0);
    }

    #[tokio::test]
    async fn test_clones_share_one_bucket() {
        let a = RateLimiter::new(2.0, 0.0);
        let b = a.clone();
        assert!(a.try_consume(1.0));
        assert!(b.try_consume(1.0));
        assert!(!a.try_consume(1.0));
        assert!(!b.try_consume(1.0));
    }
}

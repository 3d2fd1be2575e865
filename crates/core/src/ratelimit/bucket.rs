// Token bucket primitive used by every rate limit tier

use super::RateLimitError;
use crate::context::CallContext;
use parking_lot::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// Mutable part of a bucket, always accessed under the bucket's lock
#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// A single rate-limited counter.
///
/// Holds up to `burst` tokens and refills continuously at `rate` tokens per
/// second. Starts full. Refill and consume happen under one lock, so
/// concurrent admissions against the same bucket are linearized.
#[derive(Debug)]
pub struct TokenBucket {
    rate: f64,
    burst: u32,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// Create a full bucket. Negative or NaN rates are treated as zero.
    pub fn new(rate: f64, burst: u32) -> Self {
        Self {
            rate: rate.max(0.0),
            burst,
            state: Mutex::new(BucketState {
                tokens: burst as f64,
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn burst(&self) -> u32 {
        self.burst
    }

    /// Tokens currently available, after refilling up to now
    pub fn available(&self) -> f64 {
        let mut state = self.state.lock();
        self.refill(&mut state, Instant::now());
        state.tokens
    }

    /// Consume a token if one is available right now.
    ///
    /// Returns `Ok(None)` on admission, `Ok(Some(wait))` with the time until
    /// the next token accrues, or `Exhausted` if this bucket can never admit.
    pub fn try_acquire(&self) -> Result<Option<Duration>, RateLimitError> {
        if self.rate.is_infinite() {
            return Ok(None);
        }
        if self.burst == 0 {
            return Err(RateLimitError::Exhausted);
        }

        let mut state = self.state.lock();
        self.refill(&mut state, Instant::now());

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            return Ok(None);
        }
        if self.rate == 0.0 {
            return Err(RateLimitError::Exhausted);
        }

        // A rate small enough to overflow `Duration` can never admit again
        let needed = 1.0 - state.tokens;
        let wait = Duration::try_from_secs_f64(needed / self.rate)
            .map_err(|_| RateLimitError::Exhausted)?;
        Ok(Some(wait))
    }

    /// Wait until a token can be consumed.
    ///
    /// A token that is available right now is taken even if the context is
    /// already cancelled. Otherwise fails with `Cancelled` if the context is
    /// cancelled before the token accrues, and with `DeadlineExceeded` as
    /// soon as the next token would only accrue after the context's
    /// deadline.
    pub async fn wait(&self, cx: &CallContext) -> Result<(), RateLimitError> {
        loop {
            let wait = match self.try_acquire()? {
                None => return Ok(()),
                Some(wait) => wait,
            };

            if cx.is_cancelled() {
                return Err(RateLimitError::Cancelled);
            }

            if let Some(deadline) = cx.deadline() {
                let ready = Instant::now().checked_add(wait);
                if ready.map_or(true, |ready| ready > deadline) {
                    return Err(RateLimitError::DeadlineExceeded { wait });
                }
            }

            tracing::trace!(wait_ms = wait.as_millis() as u64, "waiting for rate limit token");

            tokio::select! {
                biased;
                _ = cx.cancelled() => return Err(RateLimitError::Cancelled),
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    fn refill(&self, state: &mut BucketState, now: Instant) {
        let elapsed = now.saturating_duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rate).min(self.burst as f64);
        state.last_refill = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_bucket_starts_full() {
        let bucket = TokenBucket::new(1.0, 3);

        for _ in 0..3 {
            assert_eq!(bucket.try_acquire().unwrap(), None);
        }

        let wait = bucket.try_acquire().unwrap().unwrap();
        assert_eq!(wait, Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_refill_is_capped_at_burst() {
        let bucket = TokenBucket::new(10.0, 2);
        bucket.try_acquire().unwrap();
        bucket.try_acquire().unwrap();

        tokio::time::advance(Duration::from_secs(60)).await;

        assert_eq!(bucket.available(), 2.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_refill() {
        let bucket = TokenBucket::new(4.0, 1);
        bucket.try_acquire().unwrap();

        tokio::time::advance(Duration::from_millis(125)).await;
        assert!((bucket.available() - 0.5).abs() < 1e-9);

        let wait = bucket.try_acquire().unwrap().unwrap();
        assert_eq!(wait, Duration::from_millis(125));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_rate_never_admits_after_burst() {
        let bucket = TokenBucket::new(0.0, 1);
        assert!(bucket.wait(&CallContext::new()).await.is_ok());

        let err = bucket.wait(&CallContext::new()).await.unwrap_err();
        assert!(matches!(err, RateLimitError::Exhausted));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_burst_never_admits() {
        let bucket = TokenBucket::new(0.0, 0);
        assert!(matches!(
            bucket.try_acquire(),
            Err(RateLimitError::Exhausted)
        ));

        let bucket = TokenBucket::new(100.0, 0);
        assert!(matches!(
            bucket.wait(&CallContext::new()).await,
            Err(RateLimitError::Exhausted)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_infinite_rate_always_admits() {
        let bucket = TokenBucket::new(f64::INFINITY, 0);
        for _ in 0..100 {
            assert!(bucket.wait(&CallContext::new()).await.is_ok());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_blocks_until_token_accrues() {
        let bucket = TokenBucket::new(1.0, 1);
        bucket.wait(&CallContext::new()).await.unwrap();

        let start = Instant::now();
        bucket.wait(&CallContext::new()).await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_fails_past_deadline() {
        let bucket = TokenBucket::new(1.0, 1);
        bucket.wait(&CallContext::new()).await.unwrap();

        let cx = CallContext::with_timeout(Duration::from_millis(100));
        let err = bucket.wait(&cx).await.unwrap_err();
        assert!(matches!(err, RateLimitError::DeadlineExceeded { .. }));

        // A failed wait does not consume anything
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(bucket.available(), 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_honors_cancellation() {
        let bucket = std::sync::Arc::new(TokenBucket::new(0.1, 1));
        bucket.wait(&CallContext::new()).await.unwrap();

        let cx = CallContext::new();
        let waiter = {
            let bucket = bucket.clone();
            let cx = cx.clone();
            tokio::spawn(async move { bucket.wait(&cx).await })
        };

        tokio::time::advance(Duration::from_secs(1)).await;
        cx.cancel();

        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(RateLimitError::Cancelled)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_tiny_rate_is_exhausted_instead_of_overflowing() {
        let bucket = TokenBucket::new(1e-20, 1);
        assert_eq!(bucket.try_acquire().unwrap(), None);

        assert_eq!(bucket.try_acquire(), Err(RateLimitError::Exhausted));
        assert!(matches!(
            bucket.wait(&CallContext::new()).await,
            Err(RateLimitError::Exhausted)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_huge_wait_exceeds_any_deadline() {
        let bucket = TokenBucket::new(1e-15, 1);
        bucket.try_acquire().unwrap();

        let cx = CallContext::with_timeout(Duration::from_secs(3600));
        let err = bucket.wait(&cx).await.unwrap_err();
        assert!(matches!(err, RateLimitError::DeadlineExceeded { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_available_token_taken_despite_cancellation() {
        let bucket = TokenBucket::new(1.0, 1);
        let cx = CallContext::new();
        cx.cancel();

        assert!(bucket.wait(&cx).await.is_ok());
        assert_eq!(bucket.wait(&cx).await, Err(RateLimitError::Cancelled));
    }

    #[tokio::test]
    async fn test_negative_rate_is_clamped() {
        let bucket = TokenBucket::new(-5.0, 1);
        assert_eq!(bucket.rate(), 0.0);

        let bucket = TokenBucket::new(f64::NAN, 1);
        assert_eq!(bucket.rate(), 0.0);
    }
}

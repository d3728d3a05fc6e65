//! Per-source token bucket.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Stand-in for "no deadline" when `now + timeout` does not fit in an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// `now + timeout`, saturating to a far-future instant instead of overflowing.
pub fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_per_second: f64,
}

impl Default for TokenBucketConfig {
    fn default() -> Self {
        Self {
            capacity: 5,
            refill_per_second: 1.0,
        }
    }
}

#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    refill_per_second: f64,
    state: Mutex<TokenBucketState>,
}

#[derive(Debug, Clone, Copy)]
struct TokenBucketState {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// Starts full.
    pub fn new(config: TokenBucketConfig) -> Self {
        let capacity = f64::from(config.capacity.max(1));
        Self {
            capacity,
            refill_per_second: config.refill_per_second.max(0.0),
            state: Mutex::new(TokenBucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Take one token, waiting at most `timeout`. Returns `false` if no token
    /// can be had within the wait budget.
    pub async fn acquire(&self, timeout: Duration) -> bool {
        let deadline = deadline_after(timeout);
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                self.refill(&mut state);
                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    return true;
                }
                self.time_until_token(&state)
            };

            match wait {
                Some(wait) if Instant::now().checked_add(wait).is_some_and(|ready| ready <= deadline) => {
                    tokio::time::sleep(wait).await
                }
                _ => return false,
            }
        }
    }

    pub async fn available(&self) -> f64 {
        let mut state = self.state.lock().await;
        self.refill(&mut state);
        state.tokens
    }

    fn refill(&self, state: &mut TokenBucketState) {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(state.last_refill);
        if self.refill_per_second > 0.0 && !elapsed.is_zero() {
            let added = elapsed.as_secs_f64() * self.refill_per_second;
            state.tokens = (state.tokens + added).min(self.capacity);
        }
        state.last_refill = now;
    }

    fn time_until_token(&self, state: &TokenBucketState) -> Option<Duration> {
        if self.refill_per_second <= 0.0 {
            return None;
        }
        Duration::try_from_secs_f64((1.0 - state.tokens) / self.refill_per_second).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bucket(capacity: u32, refill_per_second: f64) -> TokenBucket {
        TokenBucket::new(TokenBucketConfig {
            capacity,
            refill_per_second,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn burst_up_to_capacity_then_waits_for_refill() {
        let bucket = bucket(2, 1.0);
        assert!(bucket.acquire(Duration::ZERO).await);
        assert!(bucket.acquire(Duration::ZERO).await);
        assert!(!bucket.acquire(Duration::from_millis(100)).await);

        let started = Instant::now();
        assert!(bucket.acquire(Duration::from_secs(2)).await);
        let waited = started.elapsed();
        assert!(waited >= Duration::from_millis(900), "waited {waited:?}");
        assert!(waited <= Duration::from_millis(1100), "waited {waited:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn refill_is_capped_at_capacity() {
        let bucket = bucket(3, 10.0);
        tokio::time::advance(Duration::from_secs(60)).await;
        assert!((bucket.available().await - 3.0).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_refill_never_recovers() {
        let bucket = bucket(1, 0.0);
        assert!(bucket.acquire(Duration::ZERO).await);
        assert!(!bucket.acquire(Duration::from_secs(3600)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn unbounded_wait_does_not_overflow() {
        let bucket = bucket(1, 1.0);
        assert!(bucket.acquire(Duration::MAX).await);
        assert!(bucket.acquire(Duration::MAX).await);

        let dry = TokenBucket::new(TokenBucketConfig {
            capacity: 1,
            refill_per_second: 1e-300,
        });
        assert!(dry.acquire(Duration::ZERO).await);
        assert!(!dry.acquire(Duration::MAX).await);
    }

    #[test]
    fn deadline_saturates() {
        let runtime = tokio::runtime::Builder::new_current_thread().enable_time().build().unwrap();
        runtime.block_on(async {
            assert!(deadline_after(Duration::MAX) > Instant::now());
            assert!(deadline_after(Duration::from_secs(5)) > Instant::now());
        });
    }

    #[tokio::test(start_paused = true)]
    async fn shared_bucket_hands_out_each_token_once() {
        let bucket = std::sync::Arc::new(bucket(4, 0.0));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let bucket = bucket.clone();
            handles.push(tokio::spawn(async move { bucket.acquire(Duration::ZERO).await }));
        }
        let mut granted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                granted += 1;
            }
        }
        assert_eq!(granted, 4);
    }
}

//! Rate Governor - Shared Token Bucket
//!
//! Capacity equals the configured requests-per-minute and refills
//! continuously. One governor is shared by every generation call in the
//! process; the bucket state lives behind a single async mutex.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GovernorError {
    #[error("Rate limit timeout: no token available within {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
}

/// Longest acquire timeout the config accepts: one day.
pub const MAX_ACQUIRE_TIMEOUT_MS: u64 = 24 * 60 * 60 * 1_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GovernorConfig {
    pub requests_per_minute: u32,
    pub acquire_timeout_ms: u64,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: 45,
            acquire_timeout_ms: 120_000,
        }
    }
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

#[derive(Debug)]
pub struct RateGovernor {
    capacity: f64,
    refill_per_sec: f64,
    acquire_timeout: Duration,
    bucket: Mutex<Bucket>,
}

impl RateGovernor {
    /// Starts with a full bucket.
    pub fn new(config: &GovernorConfig) -> Self {
        let capacity = f64::from(config.requests_per_minute.max(1));
        Self {
            capacity,
            refill_per_sec: capacity / 60.0,
            acquire_timeout: Duration::from_millis(config.acquire_timeout_ms),
            bucket: Mutex::new(Bucket {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    fn refill(&self, bucket: &mut Bucket, now: Instant) {
        let elapsed = now.saturating_duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        bucket.last_refill = now;
    }

    /// Take one token without waiting.
    pub async fn try_acquire(&self) -> bool {
        let mut bucket = self.bucket.lock().await;
        self.refill(&mut bucket, Instant::now());
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Wait for a token, or fail once the acquire timeout would be exceeded.
    ///
    /// Tokens only arrive through refill, so if the next one cannot arrive
    /// before the deadline the call fails without sleeping.
    pub async fn acquire(&self) -> Result<(), GovernorError> {
        // No representable deadline means no deadline.
        let deadline = Instant::now().checked_add(self.acquire_timeout);
        loop {
            let wait = {
                let mut bucket = self.bucket.lock().await;
                let now = Instant::now();
                self.refill(&mut bucket, now);
                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    return Ok(());
                }
                Duration::from_secs_f64((1.0 - bucket.tokens) / self.refill_per_sec)
                    .max(Duration::from_millis(1))
            };

            let now = Instant::now();
            if deadline.is_some_and(|deadline| now + wait > deadline) {
                return Err(GovernorError::Timeout {
                    timeout_ms: self.acquire_timeout.as_millis() as u64,
                });
            }
            debug!(wait_ms = wait.as_millis() as u64, "waiting for rate governor token");
            tokio::time::sleep(wait).await;
        }
    }

    /// Current token count after refill.
    pub async fn available(&self) -> f64 {
        let mut bucket = self.bucket.lock().await;
        self.refill(&mut bucket, Instant::now());
        bucket.tokens
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn governor(rpm: u32, timeout_ms: u64) -> RateGovernor {
        RateGovernor::new(&GovernorConfig {
            requests_per_minute: rpm,
            acquire_timeout_ms: timeout_ms,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_up_to_capacity() {
        let gov = governor(3, 0);
        assert!(gov.acquire().await.is_ok());
        assert!(gov.acquire().await.is_ok());
        assert!(gov.acquire().await.is_ok());
        assert_eq!(
            gov.acquire().await,
            Err(GovernorError::Timeout { timeout_ms: 0 })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_for_refill() {
        // 60 rpm = one token per second
        let gov = governor(60, 5_000);
        for _ in 0..60 {
            assert!(gov.try_acquire().await);
        }
        let start = Instant::now();
        gov.acquire().await.unwrap();
        let waited = start.elapsed();
        assert!(waited >= Duration::from_millis(900), "waited {:?}", waited);
        assert!(waited <= Duration::from_millis(1_100), "waited {:?}", waited);
    }

    #[tokio::test(start_paused = true)]
    async fn test_times_out_when_refill_too_slow() {
        // 1 rpm: next token in 60s, timeout 1s
        let gov = governor(1, 1_000);
        gov.acquire().await.unwrap();
        assert!(matches!(
            gov.acquire().await,
            Err(GovernorError::Timeout { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_huge_timeout_waits_instead_of_overflowing() {
        let gov = governor(60, u64::MAX);
        assert!(gov.try_acquire().await);
        for _ in 0..59 {
            assert!(gov.try_acquire().await);
        }
        let start = Instant::now();
        gov.acquire().await.unwrap();
        assert!(start.elapsed() <= Duration::from_millis(1_100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_refill_capped_at_capacity() {
        let gov = governor(10, 0);
        tokio::time::advance(Duration::from_secs(600)).await;
        assert!(gov.available().await <= 10.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shared_across_tasks() {
        let gov = Arc::new(governor(5, 0));
        let mut handles = Vec::new();
        for _ in 0..10 {
            let gov = Arc::clone(&gov);
            handles.push(tokio::spawn(async move { gov.try_acquire().await }));
        }
        let mut granted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                granted += 1;
            }
        }
        assert_eq!(granted, 5);
    }
}

//! Token-bucket rate regulation for the send path. The engine only ever
//! talks to the [`RateLimiter`] seam; the bucket below is the stock
//! implementation wired in when `txw_max_rte` is configured.

use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

#[cfg(test)]
use mockall::automock;

#[cfg_attr(test, automock)]
pub trait RateLimiter: Send + Sync {
    /// account for `len` bytes about to be sent. `None` clears the send;
    /// `Some(wait)` tells the caller how long the bucket needs to refill.
    fn check(&self, len: usize) -> Option<Duration>;
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

pub struct TokenBucket {
    rate_per_sec: f64,
    capacity: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// `rate` in bytes per second; `iphdr_len` is charged per packet on top
    /// of the PGM bytes, matching how the rate target is specified
    pub fn new(rate: u64, iphdr_len: usize) -> TokenBucket {
        let rate_per_sec = rate as f64;
        TokenBucket {
            rate_per_sec,
            // one second worth of burst, but never less than one full packet
            capacity: rate_per_sec.max((iphdr_len + 9000) as f64),
            state: Mutex::new(BucketState {
                tokens: rate_per_sec,
                last_refill: Instant::now(),
            }),
        }
    }
}

impl RateLimiter for TokenBucket {
    fn check(&self, len: usize) -> Option<Duration> {
        let mut state = self.state.lock().expect("rate limiter lock poisoned");

        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rate_per_sec).min(self.capacity);
        state.last_refill = now;

        let needed = len as f64;
        if state.tokens >= needed {
            state.tokens -= needed;
            None
        } else {
            let deficit = needed - state.tokens;
            Some(Duration::from_secs_f64(deficit / self.rate_per_sec))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_burst_within_capacity_passes() {
        let bucket = TokenBucket::new(10_000, 20);
        assert_eq!(bucket.check(4000), None);
        assert_eq!(bucket.check(4000), None);
    }

    #[test]
    fn test_exhausted_bucket_reports_wait() {
        let bucket = TokenBucket::new(1000, 20);
        assert_eq!(bucket.check(1000), None);

        let wait = bucket.check(500).expect("bucket should be empty");
        assert!(wait > Duration::from_millis(400), "wait was {:?}", wait);
        assert!(wait <= Duration::from_millis(520), "wait was {:?}", wait);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refill_over_time() {
        let bucket = TokenBucket::new(1000, 20);
        assert_eq!(bucket.check(1000), None);
        assert!(bucket.check(100).is_some());

        tokio::time::advance(Duration::from_millis(200)).await;
        assert_eq!(bucket.check(100), None);
    }
}

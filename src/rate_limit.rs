// =============================================================================
// Rate Limiter — token bucket pacing outbound fetches
// =============================================================================
//
// The bucket refills continuously at `requests_per_second` up to `burst`
// tokens. `acquire` suspends the caller until a token is available, so the
// fetch path cannot exceed the configured pace no matter how many workers
// run concurrently.
// =============================================================================

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Token-bucket limiter shared by all fetch workers.
pub struct RateLimiter {
    rate_per_second: f64,
    burst: f64,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    /// `rate_per_second` must be positive; `burst` is clamped to at least 1.
    pub fn new(rate_per_second: f64, burst: u32) -> Self {
        let burst = burst.max(1) as f64;
        Self {
            rate_per_second: rate_per_second.max(0.001),
            burst,
            bucket: Mutex::new(Bucket {
                tokens: burst,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Take one token, sleeping until one is available.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut bucket = self.bucket.lock();
                self.refill(&mut bucket);
                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    return;
                }
                // Time until one full token accumulates.
                Duration::from_secs_f64((1.0 - bucket.tokens) / self.rate_per_second)
            };
            debug!(wait_ms = wait.as_millis() as u64, "rate limiter pacing");
            tokio::time::sleep(wait).await;
        }
    }

    /// Take a token only if one is immediately available.
    pub fn try_acquire(&self) -> bool {
        let mut bucket = self.bucket.lock();
        self.refill(&mut bucket);
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn refill(&self, bucket: &mut Bucket) {
        let elapsed = bucket.last_refill.elapsed().as_secs_f64();
        bucket.last_refill = Instant::now();
        bucket.tokens = (bucket.tokens + elapsed * self.rate_per_second).min(self.burst);
    }
}

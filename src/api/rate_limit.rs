use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Continuous-refill token bucket gating outbound API calls.
///
/// Capacity equals the configured requests-per-second, so a full bucket
/// admits at most one second of burst. Refill is derived from monotonic
/// elapsed time on each acquire, no background timer involved. Tokens are
/// fractional to avoid burst quantization at low rates.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    rate: f64,
    capacity: f64,
    bucket: Arc<Mutex<Bucket>>,
}

impl RateLimiter {
    pub fn new(requests_per_second: f64) -> Self {
        let rate = requests_per_second.max(0.01);
        let capacity = rate.max(1.0);
        Self {
            rate,
            capacity,
            bucket: Arc::new(Mutex::new(Bucket {
                tokens: capacity,
                last_refill: Instant::now(),
            })),
        }
    }

    /// Block until one token is available, then consume it.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut bucket = self.bucket.lock().await;

                let now = Instant::now();
                let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
                bucket.tokens = (bucket.tokens + elapsed * self.rate).min(self.capacity);
                bucket.last_refill = now;

                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    return;
                }

                Duration::from_secs_f64((1.0 - bucket.tokens) / self.rate)
            };

            tokio::time::sleep(wait).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn burst_up_to_capacity_is_immediate() {
        let limiter = RateLimiter::new(5.0);
        let start = Instant::now();

        for _ in 0..5 {
            limiter.acquire().await;
        }

        assert!(start.elapsed() < Duration::from_millis(10));
    }

    #[tokio::test(start_paused = true)]
    async fn drained_bucket_paces_at_the_configured_rate() {
        let limiter = RateLimiter::new(5.0);

        for _ in 0..5 {
            limiter.acquire().await;
        }

        // Bucket is empty; the next token refills at 5/s, so roughly 200ms.
        let start = Instant::now();
        limiter.acquire().await;
        let waited = start.elapsed();

        assert!(waited >= Duration::from_millis(190), "waited {waited:?}");
        assert!(waited <= Duration::from_millis(400), "waited {waited:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_acquirers_share_the_bucket() {
        let limiter = RateLimiter::new(2.0);
        let start = Instant::now();

        let mut handles = Vec::new();
        for _ in 0..6 {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move { limiter.acquire().await }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        // 2 immediate + 4 refills at 2/s: at least ~2s total.
        assert!(start.elapsed() >= Duration::from_millis(1900));
    }
}

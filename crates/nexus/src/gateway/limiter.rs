//! Per-provider call budgets: a concurrency gate plus a token bucket for
//! request rate. Waiters are served in FIFO order.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

pub struct ProviderLimiter {
    semaphore: Arc<Semaphore>,
    /// Serializes token grants so rate waiters keep arrival order.
    turnstile: Mutex<()>,
    bucket: Mutex<TokenBucket>,
}

struct TokenBucket {
    tokens: f64,
    capacity: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
    }
}

/// Held for the duration of one provider call.
pub struct LimiterPermit {
    _permit: OwnedSemaphorePermit,
}

impl ProviderLimiter {
    pub fn new(concurrency: usize, requests_per_sec: u32) -> Self {
        let rate = requests_per_sec.max(1) as f64;
        Self {
            semaphore: Arc::new(Semaphore::new(concurrency.max(1))),
            turnstile: Mutex::new(()),
            bucket: Mutex::new(TokenBucket {
                tokens: rate,
                capacity: rate,
                refill_per_sec: rate,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Wait for a concurrency slot and a rate token. Bounded wait: the rate
    /// deficit is at most one token, so the sleep is at most `1/rate`.
    pub async fn acquire(&self) -> LimiterPermit {
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .expect("limiter semaphore never closes");

        let _turn = self.turnstile.lock().await;
        loop {
            let wait = {
                let mut bucket = self.bucket.lock().await;
                bucket.refill(Instant::now());
                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    None
                } else {
                    Some(Duration::from_secs_f64(
                        (1.0 - bucket.tokens) / bucket.refill_per_sec,
                    ))
                }
            };
            match wait {
                None => break,
                Some(wait) => tokio::time::sleep(wait).await,
            }
        }

        LimiterPermit { _permit: permit }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_concurrency_gate() {
        let limiter = Arc::new(ProviderLimiter::new(2, 1000));
        let a = limiter.acquire().await;
        let _b = limiter.acquire().await;

        let limiter_clone = Arc::clone(&limiter);
        let third = tokio::spawn(async move { limiter_clone.acquire().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!third.is_finished());

        drop(a);
        let _c = third.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_tokens_refill_over_time() {
        let limiter = ProviderLimiter::new(8, 2);

        // Burst up to the bucket capacity, then the next call must wait.
        let _a = limiter.acquire().await;
        let _b = limiter.acquire().await;

        let start = Instant::now();
        let _c = limiter.acquire().await;
        // 2 rps means roughly half a second for the next token.
        assert!(start.elapsed() >= Duration::from_millis(400));
    }
}

//! Token-bucket admission control

use tokio::time::Instant;

/// Per-connection token bucket.
///
/// Owned by exactly one connection task, so it takes `&mut self` and needs no
/// synchronisation.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    rate: f64,
    capacity: f64,
    tokens: f64,
    last_refill: Instant,
}

impl RateLimiter {
    /// `rate` tokens per second; capacity is `burst` when given, else `rate`
    pub fn new(rate: u32, burst: Option<u32>) -> Self {
        let capacity = f64::from(burst.unwrap_or(rate));
        Self {
            rate: f64::from(rate),
            capacity,
            tokens: capacity,
            last_refill: Instant::now(),
        }
    }

    /// Take one token if available
    pub fn try_consume(&mut self) -> bool {
        self.try_consume_at(Instant::now())
    }

    pub fn try_consume_at(&mut self, now: Instant) -> bool {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Tokens currently available, after refilling
    pub fn available(&mut self) -> f64 {
        self.refill(Instant::now());
        self.tokens
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.capacity);
        self.last_refill = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_burst_then_deny() {
        let mut limiter = RateLimiter::new(10, Some(5));
        for _ in 0..5 {
            assert!(limiter.try_consume());
        }
        assert!(!limiter.try_consume());
    }

    #[tokio::test(start_paused = true)]
    async fn test_refill_after_one_interval() {
        let mut limiter = RateLimiter::new(10, Some(3));
        for _ in 0..3 {
            assert!(limiter.try_consume());
        }
        assert!(!limiter.try_consume());

        tokio::time::advance(Duration::from_millis(100)).await;
        assert!(limiter.try_consume());
        assert!(!limiter.try_consume());
    }

    #[tokio::test(start_paused = true)]
    async fn test_capacity_defaults_to_rate() {
        let mut limiter = RateLimiter::new(4, None);
        assert_eq!(limiter.capacity(), 4.0);
        for _ in 0..4 {
            assert!(limiter.try_consume());
        }
        assert!(!limiter.try_consume());
    }

    #[tokio::test(start_paused = true)]
    async fn test_refill_is_capped() {
        let mut limiter = RateLimiter::new(100, Some(2));
        assert!(limiter.try_consume());
        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(limiter.available(), 2.0);
    }

    #[test]
    fn test_denied_attempt_does_not_go_negative() {
        let start = Instant::now();
        let mut limiter = RateLimiter::new(1, Some(1));
        assert!(limiter.try_consume_at(start));
        assert!(!limiter.try_consume_at(start));
        assert!(!limiter.try_consume_at(start));
        assert!(limiter.try_consume_at(start + Duration::from_secs(1)));
    }
}

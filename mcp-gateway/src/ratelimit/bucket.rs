//! In-process token bucket, the fallback when the cache store is unavailable
//!
//! Semantics mirror the Redis script exactly: refill from elapsed time,
//! clamp to capacity, consume atomically under the caller's lock.

use std::time::Instant;

/// A single token bucket
#[derive(Debug, Clone)]
pub struct TokenBucket {
    pub tokens: f64,
    pub capacity: f64,
    pub refill_rate: f64,
    pub last_refill: Instant,
}

impl TokenBucket {
    pub fn new(capacity: f64, refill_rate: f64) -> Self {
        Self {
            tokens: capacity,
            capacity,
            refill_rate,
            last_refill: Instant::now(),
        }
    }

    /// Refill from elapsed time and try to consume `requested` tokens
    pub fn consume(&mut self, requested: f64) -> bool {
        self.consume_at(Instant::now(), requested)
    }

    /// Refill/consume against an explicit clock reading
    pub fn consume_at(&mut self, now: Instant, requested: f64) -> bool {
        let elapsed = now
            .checked_duration_since(self.last_refill)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);

        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
        self.last_refill = now;

        if self.tokens >= requested {
            self.tokens -= requested;
            true
        } else {
            false
        }
    }

    /// Refill all tokens
    pub fn reset(&mut self) {
        self.tokens = self.capacity;
        self.last_refill = Instant::now();
    }

    /// Fraction of capacity currently consumed, as a percentage
    pub fn utilization_percent(&self) -> f64 {
        if self.capacity <= 0.0 {
            return 0.0;
        }
        (1.0 - self.tokens / self.capacity) * 100.0
    }

    /// Seconds of idleness since the last refill
    pub fn idle_secs(&self) -> f64 {
        self.last_refill.elapsed().as_secs_f64()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_full_bucket_allows_up_to_capacity() {
        let mut bucket = TokenBucket::new(5.0, 1.0);
        let now = Instant::now();

        for _ in 0..5 {
            assert!(bucket.consume_at(now, 1.0));
        }
        assert!(!bucket.consume_at(now, 1.0));
    }

    #[test]
    fn test_refill_over_time() {
        let mut bucket = TokenBucket::new(10.0, 2.0);
        let start = Instant::now();

        // Drain completely
        assert!(bucket.consume_at(start, 10.0));
        assert!(!bucket.consume_at(start, 1.0));

        // 2 tokens/sec: after 1.5s there are 3 tokens
        let later = start + Duration::from_millis(1500);
        assert!(bucket.consume_at(later, 3.0));
        assert!(!bucket.consume_at(later, 0.5));
    }

    #[test]
    fn test_refill_clamped_to_capacity() {
        let mut bucket = TokenBucket::new(10.0, 100.0);
        let start = Instant::now();
        assert!(bucket.consume_at(start, 1.0));

        // A long idle period must not overfill
        let much_later = start + Duration::from_secs(3600);
        assert!(bucket.consume_at(much_later, 10.0));
        assert!(!bucket.consume_at(much_later, 1.0));
    }

    #[test]
    fn test_utilization() {
        let mut bucket = TokenBucket::new(10.0, 0.0);
        assert_eq!(bucket.utilization_percent(), 0.0);

        let now = Instant::now();
        assert!(bucket.consume_at(now, 5.0));
        assert!((bucket.utilization_percent() - 50.0).abs() < 1e-9);

        bucket.reset();
        assert_eq!(bucket.utilization_percent(), 0.0);
    }

    #[test]
    fn test_sum_consumed_bounded_by_capacity_plus_refill() {
        // Universal invariant: allowed <= capacity + refill_rate * window
        let mut bucket = TokenBucket::new(20.0, 5.0);
        let start = Instant::now();
        let window = 10.0;

        let mut allowed = 0u32;
        for i in 0..1000 {
            let now = start + Duration::from_secs_f64(window * i as f64 / 1000.0);
            if bucket.consume_at(now, 1.0) {
                allowed += 1;
            }
        }

        let bound = 20.0 + 5.0 * window;
        assert!(allowed as f64 <= bound, "allowed={allowed} bound={bound}");
    }
}

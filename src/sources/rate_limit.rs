// =============================================================================
// Token bucket — per-source call budget
// =============================================================================
//
// Each registered source carries its own bucket, refilled continuously at the
// configured calls-per-second rate with a burst capacity of one second's
// worth of calls (minimum 1). An exhausted bucket maps to
// `SourceError::RateLimited`; the registry never queues or waits.

use std::time::Instant;

use parking_lot::Mutex;

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Thread-safe token bucket.
pub struct TokenBucket {
    state: Mutex<BucketState>,
    refill_per_sec: f64,
    capacity: f64,
}

impl TokenBucket {
    pub fn new(refill_per_sec: f64) -> Self {
        let capacity = refill_per_sec.max(1.0);
        Self {
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
            refill_per_sec,
            capacity,
        }
    }

    /// Take one token. Returns `false` when the bucket is empty.
    pub fn try_acquire(&self) -> bool {
        let mut state = self.state.lock();

        let elapsed = state.last_refill.elapsed().as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        state.last_refill = Instant::now();

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Remaining whole tokens (diagnostic only; racy by nature).
    pub fn available(&self) -> u32 {
        self.state.lock().tokens as u32
    }
}

impl std::fmt::Debug for TokenBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenBucket")
            .field("refill_per_sec", &self.refill_per_sec)
            .field("available", &self.available())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn burst_up_to_capacity_then_exhausted() {
        let bucket = TokenBucket::new(5.0);
        for _ in 0..5 {
            assert!(bucket.try_acquire());
        }
        assert!(!bucket.try_acquire());
    }

    #[test]
    fn fractional_rate_has_minimum_burst_of_one() {
        let bucket = TokenBucket::new(0.5);
        assert!(bucket.try_acquire());
        assert!(!bucket.try_acquire());
    }

    #[test]
    fn refills_over_time() {
        let bucket = TokenBucket::new(1000.0);
        while bucket.try_acquire() {}
        std::thread::sleep(std::time::Duration::from_millis(10));
        // ~10 tokens refilled at 1000/s.
        assert!(bucket.try_acquire());
    }
}

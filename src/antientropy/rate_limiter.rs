//! Token bucket rate limiter gating outbound SYNC requests (default 5
//! req/s, configurable). Over any window W, the number of SYNC requests
//! initiated is bounded by roughly `rate * W`.

use std::sync::Mutex;
use std::time::Instant;

struct State {
    tokens: f64,
    last_refill: Instant,
}

pub struct TokenBucket {
    rate_per_sec: f64,
    capacity: f64,
    state: Mutex<State>,
}

impl TokenBucket {
    pub fn new(rate_per_sec: f64) -> Self {
        Self {
            rate_per_sec,
            capacity: rate_per_sec.max(1.0),
            state: Mutex::new(State { tokens: rate_per_sec.max(1.0), last_refill: Instant::now() }),
        }
    }

    /// Attempts to consume one token. Returns `true` if the request may
    /// proceed, `false` if it must be rejected with `RateLimited`.
    pub fn try_acquire(&self) -> bool {
        let mut state = self.state.lock().expect("rate limiter lock poisoned");
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rate_per_sec).min(self.capacity);
        state.last_refill = now;

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;
    use std::time::Duration;

    #[test]
    fn test_bucket_bounds_burst_rate() {
        let bucket = TokenBucket::new(5.0);
        let mut accepted = 0;
        for _ in 0..20 {
            if bucket.try_acquire() {
                accepted += 1;
            }
        }
        // Starting capacity is at most `rate_per_sec`, so an instantaneous
        // burst of 20 requests must not all succeed.
        assert!(accepted <= 5);
    }

    #[test]
    fn test_bucket_refills_over_time() {
        let bucket = TokenBucket::new(10.0);
        for _ in 0..10 {
            assert!(bucket.try_acquire());
        }
        assert!(!bucket.try_acquire());
        sleep(Duration::from_millis(150));
        assert!(bucket.try_acquire());
    }
}

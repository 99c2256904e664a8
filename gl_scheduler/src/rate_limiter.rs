//! ABOUTME: Token-bucket rate limiter gating debug-level log emission
//! ABOUTME: Continuous refill driven by wall-clock delta between `allow` calls

use std::sync::Mutex;
use std::time::Instant;

/// Token-bucket limiter. Capacity equals the configured rate; tokens refill
/// continuously at that rate (§4.1).
pub struct RateLimiter {
    rate_per_second: f64,
    state: Mutex<State>,
}

struct State {
    tokens: f64,
    last_refill: Instant,
}

impl RateLimiter {
    /// `rate_per_second` of 0 (or less) produces a disabled limiter that
    /// always admits.
    pub fn new(rate_per_second: f64) -> Self {
        Self {
            rate_per_second: rate_per_second.max(0.0),
            state: Mutex::new(State {
                tokens: rate_per_second.max(0.0),
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn disabled() -> Self {
        Self::new(0.0)
    }

    pub fn is_disabled(&self) -> bool {
        self.rate_per_second <= 0.0
    }

    /// Returns true and decrements a token if one is available.
    pub fn allow(&self) -> bool {
        if self.is_disabled() {
            return true;
        }

        let mut state = self.state.lock().expect("rate limiter mutex poisoned");
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.last_refill = now;

        let capacity = self.rate_per_second;
        state.tokens = (state.tokens + elapsed * self.rate_per_second).min(capacity);

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
    fn disabled_limiter_always_admits() {
        let limiter = RateLimiter::disabled();
        for _ in 0..1000 {
            assert!(limiter.allow());
        }
    }

    #[test]
    fn bursts_are_capped_at_capacity() {
        let limiter = RateLimiter::new(5.0);
        let admitted = (0..100).filter(|_| limiter.allow()).count();
        // Capacity is 5 tokens; a tight loop can admit at most a handful
        // before refill catches up to real elapsed time.
        assert!(admitted <= 10, "admitted {admitted} in an instant burst");
    }

    #[test]
    fn tokens_refill_over_time() {
        let limiter = RateLimiter::new(10.0);
        while limiter.allow() {}
        sleep(Duration::from_millis(150));
        assert!(limiter.allow(), "should have refilled at least one token");
    }
}

use std::time::Instant;

use dashmap::DashMap;

/// Classic token bucket; refills continuously at `rate` per second up to
/// `burst`.
#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last: Instant,
}

/// Keyed rate limiter gating public HTTP requests (per client IP) and
/// control-plane operations (per token). A zero rate disables the gate.
#[derive(Debug)]
pub struct RateLimiter {
    rate: f64,
    burst: f64,
    buckets: DashMap<String, Bucket>,
}

impl RateLimiter {
    pub fn new(rate: f64, burst: f64) -> Self {
        Self {
            rate: rate.max(0.0),
            burst: burst.max(1.0),
            buckets: DashMap::new(),
        }
    }

    /// Take one token for `key`; false means the caller must be rejected.
    pub fn allow(&self, key: &str) -> bool {
        if self.rate <= 0.0 {
            return true;
        }

        let now = Instant::now();
        let mut b = self.buckets.entry(key.to_string()).or_insert_with(|| Bucket {
            tokens: self.burst,
            last: now,
        });

        let elapsed = now.duration_since(b.last).as_secs_f64();
        b.tokens = (b.tokens + elapsed * self.rate).min(self.burst);
        b.last = now;

        if b.tokens >= 1.0 {
            b.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Drop buckets that have fully refilled; they carry no state worth
    /// keeping. Called from a periodic sweep task.
    pub fn sweep(&self) {
        if self.rate <= 0.0 {
            return;
        }
        let now = Instant::now();
        self.buckets.retain(|_k, b| {
            let elapsed = now.duration_since(b.last).as_secs_f64();
            (b.tokens + elapsed * self.rate) < self.burst
        });
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.buckets.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn burst_then_reject() {
        let rl = RateLimiter::new(1.0, 3.0);
        assert!(rl.allow("a"));
        assert!(rl.allow("a"));
        assert!(rl.allow("a"));
        assert!(!rl.allow("a"));
        // Independent key has its own bucket.
        assert!(rl.allow("b"));
    }

    #[test]
    fn zero_rate_disables() {
        let rl = RateLimiter::new(0.0, 1.0);
        for _ in 0..1000 {
            assert!(rl.allow("x"));
        }
    }

    #[test]
    fn sweep_drops_refilled_buckets() {
        let rl = RateLimiter::new(1000.0, 1.0);
        assert!(rl.allow("a"));
        std::thread::sleep(std::time::Duration::from_millis(10));
        rl.sweep();
        assert_eq!(rl.len(), 0);
    }
}

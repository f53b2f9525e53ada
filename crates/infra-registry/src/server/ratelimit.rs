//! Login rate limiting.
//!
//! Token buckets keyed by (client ip, username) so a password sprayer burns
//! one budget per target account per source, while a shared NAT does not
//! lock out unrelated users.

use std::time::Instant;

use dashmap::DashMap;

/// Attempts allowed in a burst.
const BUCKET_CAPACITY: f64 = 10.0;

/// Refill rate: one attempt every six seconds, ten per minute.
const REFILL_PER_SECOND: f64 = 10.0 / 60.0;

struct Bucket {
    tokens: f64,
    last: Instant,
}

/// Shared limiter; cheap to clone behind an `Arc`.
#[derive(Default)]
pub struct LoginRateLimiter {
    buckets: DashMap<(String, String), Bucket>,
}

impl LoginRateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume one attempt from the (ip, username) budget. Returns false
    /// when the budget is exhausted.
    pub fn allow(&self, ip: &str, username: &str) -> bool {
        let now = Instant::now();
        let mut entry = self
            .buckets
            .entry((ip.to_string(), username.to_string()))
            .or_insert_with(|| Bucket {
                tokens: BUCKET_CAPACITY,
                last: now,
            });

        let elapsed = now.duration_since(entry.last).as_secs_f64();
        entry.tokens = (entry.tokens + elapsed * REFILL_PER_SECOND).min(BUCKET_CAPACITY);
        entry.last = now;

        if entry.tokens >= 1.0 {
            entry.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_a_burst_then_blocks() {
        let limiter = LoginRateLimiter::new();
        for _ in 0..BUCKET_CAPACITY as usize {
            assert!(limiter.allow("10.0.0.1", "alice@example.com"));
        }
        assert!(!limiter.allow("10.0.0.1", "alice@example.com"));
    }

    #[test]
    fn budgets_are_per_ip_and_username() {
        let limiter = LoginRateLimiter::new();
        for _ in 0..BUCKET_CAPACITY as usize {
            limiter.allow("10.0.0.1", "alice@example.com");
        }
        assert!(!limiter.allow("10.0.0.1", "alice@example.com"));
        // Different username, same ip: separate budget.
        assert!(limiter.allow("10.0.0.1", "bob@example.com"));
        // Same username, different ip: separate budget.
        assert!(limiter.allow("10.0.0.2", "alice@example.com"));
    }
}

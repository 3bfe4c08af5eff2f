use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use crate::{domain::UserId, errors::Error, Result};

// ============== Rate Limiter (Token Bucket) ==============

#[derive(Clone, Debug)]
struct Bucket {
    tokens: f64,
    last_update: Instant,
}

/// Per-user token bucket guarding the WebApp entry points.
#[derive(Clone, Debug)]
pub struct RateLimiter {
    enabled: bool,
    max_tokens: f64,
    refill_per_sec: f64,
    buckets: HashMap<UserId, Bucket>,
}

#[derive(Clone, Copy, Debug)]
pub struct RateLimitStatus {
    pub tokens: f64,
    pub max: f64,
    pub refill_per_sec: f64,
}

impl RateLimiter {
    pub fn new(enabled: bool, max_tokens: u32, window: Duration) -> Self {
        let max_tokens_f = f64::from(max_tokens.max(1));
        let window_secs = window.as_secs_f64().max(1e-9);

        Self {
            enabled,
            max_tokens: max_tokens_f,
            refill_per_sec: max_tokens_f / window_secs,
            buckets: HashMap::new(),
        }
    }

    pub fn disabled() -> Self {
        Self::new(false, 1, Duration::from_secs(1))
    }

    pub fn check(&mut self, user_id: UserId) -> (bool, Option<Duration>) {
        self.check_at(user_id, Instant::now())
    }

    pub fn check_at(&mut self, user_id: UserId, now: Instant) -> (bool, Option<Duration>) {
        if !self.enabled {
            return (true, None);
        }

        let bucket = self.buckets.entry(user_id).or_insert_with(|| Bucket {
            tokens: self.max_tokens,
            last_update: now,
        });

        let elapsed = now.saturating_duration_since(bucket.last_update).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.refill_per_sec).min(self.max_tokens);
        bucket.last_update = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            return (true, None);
        }

        let secs = (1.0 - bucket.tokens) / self.refill_per_sec;
        (false, Some(Duration::from_secs_f64(secs.max(0.0))))
    }

    /// Take a token for `user_id` or fail with [`Error::RateLimited`].
    pub fn admit(&mut self, user_id: UserId) -> Result<()> {
        self.admit_at(user_id, Instant::now())
    }

    pub fn admit_at(&mut self, user_id: UserId, now: Instant) -> Result<()> {
        match self.check_at(user_id, now) {
            (true, _) => Ok(()),
            (false, retry_after) => {
                let retry_after = retry_after.unwrap_or(Duration::from_secs(1));
                tracing::warn!(
                    user_id = user_id.0,
                    retry_after_ms = retry_after.as_millis() as u64,
                    "rate limited"
                );
                Err(Error::RateLimited { retry_after })
            }
        }
    }

    pub fn status(&self, user_id: UserId) -> RateLimitStatus {
        let tokens = self
            .buckets
            .get(&user_id)
            .map(|b| b.tokens)
            .unwrap_or(self.max_tokens);

        RateLimitStatus {
            tokens,
            max: self.max_tokens,
            refill_per_sec: self.refill_per_sec,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limiter_basic_refill() {
        let start = Instant::now();
        let mut rl = RateLimiter::new(true, 2, Duration::from_secs(10));
        let u = UserId(1);

        assert!(rl.check_at(u, start).0);
        assert!(rl.check_at(u, start).0);
        let (ok, wait) = rl.check_at(u, start);
        assert!(!ok);
        assert!(wait.unwrap() <= Duration::from_secs(5));

        // After 5 seconds, we should have refilled 1 token (2 tokens / 10s).
        let (ok, _) = rl.check_at(u, start + Duration::from_secs(5));
        assert!(ok);
    }

    #[test]
    fn buckets_are_per_user() {
        let start = Instant::now();
        let mut rl = RateLimiter::new(true, 1, Duration::from_secs(60));

        assert!(rl.admit_at(UserId(1), start).is_ok());
        assert!(matches!(
            rl.admit_at(UserId(1), start),
            Err(Error::RateLimited { .. })
        ));
        assert!(rl.admit_at(UserId(2), start).is_ok());
        assert!(rl.status(UserId(1)).tokens < 1.0);
        assert_eq!(rl.status(UserId(3)).max, 1.0);
    }

    #[test]
    fn disabled_limiter_admits_everything() {
        let mut rl = RateLimiter::disabled();
        for _ in 0..100 {
            assert!(rl.admit(UserId(7)).is_ok());
        }
    }
}

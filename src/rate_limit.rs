/// Per-user send rate limiting
///
/// Keyed token buckets (governor GCRA) so one chatty user cannot fill the
/// shared priority queues.
use governor::clock::{Clock, DefaultClock};
use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use nonzero_ext::nonzero;
use std::num::NonZeroU32;

use crate::config::RateLimitConfig;
use crate::error::{AppError, AppResult};

pub struct SendRateLimiter {
    limiter: Option<DefaultKeyedRateLimiter<String>>,
    clock: DefaultClock,
}

impl SendRateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        let limiter = config.enabled.then(|| {
            let per_second = NonZeroU32::new(config.per_second).unwrap_or(nonzero!(1u32));
            let burst = NonZeroU32::new(config.burst).unwrap_or(per_second);
            RateLimiter::keyed(Quota::per_second(per_second).allow_burst(burst))
        });

        Self {
            limiter,
            clock: DefaultClock::default(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.limiter.is_some()
    }

    /// Take one send permit for `key` (user id, or session id for
    /// anonymous connections)
    pub fn check(&self, key: &str) -> AppResult<()> {
        let Some(limiter) = &self.limiter else {
            return Ok(());
        };

        limiter.check_key(&key.to_string()).map_err(|not_until| {
            let wait = not_until.wait_time_from(self.clock.now());
            tracing::debug!("Rate limit hit for {}, retry in {:?}", key, wait);
            AppError::RateLimited(format!("send rate exceeded for {}, retry in {:?}", key, wait))
        })
    }

    /// Drop buckets that have fully refilled
    pub fn cleanup(&self) {
        if let Some(limiter) = &self.limiter {
            limiter.retain_recent();
            limiter.shrink_to_fit();
        }
    }

    pub fn tracked_keys(&self) -> usize {
        self.limiter.as_ref().map(|l| l.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_allows_everything() {
        let limiter = SendRateLimiter::new(&RateLimitConfig::default());
        assert!(!limiter.is_enabled());
        for _ in 0..1000 {
            assert!(limiter.check("u1").is_ok());
        }
    }

    #[test]
    fn test_burst_then_rejects_per_key() {
        let limiter = SendRateLimiter::new(&RateLimitConfig {
            enabled: true,
            per_second: 1,
            burst: 2,
        });

        assert!(limiter.check("u1").is_ok());
        assert!(limiter.check("u1").is_ok());
        assert!(matches!(limiter.check("u1"), Err(AppError::RateLimited(_))));

        // separate bucket
        assert!(limiter.check("u2").is_ok());
        assert_eq!(limiter.tracked_keys(), 2);
    }
}

//! Fixed-window request limiting keyed by client address

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::config::RateLimitSettings;

// Stale windows are swept once the table grows past this many keys
const SWEEP_THRESHOLD: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitDecision {
    Allowed { remaining: u32 },
    Rejected { retry_after: Duration },
}

/// Backing store for request counters.
///
/// The in-process [`FixedWindowLimiter`] is enough for a single server; a
/// shared store can implement this trait when several instances run.
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    async fn check(&self, key: &str) -> RateLimitDecision;
}

#[derive(Debug, Clone, Copy)]
struct WindowCount {
    window: i64,
    count: u32,
}

#[derive(Debug)]
struct Counters {
    entries: HashMap<String, WindowCount>,
    // window index of the last stale-entry sweep
    swept: i64,
}

/// Allows `max_requests` per key in each aligned window of `window` length.
pub struct FixedWindowLimiter {
    settings: RateLimitSettings,
    counters: Mutex<Counters>,
}

impl FixedWindowLimiter {
    pub fn new(settings: RateLimitSettings) -> Self {
        Self {
            settings,
            counters: Mutex::new(Counters {
                entries: HashMap::new(),
                swept: i64::MIN,
            }),
        }
    }

    /// Counts one request for `key` at `now`.
    pub fn check_at(&self, key: &str, now: DateTime<Utc>) -> RateLimitDecision {
        let window_ms = i64::try_from(self.settings.window.as_millis())
            .unwrap_or(i64::MAX)
            .max(1);
        let now_ms = now.timestamp_millis();
        let window = now_ms.div_euclid(window_ms);

        let mut counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);

        // at most one sweep per window; entries from the current window are never stale
        if counters.entries.len() > SWEEP_THRESHOLD && counters.swept != window {
            counters.entries.retain(|_, entry| entry.window == window);
            counters.swept = window;
        }

        let entry = counters
            .entries
            .entry(key.to_string())
            .or_insert(WindowCount { window, count: 0 });
        if entry.window != window {
            *entry = WindowCount { window, count: 0 };
        }

        if entry.count >= self.settings.max_requests {
            let window_end = (window + 1).saturating_mul(window_ms);
            let wait_ms = u64::try_from(window_end - now_ms).unwrap_or(0);
            return RateLimitDecision::Rejected {
                retry_after: Duration::from_secs(wait_ms.div_ceil(1000).max(1)),
            };
        }

        entry.count += 1;
        RateLimitDecision::Allowed {
            remaining: self.settings.max_requests - entry.count,
        }
    }
}

#[async_trait]
impl RateLimitStore for FixedWindowLimiter {
    async fn check(&self, key: &str) -> RateLimitDecision {
        self.check_at(key, Utc::now())
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn limiter(max_requests: u32) -> FixedWindowLimiter {
        FixedWindowLimiter::new(RateLimitSettings {
            max_requests,
            window: Duration::from_secs(60),
        })
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn rejects_after_limit_until_window_ends() {
        let limiter = limiter(2);

        assert_eq!(
            limiter.check_at("10.0.0.1", at(600)),
            RateLimitDecision::Allowed { remaining: 1 }
        );
        assert_eq!(
            limiter.check_at("10.0.0.1", at(610)),
            RateLimitDecision::Allowed { remaining: 0 }
        );
        assert_eq!(
            limiter.check_at("10.0.0.1", at(615)),
            RateLimitDecision::Rejected {
                retry_after: Duration::from_secs(45)
            }
        );
        assert_eq!(
            limiter.check_at("10.0.0.1", at(660)),
            RateLimitDecision::Allowed { remaining: 1 }
        );
    }

    #[test]
    fn keys_are_counted_independently() {
        let limiter = limiter(1);

        assert!(matches!(
            limiter.check_at("10.0.0.1", at(0)),
            RateLimitDecision::Allowed { .. }
        ));
        assert!(matches!(
            limiter.check_at("10.0.0.2", at(0)),
            RateLimitDecision::Allowed { .. }
        ));
        assert!(matches!(
            limiter.check_at("10.0.0.1", at(1)),
            RateLimitDecision::Rejected { .. }
        ));
    }

    #[test]
    fn stale_keys_are_swept_once_per_window() {
        let limiter = limiter(5);

        for n in 0..SWEEP_THRESHOLD + 2 {
            limiter.check_at(&format!("10.1.{}.{}", n / 256, n % 256), at(0));
        }
        {
            let counters = limiter.counters.lock().unwrap();
            assert_eq!(counters.entries.len(), SWEEP_THRESHOLD + 2);
            assert_eq!(counters.swept, 0);
        }

        limiter.check_at("10.9.9.9", at(60));

        let counters = limiter.counters.lock().unwrap();
        assert_eq!(counters.entries.len(), 1);
        assert_eq!(counters.swept, 1);
    }

    #[tokio::test]
    async fn store_trait_uses_current_time() {
        let limiter = FixedWindowLimiter::new(RateLimitSettings {
            max_requests: 1,
            window: Duration::from_secs(365 * 24 * 3600),
        });

        assert!(matches!(
            limiter.check("client").await,
            RateLimitDecision::Allowed { remaining: 0 }
        ));
        assert!(matches!(
            limiter.check("client").await,
            RateLimitDecision::Rejected { .. }
        ));
    }
}

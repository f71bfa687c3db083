// src/resilience/limiter.rs
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::SharedClock;
use crate::config::RateLimitConfig;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitBudget {
    pub provider: String,
    pub window_start: DateTime<Utc>,
    pub used: u32,
    pub limit: u32,
}

impl RateLimitBudget {
    pub fn remaining(&self) -> u32 {
        self.limit.saturating_sub(self.used)
    }
}

/// Per-provider request budget over a fixed window that restarts once it
/// has fully elapsed.
pub struct RateLimiter {
    window: Duration,
    clock: SharedClock,
    budget: Mutex<RateLimitBudget>,
}

impl RateLimiter {
    pub fn new(provider: impl Into<String>, cfg: &RateLimitConfig, clock: SharedClock) -> Self {
        let now = clock.now();
        Self {
            window: Duration::seconds(cfg.window_secs as i64),
            budget: Mutex::new(RateLimitBudget {
                provider: provider.into(),
                window_start: now,
                used: 0,
                limit: cfg.limit,
            }),
            clock,
        }
    }

    /// Take one request from the budget. `false` means exhausted.
    pub fn try_acquire(&self) -> bool {
        let mut b = self.rolled();
        if b.used >= b.limit {
            return false;
        }
        b.used += 1;
        true
    }

    /// Give back a token taken by a call that never went out.
    pub fn refund(&self) {
        let mut b = self.rolled();
        b.used = b.used.saturating_sub(1);
    }

    /// Align with the provider's own view: keep the smaller remaining budget.
    pub fn reconcile(&self, remote_remaining: u32) {
        let mut b = self.rolled();
        let remaining = b.remaining().min(remote_remaining);
        b.used = b.limit - remaining;
    }

    pub fn budget(&self) -> RateLimitBudget {
        self.rolled().clone()
    }

    fn rolled(&self) -> std::sync::MutexGuard<'_, RateLimitBudget> {
        let now = self.clock.now();
        let mut b = self.budget.lock().unwrap_or_else(|e| e.into_inner());
        if now >= b.window_start + self.window {
            b.window_start = now;
            b.used = 0;
        }
        b
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::TimeZone;
    use std::sync::Arc;

    fn limiter(limit: u32) -> (Arc<ManualClock>, RateLimiter) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
        ));
        let cfg = RateLimitConfig {
            limit,
            window_secs: 3600,
        };
        (clock.clone(), RateLimiter::new("EPA_eGRID", &cfg, clock))
    }

    #[test]
    fn exhausts_then_resets_after_window() {
        let (clock, l) = limiter(2);
        assert!(l.try_acquire());
        assert!(l.try_acquire());
        assert!(!l.try_acquire());

        clock.advance(Duration::seconds(3599));
        assert!(!l.try_acquire());

        clock.advance(Duration::seconds(1));
        assert!(l.try_acquire());
        assert_eq!(l.budget().used, 1);
    }

    #[test]
    fn reconcile_takes_minimum_of_local_and_remote() {
        let (_c, l) = limiter(1000);
        for _ in 0..10 {
            l.try_acquire();
        }
        l.reconcile(50);
        assert_eq!(l.budget().remaining(), 50);

        // Remote says more than we think: local estimate stays.
        l.reconcile(900);
        assert_eq!(l.budget().remaining(), 50);
    }

    #[test]
    fn refund_returns_a_token() {
        let (_c, l) = limiter(1);
        assert!(l.try_acquire());
        l.refund();
        assert!(l.try_acquire());
    }
}

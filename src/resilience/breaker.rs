//! # Circuit Breaker
//! Rolling-window breaker, one per provider.
//!
//! ```text
//! closed ──(error% > threshold over window)──► open
//!   ▲                                           │ reset timeout elapsed
//!   │ trial ok                                  ▼
//!   └──────────────────────────────────────── half_open ──(trial failed)──► open
//! ```
//!
//! Failures are tallied in `buckets` equal slices of `rolling_window_secs`.
//! While half-open exactly one caller gets [`Admission::Trial`]; everyone
//! else is rejected until that trial reports back. Results are recorded
//! against the admission they were issued under, so a late answer from a
//! call admitted before the breaker opened never settles a trial.
//!
//! Transitions are published to [`BreakerObserver`]s after the internal lock
//! is released.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::SharedClock;
use crate::config::BreakerConfig;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    HalfOpen,
    Open,
}

/// Closed set of breaker notifications.
#[derive(Debug, Clone, PartialEq)]
pub enum BreakerEvent {
    Opened { next_attempt_at: DateTime<Utc> },
    HalfOpened,
    Closed,
    Failure { error: String },
}

pub trait BreakerObserver: Send + Sync {
    fn on_breaker_event(&self, provider: &str, event: &BreakerEvent);
}

/// Point-in-time view for health reporting.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CircuitBreakerState {
    pub provider: String,
    pub state: BreakerState,
    pub failure_count: u64,
    pub success_count: u64,
    pub next_attempt_at: Option<DateTime<Utc>>,
}

/// Ticket handed out by [`CircuitBreaker::admit`] and passed back with the
/// call's outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    /// The single half-open probe call, tagged with its generation.
    Trial(u64),
    Rejected,
}

#[derive(Debug, Clone)]
struct Bucket {
    start: DateTime<Utc>,
    successes: u32,
    failures: u32,
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    buckets: VecDeque<Bucket>,
    next_attempt_at: Option<DateTime<Utc>>,
    trial_in_flight: bool,
    trial_gen: u64,
    failure_count: u64,
    success_count: u64,
}

pub struct CircuitBreaker {
    provider: String,
    cfg: BreakerConfig,
    clock: SharedClock,
    inner: Mutex<Inner>,
    observers: Mutex<Vec<Arc<dyn BreakerObserver>>>,
}

impl CircuitBreaker {
    pub fn new(provider: impl Into<String>, cfg: BreakerConfig, clock: SharedClock) -> Self {
        Self {
            provider: provider.into(),
            cfg,
            clock,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                buckets: VecDeque::new(),
                next_attempt_at: None,
                trial_in_flight: false,
                trial_gen: 0,
                failure_count: 0,
                success_count: 0,
            }),
            observers: Mutex::new(Vec::new()),
        }
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn add_observer(&self, observer: Arc<dyn BreakerObserver>) {
        self.observers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(observer);
    }

    pub fn state(&self) -> BreakerState {
        self.lock().state
    }

    pub fn is_open(&self) -> bool {
        self.state() == BreakerState::Open
    }

    pub fn snapshot(&self) -> CircuitBreakerState {
        let g = self.lock();
        CircuitBreakerState {
            provider: self.provider.clone(),
            state: g.state,
            failure_count: g.failure_count,
            success_count: g.success_count,
            next_attempt_at: g.next_attempt_at,
        }
    }

    /// Decide whether a call may go out now. Never performs I/O.
    pub fn admit(&self) -> Admission {
        let now = self.clock.now();
        let (admission, events) = {
            let mut g = self.lock();
            match g.state {
                BreakerState::Closed => (Admission::Allowed, vec![]),
                BreakerState::Open => {
                    let due = g.next_attempt_at.map(|t| now >= t).unwrap_or(true);
                    if due {
                        g.state = BreakerState::HalfOpen;
                        (begin_trial(&mut g), vec![BreakerEvent::HalfOpened])
                    } else {
                        (Admission::Rejected, vec![])
                    }
                }
                BreakerState::HalfOpen => {
                    if g.trial_in_flight {
                        (Admission::Rejected, vec![])
                    } else {
                        (begin_trial(&mut g), vec![])
                    }
                }
            }
        };
        self.publish(&events);
        admission
    }

    pub fn record_success(&self, ticket: Admission) {
        let now = self.clock.now();
        let events = {
            let mut g = self.lock();
            g.success_count += 1;
            match g.state {
                BreakerState::HalfOpen if is_current_trial(&g, ticket) => {
                    g.state = BreakerState::Closed;
                    g.trial_in_flight = false;
                    g.next_attempt_at = None;
                    g.buckets.clear();
                    vec![BreakerEvent::Closed]
                }
                BreakerState::Closed => {
                    self.current_bucket(&mut g, now).successes += 1;
                    vec![]
                }
                // Late result of a call admitted under an earlier state.
                _ => vec![],
            }
        };
        self.publish(&events);
    }

    pub fn record_failure(&self, ticket: Admission, error: &str) {
        let now = self.clock.now();
        let events = {
            let mut g = self.lock();
            g.failure_count += 1;
            let mut events = vec![BreakerEvent::Failure {
                error: error.to_string(),
            }];
            match g.state {
                BreakerState::HalfOpen if is_current_trial(&g, ticket) => {
                    events.push(self.trip(&mut g, now));
                }
                BreakerState::Closed => {
                    self.current_bucket(&mut g, now).failures += 1;
                    if self.threshold_crossed(&g) {
                        events.push(self.trip(&mut g, now));
                    }
                }
                _ => {}
            }
            events
        };
        self.publish(&events);
    }

    /// Rolling error percentage over the current window, if any calls were made.
    pub fn error_percentage(&self) -> Option<f64> {
        let now = self.clock.now();
        let mut g = self.lock();
        self.evict_old(&mut g, now);
        let (ok, failed) = totals(&g.buckets);
        let total = ok + failed;
        (total > 0).then(|| failed as f64 / total as f64 * 100.0)
    }

    fn trip(&self, g: &mut Inner, now: DateTime<Utc>) -> BreakerEvent {
        let next = now + Duration::seconds(self.cfg.reset_timeout_secs as i64);
        g.state = BreakerState::Open;
        g.trial_in_flight = false;
        g.next_attempt_at = Some(next);
        g.buckets.clear();
        tracing::warn!(provider = %self.provider, next_attempt_at = %next, "circuit opened");
        BreakerEvent::Opened {
            next_attempt_at: next,
        }
    }

    fn threshold_crossed(&self, g: &Inner) -> bool {
        let (ok, failed) = totals(&g.buckets);
        let total = ok + failed;
        if total == 0 || total < self.cfg.volume_threshold.max(1) {
            return false;
        }
        failed as f64 / total as f64 * 100.0 > self.cfg.error_threshold_pct
    }

    fn bucket_width(&self) -> Duration {
        let window_ms = (self.cfg.rolling_window_secs * 1000) as i64;
        Duration::milliseconds((window_ms / self.cfg.buckets.max(1) as i64).max(1))
    }

    fn evict_old(&self, g: &mut Inner, now: DateTime<Utc>) {
        let window = Duration::seconds(self.cfg.rolling_window_secs as i64);
        while let Some(b) = g.buckets.front() {
            if b.start + window <= now {
                g.buckets.pop_front();
            } else {
                break;
            }
        }
    }

    fn current_bucket<'a>(&self, g: &'a mut Inner, now: DateTime<Utc>) -> &'a mut Bucket {
        self.evict_old(g, now);
        let width = self.bucket_width();
        let needs_new = g
            .buckets
            .back()
            .map(|b| b.start + width <= now)
            .unwrap_or(true);
        if needs_new {
            let width_ms = width.num_milliseconds();
            let offset = now.timestamp_millis().rem_euclid(width_ms);
            g.buckets.push_back(Bucket {
                start: now - Duration::milliseconds(offset),
                successes: 0,
                failures: 0,
            });
        }
        // A bucket was pushed above when the deque was empty.
        let last = g.buckets.len() - 1;
        &mut g.buckets[last]
    }

    fn publish(&self, events: &[BreakerEvent]) {
        if events.is_empty() {
            return;
        }
        let observers = self
            .observers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for ev in events {
            for o in &observers {
                o.on_breaker_event(&self.provider, ev);
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn begin_trial(g: &mut Inner) -> Admission {
    g.trial_in_flight = true;
    g.trial_gen += 1;
    Admission::Trial(g.trial_gen)
}

fn is_current_trial(g: &Inner, ticket: Admission) -> bool {
    g.trial_in_flight && ticket == Admission::Trial(g.trial_gen)
}

fn totals(buckets: &VecDeque<Bucket>) -> (u32, u32) {
    buckets
        .iter()
        .fold((0, 0), |(s, f), b| (s + b.successes, f + b.failures))
}

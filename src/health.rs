//! # Health Monitor
//! Rolling probe success rate per provider, combined with breaker state into
//! a composite status.
//!
//! A provider is available when its rolling success rate is above
//! [`AVAILABILITY_THRESHOLD`] and its breaker is not open. With no probes in
//! the window yet, only the breaker decides.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use metrics::gauge;
use serde::Serialize;

use crate::clock::SharedClock;
use crate::providers::ProviderAdapter;
use crate::resilience::{BreakerEvent, BreakerObserver};

pub const AVAILABILITY_THRESHOLD: f64 = 0.7;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HealthRecord {
    pub provider: String,
    pub is_available: bool,
    pub response_time_ms: Option<u64>,
    pub rolling_success_rate: f64,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub circuit_open: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: HealthStatus,
    pub providers: Vec<HealthRecord>,
    pub issues: Vec<String>,
    pub checked_at: DateTime<Utc>,
}

/// Time-bounded window of probe outcomes.
#[derive(Debug)]
struct OutcomeWindow {
    window: chrono::Duration,
    buf: VecDeque<(DateTime<Utc>, bool)>,
}

impl OutcomeWindow {
    fn new(window: chrono::Duration) -> Self {
        Self {
            window,
            buf: VecDeque::new(),
        }
    }

    fn record(&mut self, ok: bool, now: DateTime<Utc>) {
        self.buf.push_back((now, ok));
        self.evict(now);
    }

    fn evict(&mut self, now: DateTime<Utc>) {
        let cutoff = now - self.window;
        while let Some(&(t, _)) = self.buf.front() {
            if t < cutoff {
                self.buf.pop_front();
            } else {
                break;
            }
        }
    }

    /// `None` when the window holds no samples.
    fn success_rate(&self, now: DateTime<Utc>) -> Option<f64> {
        let cutoff = now - self.window;
        let (mut ok, mut n) = (0usize, 0usize);
        for &(t, success) in self.buf.iter().rev() {
            if t < cutoff {
                break;
            }
            n += 1;
            if success {
                ok += 1;
            }
        }
        (n > 0).then(|| ok as f64 / n as f64)
    }
}

#[derive(Debug)]
struct ProviderHealth {
    outcomes: OutcomeWindow,
    circuit_open: bool,
    response_time_ms: Option<u64>,
    last_success_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

#[derive(Debug, Default)]
struct Inner {
    providers: BTreeMap<String, ProviderHealth>,
    misconfigured: BTreeMap<String, String>,
}

pub struct HealthMonitor {
    inner: Mutex<Inner>,
    window: chrono::Duration,
    clock: SharedClock,
}

impl HealthMonitor {
    pub fn new(window: Duration, clock: SharedClock) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            window: chrono::Duration::from_std(window).unwrap_or(chrono::Duration::hours(1)),
            clock,
        }
    }

    pub fn register(&self, provider: &str) {
        let window = self.window;
        self.lock()
            .providers
            .entry(provider.to_string())
            .or_insert_with(|| ProviderHealth {
                outcomes: OutcomeWindow::new(window),
                circuit_open: false,
                response_time_ms: None,
                last_success_at: None,
                last_error: None,
            });
    }

    /// A provider that could not be built; always reported unavailable.
    pub fn register_misconfigured(&self, provider: &str, reason: &str) {
        self.lock()
            .misconfigured
            .insert(provider.to_string(), reason.to_string());
    }

    pub fn record_probe(&self, provider: &str, result: Result<(), String>, elapsed: Duration) {
        let now = self.clock.now();
        self.register(provider);
        let mut g = self.lock();
        let Some(h) = g.providers.get_mut(provider) else {
            return;
        };
        h.response_time_ms = Some(elapsed.as_millis() as u64);
        match result {
            Ok(()) => {
                h.outcomes.record(true, now);
                h.last_success_at = Some(now);
            }
            Err(e) => {
                h.outcomes.record(false, now);
                h.last_error = Some(e);
            }
        }
    }

    /// Probe one adapter under `timeout` and record the outcome.
    pub async fn probe(&self, adapter: &dyn ProviderAdapter, timeout: Duration) -> bool {
        let provider = adapter.name().to_string();
        let t0 = Instant::now();
        let result = match tokio::time::timeout(timeout, adapter.probe()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!("probe timed out after {}ms", timeout.as_millis())),
        };
        let ok = result.is_ok();
        if let Err(e) = &result {
            tracing::warn!(provider = %provider, error = %e, "health probe failed");
        }
        self.record_probe(&provider, result, t0.elapsed());
        ok
    }

    pub fn record(&self, provider: &str) -> Option<HealthRecord> {
        let now = self.clock.now();
        let g = self.lock();
        g.providers.get(provider).map(|h| to_record(provider, h, now))
    }

    pub fn is_available(&self, provider: &str) -> bool {
        self.record(provider).map(|r| r.is_available).unwrap_or(false)
    }

    /// Composite report; `extra_issues` carries findings from outside the
    /// monitor (e.g. stale sources).
    pub fn report(&self, extra_issues: Vec<String>) -> HealthReport {
        let now = self.clock.now();
        let g = self.lock();
        let mut issues = Vec::new();

        let mut providers: Vec<HealthRecord> = g
            .providers
            .iter()
            .map(|(name, h)| to_record(name, h, now))
            .collect();
        for r in &providers {
            gauge!("provider_available", "provider" => r.provider.clone())
                .set(if r.is_available { 1.0 } else { 0.0 });
            if r.circuit_open {
                issues.push(format!("{}: circuit open", r.provider));
            } else if !r.is_available {
                issues.push(format!(
                    "{}: success rate {:.0}% below {:.0}%",
                    r.provider,
                    r.rolling_success_rate * 100.0,
                    AVAILABILITY_THRESHOLD * 100.0
                ));
            }
        }
        for (name, reason) in &g.misconfigured {
            issues.push(format!("{name}: misconfigured: {reason}"));
            providers.push(HealthRecord {
                provider: name.clone(),
                is_available: false,
                response_time_ms: None,
                rolling_success_rate: 0.0,
                last_success_at: None,
                last_error: Some(reason.clone()),
                circuit_open: false,
            });
        }
        issues.extend(extra_issues);

        let total = providers.len();
        let available = providers.iter().filter(|r| r.is_available).count();
        HealthReport {
            status: composite_status(available, total),
            providers,
            issues,
            checked_at: now,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl BreakerObserver for HealthMonitor {
    fn on_breaker_event(&self, provider: &str, event: &BreakerEvent) {
        self.register(provider);
        let mut g = self.lock();
        let Some(h) = g.providers.get_mut(provider) else {
            return;
        };
        match event {
            BreakerEvent::Opened { .. } => h.circuit_open = true,
            BreakerEvent::HalfOpened | BreakerEvent::Closed => h.circuit_open = false,
            BreakerEvent::Failure { error } => h.last_error = Some(error.clone()),
        }
    }
}

fn to_record(provider: &str, h: &ProviderHealth, now: DateTime<Utc>) -> HealthRecord {
    let rate = h.outcomes.success_rate(now);
    let rate_ok = rate.map(|r| r > AVAILABILITY_THRESHOLD).unwrap_or(true);
    HealthRecord {
        provider: provider.to_string(),
        is_available: rate_ok && !h.circuit_open,
        response_time_ms: h.response_time_ms,
        rolling_success_rate: rate.unwrap_or(1.0),
        last_success_at: h.last_success_at,
        last_error: h.last_error.clone(),
        circuit_open: h.circuit_open,
    }
}

/// All available → healthy; at least half → degraded; otherwise (including
/// no providers at all) unhealthy.
pub fn composite_status(available: usize, total: usize) -> HealthStatus {
    if total == 0 {
        HealthStatus::Unhealthy
    } else if available == total {
        HealthStatus::Healthy
    } else if available * 2 >= total {
        HealthStatus::Degraded
    } else {
        HealthStatus::Unhealthy
    }
}

//! # Metrics
//! In-process aggregate (served by `/stats`) plus the Prometheus exporter
//! (served by `/metrics`).

use std::collections::BTreeMap;
use std::sync::Mutex;

use anyhow::Context;
use axum::{routing::get, Router};
use chrono::{DateTime, Utc};
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use serde::Serialize;

use crate::model::Update;

/// Register metric descriptions once per process. Descriptions only stick to
/// an installed recorder, so this runs from [`Metrics::init`].
fn describe_metrics() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("factor_updates_total", "Updates emitted by the diff engine.");
        describe_counter!(
            "refresh_cycles_total",
            "Completed refresh cycles per source and outcome."
        );
        describe_counter!(
            "provider_calls_total",
            "Provider calls that reached the adapter, by outcome."
        );
        describe_counter!(
            "provider_short_circuit_total",
            "Calls answered from cache without touching the provider."
        );
        describe_counter!(
            "recalculation_batches_total",
            "Reconciliation passes that selected at least one update."
        );
        describe_histogram!("provider_fetch_ms", "Provider fetch latency in milliseconds.");
        describe_histogram!("refresh_cycle_ms", "Refresh cycle duration in milliseconds.");
        describe_gauge!("factor_subscribers_active", "Connections with a subscription.");
        describe_gauge!("factor_snapshot_size", "Entries in the factor snapshot.");
        describe_gauge!(
            "source_freshness_seconds",
            "Seconds since the last successful refresh per source."
        );
        describe_gauge!("provider_available", "1 if the provider is considered available.");
    });
}

#[derive(Debug, Clone, Default)]
struct SourceStats {
    cycles: u64,
    last_refresh_at: Option<DateTime<Utc>>,
    last_success_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct Inner {
    total_updates: u64,
    last_update_at: Option<DateTime<Utc>>,
    abs_change_sum: f64,
    sources: BTreeMap<String, SourceStats>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SourceFreshness {
    pub source: String,
    pub cycles: u64,
    pub last_refresh_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    /// Seconds since `last_success_at`; `None` until the first live sample.
    pub freshness_secs: Option<i64>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub total_updates: u64,
    pub last_update_at: Option<DateTime<Utc>>,
    pub mean_abs_change_percent: f64,
    pub active_subscribers: usize,
    pub sources: Vec<SourceFreshness>,
}

#[derive(Debug, Default)]
pub struct MetricsAggregator {
    inner: Mutex<Inner>,
}

impl MetricsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make a source visible before its first cycle.
    pub fn register_source(&self, source: &str) {
        self.lock().sources.entry(source.to_string()).or_default();
    }

    pub fn record_updates(&self, updates: &[Update], now: DateTime<Utc>) {
        if updates.is_empty() {
            return;
        }
        let mut g = self.lock();
        g.total_updates += updates.len() as u64;
        g.abs_change_sum += updates.iter().map(|u| u.change_percent.abs()).sum::<f64>();
        g.last_update_at = Some(now);
        counter!("factor_updates_total").increment(updates.len() as u64);
    }

    /// `live` marks that at least one region came back from the provider.
    pub fn record_cycle(&self, source: &str, live: bool, now: DateTime<Utc>) {
        let mut g = self.lock();
        let s = g.sources.entry(source.to_string()).or_default();
        s.cycles += 1;
        s.last_refresh_at = Some(now);
        if live {
            s.last_success_at = Some(now);
        }
        let outcome = if live { "live" } else { "fallback" };
        counter!("refresh_cycles_total", "source" => source.to_string(), "outcome" => outcome)
            .increment(1);
    }

    /// Elapsed time since the source last refreshed successfully.
    pub fn freshness(&self, source: &str, now: DateTime<Utc>) -> Option<chrono::Duration> {
        self.lock()
            .sources
            .get(source)
            .and_then(|s| s.last_success_at)
            .map(|t| now - t)
    }

    pub fn snapshot(&self, active_subscribers: usize, now: DateTime<Utc>) -> MetricsSnapshot {
        let g = self.lock();
        let sources = g
            .sources
            .iter()
            .map(|(name, s)| {
                let freshness_secs = s.last_success_at.map(|t| (now - t).num_seconds());
                if let Some(secs) = freshness_secs {
                    gauge!("source_freshness_seconds", "source" => name.clone()).set(secs as f64);
                }
                SourceFreshness {
                    source: name.clone(),
                    cycles: s.cycles,
                    last_refresh_at: s.last_refresh_at,
                    last_success_at: s.last_success_at,
                    freshness_secs,
                }
            })
            .collect();
        let mean = if g.total_updates == 0 {
            0.0
        } else {
            g.abs_change_sum / g.total_updates as f64
        };
        MetricsSnapshot {
            total_updates: g.total_updates,
            last_update_at: g.last_update_at,
            mean_abs_change_percent: mean,
            active_subscribers,
            sources,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Prometheus exporter handle.
pub struct Metrics {
    pub handle: PrometheusHandle,
}

impl Metrics {
    /// Install the global Prometheus recorder. Fails if one is already set.
    pub fn init() -> anyhow::Result<Self> {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .context("prometheus: install recorder")?;
        describe_metrics();
        Ok(Self { handle })
    }

    /// Router exposing `/metrics` in the Prometheus exposition format.
    pub fn router(&self) -> Router {
        let handle = self.handle.clone();
        Router::new().route(
            "/metrics",
            get(move || {
                let h = handle.clone();
                async move { h.render() }
            }),
        )
    }
}

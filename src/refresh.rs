//! # Refresh & Reconciliation
//!
//! One refresh cycle per source:
//! 1. fetch every tracked region through the resilient client,
//! 2. diff each sample against the snapshot (first sighting is inserted
//!    silently, sub-epsilon moves are ignored),
//! 3. broadcast the batch, append it to the recent-updates buffer,
//! 4. checkpoint the full snapshot.
//!
//! A region that yields nothing is skipped; the rest of the cycle carries on.
//! Each source only writes keys under its own `"{source}:"` prefix, so
//! cycles for different sources can interleave freely.
//!
//! Reconciliation drains the recent-updates buffer and announces the
//! impactful subset to every subscriber.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use metrics::{counter, gauge, histogram};
use serde::Serialize;

use crate::broadcast::Broadcaster;
use crate::cache::{save_checkpoint, CacheStore};
use crate::clock::SharedClock;
use crate::diff::{diff_sample, DiffOutcome};
use crate::metrics::MetricsAggregator;
use crate::model::Update;
use crate::resilience::{Fetch, ResilientClient};
use crate::snapshot::FactorSnapshot;

/// What one refresh cycle did.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CycleReport {
    pub source: String,
    pub started_at: DateTime<Utc>,
    pub regions_attempted: usize,
    pub live: usize,
    pub cached: usize,
    pub empty: usize,
    pub inserted: usize,
    pub updates: Vec<Update>,
    pub delivered_to: usize,
}

/// Per-source refresh settings plus its resilient client.
pub struct SourceRuntime {
    pub client: Arc<ResilientClient>,
    pub regions: Vec<String>,
    pub epsilon: f64,
    pub interval: Duration,
}

impl SourceRuntime {
    pub fn new(client: Arc<ResilientClient>) -> Self {
        let cfg = client.config();
        Self {
            regions: cfg.regions.clone(),
            epsilon: cfg.epsilon,
            interval: cfg.refresh_interval(),
            client,
        }
    }
}

pub struct RefreshEngine {
    sources: BTreeMap<String, SourceRuntime>,
    snapshot: Arc<FactorSnapshot>,
    cache: Arc<dyn CacheStore>,
    broadcaster: Arc<Broadcaster>,
    metrics: Arc<MetricsAggregator>,
    recent: Mutex<VecDeque<Update>>,
    recent_cap: usize,
    checkpoint_ttl: Duration,
    clock: SharedClock,
}

impl RefreshEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        sources: Vec<SourceRuntime>,
        snapshot: Arc<FactorSnapshot>,
        cache: Arc<dyn CacheStore>,
        broadcaster: Arc<Broadcaster>,
        metrics: Arc<MetricsAggregator>,
        recent_cap: usize,
        checkpoint_ttl: Duration,
        clock: SharedClock,
    ) -> Self {
        let sources = sources
            .into_iter()
            .map(|s| (s.client.name().to_string(), s))
            .collect::<BTreeMap<_, _>>();
        for name in sources.keys() {
            metrics.register_source(name);
        }
        Self {
            sources,
            snapshot,
            cache,
            broadcaster,
            metrics,
            recent: Mutex::new(VecDeque::new()),
            recent_cap: recent_cap.max(1),
            checkpoint_ttl,
            clock,
        }
    }

    pub fn source_names(&self) -> Vec<String> {
        self.sources.keys().cloned().collect()
    }

    pub fn source(&self, name: &str) -> Option<&SourceRuntime> {
        self.sources.get(name)
    }

    pub fn sources(&self) -> impl Iterator<Item = &SourceRuntime> {
        self.sources.values()
    }

    /// Run one cycle for `source`; `None` if the source is unknown.
    pub async fn run_cycle(&self, source: &str) -> Option<CycleReport> {
        let rt = self.sources.get(source)?;
        let t0 = Instant::now();
        let mut report = CycleReport {
            source: source.to_string(),
            started_at: self.clock.now(),
            regions_attempted: rt.regions.len(),
            live: 0,
            cached: 0,
            empty: 0,
            inserted: 0,
            updates: Vec::new(),
            delivered_to: 0,
        };

        for region in &rt.regions {
            let fetched = rt.client.call(region).await;
            let sample = match &fetched {
                Fetch::Live(s) => {
                    report.live += 1;
                    s
                }
                Fetch::Cached(s) => {
                    report.cached += 1;
                    s
                }
                Fetch::Empty => {
                    report.empty += 1;
                    tracing::debug!(source, region = %region, "no data this cycle");
                    continue;
                }
            };

            // Snapshot reads and writes happen between awaits only.
            let now = self.clock.now();
            let key = crate::model::factor_key(&sample.source, &sample.region);
            let prev = self.snapshot.get(&key);
            match diff_sample(prev.as_ref(), sample, rt.epsilon, now) {
                DiffOutcome::Inserted(f) => {
                    report.inserted += 1;
                    self.snapshot.upsert(f);
                }
                DiffOutcome::Changed { factor, update } => {
                    self.snapshot.upsert(factor);
                    report.updates.push(update);
                }
                DiffOutcome::Unchanged => {}
            }
        }

        let now = self.clock.now();
        if !report.updates.is_empty() {
            report.delivered_to = self.broadcaster.broadcast(&report.updates);
            self.push_recent(&report.updates);
            self.metrics.record_updates(&report.updates, now);
        }
        self.metrics.record_cycle(source, report.live > 0, now);
        self.checkpoint();

        histogram!("refresh_cycle_ms", "source" => source.to_string())
            .record(t0.elapsed().as_secs_f64() * 1_000.0);
        tracing::info!(
            source,
            attempted = report.regions_attempted,
            live = report.live,
            cached = report.cached,
            empty = report.empty,
            inserted = report.inserted,
            updates = report.updates.len(),
            delivered_to = report.delivered_to,
            "refresh cycle complete"
        );
        Some(report)
    }

    /// Drain the recent-updates buffer and announce the subset that needs
    /// downstream recalculation. Returns that subset.
    pub fn reconcile(&self) -> Vec<Update> {
        let drained: Vec<Update> = self.lock_recent().drain(..).collect();
        let selected: Vec<Update> = drained
            .into_iter()
            .filter(Update::requires_recalculation)
            .collect();
        if selected.is_empty() {
            tracing::debug!("reconciliation: nothing to recalculate");
            return selected;
        }
        let delivered = self
            .broadcaster
            .broadcast_recalculation(&selected, self.clock.now());
        counter!("recalculation_batches_total").increment(1);
        tracing::info!(
            updates = selected.len(),
            delivered_to = delivered,
            "recalculation required"
        );
        selected
    }

    /// Newest last.
    pub fn recent_updates(&self) -> Vec<Update> {
        self.lock_recent().iter().cloned().collect()
    }

    pub fn checkpoint(&self) {
        let map = self.snapshot.to_map();
        gauge!("factor_snapshot_size").set(map.len() as f64);
        save_checkpoint(self.cache.as_ref(), &map, self.checkpoint_ttl);
    }

    fn push_recent(&self, updates: &[Update]) {
        let mut buf = self.lock_recent();
        buf.extend(updates.iter().cloned());
        while buf.len() > self.recent_cap {
            buf.pop_front();
        }
    }

    fn lock_recent(&self) -> std::sync::MutexGuard<'_, VecDeque<Update>> {
        self.recent.lock().unwrap_or_else(|e| e.into_inner())
    }
}

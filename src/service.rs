//! # Factor Service
//! Process-scoped owner of the snapshot, subscriptions, refresh engine,
//! health monitor and metrics. Everything is injected through
//! [`FactorService::new`]; `start()` registers the periodic triggers and
//! `shutdown()` releases them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::broadcast::{Broadcaster, EventReceiver};
use crate::cache::{get_stale_typed, load_checkpoint, CacheStore};
use crate::clock::SharedClock;
use crate::config::{ProviderConfig, ProviderKind, ServiceConfig};
use crate::error::{ConfigurationError, DeliveryError};
use crate::health::{HealthMonitor, HealthReport};
use crate::metrics::{MetricsAggregator, MetricsSnapshot};
use crate::model::{ClientMessage, EmissionFactor, OutboundEvent, Sample, Subscription, CANONICAL_UNIT};
use crate::providers::fallback::{fallback_dataset, seed_kind, GLOBAL_GRID_FALLBACK_KG_PER_KWH};
use crate::providers::DynAdapter;
use crate::refresh::{CycleReport, RefreshEngine, SourceRuntime};
use crate::resilience::{sample_cache_key, BreakerObserver, ResilientClient};
use crate::scheduler::{task, Scheduler};
use crate::snapshot::FactorSnapshot;

/// Health probes are judged over this many probe intervals.
const HEALTH_WINDOW_PROBES: u32 = 12;
/// A source is stale once its freshness exceeds this many refresh intervals.
const STALE_AFTER_INTERVALS: i32 = 3;

pub const TRIGGER_RECONCILE: &str = "reconcile";
pub const TRIGGER_HEALTH: &str = "health-probe";

pub fn refresh_trigger(source: &str) -> String {
    format!("refresh:{source}")
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum IntensityOrigin {
    Snapshot,
    Cache,
    GlobalFallback,
}

/// Grid intensity for a region, flagged with where it came from.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GridIntensity {
    pub region: String,
    pub value: f64,
    pub unit: String,
    pub source: Option<String>,
    pub origin: IntensityOrigin,
}

/// Collaborators the service does not construct itself.
pub struct ServiceDeps {
    pub cache: Arc<dyn CacheStore>,
    pub scheduler: Arc<dyn Scheduler>,
    pub clock: SharedClock,
}

pub struct FactorService {
    cfg: ServiceConfig,
    clock: SharedClock,
    cache: Arc<dyn CacheStore>,
    scheduler: Arc<dyn Scheduler>,
    snapshot: Arc<FactorSnapshot>,
    broadcaster: Arc<Broadcaster>,
    metrics: Arc<MetricsAggregator>,
    health: Arc<HealthMonitor>,
    engine: Arc<RefreshEngine>,
    enabled: Arc<AtomicBool>,
    started_at: Mutex<Option<DateTime<Utc>>>,
    stopped: AtomicBool,
}

impl FactorService {
    /// `adapters` are the providers that built cleanly; `misconfigured` are
    /// reported by health and never scheduled.
    pub fn new(
        cfg: ServiceConfig,
        adapters: Vec<(ProviderConfig, DynAdapter)>,
        misconfigured: Vec<(String, ConfigurationError)>,
        deps: ServiceDeps,
    ) -> Arc<Self> {
        let ServiceDeps {
            cache,
            scheduler,
            clock,
        } = deps;

        let snapshot = Arc::new(FactorSnapshot::new());
        let broadcaster = Arc::new(Broadcaster::new());
        let metrics = Arc::new(MetricsAggregator::new());
        let health = Arc::new(HealthMonitor::new(
            cfg.health_probe_interval() * HEALTH_WINDOW_PROBES,
            clock.clone(),
        ));
        for (name, err) in &misconfigured {
            health.register_misconfigured(name, &err.to_string());
        }

        let observer: Arc<dyn BreakerObserver> = health.clone();
        let runtimes = adapters
            .into_iter()
            .map(|(pcfg, adapter)| {
                health.register(&pcfg.name);
                let client = ResilientClient::new(pcfg, adapter, cache.clone(), clock.clone());
                client.breaker().add_observer(observer.clone());
                SourceRuntime::new(Arc::new(client))
            })
            .collect();

        let engine = Arc::new(RefreshEngine::new(
            runtimes,
            snapshot.clone(),
            cache.clone(),
            broadcaster.clone(),
            metrics.clone(),
            cfg.recent_updates_cap,
            cfg.checkpoint_ttl(),
            clock.clone(),
        ));

        Arc::new(Self {
            enabled: Arc::new(AtomicBool::new(cfg.enabled)),
            cfg,
            clock,
            cache,
            scheduler,
            snapshot,
            broadcaster,
            metrics,
            health,
            engine,
            started_at: Mutex::new(None),
            stopped: AtomicBool::new(false),
        })
    }

    /// Restore state and register triggers. A second call is a no-op.
    pub fn start(&self) {
        {
            let mut started = self.started_at.lock().unwrap_or_else(|e| e.into_inner());
            if started.is_some() {
                return;
            }
            *started = Some(self.clock.now());
        }
        self.restore();

        for source in self.engine.source_names() {
            let Some(rt) = self.engine.source(&source) else {
                continue;
            };
            let period = rt.interval;
            let engine = self.engine.clone();
            let enabled = self.enabled.clone();
            self.scheduler.every(
                &refresh_trigger(&source),
                period,
                task(move || {
                    let engine = engine.clone();
                    let enabled = enabled.clone();
                    let source = source.clone();
                    async move {
                        if !enabled.load(Ordering::SeqCst) {
                            tracing::debug!(source = %source, "disabled, skipping refresh");
                            return;
                        }
                        engine.run_cycle(&source).await;
                    }
                }),
            );
        }

        let engine = self.engine.clone();
        let enabled = self.enabled.clone();
        self.scheduler.every(
            TRIGGER_RECONCILE,
            self.cfg.reconciliation_interval(),
            task(move || {
                let engine = engine.clone();
                let enabled = enabled.clone();
                async move {
                    if enabled.load(Ordering::SeqCst) {
                        engine.reconcile();
                    }
                }
            }),
        );

        let engine = self.engine.clone();
        let health = self.health.clone();
        let enabled = self.enabled.clone();
        self.scheduler.every(
            TRIGGER_HEALTH,
            self.cfg.health_probe_interval(),
            task(move || {
                let engine = engine.clone();
                let health = health.clone();
                let enabled = enabled.clone();
                async move {
                    if enabled.load(Ordering::SeqCst) {
                        probe_all(&engine, &health).await;
                    }
                }
            }),
        );

        tracing::info!(
            sources = self.engine.source_names().len(),
            enabled = self.is_enabled(),
            clock = self.clock.name(),
            "factor service started"
        );
    }

    fn restore(&self) {
        match load_checkpoint(self.cache.as_ref()) {
            Some(map) if !map.is_empty() => {
                tracing::info!(factors = map.len(), "snapshot restored from checkpoint");
                self.snapshot.load(map);
            }
            _ => {
                let seed = fallback_dataset();
                tracing::info!(factors = seed.len(), "no checkpoint, seeding built-in dataset");
                self.snapshot.load(seed);
            }
        }
    }

    /// Stop triggers, write a final checkpoint, drop connections.
    pub fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.scheduler.shutdown();
        self.engine.checkpoint();
        self.broadcaster.close_all();
        tracing::info!("factor service stopped");
    }

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::SeqCst);
        tracing::info!("scheduled work enabled");
    }

    pub fn disable(&self) {
        self.enabled.store(false, Ordering::SeqCst);
        tracing::warn!("scheduled work disabled");
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Run refresh cycles now, regardless of the kill switch. `None` refreshes
    /// every source; an unknown source yields no reports.
    pub async fn force_refresh(&self, source: Option<&str>) -> Vec<CycleReport> {
        let names = match source {
            Some(s) => vec![s.to_string()],
            None => self.engine.source_names(),
        };
        let mut reports = Vec::with_capacity(names.len());
        for name in names {
            match self.engine.run_cycle(&name).await {
                Some(r) => reports.push(r),
                None => tracing::warn!(source = %name, "force refresh: unknown source"),
            }
        }
        reports
    }

    pub fn reconcile(&self) -> Vec<crate::model::Update> {
        self.engine.reconcile()
    }

    pub async fn probe_health(&self) {
        probe_all(&self.engine, &self.health).await;
    }

    // ---- connections ----

    pub fn connect(&self, connection_id: &str) -> EventReceiver {
        self.broadcaster.connect(connection_id)
    }

    pub fn disconnect(&self, connection_id: &str) {
        self.broadcaster.disconnect(connection_id);
    }

    pub fn handle_message(
        &self,
        connection_id: &str,
        msg: ClientMessage,
    ) -> Result<(), DeliveryError> {
        match msg {
            ClientMessage::Subscribe {
                regions,
                sources,
                min_change_threshold,
            } => self.broadcaster.subscribe(Subscription {
                connection_id: connection_id.to_string(),
                regions: regions.into_iter().collect(),
                sources: sources.into_iter().collect(),
                min_change_threshold,
            }),
            ClientMessage::Unsubscribe => {
                self.broadcaster.unsubscribe(connection_id);
                Ok(())
            }
            ClientMessage::RequestSnapshot { regions } => self.broadcaster.send_to(
                connection_id,
                OutboundEvent::CurrentFactors {
                    factors: self.current_factors(&regions),
                },
            ),
        }
    }

    // ---- queries ----

    pub fn current_factors(&self, regions: &[String]) -> Vec<EmissionFactor> {
        self.snapshot.by_regions(regions)
    }

    pub fn get_metrics(&self) -> MetricsSnapshot {
        self.metrics
            .snapshot(self.broadcaster.subscriber_count(), self.clock.now())
    }

    pub fn get_health(&self) -> HealthReport {
        self.health.report(self.stale_sources())
    }

    fn stale_sources(&self) -> Vec<String> {
        let now = self.clock.now();
        let started = *self.started_at.lock().unwrap_or_else(|e| e.into_inner());
        let mut issues = Vec::new();
        for rt in self.engine.sources() {
            let name = rt.client.name();
            let Ok(interval) = chrono::Duration::from_std(rt.interval) else {
                continue;
            };
            let limit = interval * STALE_AFTER_INTERVALS;
            match self.metrics.freshness(name, now) {
                Some(age) if age > limit => issues.push(format!(
                    "{name}: stale, last refresh {}s ago",
                    age.num_seconds()
                )),
                None if started.is_some_and(|t| now - t > limit) => {
                    issues.push(format!("{name}: stale, never refreshed"))
                }
                _ => {}
            }
        }
        issues
    }

    /// Best grid intensity for `region`: snapshot first, then any cached
    /// sample, and only then the global constant.
    pub fn grid_intensity(&self, region: &str) -> GridIntensity {
        let best = self
            .snapshot
            .by_regions(&[region.to_string()])
            .into_iter()
            .filter(|f| self.is_grid_source(&f.source_name))
            .max_by_key(|f| f.last_updated);
        if let Some(f) = best {
            return GridIntensity {
                region: region.to_string(),
                value: f.value,
                unit: f.unit,
                source: Some(f.source_name),
                origin: IntensityOrigin::Snapshot,
            };
        }

        let grid = self
            .engine
            .sources()
            .filter(|rt| rt.client.config().kind.is_grid());
        for rt in grid {
            let hit: Option<Sample> =
                get_stale_typed(self.cache.as_ref(), &sample_cache_key(rt.client.name(), region));
            if let Some(s) = hit {
                return GridIntensity {
                    region: region.to_string(),
                    value: s.carbon_intensity,
                    unit: CANONICAL_UNIT.to_string(),
                    source: Some(s.source),
                    origin: IntensityOrigin::Cache,
                };
            }
        }

        tracing::warn!(region, "no grid data, using global fallback");
        GridIntensity {
            region: region.to_string(),
            value: GLOBAL_GRID_FALLBACK_KG_PER_KWH,
            unit: CANONICAL_UNIT.to_string(),
            source: None,
            origin: IntensityOrigin::GlobalFallback,
        }
    }

    fn is_grid_source(&self, source: &str) -> bool {
        self.engine
            .source(source)
            .map(|rt| rt.client.config().kind)
            .or_else(|| seed_kind(source))
            .is_some_and(ProviderKind::is_grid)
    }

    // ---- accessors ----

    pub fn config(&self) -> &ServiceConfig {
        &self.cfg
    }

    pub fn snapshot(&self) -> &Arc<FactorSnapshot> {
        &self.snapshot
    }

    pub fn engine(&self) -> &Arc<RefreshEngine> {
        &self.engine
    }

    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    pub fn broadcaster(&self) -> &Arc<Broadcaster> {
        &self.broadcaster
    }

    pub fn client(&self, source: &str) -> Option<&Arc<ResilientClient>> {
        self.engine.source(source).map(|rt| &rt.client)
    }
}

async fn probe_all(engine: &RefreshEngine, health: &HealthMonitor) {
    for rt in engine.sources() {
        let timeout = rt.client.config().timeout();
        health.probe(rt.client.adapter().as_ref(), timeout).await;
    }
}

// tests/refresh_diff.rs
//
// Refresh cycles end to end: scripted provider → resilient client → diff →
// snapshot/broadcast/checkpoint. Time and triggers are manual.

use std::sync::Arc;

use chrono::{TimeZone, Utc};

use carbon_factor_sync::cache::{load_checkpoint, CacheStore, MemoryCache};
use carbon_factor_sync::clock::{ManualClock, SharedClock};
use carbon_factor_sync::config::{
    BreakerConfig, ProviderConfig, ProviderKind, RateLimitConfig, ServiceConfig,
};
use carbon_factor_sync::model::{ClientMessage, ImpactScope, OutboundEvent};
use carbon_factor_sync::providers::scripted::{ScriptedProvider, Step};
use carbon_factor_sync::providers::DynAdapter;
use carbon_factor_sync::scheduler::ManualScheduler;
use carbon_factor_sync::service::refresh_trigger;
use carbon_factor_sync::{FactorService, ServiceDeps};

const SOURCE: &str = "TestGrid";

fn provider_cfg(name: &str, regions: &[&str], epsilon: f64) -> ProviderConfig {
    ProviderConfig {
        name: name.into(),
        kind: ProviderKind::Egrid,
        base_url: "http://scripted.invalid".into(),
        api_key_env: None,
        regions: regions.iter().map(|r| r.to_string()).collect(),
        refresh_interval_secs: 60,
        timeout_secs: 2,
        epsilon,
        cache_ttl_secs: 600,
        rate_limit: RateLimitConfig::default(),
        breaker: BreakerConfig::default(),
    }
}

struct Harness {
    svc: Arc<FactorService>,
    provider: Arc<ScriptedProvider>,
    scheduler: Arc<ManualScheduler>,
    cache: Arc<MemoryCache>,
}

fn harness(regions: &[&str], epsilon: f64) -> Harness {
    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap(),
    ));
    let shared: SharedClock = clock.clone();
    let cache = Arc::new(MemoryCache::new(shared.clone()));
    let scheduler = Arc::new(ManualScheduler::new());
    let provider = Arc::new(ScriptedProvider::new(SOURCE));

    let pcfg = provider_cfg(SOURCE, regions, epsilon);
    let cfg = ServiceConfig {
        providers: vec![pcfg.clone()],
        cache_dir: None,
        ..ServiceConfig::default()
    };
    let svc = FactorService::new(
        cfg,
        vec![(pcfg, provider.clone() as DynAdapter)],
        vec![],
        ServiceDeps {
            cache: cache.clone(),
            scheduler: scheduler.clone(),
            clock: shared,
        },
    );
    svc.start();
    Harness {
        svc,
        provider,
        scheduler,
        cache,
    }
}

#[tokio::test]
async fn first_observation_is_silent_then_change_is_classified() {
    let h = harness(&["R1"], 0.01);
    let mut rx = h.svc.connect("c1");
    h.svc
        .handle_message(
            "c1",
            ClientMessage::Subscribe {
                regions: vec![],
                sources: vec![],
                min_change_threshold: 0.0,
            },
        )
        .unwrap();

    h.provider.enqueue("R1", Step::Value(250.0));
    let first = h.svc.force_refresh(Some(SOURCE)).await;
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].inserted, 1);
    assert!(first[0].updates.is_empty());
    assert!(rx.try_recv().is_err(), "first sighting must not broadcast");

    h.provider.enqueue("R1", Step::Value(300.0));
    let second = h.svc.force_refresh(Some(SOURCE)).await;
    let u = &second[0].updates[0];
    assert_eq!(u.old_value, 250.0);
    assert_eq!(u.new_value, 300.0);
    assert_eq!(u.change_percent, 20.0);
    assert_eq!(u.impact_scope, ImpactScope::High);
    assert_eq!(u.factor_id, "TestGrid:R1");

    match rx.try_recv().unwrap() {
        OutboundEvent::FactorUpdates { updates } => assert_eq!(updates.len(), 1),
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(h.svc.snapshot().get("TestGrid:R1").unwrap().value, 300.0);
    assert_eq!(h.svc.get_metrics().total_updates, 1);
}

#[tokio::test]
async fn sub_epsilon_delta_leaves_snapshot_untouched() {
    let h = harness(&["R1"], 0.01);
    h.provider.enqueue("R1", Step::Value(0.400));
    h.svc.force_refresh(None).await;
    let before = h.svc.snapshot().get("TestGrid:R1").unwrap();

    h.provider.enqueue("R1", Step::Value(0.405));
    let report = h.svc.force_refresh(None).await;
    assert!(report[0].updates.is_empty());
    assert_eq!(h.svc.snapshot().get("TestGrid:R1").unwrap(), before);

    // A move that clears the floor lands.
    h.provider.enqueue("R1", Step::Value(0.44));
    let report = h.svc.force_refresh(None).await;
    assert_eq!(report[0].updates.len(), 1);
    assert_eq!(report[0].updates[0].impact_scope, ImpactScope::Medium);
}

#[tokio::test]
async fn failing_region_does_not_abort_the_cycle() {
    let h = harness(&["R1", "R2", "R3"], 0.001);
    h.provider
        .respond("R1", Step::Fail("connection reset".into()))
        .respond("R2", Step::Value(0.2))
        .respond("R3", Step::Malformed("missing field".into()));

    let report = h.svc.force_refresh(None).await.remove(0);
    assert_eq!(report.regions_attempted, 3);
    assert_eq!(report.live, 1);
    assert_eq!(report.empty, 2);
    assert!(h.svc.snapshot().get("TestGrid:R2").is_some());
    assert!(h.svc.snapshot().get("TestGrid:R1").is_none());
    assert!(h.svc.snapshot().get("TestGrid:R3").is_none());
}

#[tokio::test]
async fn cycle_writes_checkpoint() {
    let h = harness(&["R1"], 0.001);
    h.provider.respond("R1", Step::Value(0.33));
    h.svc.force_refresh(None).await;

    let cp = load_checkpoint(h.cache.as_ref() as &dyn CacheStore).expect("checkpoint");
    assert_eq!(cp.get("TestGrid:R1").map(|f| f.value), Some(0.33));
    // Seeded entries are carried along with live ones.
    assert!(cp.contains_key("EPA_eGRID:CAMX"));
}

#[tokio::test]
async fn scheduled_trigger_respects_kill_switch() {
    let h = harness(&["R1"], 0.001);
    h.provider.respond("R1", Step::Value(0.5));
    let trigger = refresh_trigger(SOURCE);

    assert!(h.scheduler.fire(&trigger).await);
    assert_eq!(h.provider.calls(), 1);

    h.svc.disable();
    assert!(h.scheduler.fire(&trigger).await);
    assert_eq!(h.provider.calls(), 1, "disabled trigger must skip work");

    // Manual refresh still goes through.
    h.svc.force_refresh(Some(SOURCE)).await;
    assert_eq!(h.provider.calls(), 2);

    h.svc.enable();
    h.scheduler.fire(&trigger).await;
    assert_eq!(h.provider.calls(), 3);
}

#[tokio::test]
async fn unknown_source_refresh_is_empty() {
    let h = harness(&["R1"], 0.001);
    assert!(h.svc.force_refresh(Some("Nope")).await.is_empty());
    assert_eq!(h.provider.calls(), 0);
}

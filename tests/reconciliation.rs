// tests/reconciliation.rs
//
// Recent-updates buffer → recalculation_required selection and delivery.

use std::sync::Arc;

use chrono::{TimeZone, Utc};

use carbon_factor_sync::cache::MemoryCache;
use carbon_factor_sync::clock::{ManualClock, SharedClock};
use carbon_factor_sync::config::{
    BreakerConfig, ProviderConfig, ProviderKind, RateLimitConfig, ServiceConfig,
};
use carbon_factor_sync::model::{ClientMessage, ImpactScope, OutboundEvent};
use carbon_factor_sync::providers::scripted::{ScriptedProvider, Step};
use carbon_factor_sync::providers::DynAdapter;
use carbon_factor_sync::scheduler::ManualScheduler;
use carbon_factor_sync::service::TRIGGER_RECONCILE;
use carbon_factor_sync::{FactorService, ServiceDeps};

const REGIONS: [&str; 4] = ["HIGH", "MED_SMALL", "MED_LARGE", "LOW"];

fn service(recent_cap: usize) -> (Arc<FactorService>, Arc<ScriptedProvider>, Arc<ManualScheduler>) {
    let clock: SharedClock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2025, 9, 1, 0, 0, 0).unwrap(),
    ));
    let provider = Arc::new(ScriptedProvider::new("Recon"));
    let scheduler = Arc::new(ManualScheduler::new());
    let pcfg = ProviderConfig {
        name: "Recon".into(),
        kind: ProviderKind::Egrid,
        base_url: "http://scripted.invalid".into(),
        api_key_env: None,
        regions: REGIONS.iter().map(|r| r.to_string()).collect(),
        refresh_interval_secs: 60,
        timeout_secs: 2,
        epsilon: 0.0001,
        cache_ttl_secs: 600,
        rate_limit: RateLimitConfig::default(),
        breaker: BreakerConfig::default(),
    };
    let cfg = ServiceConfig {
        providers: vec![pcfg.clone()],
        cache_dir: None,
        recent_updates_cap: recent_cap,
        ..ServiceConfig::default()
    };
    let svc = FactorService::new(
        cfg,
        vec![(pcfg, provider.clone() as DynAdapter)],
        vec![],
        ServiceDeps {
            cache: Arc::new(MemoryCache::new(clock.clone())),
            scheduler: scheduler.clone(),
            clock,
        },
    );
    svc.start();
    (svc, provider, scheduler)
}

/// Baseline of 1.0 everywhere, then +25%, +8%, +12%, +1%.
async fn produce_mixed_updates(svc: &FactorService, p: &ScriptedProvider) {
    for r in REGIONS {
        p.enqueue(r, Step::Value(1.0));
    }
    svc.force_refresh(None).await;
    p.enqueue("HIGH", Step::Value(1.25))
        .enqueue("MED_SMALL", Step::Value(1.08))
        .enqueue("MED_LARGE", Step::Value(1.12))
        .enqueue("LOW", Step::Value(1.01));
    let reports = svc.force_refresh(None).await;
    assert_eq!(reports[0].updates.len(), 4);
}

#[tokio::test]
async fn selects_high_and_large_medium_only() {
    let (svc, p, _) = service(1000);
    produce_mixed_updates(&svc, &p).await;

    let selected = svc.reconcile();
    let ids: Vec<_> = selected.iter().map(|u| u.factor_id.as_str()).collect();
    assert_eq!(ids, vec!["Recon:HIGH", "Recon:MED_LARGE"]);
    assert_eq!(selected[0].impact_scope, ImpactScope::High);
    assert_eq!(selected[1].impact_scope, ImpactScope::Medium);

    assert!(svc.engine().recent_updates().is_empty());
    assert!(svc.reconcile().is_empty(), "buffer must be empty on the next pass");
}

#[tokio::test]
async fn recalculation_is_sent_to_every_subscriber_unfiltered() {
    let (svc, p, scheduler) = service(1000);
    let mut rx = svc.connect("narrow");
    svc.handle_message(
        "narrow",
        ClientMessage::Subscribe {
            regions: vec!["NOWHERE".into()],
            sources: vec!["SomethingElse".into()],
            min_change_threshold: 99.0,
        },
    )
    .unwrap();

    produce_mixed_updates(&svc, &p).await;
    assert!(rx.try_recv().is_err(), "filtered out of factor_updates");

    assert!(scheduler.fire(TRIGGER_RECONCILE).await);
    match rx.try_recv().unwrap() {
        OutboundEvent::RecalculationRequired { updates, .. } => assert_eq!(updates.len(), 2),
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn low_only_batch_sends_nothing() {
    let (svc, p, _) = service(1000);
    let mut rx = svc.connect("c");
    svc.handle_message(
        "c",
        ClientMessage::Subscribe {
            regions: vec![],
            sources: vec![],
            min_change_threshold: 0.0,
        },
    )
    .unwrap();
    for r in REGIONS {
        p.respond(r, Step::Value(1.0));
    }
    svc.force_refresh(None).await;
    p.enqueue("LOW", Step::Value(1.02));
    svc.force_refresh(None).await;
    let _ = rx.try_recv(); // factor_updates

    assert!(svc.reconcile().is_empty());
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn recent_buffer_is_bounded() {
    let (svc, p, _) = service(3);
    produce_mixed_updates(&svc, &p).await;
    let recent = svc.engine().recent_updates();
    assert_eq!(recent.len(), 3);
    assert_eq!(recent[0].factor_id, "Recon:MED_SMALL", "oldest dropped first");
}

// tests/broadcast_filter.rs
//
// Subscription filtering and delivery isolation on the broadcaster.

use std::collections::BTreeSet;

use chrono::Utc;

use carbon_factor_sync::broadcast::Broadcaster;
use carbon_factor_sync::model::{factor_key, ImpactScope, OutboundEvent, Subscription, Update};
use carbon_factor_sync::DeliveryError;

fn update(source: &str, region: Option<&str>, pct: f64) -> Update {
    Update {
        factor_id: factor_key(source, region.unwrap_or("GLOBAL")),
        source: source.into(),
        old_value: 100.0,
        new_value: 100.0 + pct,
        change: pct,
        change_percent: pct,
        timestamp: Utc::now(),
        region: region.map(str::to_string),
        impact_scope: ImpactScope::classify(pct),
    }
}

fn set(items: &[&str]) -> BTreeSet<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn delivered(ev: OutboundEvent) -> Vec<Update> {
    match ev {
        OutboundEvent::FactorUpdates { updates } => updates,
        other => panic!("expected factor_updates, got {other:?}"),
    }
}

#[test]
fn source_and_threshold_filter() {
    let b = Broadcaster::new();
    let mut rx = b.connect("egrid-watcher");
    b.subscribe(Subscription {
        connection_id: "egrid-watcher".into(),
        sources: set(&["EPA_eGRID"]),
        regions: BTreeSet::new(),
        min_change_threshold: 5.0,
    })
    .unwrap();

    let batch = vec![
        update("AWS_Carbon", Some("us-east-1"), 30.0),
        update("EPA_eGRID", Some("CAMX"), 6.0),
        update("EPA_eGRID", Some("ERCT"), 4.0),
        update("EPA_eGRID", Some("NYUP"), -7.5),
    ];
    assert_eq!(b.broadcast(&batch), 1);

    let got = delivered(rx.try_recv().unwrap());
    let ids: Vec<_> = got.iter().map(|u| u.factor_id.as_str()).collect();
    assert_eq!(ids, vec!["EPA_eGRID:CAMX", "EPA_eGRID:NYUP"]);
}

#[test]
fn region_filter_passes_updates_without_region() {
    let b = Broadcaster::new();
    let mut rx = b.connect("de");
    b.subscribe(Subscription {
        connection_id: "de".into(),
        sources: BTreeSet::new(),
        regions: set(&["DE"]),
        min_change_threshold: 0.0,
    })
    .unwrap();

    let batch = vec![
        update("ElectricityMaps", Some("FR"), 10.0),
        update("ElectricityMaps", Some("DE"), 10.0),
        update("Custom", None, 10.0),
    ];
    b.broadcast(&batch);
    let got = delivered(rx.try_recv().unwrap());
    assert_eq!(got.len(), 2);
    assert_eq!(got[0].region.as_deref(), Some("DE"));
    assert_eq!(got[1].region, None);
}

#[test]
fn nothing_matching_means_nothing_sent() {
    let b = Broadcaster::new();
    let mut rx = b.connect("quiet");
    b.subscribe(Subscription {
        connection_id: "quiet".into(),
        min_change_threshold: 50.0,
        ..Default::default()
    })
    .unwrap();
    assert_eq!(b.broadcast(&[update("EPA_eGRID", Some("CAMX"), 10.0)]), 0);
    assert!(rx.try_recv().is_err());
}

#[test]
fn resubscribe_overwrites_criteria() {
    let b = Broadcaster::new();
    let mut rx = b.connect("c");
    b.subscribe(Subscription {
        connection_id: "c".into(),
        sources: set(&["AWS_Carbon"]),
        ..Default::default()
    })
    .unwrap();
    b.subscribe(Subscription {
        connection_id: "c".into(),
        sources: set(&["EPA_eGRID"]),
        ..Default::default()
    })
    .unwrap();
    assert_eq!(b.subscriber_count(), 1);

    b.broadcast(&[
        update("AWS_Carbon", Some("us-east-1"), 10.0),
        update("EPA_eGRID", Some("CAMX"), 10.0),
    ]);
    let got = delivered(rx.try_recv().unwrap());
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].source, "EPA_eGRID");
}

#[test]
fn unsubscribe_stops_delivery() {
    let b = Broadcaster::new();
    let mut rx = b.connect("c");
    b.subscribe(Subscription {
        connection_id: "c".into(),
        ..Default::default()
    })
    .unwrap();
    assert!(b.unsubscribe("c"));
    assert!(!b.unsubscribe("c"));

    assert_eq!(b.broadcast(&[update("EPA_eGRID", Some("CAMX"), 40.0)]), 0);
    assert_eq!(
        b.broadcast_recalculation(&[update("EPA_eGRID", Some("CAMX"), 40.0)], Utc::now()),
        0
    );
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn dead_connection_is_removed_and_others_unaffected() {
    let b = Broadcaster::new();
    let dead = b.connect("dead");
    let mut alive = b.connect("alive");
    for id in ["dead", "alive"] {
        b.subscribe(Subscription {
            connection_id: id.into(),
            ..Default::default()
        })
        .unwrap();
    }
    drop(dead);

    let batch = [update("EPA_eGRID", Some("CAMX"), 12.0)];
    assert_eq!(b.broadcast(&batch), 1);
    assert_eq!(b.subscriber_count(), 1);
    assert_eq!(b.connection_count(), 1);
    assert_eq!(delivered(alive.recv().await.unwrap()).len(), 1);

    // Gone for good: direct sends now fail as unknown.
    assert!(matches!(
        b.send_to("dead", OutboundEvent::CurrentFactors { factors: vec![] }),
        Err(DeliveryError::UnknownConnection(_))
    ));
}

#[test]
fn disconnect_drops_subscription() {
    let b = Broadcaster::new();
    let _rx = b.connect("c");
    b.subscribe(Subscription {
        connection_id: "c".into(),
        ..Default::default()
    })
    .unwrap();
    b.disconnect("c");
    assert_eq!(b.subscriber_count(), 0);
    assert!(b.subscription("c").is_none());
}

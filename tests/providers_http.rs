// tests/providers_http.rs
//
// Real HTTP adapters against a local axum stand-in for the provider APIs:
// unit normalization, status mapping into the breaker, quota header, probes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, Query},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{TimeZone, Utc};
use serde_json::json;

use carbon_factor_sync::cache::MemoryCache;
use carbon_factor_sync::clock::{ManualClock, SharedClock};
use carbon_factor_sync::config::{BreakerConfig, ProviderConfig, ProviderKind, RateLimitConfig};
use carbon_factor_sync::health::HealthMonitor;
use carbon_factor_sync::providers::egrid::EgridProvider;
use carbon_factor_sync::providers::electricity_maps::ElectricityMapsProvider;
use carbon_factor_sync::providers::http::{build_client, QUOTA_HEADER};
use carbon_factor_sync::providers::{DynAdapter, ProviderAdapter};
use carbon_factor_sync::resilience::{BreakerState, Fetch, ResilientClient};

const TOKEN: &str = "test-token";

async fn em_latest(headers: HeaderMap, Query(q): Query<HashMap<String, String>>) -> Response {
    if headers.get("auth-token").and_then(|v| v.to_str().ok()) != Some(TOKEN) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let zone = q.get("zone").cloned().unwrap_or_default();
    (
        [(QUOTA_HEADER, "7")],
        Json(json!({
            "zone": zone,
            "carbonIntensity": 302,
            "datetime": "2025-05-01T10:00:00.000Z",
            "isEstimated": false,
            "emissionFactorType": "lifecycle"
        })),
    )
        .into_response()
}

async fn egrid_subregion(Path(id): Path<String>) -> Response {
    match id.as_str() {
        "DOWN" => StatusCode::SERVICE_UNAVAILABLE.into_response(),
        "RATE" => StatusCode::TOO_MANY_REQUESTS.into_response(),
        "GONE" => StatusCode::NOT_FOUND.into_response(),
        _ => Json(json!({ "subregion": id, "co2e_lb_per_mwh": 500.0, "year": 2022 }))
            .into_response(),
    }
}

async fn serve() -> String {
    let app = Router::new()
        .route("/v3/carbon-intensity/latest", get(em_latest))
        .route("/v3/zones", get(|| async { Json(json!({})) }))
        .route("/subregions/{id}", get(egrid_subregion))
        .route("/status", get(|| async { "ok" }));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

fn clock() -> SharedClock {
    Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2025, 5, 1, 12, 0, 0).unwrap(),
    ))
}

fn provider_cfg(name: &str, kind: ProviderKind, base_url: &str) -> ProviderConfig {
    ProviderConfig {
        name: name.into(),
        kind,
        base_url: base_url.into(),
        api_key_env: None,
        regions: vec![],
        refresh_interval_secs: 60,
        timeout_secs: 5,
        epsilon: 0.001,
        cache_ttl_secs: 600,
        rate_limit: RateLimitConfig::default(),
        breaker: BreakerConfig {
            volume_threshold: 2,
            ..BreakerConfig::default()
        },
    }
}

fn client_for(cfg: ProviderConfig, adapter: DynAdapter) -> ResilientClient {
    let clock = clock();
    ResilientClient::new(cfg, adapter, Arc::new(MemoryCache::new(clock.clone())), clock)
}

fn egrid(base: &str) -> ResilientClient {
    let cfg = provider_cfg("EPA_eGRID", ProviderKind::Egrid, base);
    let http = build_client(cfg.timeout()).unwrap();
    let adapter = Arc::new(EgridProvider::new(&cfg.name, base, http));
    client_for(cfg, adapter)
}

#[tokio::test]
async fn electricity_maps_sample_is_normalized_and_quota_reconciled() {
    let base = serve().await;
    let cfg = provider_cfg("ElectricityMaps", ProviderKind::ElectricityMaps, &base);
    let http = build_client(cfg.timeout()).unwrap();
    let adapter = Arc::new(ElectricityMapsProvider::new(
        &cfg.name,
        &base,
        TOKEN.to_string(),
        http,
    ));
    let client = client_for(cfg, adapter);

    let f = client.call("DE").await;
    let s = f.sample().expect("live sample");
    assert!(f.is_live());
    assert!((s.carbon_intensity - 0.302).abs() < 1e-12);
    assert_eq!(s.region, "DE");
    assert_eq!(client.limiter().budget().remaining(), 7);
}

#[tokio::test]
async fn rejected_token_is_not_a_breaker_failure() {
    let base = serve().await;
    let cfg = provider_cfg("ElectricityMaps", ProviderKind::ElectricityMaps, &base);
    let http = build_client(cfg.timeout()).unwrap();
    let adapter = Arc::new(ElectricityMapsProvider::new(
        &cfg.name,
        &base,
        "wrong".to_string(),
        http,
    ));
    let client = client_for(cfg, adapter);

    for _ in 0..3 {
        assert_eq!(client.call("DE").await, Fetch::Empty);
    }
    assert_eq!(client.breaker().state(), BreakerState::Closed);
    assert_eq!(client.breaker().snapshot().failure_count, 0);
}

#[tokio::test]
async fn server_errors_trip_the_breaker_then_cache_serves() {
    let base = serve().await;
    let client = egrid(&base);

    let live = client.call("CAMX").await;
    assert!(live.is_live());
    assert_eq!(client.call("DOWN").await, Fetch::Empty);
    assert_eq!(client.call("DOWN").await, Fetch::Empty);
    assert_eq!(client.breaker().state(), BreakerState::Open);

    // Short-circuited, but CAMX is still in the cache.
    let f = client.call("CAMX").await;
    assert!(matches!(f, Fetch::Cached(_)));
    assert_eq!(f.sample(), live.sample());
}

#[tokio::test]
async fn status_codes_map_to_breaker_outcomes() {
    let base = serve().await;
    let client = egrid(&base);

    assert_eq!(client.call("GONE").await, Fetch::Empty);
    assert_eq!(client.breaker().snapshot().failure_count, 0, "4xx is the caller's problem");

    assert_eq!(client.call("RATE").await, Fetch::Empty);
    assert_eq!(client.breaker().snapshot().failure_count, 1, "429 counts");
}

#[tokio::test]
async fn probes_record_reachability() {
    let base = serve().await;
    let http = build_client(Duration::from_secs(2)).unwrap();
    let up = EgridProvider::new("EPA_eGRID", &base, http.clone());

    // A port nobody listens on.
    let closed = {
        let l = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        format!("http://{}", l.local_addr().unwrap())
    };
    let down = EgridProvider::new("Offline", &closed, http);

    let monitor = HealthMonitor::new(Duration::from_secs(3600), clock());
    assert!(monitor.probe(&up, Duration::from_secs(2)).await);
    assert!(!monitor.probe(&down, Duration::from_secs(2)).await);

    assert!(monitor.is_available(up.name()));
    let rec = monitor.record("Offline").unwrap();
    assert!(!rec.is_available);
    assert!(rec.last_error.is_some());
}

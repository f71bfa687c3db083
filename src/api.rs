use std::future::Future;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use shuttle_axum::axum::{
    self,
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;

use crate::health::{HealthReport, HealthStatus};
use crate::metrics::MetricsSnapshot;
use crate::model::{EmissionFactor, Update};
use crate::refresh::CycleReport;
use crate::service::{FactorService, GridIntensity};

pub type AppState = Arc<FactorService>;

/// Administrative routes over a running service.
pub fn router(service: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/stats", get(stats))
        .route("/factors", get(factors))
        .route("/factors/grid/{region}", get(grid_intensity))
        .route("/debug/recent-updates", get(recent_updates))
        .route("/admin/refresh", post(admin_refresh))
        .route("/admin/enable", post(admin_enable))
        .route("/admin/disable", post(admin_disable))
        .layer(CorsLayer::very_permissive())
        .with_state(service)
}

/// Serve `app` until `signal` resolves, then shut `service` down so its
/// triggers are released and a final checkpoint is written.
pub async fn serve_with_shutdown<F>(
    listener: TcpListener,
    app: Router,
    service: AppState,
    signal: F,
) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(signal)
        .await;
    service.shutdown();
    served
}

async fn health(State(svc): State<AppState>) -> (StatusCode, Json<HealthReport>) {
    let report = svc.get_health();
    let code = match report.status {
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::OK,
    };
    (code, Json(report))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatsOut {
    enabled: bool,
    snapshot_size: usize,
    #[serde(flatten)]
    metrics: MetricsSnapshot,
}

async fn stats(State(svc): State<AppState>) -> Json<StatsOut> {
    Json(StatsOut {
        enabled: svc.is_enabled(),
        snapshot_size: svc.snapshot().len(),
        metrics: svc.get_metrics(),
    })
}

#[derive(Deserialize)]
struct FactorsQuery {
    /// Comma separated; absent or empty means all regions.
    #[serde(default)]
    regions: Option<String>,
}

async fn factors(
    State(svc): State<AppState>,
    Query(q): Query<FactorsQuery>,
) -> Json<Vec<EmissionFactor>> {
    let regions: Vec<String> = q
        .regions
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();
    Json(svc.current_factors(&regions))
}

async fn grid_intensity(
    State(svc): State<AppState>,
    Path(region): Path<String>,
) -> Json<GridIntensity> {
    Json(svc.grid_intensity(&region))
}

async fn recent_updates(State(svc): State<AppState>) -> Json<Vec<Update>> {
    Json(svc.engine().recent_updates())
}

#[derive(Deserialize)]
struct RefreshQuery {
    #[serde(default)]
    source: Option<String>,
}

async fn admin_refresh(
    State(svc): State<AppState>,
    Query(q): Query<RefreshQuery>,
) -> Json<Vec<CycleReport>> {
    Json(svc.force_refresh(q.source.as_deref()).await)
}

#[derive(Serialize)]
struct EnabledOut {
    enabled: bool,
}

async fn admin_enable(State(svc): State<AppState>) -> Json<EnabledOut> {
    svc.enable();
    Json(EnabledOut {
        enabled: svc.is_enabled(),
    })
}

async fn admin_disable(State(svc): State<AppState>) -> Json<EnabledOut> {
    svc.disable();
    Json(EnabledOut {
        enabled: svc.is_enabled(),
    })
}

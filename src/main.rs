//! Carbon factor sync: binary entrypoint.
//! Loads config, builds provider adapters, starts the refresh/health
//! triggers and serves the admin + metrics routes. On SIGINT/SIGTERM the
//! server drains and the service writes its final checkpoint.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use shuttle_axum::axum::Router;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use carbon_factor_sync::cache::{CacheStore, FileCache, MemoryCache};
use carbon_factor_sync::clock::{SharedClock, SystemClock};
use carbon_factor_sync::metrics::Metrics;
use carbon_factor_sync::providers::build_adapters;
use carbon_factor_sync::scheduler::TokioScheduler;
use carbon_factor_sync::{config, router, serve_with_shutdown, FactorService, ServiceDeps};

/// Compact tracing logs. `FACTOR_SYNC_LOG` overrides the default filter;
/// a subscriber installed by the runtime wins.
fn init_tracing() {
    let filter = EnvFilter::try_from_env("FACTOR_SYNC_LOG")
        .unwrap_or_else(|_| EnvFilter::new("carbon_factor_sync=info,warn"));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().compact())
        .try_init();
}

/// Router plus the service it fronts, so shutdown can reach the service.
struct FactorSyncService {
    app: Router,
    service: Arc<FactorService>,
}

#[shuttle_runtime::async_trait]
impl shuttle_runtime::Service for FactorSyncService {
    async fn bind(self, addr: SocketAddr) -> Result<(), shuttle_runtime::Error> {
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .context("binding admin listener")?;
        serve_with_shutdown(listener, self.app, self.service, shutdown_signal())
            .await
            .context("serving admin routes")?;
        Ok(())
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown signal received");
}

#[shuttle_runtime::main]
async fn axum() -> Result<FactorSyncService, shuttle_runtime::Error> {
    // Load .env in local/dev; no-op in prod environments.
    let _ = dotenvy::dotenv();
    init_tracing();

    // Recorder before anything that emits or describes metrics.
    let metrics = Metrics::init().context("metrics exporter")?;

    let cfg = config::load_default().context("loading factor sync config")?;
    let clock: SharedClock = Arc::new(SystemClock);

    let cache: Arc<dyn CacheStore> = match &cfg.cache_dir {
        Some(dir) => Arc::new(FileCache::new(dir.clone(), clock.clone())),
        None => Arc::new(MemoryCache::new(clock.clone())),
    };

    let (adapters, misconfigured) = build_adapters(&cfg);
    let service = FactorService::new(
        cfg,
        adapters,
        misconfigured,
        ServiceDeps {
            cache,
            scheduler: Arc::new(TokioScheduler::new()),
            clock,
        },
    );
    service.start();

    let app = router(service.clone()).merge(metrics.router());
    Ok(FactorSyncService { app, service })
}

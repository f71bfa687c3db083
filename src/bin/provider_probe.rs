//! Runs one refresh cycle per configured provider against the real APIs and
//! prints the cycle reports plus the resulting health report.

use std::sync::Arc;

use carbon_factor_sync::cache::MemoryCache;
use carbon_factor_sync::clock::{SharedClock, SystemClock};
use carbon_factor_sync::config;
use carbon_factor_sync::providers::build_adapters;
use carbon_factor_sync::scheduler::ManualScheduler;
use carbon_factor_sync::{FactorService, ServiceDeps};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt().with_target(false).init();

    let cfg = config::load_default()?;
    let clock: SharedClock = Arc::new(SystemClock);
    let (adapters, misconfigured) = build_adapters(&cfg);
    let service = FactorService::new(
        cfg,
        adapters,
        misconfigured,
        ServiceDeps {
            cache: Arc::new(MemoryCache::new(clock.clone())),
            scheduler: Arc::new(ManualScheduler::new()),
            clock,
        },
    );
    service.start();

    for report in service.force_refresh(None).await {
        println!("{}", serde_json::to_string_pretty(&report)?);
    }
    service.probe_health().await;
    println!("{}", serde_json::to_string_pretty(&service.get_health())?);

    service.shutdown();
    Ok(())
}

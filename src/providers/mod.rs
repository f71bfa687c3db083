// src/providers/mod.rs
pub mod cloud_carbon;
pub mod egrid;
pub mod electricity_maps;
pub mod fallback;
pub mod http;
pub mod scripted;

use std::sync::Arc;

use crate::config::{ProviderConfig, ProviderKind, ServiceConfig};
use crate::error::{ConfigurationError, ProviderError};
use crate::model::Sample;

/// One normalized reading plus whatever the provider told us about quota.
#[derive(Debug, Clone, PartialEq)]
pub struct Fetched {
    pub sample: Sample,
    pub quota_remaining: Option<u32>,
}

impl Fetched {
    pub fn new(sample: Sample) -> Self {
        Self {
            sample,
            quota_remaining: None,
        }
    }
}

/// Capability every data source exposes to the resilient client.
#[async_trait::async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Source name; prefixes every snapshot key this adapter produces.
    fn name(&self) -> &str;

    /// Latest normalized sample for `region`, value in kgCO2e/kWh.
    async fn fetch(&self, region: &str) -> Result<Fetched, ProviderError>;

    /// Lightweight liveness check used by the health monitor.
    async fn probe(&self) -> Result<(), ProviderError>;
}

pub type DynAdapter = Arc<dyn ProviderAdapter>;

/// Build adapters for every configured provider.
///
/// A provider with a configuration problem is reported in the second list and
/// simply left out; the others are unaffected.
pub fn build_adapters(
    cfg: &ServiceConfig,
) -> (
    Vec<(ProviderConfig, DynAdapter)>,
    Vec<(String, ConfigurationError)>,
) {
    let mut ok = Vec::new();
    let mut failed = Vec::new();
    for p in &cfg.providers {
        match build_adapter(p) {
            Ok(a) => ok.push((p.clone(), a)),
            Err(e) => {
                tracing::error!(provider = %p.name, error = %e, "provider disabled by configuration");
                failed.push((p.name.clone(), e));
            }
        }
    }
    (ok, failed)
}

pub fn build_adapter(p: &ProviderConfig) -> Result<DynAdapter, ConfigurationError> {
    let key = p.resolve_api_key()?;
    if p.base_url.trim().is_empty() {
        return Err(ConfigurationError::Invalid(format!(
            "{}: base_url is empty",
            p.name
        )));
    }
    let http = http::build_client(p.timeout())?;
    let adapter: DynAdapter = match p.kind {
        ProviderKind::ElectricityMaps => {
            let token = key.ok_or_else(|| {
                ConfigurationError::Invalid(format!("{}: api_key_env is required", p.name))
            })?;
            Arc::new(electricity_maps::ElectricityMapsProvider::new(
                &p.name,
                &p.base_url,
                token,
                http,
            ))
        }
        ProviderKind::Egrid => Arc::new(egrid::EgridProvider::new(&p.name, &p.base_url, http)),
        ProviderKind::CloudCarbon => Arc::new(cloud_carbon::CloudCarbonProvider::new(
            &p.name,
            &p.base_url,
            key,
            http,
        )),
    };
    Ok(adapter)
}

/// Shared guard for parsed intensities.
pub(crate) fn checked_intensity(
    provider: &str,
    region: &str,
    value: f64,
) -> Result<f64, ProviderError> {
    if value.is_finite() && value >= 0.0 {
        Ok(value)
    } else {
        Err(ProviderError::integrity(
            provider,
            region,
            format!("intensity out of range: {value}"),
        ))
    }
}

// src/providers/egrid.rs
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use serde::Deserialize;

use super::{checked_intensity, http, Fetched, ProviderAdapter};
use crate::error::ProviderError;
use crate::model::Sample;

const KG_PER_LB: f64 = 0.453_592_37;

#[derive(Debug, Deserialize)]
struct SubregionRow {
    subregion: String,
    co2e_lb_per_mwh: f64,
    year: i32,
}

/// US EPA eGRID subregion output emission rates (annual releases).
pub struct EgridProvider {
    name: String,
    base_url: String,
    client: reqwest::Client,
}

impl EgridProvider {
    pub fn new(name: &str, base_url: &str, client: reqwest::Client) -> Self {
        Self {
            name: name.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        }
    }
}

/// lb/MWh → kg/kWh.
pub fn lb_per_mwh_to_kg_per_kwh(v: f64) -> f64 {
    v * KG_PER_LB / 1000.0
}

pub fn parse_subregion(provider: &str, region: &str, body: &str) -> Result<Sample, ProviderError> {
    let row: SubregionRow = serde_json::from_str(body)
        .map_err(|e| ProviderError::integrity(provider, region, e.to_string()))?;
    if !row.subregion.eq_ignore_ascii_case(region) {
        return Err(ProviderError::integrity(
            provider,
            region,
            format!("subregion mismatch: got {}", row.subregion),
        ));
    }
    let lb = checked_intensity(provider, region, row.co2e_lb_per_mwh)?;
    let valid_from = Utc
        .with_ymd_and_hms(row.year, 1, 1, 0, 0, 0)
        .single()
        .ok_or_else(|| ProviderError::integrity(provider, region, "bad year"))?;
    Ok(Sample {
        source: provider.to_string(),
        region: region.to_string(),
        carbon_intensity: lb_per_mwh_to_kg_per_kwh(lb),
        timestamp: valid_from,
        provider_meta: Some(serde_json::json!({ "dataYear": row.year })),
    })
}

#[async_trait]
impl ProviderAdapter for EgridProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self, region: &str) -> Result<Fetched, ProviderError> {
        let req = self
            .client
            .get(format!("{}/subregions/{}", self.base_url, region));
        let body = http::send(&self.name, region, req).await?;
        Ok(Fetched {
            sample: parse_subregion(&self.name, region, &body.text)?,
            quota_remaining: body.quota_remaining,
        })
    }

    async fn probe(&self) -> Result<(), ProviderError> {
        let req = self.client.get(format!("{}/status", self.base_url));
        http::send(&self.name, "-", req).await.map(|_| ())
    }
}

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;

use super::{checked_intensity, http, Fetched, ProviderAdapter};
use crate::error::ProviderError;
use crate::model::Sample;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LatestIntensity {
    zone: String,
    /// gCO2eq/kWh
    carbon_intensity: Option<f64>,
    datetime: DateTime<Utc>,
    #[serde(default)]
    is_estimated: Option<bool>,
    #[serde(default)]
    emission_factor_type: Option<String>,
}

/// Live grid intensity per zone; the high-frequency source.
pub struct ElectricityMapsProvider {
    name: String,
    base_url: String,
    token: String,
    client: reqwest::Client,
}

impl ElectricityMapsProvider {
    pub fn new(name: &str, base_url: &str, token: String, client: reqwest::Client) -> Self {
        Self {
            name: name.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            client,
        }
    }
}

/// Parse a `/v3/carbon-intensity/latest` body into a canonical sample.
pub fn parse_latest(provider: &str, region: &str, body: &str) -> Result<Sample, ProviderError> {
    let raw: LatestIntensity = serde_json::from_str(body)
        .map_err(|e| ProviderError::integrity(provider, region, e.to_string()))?;
    if !raw.zone.eq_ignore_ascii_case(region) {
        return Err(ProviderError::integrity(
            provider,
            region,
            format!("zone mismatch: got {}", raw.zone),
        ));
    }
    let grams = raw
        .carbon_intensity
        .ok_or_else(|| ProviderError::integrity(provider, region, "carbonIntensity missing"))?;
    let kg = checked_intensity(provider, region, grams)? / 1000.0;
    Ok(Sample {
        source: provider.to_string(),
        region: region.to_string(),
        carbon_intensity: kg,
        timestamp: raw.datetime,
        provider_meta: Some(serde_json::json!({
            "isEstimated": raw.is_estimated,
            "emissionFactorType": raw.emission_factor_type,
        })),
    })
}

#[async_trait]
impl ProviderAdapter for ElectricityMapsProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self, region: &str) -> Result<Fetched, ProviderError> {
        let req = self
            .client
            .get(format!("{}/v3/carbon-intensity/latest", self.base_url))
            .query(&[("zone", region)])
            .header("auth-token", &self.token);
        let body = http::send(&self.name, region, req).await?;
        let sample = parse_latest(&self.name, region, &body.text)?;
        Ok(Fetched {
            sample,
            quota_remaining: body.quota_remaining,
        })
    }

    async fn probe(&self) -> Result<(), ProviderError> {
        let req = self
            .client
            .get(format!("{}/v3/zones", self.base_url))
            .header("auth-token", &self.token);
        http::send(&self.name, "-", req).await.map(|_| ())
    }
}

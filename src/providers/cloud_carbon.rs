use async_trait::async_trait;
use chrono::{NaiveDate, TimeZone, Utc};
use serde::Deserialize;

use super::{checked_intensity, http, Fetched, ProviderAdapter};
use crate::error::ProviderError;
use crate::model::Sample;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegionIntensity {
    region: String,
    /// Metric tonnes CO2e per MWh, numerically equal to kg per kWh.
    mtco2e_per_mwh: f64,
    /// "YYYY-MM"
    month: String,
}

/// Cloud-region grid intensity export (monthly figures per AWS region).
pub struct CloudCarbonProvider {
    name: String,
    base_url: String,
    token: Option<String>,
    client: reqwest::Client,
}

impl CloudCarbonProvider {
    pub fn new(
        name: &str,
        base_url: &str,
        token: Option<String>,
        client: reqwest::Client,
    ) -> Self {
        Self {
            name: name.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            client,
        }
    }

    fn authed(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(t) => req.bearer_auth(t),
            None => req,
        }
    }
}

pub fn parse_region(provider: &str, region: &str, body: &str) -> Result<Sample, ProviderError> {
    let row: RegionIntensity = serde_json::from_str(body)
        .map_err(|e| ProviderError::integrity(provider, region, e.to_string()))?;
    if row.region != region {
        return Err(ProviderError::integrity(
            provider,
            region,
            format!("region mismatch: got {}", row.region),
        ));
    }
    let value = checked_intensity(provider, region, row.mtco2e_per_mwh)?;
    let month = NaiveDate::parse_from_str(&format!("{}-01", row.month), "%Y-%m-%d")
        .map_err(|e| ProviderError::integrity(provider, region, format!("month: {e}")))?;
    let ts = Utc.from_utc_datetime(&month.and_hms_opt(0, 0, 0).unwrap_or_default());
    Ok(Sample {
        source: provider.to_string(),
        region: region.to_string(),
        carbon_intensity: value,
        timestamp: ts,
        provider_meta: None,
    })
}

#[async_trait]
impl ProviderAdapter for CloudCarbonProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self, region: &str) -> Result<Fetched, ProviderError> {
        let req = self.authed(
            self.client
                .get(format!("{}/regions/{}/intensity", self.base_url, region)),
        );
        let body = http::send(&self.name, region, req).await?;
        Ok(Fetched {
            sample: parse_region(&self.name, region, &body.text)?,
            quota_remaining: body.quota_remaining,
        })
    }

    async fn probe(&self) -> Result<(), ProviderError> {
        let req = self.authed(self.client.get(format!("{}/health", self.base_url)));
        http::send(&self.name, "-", req).await.map(|_| ())
    }
}

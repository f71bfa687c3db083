// src/providers/http.rs
//! Shared reqwest plumbing: one status/transport → [`ProviderError`] mapping
//! for every HTTP adapter.

use std::time::Duration;

use reqwest::{Client, RequestBuilder, StatusCode};

use crate::error::{ConfigurationError, ProviderError};

pub const QUOTA_HEADER: &str = "x-ratelimit-remaining";

pub fn build_client(timeout: Duration) -> Result<Client, ConfigurationError> {
    Client::builder()
        .user_agent("carbon-factor-sync/0.1")
        .connect_timeout(Duration::from_secs(4).min(timeout))
        .timeout(timeout)
        .build()
        .map_err(|e| ConfigurationError::Invalid(format!("http client: {e}")))
}

/// Raw response body plus the provider's remaining-quota header, if any.
#[derive(Debug)]
pub struct Body {
    pub text: String,
    pub quota_remaining: Option<u32>,
}

pub async fn send(provider: &str, region: &str, req: RequestBuilder) -> Result<Body, ProviderError> {
    let resp = req
        .send()
        .await
        .map_err(|e| ProviderError::unavailable(provider, e.to_string()))?;

    let status = resp.status();
    let quota_remaining = resp
        .headers()
        .get(QUOTA_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u32>().ok());

    classify_status(provider, region, status)?;

    let text = resp
        .text()
        .await
        .map_err(|e| ProviderError::unavailable(provider, format!("reading body: {e}")))?;
    Ok(Body {
        text,
        quota_remaining,
    })
}

/// 429 → quota, 5xx → provider down, other 4xx → request rejected for this
/// region only (does not count against the breaker).
pub fn classify_status(provider: &str, region: &str, status: StatusCode) -> Result<(), ProviderError> {
    if status.is_success() {
        return Ok(());
    }
    if status == StatusCode::TOO_MANY_REQUESTS {
        return Err(ProviderError::QuotaExceeded {
            provider: provider.to_string(),
        });
    }
    if status.is_server_error() {
        return Err(ProviderError::HttpStatus {
            provider: provider.to_string(),
            status: status.as_u16(),
        });
    }
    Err(ProviderError::integrity(
        provider,
        region,
        format!("request rejected with HTTP {}", status.as_u16()),
    ))
}

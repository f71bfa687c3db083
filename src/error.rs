// src/error.rs
use std::time::Duration;

/// Failure modes of a single provider call.
///
/// Only the resilient client ever sees these; refresh cycles and subscribers
/// get a cached value or an explicit empty result instead.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProviderError {
    #[error("{provider} unavailable: {reason}")]
    Unavailable { provider: String, reason: String },

    #[error("{provider} timed out after {after:?}")]
    Timeout { provider: String, after: Duration },

    #[error("{provider} returned HTTP {status}")]
    HttpStatus { provider: String, status: u16 },

    #[error("{provider} sent a malformed payload for {region}: {detail}")]
    DataIntegrity {
        provider: String,
        region: String,
        detail: String,
    },

    #[error("{provider} quota exceeded")]
    QuotaExceeded { provider: String },

    #[error("{provider} circuit is open")]
    CircuitOpen { provider: String },
}

impl ProviderError {
    pub fn unavailable(provider: &str, reason: impl Into<String>) -> Self {
        Self::Unavailable {
            provider: provider.to_string(),
            reason: reason.into(),
        }
    }

    pub fn integrity(provider: &str, region: &str, detail: impl Into<String>) -> Self {
        Self::DataIntegrity {
            provider: provider.to_string(),
            region: region.to_string(),
            detail: detail.into(),
        }
    }

    /// Whether the breaker should tally this as a failed call.
    ///
    /// A malformed payload means the provider answered; the sample is dropped
    /// but the provider is not considered down.
    pub fn is_breaker_failure(&self) -> bool {
        match self {
            Self::Unavailable { .. }
            | Self::Timeout { .. }
            | Self::HttpStatus { .. }
            | Self::QuotaExceeded { .. } => true,
            Self::DataIntegrity { .. } | Self::CircuitOpen { .. } => false,
        }
    }
}

/// Startup problems scoped to one provider (or to the config file itself).
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigurationError {
    #[error("{provider}: missing credential in env var {var}")]
    MissingCredential { provider: String, var: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DeliveryError {
    #[error("connection {0} is closed")]
    ConnectionClosed(String),

    #[error("connection {0} is not registered")]
    UnknownConnection(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integrity_errors_do_not_trip_the_breaker() {
        assert!(!ProviderError::integrity("EPA_eGRID", "CAMX", "bad json").is_breaker_failure());
        assert!(ProviderError::unavailable("EPA_eGRID", "503").is_breaker_failure());
        assert!(ProviderError::QuotaExceeded {
            provider: "ElectricityMaps".into()
        }
        .is_breaker_failure());
    }
}

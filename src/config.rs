// src/config.rs
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigurationError;

pub const ENV_CONFIG_PATH: &str = "FACTOR_SYNC_CONFIG";
pub const ENV_ENABLED: &str = "FACTOR_SYNC_ENABLED";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    ElectricityMaps,
    Egrid,
    CloudCarbon,
}

impl ProviderKind {
    /// Samples of this kind describe electricity-grid intensity and may
    /// answer a grid lookup.
    pub fn is_grid(self) -> bool {
        match self {
            ProviderKind::ElectricityMaps | ProviderKind::Egrid | ProviderKind::CloudCarbon => true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RateLimitConfig {
    pub limit: u32,
    pub window_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            limit: 1000,
            window_secs: 3600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BreakerConfig {
    /// Open once the rolling error percentage exceeds this.
    pub error_threshold_pct: f64,
    pub rolling_window_secs: u64,
    pub buckets: u32,
    /// Cool-down before a half-open trial is allowed.
    pub reset_timeout_secs: u64,
    /// Minimum calls in the window before the percentage counts.
    pub volume_threshold: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            error_threshold_pct: 50.0,
            rolling_window_secs: 60,
            buckets: 10,
            reset_timeout_secs: 30,
            volume_threshold: 5,
        }
    }
}

fn default_timeout_secs() -> u64 {
    10
}
fn default_epsilon() -> f64 {
    0.001
}
fn default_true() -> bool {
    true
}
fn default_reconciliation_secs() -> u64 {
    3600
}
fn default_probe_secs() -> u64 {
    300
}
fn default_checkpoint_ttl_secs() -> u64 {
    30 * 24 * 3600
}
fn default_recent_cap() -> usize {
    1000
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProviderConfig {
    /// Source name; also the snapshot key prefix.
    pub name: String,
    pub kind: ProviderKind,
    #[serde(default)]
    pub base_url: String,
    /// Env var holding the API credential, if the provider needs one.
    #[serde(default)]
    pub api_key_env: Option<String>,
    pub regions: Vec<String>,
    pub refresh_interval_secs: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Noise floor in canonical units.
    #[serde(default = "default_epsilon")]
    pub epsilon: f64,
    pub cache_ttl_secs: u64,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub breaker: BreakerConfig,
}

impl ProviderConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    /// Reads the credential named by `api_key_env`.
    pub fn resolve_api_key(&self) -> Result<Option<String>, ConfigurationError> {
        let Some(var) = self.api_key_env.as_deref() else {
            return Ok(None);
        };
        match std::env::var(var) {
            Ok(v) if !v.trim().is_empty() => Ok(Some(v)),
            _ => Err(ConfigurationError::MissingCredential {
                provider: self.name.clone(),
                var: var.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_reconciliation_secs")]
    pub reconciliation_interval_secs: u64,
    #[serde(default = "default_probe_secs")]
    pub health_probe_interval_secs: u64,
    #[serde(default = "default_checkpoint_ttl_secs")]
    pub checkpoint_ttl_secs: u64,
    #[serde(default = "default_recent_cap")]
    pub recent_updates_cap: usize,
    /// File cache directory; in-memory cache when absent.
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,
    pub providers: Vec<ProviderConfig>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            reconciliation_interval_secs: default_reconciliation_secs(),
            health_probe_interval_secs: default_probe_secs(),
            checkpoint_ttl_secs: default_checkpoint_ttl_secs(),
            recent_updates_cap: default_recent_cap(),
            cache_dir: Some(PathBuf::from("cache/factors")),
            providers: vec![
                ProviderConfig {
                    name: "ElectricityMaps".into(),
                    kind: ProviderKind::ElectricityMaps,
                    base_url: "https://api.electricitymap.org".into(),
                    api_key_env: Some("ELECTRICITYMAPS_API_KEY".into()),
                    regions: vec!["DE".into(), "FR".into(), "GB".into(), "US-CAL-CISO".into()],
                    refresh_interval_secs: 900,
                    timeout_secs: 10,
                    epsilon: 0.001,
                    cache_ttl_secs: 600,
                    rate_limit: RateLimitConfig::default(),
                    breaker: BreakerConfig::default(),
                },
                ProviderConfig {
                    name: "EPA_eGRID".into(),
                    kind: ProviderKind::Egrid,
                    base_url: "https://data.epa.gov/egrid/api".into(),
                    api_key_env: None,
                    regions: vec!["CAMX".into(), "ERCT".into(), "NYUP".into(), "RFCE".into()],
                    refresh_interval_secs: 86_400,
                    timeout_secs: 30,
                    epsilon: 0.01,
                    cache_ttl_secs: 12 * 3600,
                    rate_limit: RateLimitConfig {
                        limit: 100,
                        window_secs: 3600,
                    },
                    breaker: BreakerConfig::default(),
                },
                ProviderConfig {
                    name: "AWS_Carbon".into(),
                    kind: ProviderKind::CloudCarbon,
                    base_url: "http://127.0.0.1:8790/ccft".into(),
                    api_key_env: Some("AWS_CARBON_API_KEY".into()),
                    regions: vec!["us-east-1".into(), "us-west-2".into(), "eu-west-1".into()],
                    refresh_interval_secs: 6 * 3600,
                    timeout_secs: 15,
                    epsilon: 0.005,
                    cache_ttl_secs: 4 * 3600,
                    rate_limit: RateLimitConfig {
                        limit: 500,
                        window_secs: 3600,
                    },
                    breaker: BreakerConfig::default(),
                },
            ],
        }
    }
}

impl ServiceConfig {
    pub fn reconciliation_interval(&self) -> Duration {
        Duration::from_secs(self.reconciliation_interval_secs)
    }

    pub fn health_probe_interval(&self) -> Duration {
        Duration::from_secs(self.health_probe_interval_secs)
    }

    pub fn checkpoint_ttl(&self) -> Duration {
        Duration::from_secs(self.checkpoint_ttl_secs)
    }

    pub fn provider(&self, name: &str) -> Option<&ProviderConfig> {
        self.providers.iter().find(|p| p.name == name)
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let invalid = |m: String| Err(ConfigurationError::Invalid(m));
        if self.reconciliation_interval_secs == 0 || self.health_probe_interval_secs == 0 {
            return invalid("service intervals must be > 0".into());
        }
        let mut seen = std::collections::HashSet::new();
        for p in &self.providers {
            if !seen.insert(p.name.as_str()) {
                return invalid(format!("duplicate provider name {}", p.name));
            }
            if p.name.contains(':') {
                return invalid(format!("provider name {} must not contain ':'", p.name));
            }
            if p.refresh_interval_secs == 0 || p.timeout_secs == 0 {
                return invalid(format!("{}: intervals must be > 0", p.name));
            }
            if p.epsilon.is_nan() || p.epsilon < 0.0 {
                return invalid(format!("{}: epsilon must be >= 0", p.name));
            }
            if p.rate_limit.limit == 0 || p.rate_limit.window_secs == 0 {
                return invalid(format!("{}: rate limit must be > 0", p.name));
            }
            if p.breaker.buckets == 0 || p.breaker.rolling_window_secs == 0 {
                return invalid(format!("{}: breaker window must be > 0", p.name));
            }
        }
        Ok(())
    }
}

/// Load config from an explicit path. Supports TOML or JSON, by extension.
pub fn load_from(path: &Path) -> Result<ServiceConfig> {
    let content =
        fs::read_to_string(path).with_context(|| format!("reading config {}", path.display()))?;
    let ext = path
        .extension()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    let cfg = parse_config(&content, &ext)?;
    cfg.validate()?;
    Ok(cfg)
}

/// Load config using env var + fallbacks:
/// 1) $FACTOR_SYNC_CONFIG
/// 2) config/factor_sync.toml
/// 3) config/factor_sync.json
/// 4) built-in defaults
///
/// `FACTOR_SYNC_ENABLED=0|false` flips the kill switch afterwards.
pub fn load_default() -> Result<ServiceConfig> {
    let mut cfg = if let Ok(p) = std::env::var(ENV_CONFIG_PATH) {
        let pb = PathBuf::from(p);
        if !pb.exists() {
            return Err(anyhow!("{ENV_CONFIG_PATH} points to non-existent path"));
        }
        load_from(&pb)?
    } else {
        let toml_p = PathBuf::from("config/factor_sync.toml");
        let json_p = PathBuf::from("config/factor_sync.json");
        if toml_p.exists() {
            load_from(&toml_p)?
        } else if json_p.exists() {
            load_from(&json_p)?
        } else {
            ServiceConfig::default()
        }
    };

    if let Ok(v) = std::env::var(ENV_ENABLED) {
        cfg.enabled = !matches!(v.trim().to_ascii_lowercase().as_str(), "0" | "false" | "off");
    }
    Ok(cfg)
}

fn parse_config(s: &str, hint_ext: &str) -> Result<ServiceConfig> {
    if hint_ext == "json" {
        return serde_json::from_str(s).context("parsing JSON config");
    }
    toml::from_str(s).context("parsing TOML config")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    const MINIMAL: &str = r#"
reconciliation_interval_secs = 600

[[providers]]
name = "EPA_eGRID"
kind = "egrid"
base_url = "http://localhost:9000"
regions = ["CAMX"]
refresh_interval_secs = 60
cache_ttl_secs = 3600
"#;

    #[test]
    fn toml_fills_defaults() {
        let cfg = parse_config(MINIMAL, "toml").unwrap();
        assert!(cfg.enabled);
        assert_eq!(cfg.reconciliation_interval_secs, 600);
        assert_eq!(cfg.health_probe_interval_secs, 300);
        let p = &cfg.providers[0];
        assert_eq!(p.timeout_secs, 10);
        assert_eq!(p.epsilon, 0.001);
        assert_eq!(p.breaker, BreakerConfig::default());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn defaults_are_valid() {
        assert!(ServiceConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_duplicate_and_zero_values() {
        let mut cfg = ServiceConfig::default();
        cfg.providers.push(cfg.providers[0].clone());
        assert!(cfg.validate().is_err());

        let mut cfg = ServiceConfig::default();
        cfg.providers[1].breaker.buckets = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = ServiceConfig::default();
        cfg.providers[0].epsilon = -0.1;
        assert!(cfg.validate().is_err());
    }

    #[serial_test::serial]
    #[test]
    fn missing_credential_is_reported_per_provider() {
        let mut p = ServiceConfig::default().providers[0].clone();
        p.api_key_env = Some("FACTOR_SYNC_TEST_MISSING_KEY".into());
        env::remove_var("FACTOR_SYNC_TEST_MISSING_KEY");
        assert_eq!(
            p.resolve_api_key(),
            Err(ConfigurationError::MissingCredential {
                provider: "ElectricityMaps".into(),
                var: "FACTOR_SYNC_TEST_MISSING_KEY".into(),
            })
        );
        env::set_var("FACTOR_SYNC_TEST_MISSING_KEY", "secret");
        assert_eq!(p.resolve_api_key(), Ok(Some("secret".into())));
        env::remove_var("FACTOR_SYNC_TEST_MISSING_KEY");
    }
}

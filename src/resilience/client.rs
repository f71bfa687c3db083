//! Resilient provider client: one generic wrapper around any
//! [`ProviderAdapter`], parameterised only by its [`ProviderConfig`].
//!
//! Call path: rate limiter → circuit breaker → adapter (with deadline) → cache.
//! Provider errors stop here; callers only ever see a live sample, a cached
//! sample, or an explicit empty result.

use std::sync::Arc;
use std::time::Instant;

use metrics::{counter, histogram};

use crate::cache::{get_stale_typed, get_typed, set_typed, CacheStore};
use crate::clock::SharedClock;
use crate::config::ProviderConfig;
use crate::error::ProviderError;
use crate::model::Sample;
use crate::providers::ProviderAdapter;

use super::breaker::{Admission, CircuitBreaker};
use super::limiter::RateLimiter;

/// Result of one resilient call.
#[derive(Debug, Clone, PartialEq)]
pub enum Fetch {
    Live(Sample),
    /// Served from cache because the provider could not be used.
    Cached(Sample),
    Empty,
}

impl Fetch {
    pub fn sample(&self) -> Option<&Sample> {
        match self {
            Fetch::Live(s) | Fetch::Cached(s) => Some(s),
            Fetch::Empty => None,
        }
    }

    pub fn is_live(&self) -> bool {
        matches!(self, Fetch::Live(_))
    }
}

pub fn sample_cache_key(source: &str, region: &str) -> String {
    format!("sample:{source}:{region}")
}

pub struct ResilientClient {
    cfg: ProviderConfig,
    adapter: Arc<dyn ProviderAdapter>,
    breaker: Arc<CircuitBreaker>,
    limiter: RateLimiter,
    cache: Arc<dyn CacheStore>,
}

impl ResilientClient {
    pub fn new(
        cfg: ProviderConfig,
        adapter: Arc<dyn ProviderAdapter>,
        cache: Arc<dyn CacheStore>,
        clock: SharedClock,
    ) -> Self {
        let breaker = Arc::new(CircuitBreaker::new(
            cfg.name.clone(),
            cfg.breaker.clone(),
            clock.clone(),
        ));
        let limiter = RateLimiter::new(cfg.name.clone(), &cfg.rate_limit, clock);
        Self {
            cfg,
            adapter,
            breaker,
            limiter,
            cache,
        }
    }

    pub fn name(&self) -> &str {
        &self.cfg.name
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.cfg
    }

    pub fn adapter(&self) -> &Arc<dyn ProviderAdapter> {
        &self.adapter
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub async fn call(&self, region: &str) -> Fetch {
        let provider = self.cfg.name.clone();

        if !self.limiter.try_acquire() {
            tracing::warn!(provider = %provider, region, "rate budget exhausted, serving cache");
            counter!("provider_short_circuit_total", "provider" => provider, "reason" => "quota")
                .increment(1);
            return self.cached(region, false);
        }

        let ticket = self.breaker.admit();
        if ticket == Admission::Rejected {
            self.limiter.refund();
            let e = ProviderError::CircuitOpen {
                provider: provider.clone(),
            };
            tracing::debug!(region, error = %e, "short-circuited, serving cache");
            counter!("provider_short_circuit_total", "provider" => provider, "reason" => "open")
                .increment(1);
            return self.cached(region, false);
        }

        let t0 = Instant::now();
        let res = match tokio::time::timeout(self.cfg.timeout(), self.adapter.fetch(region)).await
        {
            Ok(r) => r.and_then(|f| validate(&provider, region, f)),
            Err(_) => Err(ProviderError::Timeout {
                provider: provider.clone(),
                after: self.cfg.timeout(),
            }),
        };
        histogram!("provider_fetch_ms", "provider" => provider.clone())
            .record(t0.elapsed().as_secs_f64() * 1_000.0);

        match res {
            Ok(fetched) => {
                self.breaker.record_success(ticket);
                if let Some(remaining) = fetched.quota_remaining {
                    self.limiter.reconcile(remaining);
                }
                set_typed(
                    self.cache.as_ref(),
                    &sample_cache_key(&provider, region),
                    &fetched.sample,
                    self.cfg.cache_ttl(),
                );
                counter!("provider_calls_total", "provider" => provider, "outcome" => "live")
                    .increment(1);
                Fetch::Live(fetched.sample)
            }
            Err(e) if e.is_breaker_failure() => {
                self.breaker.record_failure(ticket, &e.to_string());
                tracing::warn!(provider = %provider, region, error = %e, "provider call failed, falling back to cache");
                counter!("provider_calls_total", "provider" => provider, "outcome" => "failed")
                    .increment(1);
                self.cached(region, true)
            }
            Err(e) => {
                // The provider answered, so the breaker sees a success; the
                // sample itself is discarded for this cycle.
                self.breaker.record_success(ticket);
                tracing::warn!(provider = %provider, region, error = %e, "discarding malformed sample");
                counter!("provider_calls_total", "provider" => provider, "outcome" => "rejected")
                    .increment(1);
                Fetch::Empty
            }
        }
    }

    /// `allow_stale`: after a real failure any cached value is better than
    /// none; when short-circuiting only unexpired entries are served.
    fn cached(&self, region: &str, allow_stale: bool) -> Fetch {
        let key = sample_cache_key(&self.cfg.name, region);
        let hit: Option<Sample> = if allow_stale {
            get_stale_typed(self.cache.as_ref(), &key)
        } else {
            get_typed(self.cache.as_ref(), &key)
        };
        match hit {
            Some(s) => Fetch::Cached(s),
            None => Fetch::Empty,
        }
    }
}

fn validate(
    provider: &str,
    region: &str,
    f: crate::providers::Fetched,
) -> Result<crate::providers::Fetched, ProviderError> {
    let v = f.sample.carbon_intensity;
    if !v.is_finite() || v < 0.0 {
        return Err(ProviderError::integrity(
            provider,
            region,
            format!("intensity out of range: {v}"),
        ));
    }
    Ok(f)
}

// src/model.rs
//! Domain types shared by the refresh engine, the snapshot store and the
//! broadcast fan-out. Wire names are camelCase.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Canonical unit for every stored factor value.
pub const CANONICAL_UNIT: &str = "kgCO2e/kWh";

/// Stable snapshot key. Each source owns the `"{source}:"` prefix.
pub fn factor_key(source: &str, region: &str) -> String {
    format!("{source}:{region}")
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EmissionFactor {
    pub factor_id: String,
    pub source_name: String,
    pub value: f64,
    pub unit: String,
    pub region: String,
    pub last_updated: DateTime<Utc>,
    pub valid_from: DateTime<Utc>,
}

impl EmissionFactor {
    pub fn from_sample(sample: &Sample, now: DateTime<Utc>) -> Self {
        Self {
            factor_id: factor_key(&sample.source, &sample.region),
            source_name: sample.source.clone(),
            value: sample.carbon_intensity,
            unit: CANONICAL_UNIT.to_string(),
            region: sample.region.clone(),
            last_updated: now,
            valid_from: sample.timestamp,
        }
    }
}

/// One normalized provider reading. Never persisted as-is; the cache holds
/// these only as a fallback for the same provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Sample {
    pub source: String,
    pub region: String,
    /// Already converted to [`CANONICAL_UNIT`].
    pub carbon_intensity: f64,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_meta: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ImpactScope {
    Low,
    Medium,
    High,
}

impl ImpactScope {
    /// `>= 20%` is high, `>= 5%` medium, anything smaller low.
    pub fn classify(change_percent: f64) -> Self {
        let abs = change_percent.abs();
        if abs >= 20.0 {
            Self::High
        } else if abs >= 5.0 {
            Self::Medium
        } else {
            Self::Low
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Update {
    pub factor_id: String,
    pub source: String,
    pub old_value: f64,
    pub new_value: f64,
    pub change: f64,
    pub change_percent: f64,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    pub impact_scope: ImpactScope,
}

impl Update {
    /// Whether reconciliation should ask downstream to recalculate.
    pub fn requires_recalculation(&self) -> bool {
        match self.impact_scope {
            ImpactScope::High => true,
            ImpactScope::Medium => self.change_percent.abs() > 10.0,
            ImpactScope::Low => false,
        }
    }
}

/// Filter criteria attached to one connection.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {
    pub connection_id: String,
    #[serde(default)]
    pub regions: BTreeSet<String>,
    #[serde(default)]
    pub sources: BTreeSet<String>,
    #[serde(default)]
    pub min_change_threshold: f64,
}

impl Subscription {
    pub fn matches(&self, update: &Update) -> bool {
        let source_ok = self.sources.is_empty() || self.sources.contains(&update.source);
        let region_ok = match (&update.region, self.regions.is_empty()) {
            (_, true) | (None, false) => true,
            (Some(r), false) => self.regions.contains(r),
        };
        source_ok && region_ok && update.change_percent.abs() >= self.min_change_threshold
    }
}

/// Inbound messages carried by whatever transport sits in front of the service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    #[serde(rename_all = "camelCase")]
    Subscribe {
        #[serde(default)]
        regions: Vec<String>,
        #[serde(default)]
        sources: Vec<String>,
        #[serde(default)]
        min_change_threshold: f64,
    },
    Unsubscribe,
    RequestSnapshot {
        #[serde(default)]
        regions: Vec<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundEvent {
    FactorUpdates {
        updates: Vec<Update>,
    },
    CurrentFactors {
        factors: Vec<EmissionFactor>,
    },
    RecalculationRequired {
        updates: Vec<Update>,
        timestamp: DateTime<Utc>,
    },
}

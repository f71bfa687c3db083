//! # Built-in fallback dataset
//! Representative factors used to seed the snapshot when no checkpoint
//! exists, so a cold start never begins with an empty map. Keys match what
//! the live adapters produce, so the first live sample diffs against these.
//!
//! Values in kgCO2e/kWh:
//! - EPA eGRID 2022 subregion output rates (converted from lb/MWh).
//! - ElectricityMaps yearly lifecycle averages.
//! - Cloud-region monthly averages.

use chrono::{DateTime, TimeZone, Utc};
use std::collections::HashMap;

use crate::config::ProviderKind;
use crate::model::{factor_key, EmissionFactor, CANONICAL_UNIT};

/// Global grid-intensity fallback (world average, kgCO2e/kWh).
///
/// The only value the service ever substitutes on its own, and only for
/// electricity-grid lookups when neither the snapshot nor the cache has data
/// for the region. Results built from it are flagged as such.
pub const GLOBAL_GRID_FALLBACK_KG_PER_KWH: f64 = 0.475;

const SEED: &[(&str, &str, f64)] = &[
    ("EPA_eGRID", "CAMX", 0.2254),
    ("EPA_eGRID", "ERCT", 0.3733),
    ("EPA_eGRID", "NYUP", 0.1053),
    ("EPA_eGRID", "RFCE", 0.2724),
    ("ElectricityMaps", "DE", 0.381),
    ("ElectricityMaps", "FR", 0.056),
    ("ElectricityMaps", "GB", 0.237),
    ("ElectricityMaps", "US-CAL-CISO", 0.257),
    ("AWS_Carbon", "us-east-1", 0.379),
    ("AWS_Carbon", "us-west-2", 0.283),
    ("AWS_Carbon", "eu-west-1", 0.316),
];

fn seed_epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0)
        .single()
        .unwrap_or_default()
}

pub fn fallback_dataset() -> HashMap<String, EmissionFactor> {
    let at = seed_epoch();
    SEED.iter()
        .map(|&(source, region, value)| {
            let f = EmissionFactor {
                factor_id: factor_key(source, region),
                source_name: source.to_string(),
                value,
                unit: CANONICAL_UNIT.to_string(),
                region: region.to_string(),
                last_updated: at,
                valid_from: at,
            };
            (f.factor_id.clone(), f)
        })
        .collect()
}

/// Kind of the provider a seeded source name stands for. Configured
/// providers carry their own kind; this only covers seed entries left in the
/// snapshot under names no configured provider uses.
pub fn seed_kind(source: &str) -> Option<ProviderKind> {
    match source {
        "ElectricityMaps" => Some(ProviderKind::ElectricityMaps),
        "EPA_eGRID" => Some(ProviderKind::Egrid),
        "AWS_Carbon" => Some(ProviderKind::CloudCarbon),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dataset_keys_are_prefixed_by_source() {
        let ds = fallback_dataset();
        assert_eq!(ds.len(), SEED.len());
        for (k, f) in ds {
            assert!(k.starts_with(&format!("{}:", f.source_name)));
            assert_eq!(f.unit, CANONICAL_UNIT);
            assert!(seed_kind(&f.source_name).is_some());
        }
    }
}

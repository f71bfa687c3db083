// src/snapshot.rs
//! Current best-known emission factor per stable key.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::model::EmissionFactor;

#[derive(Debug, Default)]
pub struct FactorSnapshot {
    inner: RwLock<HashMap<String, EmissionFactor>>,
}

impl FactorSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole map (startup restore).
    pub fn load(&self, factors: HashMap<String, EmissionFactor>) {
        *self.inner.write().unwrap_or_else(|e| e.into_inner()) = factors;
    }

    pub fn get(&self, factor_id: &str) -> Option<EmissionFactor> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(factor_id)
            .cloned()
    }

    pub fn upsert(&self, factor: EmissionFactor) {
        self.inner
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(factor.factor_id.clone(), factor);
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All factors, ordered by id.
    pub fn all(&self) -> Vec<EmissionFactor> {
        self.filtered(|_| true)
    }

    /// Factors for the given regions; empty list means everything.
    pub fn by_regions(&self, regions: &[String]) -> Vec<EmissionFactor> {
        if regions.is_empty() {
            return self.all();
        }
        self.filtered(|f| regions.iter().any(|r| r == &f.region))
    }

    /// Clone of the map for checkpointing.
    pub fn to_map(&self) -> HashMap<String, EmissionFactor> {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn filtered(&self, keep: impl Fn(&EmissionFactor) -> bool) -> Vec<EmissionFactor> {
        let g = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let mut out: Vec<_> = g.values().filter(|f| keep(f)).cloned().collect();
        out.sort_by(|a, b| a.factor_id.cmp(&b.factor_id));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::fallback::fallback_dataset;

    #[test]
    fn by_regions_filters_and_sorts() {
        let s = FactorSnapshot::new();
        s.load(fallback_dataset());
        let de = s.by_regions(&["DE".to_string(), "CAMX".to_string()]);
        let ids: Vec<_> = de.iter().map(|f| f.factor_id.as_str()).collect();
        assert_eq!(ids, vec!["EPA_eGRID:CAMX", "ElectricityMaps:DE"]);
        assert_eq!(s.by_regions(&[]).len(), s.len());
    }
}

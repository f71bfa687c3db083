//! # Diff
//! Pure comparison of a fresh sample against the current snapshot entry.
//! No I/O, no shared state; the refresh engine applies the outcome.

use chrono::{DateTime, Utc};

use crate::model::{EmissionFactor, ImpactScope, Sample, Update};

#[derive(Debug, Clone, PartialEq)]
pub enum DiffOutcome {
    /// First observation for this key: stored, never announced.
    Inserted(EmissionFactor),
    Changed {
        factor: EmissionFactor,
        update: Update,
    },
    /// Within the noise floor; the snapshot stays as it is.
    Unchanged,
}

/// Percentage change relative to the old value.
///
/// A zero baseline has no meaningful ratio; any move away from it is reported
/// as ±100%.
pub fn change_percent(old: f64, new: f64) -> f64 {
    let delta = new - old;
    if old == 0.0 {
        return 100.0 * delta.signum();
    }
    delta / old * 100.0
}

pub fn diff_sample(
    prev: Option<&EmissionFactor>,
    sample: &Sample,
    epsilon: f64,
    now: DateTime<Utc>,
) -> DiffOutcome {
    let fresh = EmissionFactor::from_sample(sample, now);
    let Some(prev) = prev else {
        return DiffOutcome::Inserted(fresh);
    };

    let delta = fresh.value - prev.value;
    if delta.abs() <= epsilon {
        return DiffOutcome::Unchanged;
    }

    let pct = change_percent(prev.value, fresh.value);
    let update = Update {
        factor_id: fresh.factor_id.clone(),
        source: fresh.source_name.clone(),
        old_value: prev.value,
        new_value: fresh.value,
        change: delta,
        change_percent: pct,
        timestamp: now,
        region: Some(fresh.region.clone()),
        impact_scope: ImpactScope::classify(pct),
    };
    DiffOutcome::Changed {
        factor: fresh,
        update,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 4, 1, 0, 0, 0).unwrap()
    }

    fn sample(v: f64) -> Sample {
        Sample {
            source: "EPA_eGRID".into(),
            region: "CAMX".into(),
            carbon_intensity: v,
            timestamp: t(),
            provider_meta: None,
        }
    }

    fn factor(v: f64) -> EmissionFactor {
        EmissionFactor::from_sample(&sample(v), t())
    }

    #[test]
    fn first_observation_is_inserted_silently() {
        assert!(matches!(
            diff_sample(None, &sample(1.0), 0.01, t()),
            DiffOutcome::Inserted(_)
        ));
    }

    #[test]
    fn change_is_relative_to_old_value() {
        let prev = factor(250.0);
        match diff_sample(Some(&prev), &sample(300.0), 0.01, t()) {
            DiffOutcome::Changed { update, factor } => {
                assert_eq!(update.change_percent, 20.0);
                assert_eq!(update.change, 50.0);
                assert_eq!(update.impact_scope, ImpactScope::High);
                assert_eq!(update.region.as_deref(), Some("CAMX"));
                assert_eq!(factor.value, 300.0);
            }
            other => panic!("expected change, got {other:?}"),
        }
    }

    #[test]
    fn sub_epsilon_delta_is_noise() {
        let prev = factor(0.300);
        assert_eq!(
            diff_sample(Some(&prev), &sample(0.3009), 0.001, t()),
            DiffOutcome::Unchanged
        );
        assert!(matches!(
            diff_sample(Some(&prev), &sample(0.302), 0.001, t()),
            DiffOutcome::Changed { .. }
        ));
    }

    #[test]
    fn zero_baseline() {
        assert_eq!(change_percent(0.0, 0.5), 100.0);
        assert_eq!(change_percent(0.0, 0.0), 0.0);
        assert_eq!(change_percent(2.0, 1.0), -50.0);
    }
}

//! Render-relevance change detection between two field sets.

#![forbid(unsafe_code)]

use fleetview_core::{field, EngineConfig, FieldValue, Fields};
use rustc_hash::{FxHashMap, FxHashSet};

/// Decides whether the delta between two records is worth a re-render.
/// Volatile fields are excluded entirely and numeric fields compare equal
/// within a per-field tolerance, so measurement jitter and noise fields
/// never mark a row dirty. Pure: no side effects, no interior state.
#[derive(Debug, Clone)]
pub struct ChangeDetector {
    excluded: FxHashSet<String>,
    epsilon_by_field: FxHashMap<String, f64>,
    default_epsilon: f64,
}

impl ChangeDetector {
    pub fn from_config(cfg: &EngineConfig) -> Self {
        Self {
            excluded: cfg.excluded_fields.iter().cloned().collect(),
            epsilon_by_field: cfg.epsilon_by_field.iter().cloned().collect(),
            default_epsilon: cfg.default_epsilon,
        }
    }

    fn epsilon(&self, name: &str) -> f64 {
        self.epsilon_by_field.get(name).copied().unwrap_or(self.default_epsilon)
    }

    fn value_eq(&self, name: &str, a: &FieldValue, b: &FieldValue) -> bool {
        match (a, b) {
            (FieldValue::Number(x), FieldValue::Number(y)) => {
                // NaN compares equal to itself so a broken probe does not
                // re-render the row on every tick.
                (x.is_nan() && y.is_nan()) || (x - y).abs() <= self.epsilon(name)
            }
            _ => a == b,
        }
    }

    /// True if any non-excluded field differs beyond tolerance, including
    /// fields added or removed between the two sets.
    pub fn is_relevant_change(&self, old: &Fields, new: &Fields) -> bool {
        for (name, value) in new.iter() {
            if self.excluded.contains(name) {
                continue;
            }
            match field(old, name) {
                Some(prev) if self.value_eq(name, prev, value) => {}
                _ => return true,
            }
        }
        // A non-excluded field that vanished is a relevant change too.
        old.iter()
            .any(|(name, _)| !self.excluded.contains(name) && field(new, name).is_none())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector() -> ChangeDetector {
        ChangeDetector::from_config(&EngineConfig::default())
    }

    fn fields(pairs: &[(&str, FieldValue)]) -> Fields {
        pairs.iter().map(|(n, v)| (n.to_string(), v.clone())).collect()
    }

    #[test]
    fn identical_fields_are_clean() {
        let a = fields(&[
            ("name", FieldValue::Text("MuMu-1".into())),
            ("cpu", FieldValue::Number(10.0)),
        ]);
        assert!(!detector().is_relevant_change(&a, &a.clone()));
    }

    #[test]
    fn excluded_fields_are_ignored() {
        let old = fields(&[("pid", FieldValue::Number(100.0)), ("cpu", FieldValue::Number(10.0))]);
        let new = fields(&[("pid", FieldValue::Number(999.0)), ("cpu", FieldValue::Number(10.0))]);
        assert!(!detector().is_relevant_change(&old, &new));
    }

    #[test]
    fn numeric_jitter_within_epsilon_is_clean() {
        let old = fields(&[("cpu", FieldValue::Number(10.0))]);
        let new = fields(&[("cpu", FieldValue::Number(10.0009))]);
        assert!(!detector().is_relevant_change(&old, &new));

        let beyond = fields(&[("cpu", FieldValue::Number(10.002))]);
        assert!(detector().is_relevant_change(&old, &beyond));
    }

    #[test]
    fn per_field_epsilon_overrides_default() {
        let mut cfg = EngineConfig::default();
        cfg.epsilon_by_field = vec![("mem".to_string(), 1.0)];
        let det = ChangeDetector::from_config(&cfg);
        let old = fields(&[("mem", FieldValue::Number(512.0))]);
        assert!(!det.is_relevant_change(&old, &fields(&[("mem", FieldValue::Number(512.9))])));
        assert!(det.is_relevant_change(&old, &fields(&[("mem", FieldValue::Number(513.5))])));
    }

    #[test]
    fn text_fields_compare_exactly() {
        let old = fields(&[("status", FieldValue::Text("running".into()))]);
        let new = fields(&[("status", FieldValue::Text("stopped".into()))]);
        assert!(detector().is_relevant_change(&old, &new));
    }

    #[test]
    fn type_change_is_relevant() {
        let old = fields(&[("adb_port", FieldValue::Number(16384.0))]);
        let new = fields(&[("adb_port", FieldValue::Text("N/A".into()))]);
        assert!(detector().is_relevant_change(&old, &new));
    }

    #[test]
    fn added_and_removed_fields_are_relevant() {
        let old = fields(&[("cpu", FieldValue::Number(10.0))]);
        let grown = fields(&[
            ("cpu", FieldValue::Number(10.0)),
            ("mem", FieldValue::Number(1.0)),
        ]);
        assert!(detector().is_relevant_change(&old, &grown));
        assert!(detector().is_relevant_change(&grown, &old));

        // Unless the extra field is an excluded one.
        let noisy = fields(&[
            ("cpu", FieldValue::Number(10.0)),
            ("pid", FieldValue::Number(4242.0)),
        ]);
        assert!(!detector().is_relevant_change(&old, &noisy));
    }

    // Seeded xorshift so the perturbation sweep is reproducible.
    fn xorshift(state: &mut u64) -> u64 {
        let mut x = *state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        *state = x;
        x
    }

    #[test]
    fn randomized_perturbations_respect_epsilon() {
        let det = detector();
        let eps = EngineConfig::default().default_epsilon;
        let mut seed = 0x5eed_f1ee_7u64;
        for _ in 0..500 {
            let base = (xorshift(&mut seed) % 10_000) as f64 / 100.0;
            let unit = (xorshift(&mut seed) % 1_000) as f64 / 1_000.0; // [0, 1)
            let old = fields(&[("cpu", FieldValue::Number(base))]);

            let below = fields(&[("cpu", FieldValue::Number(base + unit * eps))]);
            assert!(!det.is_relevant_change(&old, &below), "jitter {unit} * eps marked dirty");

            let above = fields(&[("cpu", FieldValue::Number(base + eps * (2.0 + unit)))]);
            assert!(det.is_relevant_change(&old, &above), "delta beyond eps not detected");
        }
    }
}

//! Authoritative key -> record index with stable row order.

#![forbid(unsafe_code)]

use std::sync::Arc;

use fleetview_core::{EntityKey, EntityRecord, FieldValue, Fields, Row, RowSnapshot};
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, warn};

use crate::diff::ChangeDetector;

/// Result of applying one full snapshot.
#[derive(Debug, Default)]
pub struct ApplyOutcome {
    /// Keys whose record changed in a render-relevant way (incl. inserts).
    pub dirty: Vec<EntityKey>,
    /// Keys removed after exhausting the grace period.
    pub removed: Vec<EntityKey>,
    /// Malformed entities skipped in this snapshot.
    pub malformed: usize,
}

impl ApplyOutcome {
    pub fn is_clean(&self) -> bool {
        self.dirty.is_empty() && self.removed.is_empty()
    }
}

/// Owns the current table state: O(1) lookup by key plus a first-seen-order
/// key sequence that fixes row positions across refreshes. Rows never move
/// on update; new keys append at the end.
pub struct EntityIndex {
    records: FxHashMap<EntityKey, EntityRecord>,
    ordered_keys: Vec<EntityKey>,
    grace_misses: u32,
    epoch: u64,
}

impl EntityIndex {
    pub fn new(grace_misses: u32) -> Self {
        Self {
            records: FxHashMap::default(),
            ordered_keys: Vec::new(),
            grace_misses: grace_misses.max(1),
            epoch: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn record(&self, key: &str) -> Option<&EntityRecord> {
        self.records.get(key)
    }

    /// Apply one full-state snapshot. Entities without a usable `key` are
    /// skipped with a warning; the snapshot as a whole always applies.
    /// Records untouched by the snapshot for `grace_misses` consecutive
    /// applications are removed.
    pub fn apply(&mut self, entities: &[serde_json::Value], detector: &ChangeDetector) -> ApplyOutcome {
        let mut out = ApplyOutcome::default();
        let mut seen: FxHashSet<EntityKey> = FxHashSet::default();

        for (pos, raw) in entities.iter().enumerate() {
            let Some((key, fields)) = shape_entity(raw) else {
                warn!(pos, "snapshot entity missing key; skipped");
                out.malformed += 1;
                continue;
            };
            seen.insert(key.clone());
            match self.records.get_mut(&key) {
                None => {
                    self.records.insert(
                        key.clone(),
                        EntityRecord { key: key.clone(), fields, revision: 1, misses: 0 },
                    );
                    self.ordered_keys.push(key.clone());
                    out.dirty.push(key);
                }
                Some(rec) => {
                    rec.misses = 0;
                    if detector.is_relevant_change(&rec.fields, &fields) {
                        rec.fields = fields;
                        rec.revision += 1;
                        out.dirty.push(key);
                    }
                    // Irrelevant delta: no mutation, no revision bump.
                }
            }
        }

        // Grace-period removal for keys the snapshot omitted.
        for key in self.ordered_keys.iter() {
            if seen.contains(key) {
                continue;
            }
            if let Some(rec) = self.records.get_mut(key) {
                rec.misses += 1;
                if rec.misses >= self.grace_misses {
                    out.removed.push(key.clone());
                }
            }
        }
        if !out.removed.is_empty() {
            for key in out.removed.iter() {
                self.records.remove(key);
            }
            // Removals are rare; an O(n) compaction keeps order stable.
            self.ordered_keys.retain(|k| self.records.contains_key(k));
            debug!(removed = out.removed.len(), "grace period expired");
        }

        if out.malformed > 0 {
            metrics::counter!("ingest_malformed_total", out.malformed as u64);
        }
        metrics::gauge!("index_rows", self.records.len() as f64);
        out
    }

    /// Bump the epoch and return an immutable ordered view of all rows.
    pub fn materialize(&mut self) -> Arc<RowSnapshot> {
        self.epoch = self.epoch.saturating_add(1);
        let rows = self
            .ordered_keys
            .iter()
            .filter_map(|k| self.records.get(k))
            .map(|r| Row { key: r.key.clone(), fields: r.fields.clone(), revision: r.revision })
            .collect();
        Arc::new(RowSnapshot { epoch: self.epoch, rows })
    }
}

/// Shape one raw snapshot entity into `(key, fields)`. Returns None when the
/// `key` field is absent, non-string or empty. Non-scalar attribute values
/// are dropped; everything else keeps its name.
fn shape_entity(raw: &serde_json::Value) -> Option<(EntityKey, Fields)> {
    let obj = raw.as_object()?;
    let key = obj.get("key")?.as_str()?;
    if key.is_empty() {
        return None;
    }
    let mut fields = Fields::new();
    for (name, value) in obj.iter() {
        if name == "key" {
            continue;
        }
        if let Some(v) = FieldValue::from_json(value) {
            fields.push((name.clone(), v));
        }
    }
    Some((key.to_string(), fields))
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetview_core::field;

    #[test]
    fn shape_rejects_missing_or_empty_key() {
        assert!(shape_entity(&serde_json::json!({"name": "a"})).is_none());
        assert!(shape_entity(&serde_json::json!({"key": ""})).is_none());
        assert!(shape_entity(&serde_json::json!({"key": 7})).is_none());
        assert!(shape_entity(&serde_json::json!("not-an-object")).is_none());
    }

    #[test]
    fn shape_drops_non_scalar_fields() {
        let (key, fields) = shape_entity(&serde_json::json!({
            "key": "a",
            "cpu": 10.5,
            "tags": ["x"],
            "meta": {"nested": true},
            "status": "running",
        }))
        .expect("valid entity");
        assert_eq!(key, "a");
        assert_eq!(field(&fields, "cpu").and_then(|v| v.as_number()), Some(10.5));
        assert_eq!(field(&fields, "status").and_then(|v| v.as_text()), Some("running"));
        assert!(field(&fields, "tags").is_none());
        assert!(field(&fields, "meta").is_none());
    }
}

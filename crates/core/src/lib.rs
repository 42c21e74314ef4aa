//! Fleetview core types and errors.

#![forbid(unsafe_code)]

use std::sync::Arc;

use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

pub mod config;

pub use config::EngineConfig;

/// Stable unique identifier of one managed instance.
pub type EntityKey = String;

/// A single field value on a row. Numbers are normalized to f64 so the same
/// epsilon comparison applies to integers and floats alike.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Bool(bool),
    Number(f64),
    Text(String),
}

impl FieldValue {
    /// Shape a raw JSON scalar into a field value. Null, arrays and objects
    /// have no tabular representation and are dropped at the boundary.
    pub fn from_json(v: &serde_json::Value) -> Option<FieldValue> {
        match v {
            serde_json::Value::Bool(b) => Some(FieldValue::Bool(*b)),
            serde_json::Value::Number(n) => n.as_f64().map(FieldValue::Number),
            serde_json::Value::String(s) => Some(FieldValue::Text(s.clone())),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            FieldValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }
}

/// Ordered named attributes of one entity. Rows carry a handful of columns,
/// so a linear scan beats a map here.
pub type Fields = SmallVec<[(String, FieldValue); 8]>;

/// Look up a field by name.
pub fn field<'a>(fields: &'a Fields, name: &str) -> Option<&'a FieldValue> {
    fields.iter().find(|(n, _)| n == name).map(|(_, v)| v)
}

/// One managed instance as held by the index. `revision` bumps on every
/// applied write; `misses` counts consecutive snapshot rounds the key was
/// absent from (grace-period removal).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityRecord {
    pub key: EntityKey,
    pub fields: Fields,
    pub revision: u64,
    pub misses: u32,
}

/// Immutable materialized row handed to renderers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Row {
    pub key: EntityKey,
    pub fields: Fields,
    pub revision: u64,
}

/// Immutable ordered view of the whole table at one epoch.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RowSnapshot {
    pub epoch: u64,
    pub rows: Vec<Row>,
}

/// Aggregate counts over a snapshot, as shown in the dashboard header.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct FleetStats {
    pub total: usize,
    pub running: usize,
    pub stopped: usize,
}

impl FleetStats {
    pub fn of(snap: &RowSnapshot) -> Self {
        let total = snap.rows.len();
        let running = snap
            .rows
            .iter()
            .filter(|r| field(&r.fields, "status").and_then(|v| v.as_text()) == Some("running"))
            .count();
        Self { total, running, stopped: total - running }
    }
}

/// Errors surfaced by the engine.
#[derive(Debug, thiserror::Error)]
pub enum FleetError {
    /// A single malformed entity in a snapshot; the rest of the snapshot is
    /// still applied.
    #[error("ingestion: {0}")]
    Ingestion(String),
    /// One failed render callback; the affected keys are requeued.
    #[error("dispatch: {0}")]
    Dispatch(String),
    /// Too many consecutive dispatch failures; flushing is halted until the
    /// engine is explicitly reset.
    #[error("dispatch halted after {failures} consecutive failures")]
    DispatchHalted { failures: u32 },
}

pub type FleetResult<T> = Result<T, FleetError>;

/// The render sink. Implementations own the actual widget; they are expected
/// to hand the payload off to their UI thread rather than render inline.
pub trait RenderDispatcher: Send + Sync {
    /// One coalesced flush: the full current row list plus the keys that
    /// changed since the last delivered flush. Keys in `changed` that are
    /// absent from `rows` were removed and should be dropped by the sink.
    fn on_flush(&self, rows: Arc<RowSnapshot>, changed: &FxHashSet<EntityKey>) -> FleetResult<()>;

    /// Result of a debounced filter recomputation.
    fn on_filtered(&self, rows: Vec<Row>) -> FleetResult<()>;
}

pub mod prelude {
    pub use super::{
        field, EngineConfig, EntityKey, EntityRecord, FieldValue, Fields, FleetError, FleetResult,
        FleetStats, RenderDispatcher, Row, RowSnapshot,
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use smallvec::smallvec;

    fn row(key: &str, status: &str) -> Row {
        Row {
            key: key.to_string(),
            fields: smallvec![("status".to_string(), FieldValue::Text(status.to_string()))],
            revision: 1,
        }
    }

    #[test]
    fn from_json_shapes_scalars_only() {
        assert_eq!(
            FieldValue::from_json(&serde_json::json!("x")),
            Some(FieldValue::Text("x".into()))
        );
        assert_eq!(FieldValue::from_json(&serde_json::json!(3)), Some(FieldValue::Number(3.0)));
        assert_eq!(FieldValue::from_json(&serde_json::json!(true)), Some(FieldValue::Bool(true)));
        assert_eq!(FieldValue::from_json(&serde_json::Value::Null), None);
        assert_eq!(FieldValue::from_json(&serde_json::json!([1, 2])), None);
    }

    #[test]
    fn field_lookup_is_by_name() {
        let fields: Fields = smallvec![
            ("cpu".to_string(), FieldValue::Number(10.0)),
            ("name".to_string(), FieldValue::Text("a".into())),
        ];
        assert_eq!(field(&fields, "cpu").and_then(|v| v.as_number()), Some(10.0));
        assert_eq!(field(&fields, "name").and_then(|v| v.as_text()), Some("a"));
        assert!(field(&fields, "missing").is_none());
    }

    #[test]
    fn fleet_stats_counts_running() {
        let snap = RowSnapshot {
            epoch: 1,
            rows: vec![row("a", "running"), row("b", "stopped"), row("c", "starting")],
        };
        let stats = FleetStats::of(&snap);
        assert_eq!(stats.total, 3);
        assert_eq!(stats.running, 1);
        assert_eq!(stats.stopped, 2);
    }
}

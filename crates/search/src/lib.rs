//! Fleetview search: debounced, non-blocking filter over materialized rows.
//! Runs beside ingestion without coordination; both sides only ever touch
//! immutable `RowSnapshot` values.

#![forbid(unsafe_code)]

use std::sync::Arc;

use fleetview_core::{EngineConfig, FieldValue, RenderDispatcher, Row, RowSnapshot};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Fields consulted by the filter besides the row key.
const SEARCHABLE_FIELDS: [&str; 2] = ["name", "status"];

/// Case-insensitive substring filter over key, name and status. An empty (or
/// control-character-only) query short-circuits to the full row list without
/// scanning, so search can never make things worse than no search.
pub fn compute_filtered_rows(query: &str, snap: &RowSnapshot) -> Vec<Row> {
    let needle = sanitize(query);
    if needle.is_empty() {
        return snap.rows.clone();
    }
    snap.rows.iter().filter(|row| row_matches(row, &needle)).cloned().collect()
}

// Control characters in a query are input noise, not match criteria.
fn sanitize(query: &str) -> String {
    query.chars().filter(|c| !c.is_control()).collect::<String>().trim().to_lowercase()
}

fn row_matches(row: &Row, needle: &str) -> bool {
    if row.key.to_lowercase().contains(needle) {
        return true;
    }
    row.fields.iter().any(|(name, value)| {
        SEARCHABLE_FIELDS.contains(&name.as_str())
            && matches!(value, FieldValue::Text(s) if s.to_lowercase().contains(needle))
    })
}

/// Producer-side handle for query keystrokes. Every call supersedes the
/// previous pending query (last-write-wins).
#[derive(Clone)]
pub struct QuerySender {
    tx: mpsc::Sender<String>,
}

impl QuerySender {
    pub fn query(&self, text: impl Into<String>) {
        if self.tx.try_send(text.into()).is_err() {
            debug!("debouncer stopped or busy; keystroke dropped");
        }
    }
}

/// Spawn the debouncer task. `snapshot` yields the latest materialized rows
/// at recomputation time (typically `EngineHandle::current`). At most one
/// recomputation is armed at a time; a new keystroke resets the quiet-period
/// timer instead of queueing a second run.
pub fn spawn_debouncer<S>(
    cfg: &EngineConfig,
    snapshot: S,
    dispatcher: Arc<dyn RenderDispatcher>,
) -> QuerySender
where
    S: Fn() -> Arc<RowSnapshot> + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<String>(64);
    let debounce = cfg.debounce;
    tokio::spawn(async move {
        let mut pending: Option<String> = None;
        let mut deadline = Instant::now();
        loop {
            let timer = tokio::time::sleep_until(deadline);
            tokio::select! {
                maybe = rx.recv() => match maybe {
                    Some(q) => {
                        pending = Some(q);
                        deadline = Instant::now() + debounce;
                    }
                    None => {
                        debug!("query channel closed; stopping debouncer");
                        break;
                    }
                },
                _ = timer, if pending.is_some() => {
                    let Some(query) = pending.take() else { continue };
                    let started = std::time::Instant::now();
                    let rows = compute_filtered_rows(&query, &snapshot());
                    metrics::histogram!("filter_eval_ms", started.elapsed().as_secs_f64() * 1_000.0);
                    metrics::counter!("filter_recomputes_total", 1u64);
                    // Search must never crash ingestion: a failed filtered
                    // dispatch is logged and forgotten.
                    if let Err(e) = dispatcher.on_filtered(rows) {
                        warn!(error = %e, "filtered dispatch failed");
                    }
                }
            }
        }
    });
    QuerySender { tx }
}

//! Fleetview store: entity index, change detection and the batched flush
//! engine. A single writer task owns all mutation; readers only ever see
//! immutable `RowSnapshot` values published through an `ArcSwap`.

#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use fleetview_core::{EngineConfig, EntityKey, RenderDispatcher, RowSnapshot};
use rustc_hash::FxHashSet;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

pub mod diff;
pub mod index;

pub use diff::ChangeDetector;
pub use index::{ApplyOutcome, EntityIndex};

/// Published on the status channel whenever the flush path changes state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineStatus {
    Running,
    /// Fatal dispatch error: flushing is stopped until `reset()`.
    Halted { failures: u32 },
}

#[derive(Debug, Clone, Default)]
struct Batch {
    seq: u64,
    entities: Arc<Vec<serde_json::Value>>,
}

#[derive(Debug)]
enum Control {
    Reset,
    Shutdown,
}

/// Producer-side handle. Submission is conflating: the mailbox holds only
/// the newest snapshot, so a writer falling behind skips stale intermediate
/// states instead of queueing them (snapshots are idempotent full-state
/// replacements).
#[derive(Clone)]
pub struct SnapshotSender {
    seq: Arc<AtomicU64>,
    tx: Arc<watch::Sender<Batch>>,
    ctrl: mpsc::Sender<Control>,
}

impl SnapshotSender {
    /// Submit a full snapshot. Never fails toward the producer; after
    /// shutdown the snapshot is dropped with a debug log.
    pub fn submit(&self, entities: Vec<serde_json::Value>) {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
        if self.tx.send(Batch { seq, entities: Arc::new(entities) }).is_err() {
            debug!(seq, "engine stopped; snapshot dropped");
        }
    }

    /// Clear a dispatch halt and resume flushing.
    pub fn reset(&self) {
        if self.ctrl.try_send(Control::Reset).is_err() {
            debug!("engine stopped; reset ignored");
        }
    }

    /// Stop the engine. Pending dirty keys are discarded without a final
    /// dispatch.
    pub fn shutdown(&self) {
        if self.ctrl.try_send(Control::Shutdown).is_err() {
            debug!("engine already stopped");
        }
    }
}

/// Reader-side handle: last flushed snapshot plus epoch/status signals.
#[derive(Clone)]
pub struct EngineHandle {
    snap: Arc<ArcSwap<RowSnapshot>>,
    epoch_rx: watch::Receiver<u64>,
    status_rx: watch::Receiver<EngineStatus>,
}

impl EngineHandle {
    pub fn current(&self) -> Arc<RowSnapshot> {
        self.snap.load_full()
    }

    pub fn subscribe_epoch(&self) -> watch::Receiver<u64> {
        self.epoch_rx.clone()
    }

    pub fn status(&self) -> EngineStatus {
        *self.status_rx.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<EngineStatus> {
        self.status_rx.clone()
    }
}

/// Spawn the writer task owning index, dirty set and flush timing. Returns
/// the producer handle and the reader handle.
pub fn spawn_engine(
    cfg: EngineConfig,
    dispatcher: Arc<dyn RenderDispatcher>,
) -> (SnapshotSender, EngineHandle) {
    let (snap_tx, snap_rx) = watch::channel(Batch::default());
    let (ctrl_tx, ctrl_rx) = mpsc::channel::<Control>(8);
    let (epoch_tx, epoch_rx) = watch::channel(0u64);
    let (status_tx, status_rx) = watch::channel(EngineStatus::Running);
    let snap = Arc::new(ArcSwap::from_pointee(RowSnapshot::default()));

    let handle = EngineHandle { snap: Arc::clone(&snap), epoch_rx, status_rx };
    let sender = SnapshotSender {
        seq: Arc::new(AtomicU64::new(0)),
        tx: Arc::new(snap_tx),
        ctrl: ctrl_tx,
    };

    tokio::spawn(run_engine(cfg, dispatcher, snap_rx, ctrl_rx, snap, epoch_tx, status_tx));
    (sender, handle)
}

async fn run_engine(
    cfg: EngineConfig,
    dispatcher: Arc<dyn RenderDispatcher>,
    mut snap_rx: watch::Receiver<Batch>,
    mut ctrl_rx: mpsc::Receiver<Control>,
    snap: Arc<ArcSwap<RowSnapshot>>,
    epoch_tx: watch::Sender<u64>,
    status_tx: watch::Sender<EngineStatus>,
) {
    let detector = ChangeDetector::from_config(&cfg);
    let mut index = EntityIndex::new(cfg.grace_misses);
    let mut dirty: FxHashSet<EntityKey> = FxHashSet::default();
    // Flush timing: armed from the first mark of a cycle, extended by later
    // marks only up to the idle threshold.
    let mut first_mark: Option<Instant> = None;
    let mut last_mark = Instant::now();
    let mut failures = 0u32;
    let mut halted = false;
    let mut last_seq = 0u64;

    loop {
        let deadline = first_mark
            .map(|first| std::cmp::min(first + cfg.batch_interval, last_mark + cfg.idle_threshold));
        let flush_armed = deadline.is_some() && !halted;
        let timer = tokio::time::sleep_until(
            deadline.unwrap_or_else(|| Instant::now() + cfg.batch_interval),
        );

        tokio::select! {
            changed = snap_rx.changed() => match changed {
                Ok(()) => {
                    let batch = snap_rx.borrow_and_update().clone();
                    if batch.seq > last_seq + 1 {
                        metrics::counter!("snapshots_conflated_total", batch.seq - last_seq - 1);
                    }
                    last_seq = batch.seq;
                    let outcome = index.apply(&batch.entities, &detector);
                    metrics::counter!("ingest_snapshots_total", 1u64);
                    if !outcome.is_clean() {
                        let now = Instant::now();
                        if dirty.is_empty() {
                            first_mark = Some(now);
                        }
                        last_mark = now;
                        dirty.extend(outcome.dirty);
                        dirty.extend(outcome.removed);
                    }
                    metrics::gauge!("dirty_keys", dirty.len() as f64);
                }
                Err(_) => {
                    debug!("snapshot mailbox closed; stopping engine");
                    break;
                }
            },
            ctrl = ctrl_rx.recv() => match ctrl {
                Some(Control::Reset) => {
                    if halted {
                        info!(failures, "dispatch halt cleared; resuming flushes");
                    }
                    halted = false;
                    failures = 0;
                    let _ = status_tx.send(EngineStatus::Running);
                }
                Some(Control::Shutdown) | None => {
                    debug!(pending = dirty.len(), "shutdown; discarding pending flush");
                    break;
                }
            },
            _ = timer, if flush_armed => {
                let changed = std::mem::take(&mut dirty);
                first_mark = None;
                let rows = index.materialize();
                snap.store(Arc::clone(&rows));
                metrics::histogram!("flush_batch_size", changed.len() as f64);
                match dispatcher.on_flush(Arc::clone(&rows), &changed) {
                    Ok(()) => {
                        failures = 0;
                        metrics::counter!("engine_flushes_total", 1u64);
                        let _ = epoch_tx.send(rows.epoch);
                    }
                    Err(e) => {
                        failures += 1;
                        metrics::counter!("dispatch_failures_total", 1u64);
                        warn!(error = %e, failures, "dispatch failed; requeueing dirty keys");
                        // Eventual delivery: the sink receives full row values,
                        // so a duplicate render is idempotent.
                        dirty.extend(changed);
                        let now = Instant::now();
                        first_mark = Some(now);
                        last_mark = now;
                        if failures >= cfg.max_dispatch_failures {
                            halted = true;
                            error!(failures, "dispatch halted; reset() to resume");
                            let _ = status_tx.send(EngineStatus::Halted { failures });
                        }
                    }
                }
            }
        }
    }
    info!("engine loop stopped");
}

//! Controller loop: serializes incremental reconciles and full syncs, batches their
//! output, and hands batches to the applier.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::{ArcSwap, ArcSwapOption};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use weft_core::{FabricKind, FabricObject, Operations, OwnerKey};

use crate::adapter::{DesiredSource, FabricApplier, InventorySource};
use crate::coalesce::Coalescer;
use crate::engine::{Engine, SyncReport};
use crate::index::IndexStats;
use crate::sync::observe_inventory;

const MAX_RETRY_BACKOFF: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerConfig {
    /// Period between level-triggered full syncs. The first one runs at startup.
    pub sync_interval: Duration,
    /// How often coalesced incremental output is handed to the applier.
    pub flush_interval: Duration,
    pub queue_cap: usize,
    /// Delay before the full sync scheduled after an apply failure.
    pub retry_backoff: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            sync_interval: Duration::from_secs(300),
            flush_interval: Duration::from_millis(50),
            queue_cap: 1024,
            retry_backoff: Duration::from_secs(5),
        }
    }
}

impl ControllerConfig {
    /// Defaults overridden by `WEFT_SYNC_INTERVAL_SECS`, `WEFT_FLUSH_MS`,
    /// `WEFT_QUEUE_CAP` and `WEFT_RETRY_BACKOFF_SECS`. Unparsable values are ignored.
    pub fn from_env() -> Self {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let env_u64 = |name: &str| get(name).and_then(|s| s.trim().parse::<u64>().ok());
        let d = Self::default();
        Self {
            sync_interval: env_u64("WEFT_SYNC_INTERVAL_SECS").filter(|s| *s > 0).map(Duration::from_secs).unwrap_or(d.sync_interval),
            flush_interval: env_u64("WEFT_FLUSH_MS").filter(|s| *s > 0).map(Duration::from_millis).unwrap_or(d.flush_interval),
            queue_cap: env_u64("WEFT_QUEUE_CAP").map(|n| n.max(1) as usize).unwrap_or(d.queue_cap),
            retry_backoff: env_u64("WEFT_RETRY_BACKOFF_SECS").map(Duration::from_secs).unwrap_or(d.retry_backoff),
        }
    }
}

/// Operations on their way to the applier. The controller waits for in-flight
/// batches to be applied before it observes the fabric again.
#[derive(Debug)]
pub struct Batch {
    pub ops: Operations,
    done: Option<oneshot::Sender<()>>,
}

impl Batch {
    fn tracked(ops: Operations) -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (Self { ops, done: Some(tx) }, rx)
    }

    /// Mark the batch as applied, successfully or not.
    pub fn finish(self) {
        if let Some(done) = self.done {
            let _ = done.send(());
        }
    }
}

#[derive(Debug, Clone)]
pub enum Command {
    /// Edge-triggered: new desired state for one owner key.
    Reconcile { kind: FabricKind, owner: OwnerKey, desired: Vec<FabricObject> },
    /// Level-triggered: resync everything against the observed fabric.
    FullSync,
}

/// Read side of a running controller.
#[derive(Clone)]
pub struct ControllerHandle {
    stats: Arc<ArcSwap<IndexStats>>,
    last_sync: Arc<ArcSwapOption<SyncReport>>,
    epoch_rx: watch::Receiver<u64>,
}

impl ControllerHandle {
    pub fn stats(&self) -> IndexStats { **self.stats.load() }
    pub fn last_sync(&self) -> Option<Arc<SyncReport>> { self.last_sync.load_full() }
    pub fn subscribe_epoch(&self) -> watch::Receiver<u64> { self.epoch_rx.clone() }
}

struct Loop {
    engine: Arc<Engine>,
    source: Arc<dyn InventorySource>,
    desired: Option<Arc<dyn DesiredSource>>,
    ops_tx: mpsc::Sender<Batch>,
    inflight: Vec<oneshot::Receiver<()>>,
    coalescer: Coalescer,
    stats: Arc<ArcSwap<IndexStats>>,
    last_sync: Arc<ArcSwapOption<SyncReport>>,
    epoch_tx: watch::Sender<u64>,
}

impl Loop {
    fn publish(&self) {
        let s = self.engine.stats();
        self.stats.store(Arc::new(s));
        let _ = self.epoch_tx.send(s.epoch);
    }

    async fn send(&mut self, ops: Operations) -> bool {
        let (batch, done) = Batch::tracked(ops);
        if self.ops_tx.send(batch).await.is_err() {
            return false;
        }
        self.inflight.retain_mut(|rx| matches!(rx.try_recv(), Err(oneshot::error::TryRecvError::Empty)));
        self.inflight.push(done);
        true
    }

    /// Wait until every batch sent so far has been through the applier.
    async fn settle(&mut self) {
        for done in self.inflight.drain(..) {
            let _ = done.await;
        }
    }

    async fn flush(&mut self) {
        let ops = self.coalescer.drain_ready();
        if ops.is_empty() { return; }
        debug!(ops = ops.len(), "flushing incremental batch");
        if !self.send(ops).await {
            warn!("applier channel closed; dropping batch");
        }
    }

    async fn full_sync(&mut self) {
        self.flush().await;
        self.settle().await;
        let observed = observe_inventory(self.source.as_ref()).await;
        let engine = Arc::clone(&self.engine);
        let desired = self.desired.clone();
        // desired sources may block on I/O
        let joined = tokio::task::spawn_blocking(move || match desired.as_deref() {
            Some(src) => engine.full_sync_with(&observed, src),
            None => engine.full_sync(&observed),
        })
        .await;
        let report = match joined {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "full sync task failed");
                return;
            }
        };
        if !report.ops.is_empty() && !self.send(report.ops.clone()).await {
            warn!("applier channel closed; dropping full sync output");
        }
        self.last_sync.store(Some(Arc::new(report)));
        self.publish();
    }
}

/// Spawn the controller loop. Returns the command sender and a read handle.
///
/// Dropping every command sender flushes pending output and stops the loop,
/// which in turn closes `ops_tx`.
pub fn spawn_controller(
    engine: Arc<Engine>,
    source: Arc<dyn InventorySource>,
    desired: Option<Arc<dyn DesiredSource>>,
    ops_tx: mpsc::Sender<Batch>,
    cfg: ControllerConfig,
) -> (mpsc::Sender<Command>, ControllerHandle) {
    let (tx, mut rx) = mpsc::channel::<Command>(cfg.queue_cap);
    let stats = Arc::new(ArcSwap::from_pointee(engine.stats()));
    let last_sync = Arc::new(ArcSwapOption::empty());
    let (epoch_tx, epoch_rx) = watch::channel(0u64);
    let handle = ControllerHandle { stats: Arc::clone(&stats), last_sync: Arc::clone(&last_sync), epoch_rx };

    let mut lp = Loop {
        engine,
        source,
        desired,
        ops_tx,
        inflight: Vec::new(),
        coalescer: Coalescer::new(),
        stats,
        last_sync,
        epoch_tx,
    };
    tokio::spawn(async move {
        let mut flush = tokio::time::interval(cfg.flush_interval);
        let mut resync = tokio::time::interval(cfg.sync_interval);
        flush.set_missed_tick_behavior(MissedTickBehavior::Delay);
        resync.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                maybe = rx.recv() => {
                    match maybe {
                        Some(Command::Reconcile { kind, owner, desired }) => {
                            let ops = lp.engine.reconcile_key(kind, &owner, desired);
                            lp.coalescer.push(ops);
                            lp.publish();
                        }
                        Some(Command::FullSync) => lp.full_sync().await,
                        None => {
                            debug!("command channel closed; draining and exiting controller loop");
                            lp.flush().await;
                            break;
                        }
                    }
                }
                _ = flush.tick() => lp.flush().await,
                _ = resync.tick() => lp.full_sync().await,
            }
        }
        info!("controller loop stopped");
    });

    (tx, handle)
}

/// Delay before the repair full sync after `failures_in_row` consecutive failed
/// batches: doubling from `base`, capped at five minutes.
fn retry_delay(base: Duration, failures_in_row: u32) -> Duration {
    let shift = failures_in_row.saturating_sub(1).min(16);
    base.saturating_mul(1u32 << shift).min(MAX_RETRY_BACKOFF.max(base))
}

/// Spawn the task applying batches. Failed items schedule one repair full sync,
/// backing off while batches keep failing.
pub fn spawn_applier(
    applier: Arc<dyn FabricApplier>,
    mut ops_rx: mpsc::Receiver<Batch>,
    cmd_tx: &mpsc::Sender<Command>,
    retry_backoff: Duration,
) -> JoinHandle<()> {
    // Weak so the applier never keeps the controller loop alive.
    let cmd_tx = cmd_tx.downgrade();
    let retry_pending = Arc::new(AtomicBool::new(false));
    tokio::spawn(async move {
        let mut failures_in_row = 0u32;
        while let Some(batch) = ops_rx.recv().await {
            let report = applier.apply(&batch.ops).await;
            batch.finish();
            metrics::counter!("weft_apply_ok_total", report.applied as u64);
            if report.is_clean() {
                failures_in_row = 0;
                debug!(applied = report.applied, "batch applied");
                continue;
            }
            failures_in_row = failures_in_row.saturating_add(1);
            metrics::counter!("weft_apply_err_total", report.failures.len() as u64);
            for f in report.failures.iter() {
                warn!(error = %f, "apply failed");
            }
            if retry_pending.swap(true, Ordering::SeqCst) {
                debug!("repair full sync already scheduled");
                continue;
            }
            let Some(tx) = cmd_tx.upgrade() else {
                retry_pending.store(false, Ordering::SeqCst);
                continue;
            };
            let delay = retry_delay(retry_backoff, failures_in_row);
            debug!(delay = ?delay, failures_in_row, "scheduling repair full sync");
            let pending = Arc::clone(&retry_pending);
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                pending.store(false, Ordering::SeqCst);
                let _ = tx.send(Command::FullSync).await;
            });
        }
        info!("applier stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: Vec<(String, String)> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |k: &str| vars.iter().find(|(name, _)| name == k).map(|(_, v)| v.clone())
    }

    #[test]
    fn config_defaults_when_unset() {
        assert_eq!(ControllerConfig::from_lookup(lookup(&[])), ControllerConfig::default());
    }

    #[test]
    fn config_reads_set_values() {
        let cfg = ControllerConfig::from_lookup(lookup(&[
            ("WEFT_SYNC_INTERVAL_SECS", "60"),
            ("WEFT_FLUSH_MS", "10"),
            ("WEFT_QUEUE_CAP", "8"),
            ("WEFT_RETRY_BACKOFF_SECS", "2"),
        ]));
        assert_eq!(cfg.sync_interval, Duration::from_secs(60));
        assert_eq!(cfg.flush_interval, Duration::from_millis(10));
        assert_eq!(cfg.queue_cap, 8);
        assert_eq!(cfg.retry_backoff, Duration::from_secs(2));
    }

    #[test]
    fn config_falls_back_on_unparsable_or_zero() {
        let d = ControllerConfig::default();
        let cfg = ControllerConfig::from_lookup(lookup(&[
            ("WEFT_SYNC_INTERVAL_SECS", "0"),
            ("WEFT_FLUSH_MS", "soon"),
            ("WEFT_QUEUE_CAP", "0"),
            ("WEFT_RETRY_BACKOFF_SECS", "-1"),
        ]));
        assert_eq!(cfg.sync_interval, d.sync_interval);
        assert_eq!(cfg.flush_interval, d.flush_interval);
        assert_eq!(cfg.queue_cap, 1);
        assert_eq!(cfg.retry_backoff, d.retry_backoff);
    }

    #[test]
    fn retry_delay_doubles_and_caps() {
        let base = Duration::from_secs(5);
        assert_eq!(retry_delay(base, 1), Duration::from_secs(5));
        assert_eq!(retry_delay(base, 2), Duration::from_secs(10));
        assert_eq!(retry_delay(base, 4), Duration::from_secs(40));
        assert_eq!(retry_delay(base, 10), MAX_RETRY_BACKOFF);
        assert_eq!(retry_delay(base, u32::MAX), MAX_RETRY_BACKOFF);
        assert_eq!(retry_delay(Duration::from_secs(600), 3), Duration::from_secs(600));
    }

    #[tokio::test]
    async fn finishing_a_batch_acks_the_sender() {
        let (batch, done) = Batch::tracked(Operations::default());
        batch.finish();
        assert!(done.await.is_ok());
    }
}

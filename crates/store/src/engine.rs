//! Reconcile engine: per-key diffs and global full sync over one locked index.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use metrics::{counter, gauge, histogram};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use weft_core::{FabricError, FabricKind, FabricObject, Operations};

use crate::adapter::DesiredSource;
use crate::diff::diff_bucket;
use crate::index::{BucketKey, Index, IndexStats};
use crate::sync::ObservedInventory;

/// A key full sync could not converge this pass. Its bucket was left as it was.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyFailure {
    pub key: BucketKey,
    pub error: FabricError,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncReport {
    pub ops: Operations,
    pub keys_synced: usize,
    /// Observed objects without an owner label; not managed here.
    pub unowned: usize,
    pub failures: Vec<KeyFailure>,
    pub epoch: u64,
    pub finished_at_ms: i64,
}

#[derive(Debug, Default)]
struct State {
    index: Index,
    epoch: u64,
}

/// Owns the per-key index. Every read-modify-write of the index happens under one lock.
#[derive(Debug, Default)]
pub struct Engine {
    state: Mutex<State>,
}

impl Engine {
    pub fn new() -> Self { Self::default() }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Move the bucket for `(kind, owner)` to `desired`, returning the operations that takes.
    /// An unknown key starts from an empty bucket.
    pub fn reconcile_key(&self, kind: FabricKind, owner: &str, desired: Vec<FabricObject>) -> Operations {
        let key = BucketKey::new(kind, owner);
        let mut ops = Operations::default();
        {
            let mut st = self.lock();
            let mut bucket = st.index.take(&key);
            diff_bucket(&mut bucket, desired, &mut ops);
            st.index.put(key, bucket);
            st.epoch = st.epoch.saturating_add(1);
            gauge!("weft_index_objects", st.index.object_count() as f64);
        }
        record_ops(&ops);
        debug!(kind = %kind, owner = %owner, adds = ops.adds.len(), updates = ops.updates.len(), deletes = ops.deletes.len(), "reconciled key");
        ops
    }

    /// Full sync using the engine's remembered intent as the desired state.
    pub fn full_sync(&self, observed: &ObservedInventory) -> SyncReport {
        self.run_full_sync(observed, None)
    }

    /// Full sync recomputing desired state from `source` for every tracked key.
    pub fn full_sync_with(&self, observed: &ObservedInventory, source: &dyn DesiredSource) -> SyncReport {
        self.run_full_sync(observed, Some(source))
    }

    /// Query the desired source for every key it or the index knows about.
    /// Runs without the lock held; sources may do I/O.
    fn collect_desired(
        &self,
        src: &dyn DesiredSource,
        seeded: impl Iterator<Item = BucketKey>,
    ) -> BTreeMap<BucketKey, Result<Vec<FabricObject>, FabricError>> {
        let mut keys: BTreeSet<BucketKey> = self.lock().index.keys().cloned().collect();
        keys.extend(seeded);
        keys.extend(src.keys());
        keys.into_iter()
            .map(|key| {
                let desired = src.desired(&key).map_err(|e| FabricError::Desired {
                    kind: key.kind,
                    owner: key.owner.clone(),
                    reason: format!("{:#}", e),
                });
                (key, desired)
            })
            .collect()
    }

    fn run_full_sync(&self, observed: &ObservedInventory, source: Option<&dyn DesiredSource>) -> SyncReport {
        let started = Instant::now();
        let (mut seeds, unowned) = observed.buckets();
        let mut sourced = source.map(|src| self.collect_desired(src, seeds.keys().cloned()));
        let mut ops = Operations::default();
        let mut failures = Vec::new();

        let mut st = self.lock();
        let keys: BTreeSet<BucketKey> = match &sourced {
            Some(s) => s.keys().cloned().collect(),
            None => st.index.keys().cloned().chain(seeds.keys().cloned()).collect(),
        };

        // Results are staged and committed together so a pass never leaves the index half-updated.
        let mut staged = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(error) = observed.failure(key.kind) {
                failures.push(KeyFailure { key, error });
                continue;
            }
            let desired = match sourced.as_mut().and_then(|s| s.remove(&key)) {
                Some(Ok(d)) => d,
                Some(Err(error)) => {
                    failures.push(KeyFailure { key, error });
                    continue;
                }
                None => st.index.objects(&key),
            };
            let mut bucket = seeds.remove(&key).unwrap_or_default();
            diff_bucket(&mut bucket, desired, &mut ops);
            staged.push((key, bucket));
        }
        let keys_synced = staged.len();
        for (key, bucket) in staged {
            st.index.put(key, bucket);
        }
        st.epoch = st.epoch.saturating_add(1);
        let epoch = st.epoch;
        gauge!("weft_index_objects", st.index.object_count() as f64);
        drop(st);

        record_ops(&ops);
        histogram!("weft_full_sync_ms", started.elapsed().as_secs_f64() * 1000.0);
        if !failures.is_empty() {
            counter!("weft_full_sync_failures_total", failures.len() as u64);
            for f in failures.iter() {
                warn!(key = %f.key, error = %f.error, "full sync skipped key");
            }
        }
        info!(
            epoch,
            keys = keys_synced,
            adds = ops.adds.len(),
            updates = ops.updates.len(),
            deletes = ops.deletes.len(),
            unowned,
            failures = failures.len(),
            "full sync complete"
        );
        SyncReport { ops, keys_synced, unowned, failures, epoch, finished_at_ms: chrono::Utc::now().timestamp_millis() }
    }

    pub fn stats(&self) -> IndexStats {
        let st = self.lock();
        IndexStats { epoch: st.epoch, keys: st.index.len(), objects: st.index.object_count() }
    }

    /// Last applied objects for one key, ordered by identifier.
    pub fn objects(&self, kind: FabricKind, owner: &str) -> Vec<FabricObject> {
        self.lock().index.objects(&BucketKey::new(kind, owner))
    }
}

fn record_ops(ops: &Operations) {
    if ops.is_empty() { return; }
    counter!("weft_ops_total", ops.adds.len() as u64, "op" => "add");
    counter!("weft_ops_total", ops.updates.len() as u64, "op" => "update");
    counter!("weft_ops_total", ops.deletes.len() as u64, "op" => "delete");
}

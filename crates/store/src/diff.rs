//! Per-key diff: move one bucket to a desired set and record the operations needed.

use rustc_hash::FxHashMap;
use tracing::debug;
use weft_core::{payload::diff_summary, FabricObject, Operations};

use crate::index::Bucket;

/// Diff `desired` against `bucket`, rewriting the bucket to `desired` and appending to `ops`.
///
/// Adds and updates come out in `desired` order, deletes sorted by identifier.
/// When `desired` repeats an identifier the last occurrence wins.
pub fn diff_bucket(bucket: &mut Bucket, desired: Vec<FabricObject>, ops: &mut Operations) {
    let mut last: FxHashMap<String, usize> = FxHashMap::default();
    for (i, o) in desired.iter().enumerate() {
        last.insert(o.identifier.clone(), i);
    }

    let mut stale: Vec<String> = bucket.keys().filter(|id| !last.contains_key(*id)).cloned().collect();
    stale.sort_unstable();
    for id in stale {
        bucket.remove(&id);
        ops.deletes.push(id);
    }

    for (i, obj) in desired.into_iter().enumerate() {
        if last.get(&obj.identifier) != Some(&i) { continue; }
        match bucket.get(&obj.identifier) {
            None => ops.adds.push(obj.clone()),
            Some(prev) if prev.payload != obj.payload => {
                debug!(identifier = %obj.identifier, changes = %diff_summary(&obj.payload, &prev.payload), "payload changed");
                ops.updates.push(obj.clone());
            }
            Some(_) => {}
        }
        bucket.insert(obj.identifier.clone(), obj);
    }
}

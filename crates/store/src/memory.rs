//! In-memory fabric: a stand-in fabric store for dry runs and tests.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::{anyhow, Result};
use weft_core::{FabricError, FabricKind, FabricObject, Operations};

use crate::adapter::{ApplyReport, FabricApplier, InventorySource};

#[derive(Debug, Default)]
struct Inner {
    objects: BTreeMap<String, FabricObject>,
    failing_kinds: BTreeSet<FabricKind>,
    failing_ids: BTreeSet<String>,
}

#[derive(Debug, Default)]
pub struct MemoryFabric {
    inner: Mutex<Inner>,
}

impl MemoryFabric {
    pub fn new() -> Self { Self::default() }

    pub fn with_objects(objs: impl IntoIterator<Item = FabricObject>) -> Self {
        let me = Self::new();
        for o in objs { me.put(o); }
        me
    }

    fn lock(&self) -> MutexGuard<'_, Inner> { self.inner.lock().unwrap_or_else(PoisonError::into_inner) }

    /// Write an object directly, bypassing the engine (out-of-band change).
    pub fn put(&self, obj: FabricObject) { self.lock().objects.insert(obj.identifier.clone(), obj); }
    pub fn remove(&self, identifier: &str) -> Option<FabricObject> { self.lock().objects.remove(identifier) }
    pub fn get(&self, identifier: &str) -> Option<FabricObject> { self.lock().objects.get(identifier).cloned() }
    pub fn len(&self) -> usize { self.lock().objects.len() }
    pub fn is_empty(&self) -> bool { self.lock().objects.is_empty() }

    /// Make `observe(kind)` fail until healed.
    pub fn fail_kind(&self, kind: FabricKind, on: bool) {
        let mut g = self.lock();
        if on { g.failing_kinds.insert(kind); } else { g.failing_kinds.remove(&kind); }
    }

    /// Make applying `identifier` fail until healed.
    pub fn fail_identifier(&self, identifier: &str, on: bool) {
        let mut g = self.lock();
        if on { g.failing_ids.insert(identifier.to_string()); } else { g.failing_ids.remove(identifier); }
    }
}

#[async_trait::async_trait]
impl InventorySource for MemoryFabric {
    async fn observe(&self, kind: FabricKind) -> Result<Vec<FabricObject>> {
        let g = self.lock();
        if g.failing_kinds.contains(&kind) {
            return Err(anyhow!("fabric unavailable for {}", kind));
        }
        Ok(g.objects.values().filter(|o| o.kind == kind).cloned().collect())
    }
}

#[async_trait::async_trait]
impl FabricApplier for MemoryFabric {
    async fn apply(&self, ops: &Operations) -> ApplyReport {
        let mut g = self.lock();
        let mut report = ApplyReport::default();
        for id in ops.deletes.iter() {
            if g.failing_ids.contains(id) {
                report.failures.push(FabricError::apply(id.as_str(), "injected failure"));
                continue;
            }
            g.objects.remove(id);
            report.applied += 1;
        }
        for o in ops.adds.iter().chain(ops.updates.iter()) {
            if g.failing_ids.contains(&o.identifier) {
                report.failures.push(FabricError::apply(o.identifier.as_str(), "injected failure"));
                continue;
            }
            g.objects.insert(o.identifier.clone(), o.clone());
            report.applied += 1;
        }
        report
    }
}

//! Observed inventory: the fabric's actual contents, gathered before a full sync.

use std::collections::BTreeMap;

use rustc_hash::FxHashMap;
use tracing::{debug, warn};
use weft_core::{FabricError, FabricKind, FabricObject};

use crate::adapter::InventorySource;
use crate::index::{Bucket, BucketKey};

/// Snapshot of the fabric, per kind. Kinds that failed to list carry the error instead.
#[derive(Debug, Clone, Default)]
pub struct ObservedInventory {
    objects: BTreeMap<FabricKind, Vec<FabricObject>>,
    failed: BTreeMap<FabricKind, FabricError>,
}

impl ObservedInventory {
    pub fn new() -> Self { Self::default() }

    /// Inventory with every kind observed, built from a flat object list.
    pub fn from_objects(objs: impl IntoIterator<Item = FabricObject>) -> Self {
        let mut inv = Self::new();
        for kind in FabricKind::ALL { inv.objects.insert(kind, Vec::new()); }
        for o in objs { inv.objects.entry(o.kind).or_default().push(o); }
        inv
    }

    pub fn insert(&mut self, kind: FabricKind, objs: Vec<FabricObject>) {
        self.failed.remove(&kind);
        self.objects.insert(kind, objs);
    }

    pub fn fail(&mut self, kind: FabricKind, err: FabricError) {
        self.objects.remove(&kind);
        self.failed.insert(kind, err);
    }

    /// Why `kind` cannot be trusted this pass, if it cannot.
    pub fn failure(&self, kind: FabricKind) -> Option<FabricError> {
        if let Some(e) = self.failed.get(&kind) { return Some(e.clone()); }
        if !self.objects.contains_key(&kind) {
            return Some(FabricError::Observe { kind, reason: "kind not observed".into() });
        }
        None
    }

    pub fn object_count(&self) -> usize { self.objects.values().map(|v| v.len()).sum() }

    pub fn find(&self, identifier: &str) -> Option<&FabricObject> {
        self.objects.values().flatten().find(|o| o.identifier == identifier)
    }

    /// Group observed objects into buckets by their owner label.
    /// Returns the buckets and the number of objects without a label.
    pub(crate) fn buckets(&self) -> (FxHashMap<BucketKey, Bucket>, usize) {
        let mut out: FxHashMap<BucketKey, Bucket> = FxHashMap::default();
        let mut unowned = 0usize;
        for o in self.objects.values().flatten() {
            match &o.owner {
                Some(label) => {
                    let key = BucketKey::new(label.kind, label.owner.clone());
                    out.entry(key).or_default().insert(o.identifier.clone(), o.clone());
                }
                None => unowned += 1,
            }
        }
        (out, unowned)
    }
}

/// List every kind from `source`. A failing kind is recorded and the rest still observed.
pub async fn observe_inventory(source: &dyn InventorySource) -> ObservedInventory {
    let mut inv = ObservedInventory::new();
    for kind in FabricKind::ALL {
        match source.observe(kind).await {
            Ok(objs) => {
                debug!(kind = %kind, count = objs.len(), "observed fabric objects");
                inv.insert(kind, objs);
            }
            Err(e) => {
                warn!(kind = %kind, error = %e, "observing fabric failed");
                metrics::counter!("weft_observe_err_total", 1u64, "kind" => kind.as_str());
                inv.fail(kind, FabricError::observe(kind, e));
            }
        }
    }
    inv
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buckets_group_by_owner_label_and_count_unowned() {
        let inv = ObservedInventory::from_objects(vec![
            FabricObject::security_group("common", "a").with_owner(FabricKind::SecurityGroup, "x"),
            FabricObject::security_group("common", "b").with_owner(FabricKind::SecurityGroup, "x"),
            FabricObject::security_group("common", "c").with_owner(FabricKind::SecurityGroup, "y"),
            FabricObject::security_group("common", "manual"),
        ]);
        let (buckets, unowned) = inv.buckets();
        assert_eq!(unowned, 1);
        assert_eq!(inv.object_count(), 4);
        assert_eq!(buckets[&BucketKey::new(FabricKind::SecurityGroup, "x")].len(), 2);
        assert_eq!(buckets[&BucketKey::new(FabricKind::SecurityGroup, "y")].len(), 1);
    }

    #[test]
    fn unobserved_kinds_report_failure() {
        let mut inv = ObservedInventory::new();
        inv.insert(FabricKind::SecurityGroup, Vec::new());
        assert!(inv.failure(FabricKind::SecurityGroup).is_none());
        assert!(inv.failure(FabricKind::EndpointGroup).is_some());
        inv.fail(FabricKind::SecurityGroup, FabricError::observe(FabricKind::SecurityGroup, "timeout"));
        assert!(matches!(inv.failure(FabricKind::SecurityGroup), Some(FabricError::Observe { .. })));
    }
}

//! Per-key index: `(kind, owner key)` -> identifier -> last applied object.

use std::fmt;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use weft_core::{FabricKind, FabricObject, OwnerKey};

/// Composite index key. Kept structural so `("a-b", "c")` and `("a", "b-c")` never collide.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BucketKey {
    pub kind: FabricKind,
    pub owner: OwnerKey,
}

impl BucketKey {
    pub fn new(kind: FabricKind, owner: impl Into<OwnerKey>) -> Self { Self { kind, owner: owner.into() } }
}

impl fmt::Display for BucketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}:{}", self.kind, self.owner) }
}

pub type Bucket = FxHashMap<String, FabricObject>;

/// Counts published after every pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexStats {
    pub epoch: u64,
    pub keys: usize,
    pub objects: usize,
}

#[derive(Debug, Default)]
pub struct Index {
    buckets: FxHashMap<BucketKey, Bucket>,
}

impl Index {
    pub fn new() -> Self { Self::default() }

    pub fn get(&self, key: &BucketKey) -> Option<&Bucket> { self.buckets.get(key) }

    /// Remove and return the bucket for `key`, or an empty one if the key is unknown.
    pub fn take(&mut self, key: &BucketKey) -> Bucket { self.buckets.remove(key).unwrap_or_default() }

    /// Store `bucket` under `key`; empty buckets are dropped rather than kept as tombstones.
    pub fn put(&mut self, key: BucketKey, bucket: Bucket) {
        if bucket.is_empty() {
            self.buckets.remove(&key);
        } else {
            self.buckets.insert(key, bucket);
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = &BucketKey> { self.buckets.keys() }
    pub fn len(&self) -> usize { self.buckets.len() }
    pub fn is_empty(&self) -> bool { self.buckets.is_empty() }
    pub fn object_count(&self) -> usize { self.buckets.values().map(|b| b.len()).sum() }

    /// Objects of one bucket ordered by identifier.
    pub fn objects(&self, key: &BucketKey) -> Vec<FabricObject> {
        let mut out: Vec<FabricObject> = self.buckets.get(key).map(|b| b.values().cloned().collect()).unwrap_or_default();
        out.sort_by(|a, b| a.identifier.cmp(&b.identifier));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_buckets_are_not_stored() {
        let mut idx = Index::new();
        let key = BucketKey::new(FabricKind::SecurityGroup, "a");
        idx.put(key.clone(), Bucket::default());
        assert!(idx.is_empty());

        let sg = FabricObject::security_group("common", "web");
        let mut b = Bucket::default();
        b.insert(sg.identifier.clone(), sg);
        idx.put(key.clone(), b);
        assert_eq!(idx.len(), 1);
        assert_eq!(idx.object_count(), 1);

        let taken = idx.take(&key);
        assert_eq!(taken.len(), 1);
        assert!(idx.get(&key).is_none());
    }

    #[test]
    fn composite_keys_do_not_collide() {
        let a = BucketKey::new(FabricKind::SecurityGroup, "a-b");
        let b = BucketKey::new(FabricKind::SecurityGroup, "a");
        assert_ne!(a, b);
        assert!(BucketKey::new(FabricKind::SecurityGroup, "z") < BucketKey::new(FabricKind::EndpointGroup, "a"));
    }
}

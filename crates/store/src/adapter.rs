//! Seams to the collaborators around the engine: the fabric store and the desired-state generators.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use weft_core::{FabricError, FabricKind, FabricObject, Operations};

use crate::index::BucketKey;

/// Read side of the fabric store: the objects that actually exist right now.
#[async_trait::async_trait]
pub trait InventorySource: Send + Sync {
    /// List every object of `kind` currently present in the fabric.
    async fn observe(&self, kind: FabricKind) -> Result<Vec<FabricObject>>;
}

/// Write side of the fabric store. Each item succeeds or fails on its own.
#[async_trait::async_trait]
pub trait FabricApplier: Send + Sync {
    async fn apply(&self, ops: &Operations) -> ApplyReport;
}

/// Desired-state generators, queried by full sync.
pub trait DesiredSource: Send + Sync {
    /// Every key the generators currently produce objects for.
    fn keys(&self) -> Vec<BucketKey>;

    /// Labeled desired objects for `key`. Unknown keys yield an empty set.
    fn desired(&self, key: &BucketKey) -> Result<Vec<FabricObject>>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApplyReport {
    pub applied: usize,
    pub failures: Vec<FabricError>,
}

impl ApplyReport {
    pub fn is_clean(&self) -> bool { self.failures.is_empty() }
}

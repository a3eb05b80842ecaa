//! Weft store: the per-key index, diff engine, full sync and controller loop.

#![forbid(unsafe_code)]

pub mod adapter;
pub mod coalesce;
pub mod diff;
pub mod engine;
pub mod index;
pub mod memory;
pub mod runtime;
pub mod sync;

pub use adapter::{ApplyReport, DesiredSource, FabricApplier, InventorySource};
pub use coalesce::Coalescer;
pub use engine::{Engine, KeyFailure, SyncReport};
pub use index::{Bucket, BucketKey, Index, IndexStats};
pub use memory::MemoryFabric;
pub use runtime::{spawn_applier, spawn_controller, Batch, Command, ControllerConfig, ControllerHandle};
pub use sync::{observe_inventory, ObservedInventory};

//! Coalescing batch of pending operations keyed by identifier, drained in FIFO order.

use std::collections::VecDeque;

use rustc_hash::FxHashMap;
use weft_core::{FabricObject, Operations};

#[derive(Debug, Clone)]
enum Pending {
    Add(FabricObject),
    Update(FabricObject),
    Delete,
}

/// Later operations for an identifier supersede earlier ones:
/// add+update stays an add, delete+add becomes an update, anything+delete is a delete.
#[derive(Debug, Default)]
pub struct Coalescer {
    map: FxHashMap<String, Pending>,
    order: VecDeque<String>,
    merged: u64,
}

impl Coalescer {
    pub fn new() -> Self { Self::default() }

    pub fn len(&self) -> usize { self.map.len() }
    pub fn is_empty(&self) -> bool { self.map.is_empty() }
    /// Operations folded into an earlier pending entry.
    pub fn merged(&self) -> u64 { self.merged }

    pub fn push(&mut self, ops: Operations) {
        for id in ops.deletes { self.put(id, Pending::Delete); }
        for o in ops.adds { self.put(o.identifier.clone(), Pending::Add(o)); }
        for o in ops.updates { self.put(o.identifier.clone(), Pending::Update(o)); }
    }

    fn put(&mut self, id: String, next: Pending) {
        let merged = match (self.map.remove(&id), next) {
            (None, next) => {
                self.order.push_back(id.clone());
                self.map.insert(id, next);
                return;
            }
            (Some(Pending::Add(_)), Pending::Update(o)) => Pending::Add(o),
            (Some(Pending::Delete), Pending::Add(o)) => Pending::Update(o),
            (Some(_), next) => next,
        };
        self.merged += 1;
        self.map.insert(id, merged);
    }

    /// Drain everything pending into one batch.
    pub fn drain_ready(&mut self) -> Operations {
        let mut out = Operations::default();
        while let Some(id) = self.order.pop_front() {
            match self.map.remove(&id) {
                Some(Pending::Add(o)) => out.adds.push(o),
                Some(Pending::Update(o)) => out.updates.push(o),
                Some(Pending::Delete) => out.deletes.push(id),
                None => {}
            }
        }
        out
    }
}

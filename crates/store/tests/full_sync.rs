#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use weft_core::{FabricError, FabricKind, FabricObject};
use weft_store::{observe_inventory, BucketKey, DesiredSource, Engine, FabricApplier, MemoryFabric, ObservedInventory};

const KIND: FabricKind = FabricKind::SecurityGroup;

fn sg(name: &str) -> FabricObject { FabricObject::security_group("common", name) }

fn labeled(key: &str, objs: Vec<FabricObject>) -> Vec<FabricObject> {
    objs.into_iter().map(|o| o.with_owner(KIND, key)).collect()
}

struct Step {
    objects: Vec<FabricObject>,
    adds: Vec<&'static str>,
    updates: Vec<&'static str>,
    deletes: Vec<&'static str>,
    desc: &'static str,
}

fn steps() -> Vec<Step> {
    vec![
        Step { objects: vec![], adds: vec![], updates: vec![], deletes: vec![], desc: "empty" },
        Step { objects: vec![sg("test")], adds: vec!["test"], updates: vec![], deletes: vec![], desc: "add" },
        Step { objects: vec![sg("test").with_display_name("test")], adds: vec![], updates: vec!["test"], deletes: vec![], desc: "update" },
        Step { objects: vec![], adds: vec![], updates: vec![], deletes: vec!["test"], desc: "delete" },
        Step {
            objects: vec![sg("test1"), sg("test2"), sg("test3"), sg("test4")],
            adds: vec!["test1", "test2", "test3", "test4"],
            updates: vec![],
            deletes: vec![],
            desc: "addmultiple",
        },
        Step { objects: vec![sg("test1"), sg("test4"), sg("test3"), sg("test2")], adds: vec![], updates: vec![], deletes: vec![], desc: "nochange" },
        Step {
            objects: vec![sg("test1"), sg("test0"), sg("test2").with_display_name("test2"), sg("test3"), sg("test5")],
            adds: vec!["test0", "test5"],
            updates: vec!["test2"],
            deletes: vec!["test4"],
            desc: "mixed",
        },
    ]
}

fn ids(names: &[&str]) -> Vec<String> {
    names.iter().map(|n| sg(n).identifier).collect()
}

/// The fabric holds step `i`'s objects, the engine intends step `i + 1`'s.
/// Full sync must produce exactly what the incremental diff between them produced.
#[tokio::test]
async fn full_sync_replays_consecutive_steps() {
    let steps = steps();
    for pair in steps.windows(2) {
        let (prev, next) = (&pair[0], &pair[1]);
        let fabric = MemoryFabric::with_objects(labeled("a", prev.objects.clone()));
        let engine = Engine::new();
        engine.reconcile_key(KIND, "a", labeled("a", next.objects.clone()));

        let observed = observe_inventory(&fabric).await;
        let report = engine.full_sync(&observed);

        let adds: Vec<String> = report.ops.adds.iter().map(|o| o.identifier.clone()).collect();
        let updates: Vec<String> = report.ops.updates.iter().map(|o| o.identifier.clone()).collect();
        assert_eq!(adds, ids(&next.adds), "adds: {}", next.desc);
        assert_eq!(updates, ids(&next.updates), "updates: {}", next.desc);
        assert_eq!(report.ops.deletes, ids(&next.deletes), "deletes: {}", next.desc);
        assert!(report.failures.is_empty(), "{}", next.desc);
        for o in report.ops.adds.iter().chain(report.ops.updates.iter()) {
            assert_eq!(o.owner.as_ref().map(|l| l.owner.as_str()), Some("a"), "{}", next.desc);
        }
    }
}

#[tokio::test]
async fn full_sync_is_idempotent_once_applied() {
    let fabric = MemoryFabric::with_objects(labeled("a", vec![sg("stale"), sg("keep")]));
    let engine = Engine::new();
    engine.reconcile_key(KIND, "a", labeled("a", vec![sg("keep"), sg("new")]));

    let first = engine.full_sync(&observe_inventory(&fabric).await);
    assert_eq!(first.ops.len(), 2);
    assert!(fabric.apply(&first.ops).await.is_clean());

    let second = engine.full_sync(&observe_inventory(&fabric).await);
    assert!(second.ops.is_empty(), "second pass: {:?}", second.ops);
    let third = engine.full_sync(&observe_inventory(&fabric).await);
    assert!(third.ops.is_empty());
    assert!(third.epoch > second.epoch);
}

#[tokio::test]
async fn full_sync_repairs_out_of_band_changes() {
    let engine = Engine::new();
    let fabric = MemoryFabric::new();
    let ops = engine.reconcile_key(KIND, "a", labeled("a", vec![sg("x"), sg("y")]));
    fabric.apply(&ops).await;

    // someone deletes x and edits y behind the controller's back
    fabric.remove(&sg("x").identifier);
    fabric.put(sg("y").with_display_name("hijacked").with_owner(KIND, "a"));

    let report = engine.full_sync(&observe_inventory(&fabric).await);
    assert_eq!(report.ops.adds, vec![sg("x")]);
    assert_eq!(report.ops.updates, vec![sg("y")]);
    assert!(report.ops.deletes.is_empty());
}

#[tokio::test]
async fn orphaned_labels_in_fabric_are_deleted() {
    // fabric still carries objects for an owner the engine has never heard of (e.g. after restart)
    let fabric = MemoryFabric::with_objects(labeled("gone", vec![sg("orphan")]));
    let engine = Engine::new();
    let report = engine.full_sync(&observe_inventory(&fabric).await);
    assert_eq!(report.ops.deletes, vec![sg("orphan").identifier]);
    assert_eq!(report.keys_synced, 1);
}

#[tokio::test]
async fn unowned_objects_are_left_alone() {
    let fabric = MemoryFabric::with_objects(vec![sg("manual")]);
    let engine = Engine::new();
    let report = engine.full_sync(&observe_inventory(&fabric).await);
    assert!(report.ops.is_empty());
    assert_eq!(report.unowned, 1);
}

#[tokio::test]
async fn observe_failure_is_isolated_to_its_kind() {
    let engine = Engine::new();
    engine.reconcile_key(KIND, "a", labeled("a", vec![sg("web")]));
    let epg = FabricObject::endpoint_group("common", "kube", "web").with_owner(FabricKind::EndpointGroup, "a");
    engine.reconcile_key(FabricKind::EndpointGroup, "a", vec![epg.clone()]);

    let fabric = MemoryFabric::new();
    fabric.fail_kind(KIND, true);
    let report = engine.full_sync(&observe_inventory(&fabric).await);

    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].key, BucketKey::new(KIND, "a"));
    assert!(matches!(report.failures[0].error, FabricError::Observe { kind: FabricKind::SecurityGroup, .. }));
    assert_eq!(report.ops.adds, vec![epg], "endpoint groups still converge");
    assert_eq!(engine.objects(KIND, "a"), vec![sg("web")], "failed key keeps its bucket");

    fabric.fail_kind(KIND, false);
    let report = engine.full_sync(&observe_inventory(&fabric).await);
    assert!(report.failures.is_empty());
    assert_eq!(report.ops.adds, vec![sg("web")]);
}

#[derive(Default)]
struct Generators {
    desired: BTreeMap<BucketKey, Vec<FabricObject>>,
    broken: Option<BucketKey>,
}

impl DesiredSource for Generators {
    fn keys(&self) -> Vec<BucketKey> { self.desired.keys().cloned().collect() }

    fn desired(&self, key: &BucketKey) -> Result<Vec<FabricObject>> {
        if self.broken.as_ref() == Some(key) { return Err(anyhow!("generator crashed")); }
        Ok(self.desired.get(key).cloned().unwrap_or_default())
    }
}

#[tokio::test]
async fn desired_source_recomputes_and_removed_owners_become_deletes() {
    let fabric = MemoryFabric::with_objects(labeled("removed", vec![sg("old")]));
    let mut gens = Generators::default();
    gens.desired.insert(BucketKey::new(KIND, "live"), labeled("live", vec![sg("fresh")]));

    let engine = Engine::new();
    let report = engine.full_sync_with(&observe_inventory(&fabric).await, &gens);
    assert_eq!(report.ops.adds, vec![sg("fresh")]);
    assert_eq!(report.ops.deletes, vec![sg("old").identifier]);
    assert_eq!(report.keys_synced, 2);
    assert_eq!(engine.stats().objects, 1);
}

#[tokio::test]
async fn desired_source_failure_is_isolated_to_its_key() {
    let fabric = MemoryFabric::with_objects(labeled("bad", vec![sg("b")]));
    let mut gens = Generators::default();
    gens.desired.insert(BucketKey::new(KIND, "good"), labeled("good", vec![sg("g")]));
    gens.desired.insert(BucketKey::new(KIND, "bad"), vec![]);
    gens.broken = Some(BucketKey::new(KIND, "bad"));

    let engine = Engine::new();
    let report = engine.full_sync_with(&observe_inventory(&fabric).await, &gens);
    assert_eq!(report.ops.adds, vec![sg("g")]);
    assert!(report.ops.deletes.is_empty(), "broken key must not be diffed");
    assert_eq!(report.failures.len(), 1);
    assert!(matches!(&report.failures[0].error, FabricError::Desired { owner, .. } if owner == "bad"));
}

#[test]
fn missing_kinds_in_snapshot_are_reported_not_diffed() {
    let engine = Engine::new();
    engine.reconcile_key(KIND, "a", labeled("a", vec![sg("web")]));
    let mut observed = ObservedInventory::new();
    observed.insert(FabricKind::EndpointGroup, Vec::new());
    let report = engine.full_sync(&observed);
    assert!(report.ops.is_empty());
    assert_eq!(report.failures.len(), 1);
}

/// Desired source that checks, from another thread, whether the engine is free
/// while it is being queried.
struct LockWatcher {
    engine: Arc<Engine>,
    inner: Generators,
    blocked: AtomicBool,
}

impl LockWatcher {
    fn check_engine_free(&self) {
        let engine = Arc::clone(&self.engine);
        let (tx, rx) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            let _ = tx.send(engine.stats());
        });
        if rx.recv_timeout(Duration::from_millis(300)).is_err() {
            self.blocked.store(true, Ordering::SeqCst);
        }
    }
}

impl DesiredSource for LockWatcher {
    fn keys(&self) -> Vec<BucketKey> {
        self.check_engine_free();
        self.inner.keys()
    }

    fn desired(&self, key: &BucketKey) -> Result<Vec<FabricObject>> {
        self.check_engine_free();
        self.inner.desired(key)
    }
}

#[tokio::test]
async fn desired_source_is_queried_without_holding_the_engine_lock() {
    let engine = Arc::new(Engine::new());
    engine.reconcile_key(KIND, "stale", labeled("stale", vec![sg("s")]));
    let mut inner = Generators::default();
    inner.desired.insert(BucketKey::new(KIND, "live"), labeled("live", vec![sg("fresh")]));
    let source = LockWatcher { engine: Arc::clone(&engine), inner, blocked: AtomicBool::new(false) };

    let fabric = MemoryFabric::with_objects(labeled("stale", vec![sg("s")]));
    let report = engine.full_sync_with(&observe_inventory(&fabric).await, &source);
    assert!(!source.blocked.load(Ordering::SeqCst), "engine lock held while querying desired state");
    assert_eq!(report.ops.adds, vec![sg("fresh")]);
    assert_eq!(report.ops.deletes, vec![sg("s").identifier]);
}

//! Weft kubehub: fabric objects stored as a Kubernetes custom resource.
//!
//! One custom object per fabric identifier. `metadata.name` is a DNS-safe form of
//! the identifier, the exact identifier and the owner label ride along as
//! annotations, and `spec` is the payload.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use anyhow::{anyhow, Context, Result};
use futures::{Stream, StreamExt};
use kube::{
    api::{Api, ListParams},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::{Discovery, Scope},
    runtime::{
        watcher::{self, Event},
        WatchStreamExt,
    },
    Client,
};
use once_cell::sync::Lazy;
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use weft_core::{FabricKind, FabricObject, OwnerLabel};
use weft_store::{Command, InventorySource};

pub mod leader;

pub use leader::{LeaderConfig, LeaderElector};

pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const MANAGER: &str = "weft";
pub const KIND_LABEL: &str = "weft.io/kind";
pub const OWNER_KIND_ANNOTATION: &str = "weft.io/owner-kind";
pub const OWNER_ANNOTATION: &str = "weft.io/owner";
pub const IDENTIFIER_ANNOTATION: &str = "weft.io/identifier";

const DEFAULT_GVK: &str = "fabric.weft.io/v1/FabricObject";
const DEFAULT_NAMESPACE: &str = "weft-system";

const MAX_NAME_LEN: usize = 253;
const NAME_HASH_LEN: usize = 10;

/// Where fabric objects live, from `WEFT_FABRIC_GVK` and `WEFT_FABRIC_NAMESPACE`.
pub static FABRIC_TARGET: Lazy<FabricTarget> = Lazy::new(FabricTarget::from_env);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FabricTarget {
    pub gvk: GroupVersionKind,
    pub namespace: String,
}

impl FabricTarget {
    pub fn from_env() -> Self {
        let gvk = std::env::var("WEFT_FABRIC_GVK")
            .ok()
            .and_then(|k| match parse_gvk_key(&k) {
                Ok(g) => Some(g),
                Err(e) => { warn!(error = %e, "ignoring WEFT_FABRIC_GVK"); None }
            })
            .unwrap_or_else(default_gvk);
        let namespace = std::env::var("WEFT_FABRIC_NAMESPACE").unwrap_or_else(|_| DEFAULT_NAMESPACE.to_string());
        Self { gvk, namespace }
    }
}

fn default_gvk() -> GroupVersionKind {
    GroupVersionKind { group: "fabric.weft.io".into(), version: "v1".into(), kind: "FabricObject".into() }
}

/// Parse `v1/Kind` or `group/v1/Kind`.
pub fn parse_gvk_key(key: &str) -> Result<GroupVersionKind> {
    let parts: Vec<_> = key.split('/').collect();
    match parts.as_slice() {
        [version, kind] => Ok(GroupVersionKind { group: String::new(), version: version.to_string(), kind: kind.to_string() }),
        [group, version, kind] => Ok(GroupVersionKind { group: (*group).to_string(), version: (*version).to_string(), kind: (*kind).to_string() }),
        _ => Err(anyhow!("invalid gvk key: {} (expect v1/Kind or group/v1/Kind, default {})", key, DEFAULT_GVK)),
    }
}

pub async fn get_kube_client() -> Result<Client> {
    Client::try_default().await.context("building kube client from kubeconfig or in-cluster env")
}

async fn find_api_resource(client: Client, gvk: &GroupVersionKind) -> Result<(ApiResource, bool)> {
    let discovery = Discovery::new(client).run().await?;
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                let namespaced = matches!(caps.scope, Scope::Namespaced);
                return Ok((ar.clone(), namespaced));
            }
        }
    }
    Err(anyhow!("GVK not found: {}/{}/{} (is the fabric CRD installed?)", gvk.group, gvk.version, gvk.kind))
}

fn selector(kind: Option<FabricKind>) -> String {
    match kind {
        Some(k) => format!("{}={},{}={}", MANAGED_BY_LABEL, MANAGER, KIND_LABEL, k.as_str()),
        None => format!("{}={}", MANAGED_BY_LABEL, MANAGER),
    }
}

/// Resource name for a fabric identifier: a lowercase RFC 1123 subdomain made of
/// the identifier's alphanumerics plus a short SHA-256 of the exact identifier,
/// so identifiers differing only in case or punctuation never collide.
pub fn resource_name(identifier: &str) -> String {
    let digest = hex::encode(Sha256::digest(identifier.as_bytes()));
    let hash = &digest[..NAME_HASH_LEN];
    let mut stem: String = identifier
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '-' })
        .collect();
    stem.truncate(MAX_NAME_LEN - NAME_HASH_LEN - 1);
    let stem = stem.trim_matches('-');
    if stem.is_empty() { hash.to_string() } else { format!("{}-{}", stem, hash) }
}

/// Render a fabric object as the custom resource that stores it.
pub fn to_dynamic(obj: &FabricObject, ar: &ApiResource, namespace: Option<&str>) -> DynamicObject {
    let mut d = DynamicObject::new(&resource_name(&obj.identifier), ar).data(serde_json::json!({ "spec": obj.payload }));
    if let Some(ns) = namespace { d = d.within(ns); }
    let mut labels = BTreeMap::new();
    labels.insert(MANAGED_BY_LABEL.to_string(), MANAGER.to_string());
    labels.insert(KIND_LABEL.to_string(), obj.kind.as_str().to_string());
    d.metadata.labels = Some(labels);
    let mut annos = BTreeMap::new();
    annos.insert(IDENTIFIER_ANNOTATION.to_string(), obj.identifier.clone());
    if let Some(owner) = &obj.owner {
        annos.insert(OWNER_KIND_ANNOTATION.to_string(), owner.kind.as_str().to_string());
        annos.insert(OWNER_ANNOTATION.to_string(), owner.owner.clone());
    }
    d.metadata.annotations = Some(annos);
    d
}

/// Read a custom resource back into a fabric object. The identifier comes from its
/// annotation; the owner label is restored only when both owner annotations are
/// present and valid.
pub fn from_dynamic(d: &DynamicObject) -> Result<FabricObject> {
    let name = d.metadata.name.as_deref().unwrap_or("<unnamed>");
    let identifier = d
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(IDENTIFIER_ANNOTATION))
        .cloned()
        .ok_or_else(|| anyhow!("{} missing {} annotation", name, IDENTIFIER_ANNOTATION))?;
    let kind: FabricKind = d
        .metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(KIND_LABEL))
        .ok_or_else(|| anyhow!("{} missing {} label", identifier, KIND_LABEL))?
        .parse()?;
    let payload = d.data.get("spec").cloned().unwrap_or_else(|| serde_json::json!({}));
    let owner = d.metadata.annotations.as_ref().and_then(|a| {
        let owner_kind = a.get(OWNER_KIND_ANNOTATION)?.parse::<FabricKind>().ok()?;
        let owner = a.get(OWNER_ANNOTATION)?;
        Some(OwnerLabel { kind: owner_kind, owner: owner.clone() })
    });
    Ok(FabricObject { kind, identifier, payload, owner })
}

/// Fabric store backed by a custom resource collection.
#[derive(Clone)]
pub struct KubeFabric {
    api: Api<DynamicObject>,
    ar: ApiResource,
    namespace: Option<String>,
}

impl KubeFabric {
    /// Resolve the target resource through discovery and bind to it.
    pub async fn connect(client: Client, target: &FabricTarget) -> Result<Self> {
        let (ar, namespaced) = find_api_resource(client.clone(), &target.gvk).await?;
        let (api, namespace) = if namespaced {
            (Api::namespaced_with(client, &target.namespace, &ar), Some(target.namespace.clone()))
        } else {
            (Api::all_with(client, &ar), None)
        };
        info!(gvk = ?target.gvk, ns = ?namespace, "fabric store bound");
        Ok(Self { api, ar, namespace })
    }

    pub fn api(&self) -> &Api<DynamicObject> { &self.api }
    pub fn api_resource(&self) -> &ApiResource { &self.ar }
    pub fn namespace(&self) -> Option<&str> { self.namespace.as_deref() }

    /// Watch the fabric collection and request a full sync whenever the watch
    /// relists after a desync. Watch errors back off and retry; this only returns
    /// once the controller stops accepting commands.
    pub async fn watch_resyncs(&self, cmd_tx: mpsc::Sender<Command>) {
        let cfg = watcher::Config::default().labels(&selector(None));
        let stream = watcher::watcher(self.api.clone(), cfg).default_backoff();
        info!("fabric watcher started");
        forward_resyncs(stream, &cmd_tx).await;
    }
}

/// Turn watch restarts into `Command::FullSync`. The first list is the initial
/// state and is skipped; errors are logged and the stream keeps going.
pub async fn forward_resyncs<S, K, E>(stream: S, cmd_tx: &mpsc::Sender<Command>)
where
    S: Stream<Item = Result<Event<K>, E>>,
    E: std::fmt::Display,
{
    futures::pin_mut!(stream);
    let mut primed = false;
    while let Some(ev) = stream.next().await {
        match ev {
            Ok(Event::Restarted(list)) => {
                if !primed {
                    primed = true;
                    debug!(count = list.len(), "initial fabric list");
                    continue;
                }
                info!(count = list.len(), "fabric watch restarted; requesting full sync");
                metrics::counter!("weft_watch_restarts_total", 1u64);
                if cmd_tx.send(Command::FullSync).await.is_err() {
                    debug!("command channel closed; fabric watcher exiting");
                    return;
                }
            }
            Ok(Event::Applied(_)) => debug!("fabric object applied"),
            Ok(Event::Deleted(_)) => debug!("fabric object deleted"),
            Err(e) => {
                warn!(error = %e, "fabric watch error; retrying");
                metrics::counter!("weft_watch_err_total", 1u64);
            }
        }
    }
    warn!("fabric watcher stream ended");
}

#[async_trait::async_trait]
impl InventorySource for KubeFabric {
    async fn observe(&self, kind: FabricKind) -> Result<Vec<FabricObject>> {
        let lp = ListParams::default().labels(&selector(Some(kind)));
        let list = self.api.list(&lp).await.with_context(|| format!("listing {} fabric objects", kind))?;
        let mut out = Vec::with_capacity(list.items.len());
        for d in list.items.iter() {
            match from_dynamic(d) {
                Ok(o) => out.push(o),
                Err(e) => warn!(error = %e, "skipping malformed fabric object"),
            }
        }
        Ok(out)
    }
}

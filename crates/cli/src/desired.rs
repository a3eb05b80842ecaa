//! Desired state read from a YAML file, standing in for the resource translators.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{info, warn};
use weft_core::{FabricKind, FabricObject};
use weft_store::{BucketKey, DesiredSource};

/// One entry of the desired-state file.
#[derive(Debug, Clone, Deserialize)]
pub struct DesiredEntry {
    pub kind: FabricKind,
    pub owner: String,
    /// Name components; the kind suffix is appended when building the identifier.
    pub name: Vec<String>,
    #[serde(default = "empty_payload")]
    pub payload: serde_json::Value,
}

fn empty_payload() -> serde_json::Value { serde_json::json!({}) }

type Grouped = BTreeMap<BucketKey, Vec<FabricObject>>;

pub fn parse(yaml: &str) -> Result<Grouped> {
    let entries: Vec<DesiredEntry> = serde_yaml::from_str(yaml).context("parsing desired-state YAML")?;
    let mut out: Grouped = BTreeMap::new();
    for e in entries {
        let obj = FabricObject::new(e.kind, &e.name, e.payload).with_owner(e.kind, e.owner.clone());
        out.entry(BucketKey::new(e.kind, e.owner)).or_default().push(obj);
    }
    Ok(out)
}

/// File-backed desired state. The file is re-read at the start of every full sync;
/// a read failure keeps the last good contents.
pub struct FileDesired {
    path: PathBuf,
    current: RwLock<Grouped>,
}

impl FileDesired {
    pub fn load(path: &Path) -> Result<Self> {
        let current = read(path)?;
        Ok(Self { path: path.to_path_buf(), current: RwLock::new(current) })
    }

    pub fn object_count(&self) -> usize {
        self.current.read().map(|g| g.values().map(|v| v.len()).sum()).unwrap_or(0)
    }
}

fn read(path: &Path) -> Result<Grouped> {
    let yaml = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    parse(&yaml)
}

impl DesiredSource for FileDesired {
    fn keys(&self) -> Vec<BucketKey> {
        match read(&self.path) {
            Ok(fresh) => {
                info!(path = %self.path.display(), keys = fresh.len(), "desired state reloaded");
                if let Ok(mut g) = self.current.write() { *g = fresh; }
            }
            Err(e) => warn!(error = %e, "desired state reload failed; keeping previous"),
        }
        self.current.read().map(|g| g.keys().cloned().collect()).unwrap_or_default()
    }

    fn desired(&self, key: &BucketKey) -> Result<Vec<FabricObject>> {
        let g = self.current.read().map_err(|_| anyhow::anyhow!("desired state lock poisoned"))?;
        Ok(g.get(key).cloned().unwrap_or_default())
    }
}

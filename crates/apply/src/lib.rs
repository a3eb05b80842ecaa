//! Weft apply: push operation batches to the fabric custom resources.
//!
//! Deletes go by name, adds and updates as server-side apply of the whole object.
//! Items are independent; one failure never stops the rest of the batch.

#![forbid(unsafe_code)]

use kube::api::{Api, DeleteParams, Patch, PatchParams};
use kube::core::{ApiResource, DynamicObject};
use metrics::{counter, histogram};
use tracing::{debug, warn};
use weft_core::{FabricError, FabricObject, Operations};
use weft_kubehub::{resource_name, to_dynamic, KubeFabric};
use weft_store::{ApplyReport, FabricApplier};

pub const FIELD_MANAGER: &str = "weft";

pub struct KubeApplier {
    api: Api<DynamicObject>,
    ar: ApiResource,
    namespace: Option<String>,
}

impl KubeApplier {
    pub fn new(fabric: &KubeFabric) -> Self {
        Self {
            api: fabric.api().clone(),
            ar: fabric.api_resource().clone(),
            namespace: fabric.namespace().map(|s| s.to_string()),
        }
    }

    async fn delete(&self, identifier: &str) -> Result<(), FabricError> {
        match self.api.delete(&resource_name(identifier), &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => {
                debug!(identifier, "already gone");
                Ok(())
            }
            Err(e) => Err(FabricError::apply(identifier, e)),
        }
    }

    async fn put(&self, obj: &FabricObject) -> Result<(), FabricError> {
        let body = to_dynamic(obj, &self.ar, self.namespace.as_deref());
        let name = resource_name(&obj.identifier);
        let pp = PatchParams::apply(FIELD_MANAGER).force();
        self.api
            .patch(&name, &pp, &Patch::Apply(&body))
            .await
            .map(|_| ())
            .map_err(|e| FabricError::apply(obj.identifier.as_str(), e))
    }
}

pub fn is_not_found(e: &kube::Error) -> bool {
    matches!(e, kube::Error::Api(ae) if ae.code == 404)
}

#[async_trait::async_trait]
impl FabricApplier for KubeApplier {
    async fn apply(&self, ops: &Operations) -> ApplyReport {
        let t0 = std::time::Instant::now();
        let mut report = ApplyReport::default();
        let results = deletes_then_puts(ops);
        for item in results {
            let res = match item {
                Item::Delete(id) => self.delete(id).await,
                Item::Put(o) => self.put(o).await,
            };
            match res {
                Ok(()) => report.applied += 1,
                Err(e) => {
                    warn!(error = %e, "apply item failed");
                    report.failures.push(e);
                }
            }
        }
        histogram!("weft_apply_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        counter!("weft_apply_items_total", ops.len() as u64);
        report
    }
}

enum Item<'a> {
    Delete(&'a str),
    Put(&'a FabricObject),
}

/// Deletes first so a name freed in this batch can be reused by an add in the same batch.
fn deletes_then_puts(ops: &Operations) -> Vec<Item<'_>> {
    ops.deletes
        .iter()
        .map(|id| Item::Delete(id.as_str()))
        .chain(ops.adds.iter().chain(ops.updates.iter()).map(Item::Put))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deletes_are_ordered_before_puts() {
        let ops = Operations {
            adds: vec![FabricObject::security_group("common", "a")],
            updates: vec![FabricObject::security_group("common", "b")],
            deletes: vec!["c-common-SecurityGroup".into()],
        };
        let items = deletes_then_puts(&ops);
        assert_eq!(items.len(), 3);
        assert!(matches!(items[0], Item::Delete("c-common-SecurityGroup")));
        assert!(matches!(items[1], Item::Put(o) if o.identifier == "a-common-SecurityGroup"));
        assert!(matches!(items[2], Item::Put(o) if o.identifier == "b-common-SecurityGroup"));
    }

    #[test]
    fn puts_and_deletes_target_the_same_resource_name() {
        let ar = kube::core::ApiResource::from_gvk(&weft_kubehub::FABRIC_TARGET.gvk);
        let obj = FabricObject::security_group("common", "test4");
        let body = to_dynamic(&obj, &ar, None);
        assert_eq!(body.metadata.name.as_deref(), Some(resource_name("test4-common-SecurityGroup").as_str()));
    }

    #[test]
    fn not_found_is_recognized() {
        let nf = kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".into(),
            message: "fabricobjects \"x\" not found".into(),
            reason: "NotFound".into(),
            code: 404,
        });
        assert!(is_not_found(&nf));
        let conflict = kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".into(),
            message: "conflict".into(),
            reason: "Conflict".into(),
            code: 409,
        });
        assert!(!is_not_found(&conflict));
    }
}

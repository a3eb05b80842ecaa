//! Weft core types: fabric objects, owner labels and operation batches.

#![forbid(unsafe_code)]

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub mod error;
pub mod naming;
pub mod payload;

pub use error::FabricError;
pub use naming::build_identifier;

/// Type tag of a fabric object. Also names the desired-state generator that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FabricKind {
    SecurityGroup,
    SecurityGroupSubject,
    SecurityGroupRule,
    EndpointGroup,
    ApplicationProfile,
    Contract,
    Filter,
}

impl FabricKind {
    pub const ALL: [FabricKind; 7] = [
        FabricKind::SecurityGroup,
        FabricKind::SecurityGroupSubject,
        FabricKind::SecurityGroupRule,
        FabricKind::EndpointGroup,
        FabricKind::ApplicationProfile,
        FabricKind::Contract,
        FabricKind::Filter,
    ];

    /// Stable tag used in labels and config files, e.g. `security-group`.
    pub fn as_str(&self) -> &'static str {
        match self {
            FabricKind::SecurityGroup => "security-group",
            FabricKind::SecurityGroupSubject => "security-group-subject",
            FabricKind::SecurityGroupRule => "security-group-rule",
            FabricKind::EndpointGroup => "endpoint-group",
            FabricKind::ApplicationProfile => "application-profile",
            FabricKind::Contract => "contract",
            FabricKind::Filter => "filter",
        }
    }

    /// Trailing identifier component for objects of this kind, e.g. `SecurityGroup`.
    pub fn suffix(&self) -> &'static str {
        match self {
            FabricKind::SecurityGroup => "SecurityGroup",
            FabricKind::SecurityGroupSubject => "SecurityGroupSubject",
            FabricKind::SecurityGroupRule => "SecurityGroupRule",
            FabricKind::EndpointGroup => "EndpointGroup",
            FabricKind::ApplicationProfile => "ApplicationProfile",
            FabricKind::Contract => "Contract",
            FabricKind::Filter => "Filter",
        }
    }
}

impl fmt::Display for FabricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

impl FromStr for FabricKind {
    type Err = FabricError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FabricKind::ALL
            .iter()
            .copied()
            .find(|k| k.as_str() == s || k.suffix() == s)
            .ok_or_else(|| FabricError::Invalid(format!("unknown fabric kind: {}", s)))
    }
}

/// Opaque identifier of the Kubernetes resource that owns a group of fabric objects.
pub type OwnerKey = String;

/// Back-reference from a fabric object to the `(kind, owner key)` that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OwnerLabel {
    pub kind: FabricKind,
    pub owner: OwnerKey,
}

/// One desired unit of fabric configuration.
///
/// Equality covers `identifier` and `payload` only. The owner label is
/// correlation metadata and never makes two objects differ.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FabricObject {
    pub kind: FabricKind,
    pub identifier: String,
    pub payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<OwnerLabel>,
}

impl PartialEq for FabricObject {
    fn eq(&self, other: &Self) -> bool {
        self.identifier == other.identifier && self.payload == other.payload
    }
}

impl Eq for FabricObject {}

impl FabricObject {
    /// Build an object whose identifier is derived from `components` plus the kind suffix.
    pub fn new<I, S>(kind: FabricKind, components: I, payload: serde_json::Value) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let parts: Vec<String> = components
            .into_iter()
            .map(|s| s.as_ref().to_string())
            .chain(std::iter::once(kind.suffix().to_string()))
            .collect();
        Self { kind, identifier: build_identifier(&parts), payload, owner: None }
    }

    pub fn security_group(tenant: &str, name: &str) -> Self {
        let payload = serde_json::json!({ "tenantName": tenant, "name": name, "displayName": "" });
        Self::new(FabricKind::SecurityGroup, [name, tenant], payload)
    }

    pub fn endpoint_group(tenant: &str, app_profile: &str, name: &str) -> Self {
        let payload = serde_json::json!({
            "tenantName": tenant,
            "appProfileName": app_profile,
            "name": name,
            "displayName": "",
        });
        Self::new(FabricKind::EndpointGroup, [name, app_profile, tenant], payload)
    }

    pub fn with_display_name(mut self, display_name: &str) -> Self {
        if let Some(obj) = self.payload.as_object_mut() {
            obj.insert("displayName".into(), serde_json::Value::String(display_name.to_string()));
        }
        self
    }

    /// Attach the owner label. Callers do this before handing objects to the engine.
    pub fn with_owner(mut self, kind: FabricKind, owner: impl Into<OwnerKey>) -> Self {
        self.owner = Some(OwnerLabel { kind, owner: owner.into() });
        self
    }
}

/// Output of one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Operations {
    pub adds: Vec<FabricObject>,
    pub updates: Vec<FabricObject>,
    /// Identifiers of objects to remove.
    pub deletes: Vec<String>,
}

impl Operations {
    pub fn is_empty(&self) -> bool { self.adds.is_empty() && self.updates.is_empty() && self.deletes.is_empty() }
    pub fn len(&self) -> usize { self.adds.len() + self.updates.len() + self.deletes.len() }
}

pub mod prelude {
    pub use super::{build_identifier, FabricError, FabricKind, FabricObject, Operations, OwnerKey, OwnerLabel};
}

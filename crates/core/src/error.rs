use serde::{Deserialize, Serialize};

use crate::FabricKind;

/// Failures the reconcile core reports to its caller instead of propagating.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum FabricError {
    #[error("observe {kind}: {reason}")]
    Observe { kind: FabricKind, reason: String },
    #[error("desired state for {kind}/{owner}: {reason}")]
    Desired { kind: FabricKind, owner: String, reason: String },
    #[error("apply {identifier}: {reason}")]
    Apply { identifier: String, reason: String },
    #[error("invalid fabric object: {0}")]
    Invalid(String),
}

impl FabricError {
    pub fn observe(kind: FabricKind, err: impl std::fmt::Display) -> Self {
        Self::Observe { kind, reason: format!("{:#}", err) }
    }

    pub fn apply(identifier: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::Apply { identifier: identifier.into(), reason: format!("{:#}", err) }
    }
}

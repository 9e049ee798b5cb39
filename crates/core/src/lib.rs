//! Keel core types: object references, change sets, inventory and condition bookkeeping.
//!
//! Nothing in this crate talks to a cluster. The store contract lives in [`store`]
//! and is implemented by `keel-kubehub` (live cluster) and `keel-store` (in RAM).

#![forbid(unsafe_code)]

use std::fmt;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

pub mod conditions;
pub mod health;
pub mod inventory;
pub mod json;
pub mod object;
pub mod store;

pub use conditions::{Condition, ConditionStatus, Conditions};
pub use health::{compute_health, Health};
pub use inventory::Inventory;
pub use object::{ArtifactSource, BuildError, BuildInputs, ManagedObject, ManagedStatus};
pub use store::{ApplyOptions, ApplyPolicy, ClusterStore, DeleteOptions, OwnerSelector, StoreError};

/// Label keys stamped on every applied object; GC only ever touches objects carrying all three.
pub const OWNER_KIND_LABEL: &str = "keel.dev/kind";
pub const OWNER_NAME_LABEL: &str = "keel.dev/name";
pub const OWNER_NAMESPACE_LABEL: &str = "keel.dev/namespace";

/// Finalizer attached to every managed object on first observation.
pub const FINALIZER: &str = "keel.dev/finalizer";

/// Default server-side apply field manager.
pub const FIELD_MANAGER: &str = "keel";

/// A generic resource document in unstructured form.
pub type Resource = Json;

/// Malformed resource documents. Raised before any store call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ObjectError {
    #[error("object is not a JSON map")]
    NotAnObject,
    #[error("object is missing {0}")]
    Missing(&'static str),
    #[error("{id}: object too complex (>{max} nodes)")]
    TooComplex { id: String, max: usize },
    #[error("duplicate object {0}")]
    Duplicate(String),
    #[error("{id}: {reason}")]
    Invalid { id: String, reason: String },
}

/// Identity of one managed cluster object. `version` is informational only:
/// equality for ownership purposes goes through [`ResourceRef::id`].
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRef {
    #[serde(default)]
    pub group: String,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub name: String,
    #[serde(default)]
    pub version: String,
}

impl ResourceRef {
    pub fn new(api_version: &str, kind: &str, namespace: Option<&str>, name: &str) -> Self {
        let (group, version) = split_api_version(api_version);
        Self {
            group: group.to_string(),
            kind: kind.to_string(),
            namespace: namespace.filter(|s| !s.is_empty()).map(|s| s.to_string()),
            name: name.to_string(),
            version: version.to_string(),
        }
    }

    /// Read the identity out of an unstructured document.
    pub fn from_object(obj: &Json) -> Result<Self, ObjectError> {
        if !obj.is_object() {
            return Err(ObjectError::NotAnObject);
        }
        let api_version = obj.get("apiVersion").and_then(|v| v.as_str()).ok_or(ObjectError::Missing("apiVersion"))?;
        let kind = obj.get("kind").and_then(|v| v.as_str()).ok_or(ObjectError::Missing("kind"))?;
        let meta = obj.get("metadata");
        let name = meta.and_then(|m| m.get("name")).and_then(|v| v.as_str()).ok_or(ObjectError::Missing("metadata.name"))?;
        let ns = meta.and_then(|m| m.get("namespace")).and_then(|v| v.as_str());
        if api_version.is_empty() || kind.is_empty() || name.is_empty() {
            return Err(ObjectError::Missing("apiVersion, kind or metadata.name"));
        }
        Ok(Self::new(api_version, kind, ns, name))
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() { self.version.clone() } else { format!("{}/{}", self.group, self.version) }
    }

    /// Version-less identity key, e.g. `apps_Deployment_default_web`.
    pub fn id(&self) -> String {
        format!("{}_{}_{}_{}", self.group, self.kind, self.namespace.as_deref().unwrap_or(""), self.name)
    }

    pub fn same_object(&self, other: &ResourceRef) -> bool {
        self.group == other.group && self.kind == other.kind && self.namespace == other.namespace && self.name == other.name
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}/{}", self.kind, ns, self.name),
            None => write!(f, "{}/{}", self.kind, self.name),
        }
    }
}

/// Split `group/version` (or bare `version` for the core group).
pub fn split_api_version(api_version: &str) -> (&str, &str) {
    match api_version.split_once('/') {
        Some((g, v)) => (g, v),
        None => ("", api_version),
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ChangeAction {
    Created,
    Updated,
    Unchanged,
    Deleted,
    /// Left alone on purpose: apply policy, prune exclusion or foreign ownership.
    Unmanaged,
}

impl fmt::Display for ChangeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChangeAction::Created => "created",
            ChangeAction::Updated => "configured",
            ChangeAction::Unchanged => "unchanged",
            ChangeAction::Deleted => "deleted",
            ChangeAction::Unmanaged => "skipped",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChangeEntry {
    pub object: ResourceRef,
    pub action: ChangeAction,
}

impl ChangeEntry {
    pub fn new(object: ResourceRef, action: ChangeAction) -> Self { Self { object, action } }
}

/// Ordered result of one apply or delete pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChangeSet {
    pub entries: Vec<ChangeEntry>,
}

impl ChangeSet {
    pub fn new() -> Self { Self::default() }

    pub fn push(&mut self, object: ResourceRef, action: ChangeAction) {
        self.entries.push(ChangeEntry::new(object, action));
    }

    pub fn append(&mut self, other: ChangeSet) { self.entries.extend(other.entries); }

    pub fn is_empty(&self) -> bool { self.entries.is_empty() }
    pub fn len(&self) -> usize { self.entries.len() }

    pub fn count(&self, action: ChangeAction) -> usize {
        self.entries.iter().filter(|e| e.action == action).count()
    }

    /// Objects that were created or updated by this pass.
    pub fn changed(&self) -> Vec<ResourceRef> {
        self.entries
            .iter()
            .filter(|e| matches!(e.action, ChangeAction::Created | ChangeAction::Updated))
            .map(|e| e.object.clone())
            .collect()
    }

    /// True when something other than `Unchanged` happened.
    pub fn has_notable(&self) -> bool {
        self.entries.iter().any(|e| e.action != ChangeAction::Unchanged)
    }

    /// Human-readable change log, one `Kind/ns/name action` per line; unchanged entries are omitted.
    pub fn to_log(&self) -> String {
        self.entries
            .iter()
            .filter(|e| e.action != ChangeAction::Unchanged)
            .map(|e| format!("{} {}", e.object, e.action))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Reference to an object that must exist (and optionally be ready) before a reconcile proceeds.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Dependency {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default)]
    pub require_ready: bool,
}

impl Dependency {
    /// Namespace defaults to the dependent object's own namespace.
    pub fn to_ref(&self, default_namespace: Option<&str>) -> ResourceRef {
        let ns = self.namespace.as_deref().or(default_namespace);
        ResourceRef::new(&self.api_version, &self.kind, ns, &self.name)
    }
}

pub mod prelude {
    pub use super::{
        ChangeAction, ChangeEntry, ChangeSet, ClusterStore, Condition, ConditionStatus, Conditions, Dependency, Inventory,
        ManagedObject, ManagedStatus, Resource, ResourceRef, StoreError,
    };
}

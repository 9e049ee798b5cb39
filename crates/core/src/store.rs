//! The cluster store contract consumed by the apply engine and the controllers.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value as Json;

use crate::health::{compute_health, Health};
use crate::{ChangeSet, ResourceRef, FIELD_MANAGER, OWNER_KIND_LABEL, OWNER_NAMESPACE_LABEL, OWNER_NAME_LABEL};

/// Per-object apply policy annotation: `Override` (default), `IfNotPresent` or `Ignore`.
pub const SSA_ANNOTATION: &str = "keel.dev/ssa";

/// Label or annotation that protects a live object from garbage collection.
pub const PRUNE_ANNOTATION: &str = "keel.dev/prune";
pub const PRUNE_DISABLED: &str = "disabled";

/// Field managers whose ownership is absorbed on apply instead of conflicting.
pub const DEFAULT_TAKEOVER_MANAGERS: &[&str] =
    &["kubectl", "kubectl-client-side-apply", "kubectl-edit", "before-first-apply", "helm"];

/// Legacy bookkeeping left behind by other tools.
pub const LEGACY_ANNOTATIONS: &[&str] = &[
    "kubectl.kubernetes.io/last-applied-configuration",
    "meta.helm.sh/release-name",
    "meta.helm.sh/release-namespace",
];
pub const LEGACY_LABELS: &[&str] = &["app.kubernetes.io/managed-by"];

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("conflict on {object}: {message}")]
    Conflict { object: String, message: String },
    #[error("{object}: {message}")]
    Api { object: String, message: String },
    #[error("no API resource for {0}")]
    UnknownKind(String),
    #[error("{object} failed: {message}")]
    Failed { object: String, message: String },
    #[error("timeout waiting for: {0}")]
    Timeout(String),
    #[error("transport: {0}")]
    Transport(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool { matches!(self, StoreError::NotFound(_)) }
    pub fn is_conflict(&self) -> bool { matches!(self, StoreError::Conflict { .. }) }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ApplyPolicy {
    #[default]
    Override,
    IfNotPresent,
    Ignore,
}

impl ApplyPolicy {
    pub fn of(obj: &Json) -> Self {
        match crate::json::annotations(obj).get(SSA_ANNOTATION).map(|s| s.to_ascii_lowercase()).as_deref() {
            Some("ifnotpresent") => ApplyPolicy::IfNotPresent,
            Some("ignore") => ApplyPolicy::Ignore,
            _ => ApplyPolicy::Override,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ApplyOptions {
    pub field_manager: String,
    pub force: bool,
    pub takeover_managers: Vec<String>,
    pub cleanup_annotations: Vec<String>,
    pub cleanup_labels: Vec<String>,
}

impl Default for ApplyOptions {
    fn default() -> Self {
        Self {
            field_manager: FIELD_MANAGER.to_string(),
            force: true,
            takeover_managers: DEFAULT_TAKEOVER_MANAGERS.iter().map(|s| s.to_string()).collect(),
            cleanup_annotations: LEGACY_ANNOTATIONS.iter().map(|s| s.to_string()).collect(),
            cleanup_labels: LEGACY_LABELS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// Ownership labels of one managed object. The kind is part of the identity: two
/// managed objects of different kinds may share a name and namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnerSelector {
    pub kind: String,
    pub name: String,
    pub namespace: String,
}

impl OwnerSelector {
    pub fn new(kind: &str, name: &str, namespace: &str) -> Self {
        Self { kind: kind.to_string(), name: name.to_string(), namespace: namespace.to_string() }
    }

    /// Selector for the managed object `owner`.
    pub fn of(owner: &ResourceRef) -> Self {
        Self::new(&owner.kind, &owner.name, owner.namespace.as_deref().unwrap_or_default())
    }

    pub fn labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (OWNER_KIND_LABEL.to_string(), self.kind.clone()),
            (OWNER_NAME_LABEL.to_string(), self.name.clone()),
            (OWNER_NAMESPACE_LABEL.to_string(), self.namespace.clone()),
        ])
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.labels().iter().all(|(k, v)| labels.get(k) == Some(v))
    }

    /// `keel.dev/kind=k,keel.dev/name=x,keel.dev/namespace=y`
    pub fn to_selector_string(&self) -> String {
        self.labels().iter().map(|(k, v)| format!("{}={}", k, v)).collect::<Vec<_>>().join(",")
    }
}

#[derive(Debug, Clone)]
pub struct DeleteOptions {
    /// Only objects carrying these ownership labels are deleted.
    pub owner: OwnerSelector,
    /// `key=value` pairs; a live object with any of them as label or annotation is kept.
    pub exclusions: BTreeMap<String, String>,
}

impl DeleteOptions {
    pub fn new(owner: OwnerSelector) -> Self {
        Self { owner, exclusions: BTreeMap::from([(PRUNE_ANNOTATION.to_string(), PRUNE_DISABLED.to_string())]) }
    }

    /// Whether a live object is protected from deletion by an exclusion marker.
    pub fn is_excluded(&self, live: &Json) -> bool {
        let labels = crate::json::labels(live);
        let annotations = crate::json::annotations(live);
        self.exclusions.iter().any(|(k, v)| labels.get(k) == Some(v) || annotations.get(k) == Some(v))
    }
}

#[async_trait]
pub trait ClusterStore: Send + Sync {
    /// Fetch the live object; `StoreError::NotFound` when absent.
    async fn get(&self, r: &ResourceRef) -> Result<Json, StoreError>;

    async fn is_namespaced(&self, api_version: &str, kind: &str) -> Result<bool, StoreError>;

    /// Server-side apply of normalized objects, in order. One change entry per object.
    async fn apply(&self, objects: &[Json], opts: &ApplyOptions) -> Result<ChangeSet, StoreError>;

    /// Delete the referenced objects with background propagation. Objects that do not
    /// carry the owner's labels or that match an exclusion are reported `Unmanaged`;
    /// objects already gone are skipped.
    async fn delete(&self, refs: &[ResourceRef], opts: &DeleteOptions) -> Result<ChangeSet, StoreError>;

    /// Merge-patch the `status` subresource of a managed object.
    async fn patch_status(&self, r: &ResourceRef, patch: &Json) -> Result<(), StoreError>;

    /// Merge-patch the object itself (finalizers, annotations).
    async fn patch_metadata(&self, r: &ResourceRef, patch: &Json) -> Result<(), StoreError>;

    async fn get_opt(&self, r: &ResourceRef) -> Result<Option<Json>, StoreError> {
        match self.get(r).await {
            Ok(o) => Ok(Some(o)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Poll until every object is current. The first failed object aborts the wait.
    async fn wait(&self, refs: &[ResourceRef], interval: Duration, timeout: Duration) -> Result<(), StoreError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let mut pending = Vec::new();
            for r in refs {
                match self.get(r).await {
                    Ok(obj) => match compute_health(&obj) {
                        Health::Current => {}
                        Health::InProgress(msg) => pending.push(format!("{} ({})", r, msg)),
                        Health::Failed(message) => return Err(StoreError::Failed { object: r.to_string(), message }),
                    },
                    Err(e) if e.is_not_found() => pending.push(format!("{} (not found)", r)),
                    Err(e) => return Err(e),
                }
            }
            if pending.is_empty() {
                return Ok(());
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Err(StoreError::Timeout(pending.join(", ")));
            }
            tracing::debug!(pending = pending.len(), "waiting for objects to become ready");
            tokio::time::sleep(interval.min(deadline - now)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn owner_selector_matches_all_labels() {
        let sel = OwnerSelector::new("ResourceGroup", "app", "prod");
        let mut labels = sel.labels();
        assert!(sel.matches(&labels));
        labels.insert(OWNER_NAMESPACE_LABEL.into(), "dev".into());
        assert!(!sel.matches(&labels));
        assert_eq!(sel.to_selector_string(), "keel.dev/kind=ResourceGroup,keel.dev/name=app,keel.dev/namespace=prod");
    }

    #[test]
    fn owners_of_different_kinds_do_not_match() {
        let group = OwnerSelector::of(&ResourceRef::new("keel.dev/v1", "ResourceGroup", Some("default"), "platform"));
        let dist = OwnerSelector::of(&ResourceRef::new("keel.dev/v1", "Distribution", Some("default"), "platform"));
        assert!(!dist.matches(&group.labels()));
        let mut legacy = group.labels();
        legacy.remove(OWNER_KIND_LABEL);
        assert!(!group.matches(&legacy));
    }

    #[test]
    fn exclusions_match_labels_or_annotations() {
        let opts = DeleteOptions::new(OwnerSelector::new("ResourceGroup", "a", "b"));
        let by_label = json!({ "metadata": { "labels": { "keel.dev/prune": "disabled" } } });
        let by_anno = json!({ "metadata": { "annotations": { "keel.dev/prune": "disabled" } } });
        let other = json!({ "metadata": { "annotations": { "keel.dev/prune": "enabled" } } });
        assert!(opts.is_excluded(&by_label));
        assert!(opts.is_excluded(&by_anno));
        assert!(!opts.is_excluded(&other));
    }

    #[test]
    fn apply_policy_is_case_insensitive() {
        let o = json!({ "metadata": { "annotations": { "keel.dev/ssa": "IfNotPresent" } } });
        assert_eq!(ApplyPolicy::of(&o), ApplyPolicy::IfNotPresent);
        let o = json!({ "metadata": { "annotations": { "keel.dev/ssa": "ignore" } } });
        assert_eq!(ApplyPolicy::of(&o), ApplyPolicy::Ignore);
        assert_eq!(ApplyPolicy::of(&json!({})), ApplyPolicy::Override);
    }
}

//! Capability interface implemented by every managed kind, plus the status it carries.

use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::conditions::{Conditions, READY};
use crate::{Dependency, Inventory, ObjectError, ResourceRef, FINALIZER};

/// Status subresource shared by all managed kinds.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ManagedStatus {
    #[serde(default)]
    pub conditions: Conditions,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inventory: Option<Inventory>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_applied_revision: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempted_revision: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_artifact_revision: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_handled_reconcile_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl ManagedStatus {
    /// End-of-attempt bookkeeping: record the handled reconcile request, bump the
    /// observed generation on success and settle the Reconciling condition.
    pub fn finalize(&mut self, requested_at: Option<&str>, generation: Option<i64>) {
        if let Some(token) = requested_at {
            self.last_handled_reconcile_at = Some(token.to_string());
        }
        if self.conditions.is_true(READY) {
            self.observed_generation = generation;
        }
        self.conditions.finalize();
    }
}

/// Remote artifact a managed object tracks for drift.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactSource {
    /// `oci://registry/repository:tag`
    pub url: String,
    /// Plain HTTP registry.
    #[serde(default)]
    pub insecure: bool,
    /// Name of a `kubernetes.io/dockerconfigjson` Secret in the object's namespace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pull_secret: Option<String>,
}

/// Extra inputs made available to the builder by the control loop.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildInputs {
    pub artifact_digest: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BuildError {
    #[error("template: {0}")]
    Template(String),
    #[error("patch: {0}")]
    Patch(String),
    #[error("manifests: {0}")]
    Manifest(String),
    #[error(transparent)]
    Object(#[from] ObjectError),
}

/// What the convergence core needs to know about a managed object. Implemented once per kind.
pub trait ManagedObject: Send + Sync {
    /// apiVersion/kind/namespace/name of the object itself.
    fn identity(&self) -> ResourceRef;
    fn generation(&self) -> Option<i64>;
    fn annotations(&self) -> BTreeMap<String, String>;
    fn finalizers(&self) -> Vec<String>;
    fn is_deleting(&self) -> bool;

    fn depends_on(&self) -> &[Dependency];
    fn wait(&self) -> bool;
    fn timeout(&self) -> Option<&str>;
    fn interval(&self) -> Option<&str>;

    fn artifact(&self) -> Option<&ArtifactSource> { None }

    /// Kinds never garbage collected for this object, whatever the inventory says.
    fn prune_skip_kinds(&self) -> Vec<String> { Vec::new() }

    fn status(&self) -> &ManagedStatus;
    fn status_mut(&mut self) -> &mut ManagedStatus;

    /// Render the desired resources. Pure and deterministic.
    fn render(&self, inputs: &BuildInputs) -> Result<Vec<Json>, BuildError>;

    fn conditions(&self) -> &Conditions { &self.status().conditions }
    fn conditions_mut(&mut self) -> &mut Conditions { &mut self.status_mut().conditions }

    fn has_finalizer(&self) -> bool { self.finalizers().iter().any(|f| f == FINALIZER) }

    fn namespace(&self) -> String { self.identity().namespace.unwrap_or_default() }
    fn name(&self) -> String { self.identity().name }

    /// Namespace injected into rendered namespaced resources that do not set one.
    fn target_namespace(&self) -> String { self.namespace() }
}

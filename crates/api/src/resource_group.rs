use std::collections::BTreeMap;

use keel_core::{BuildError, BuildInputs, Dependency, ManagedObject, ManagedStatus, ResourceRef};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::builder::{apply_common_metadata, apply_patches, render_value, CommonMetadata, ResourcePatch, TemplateVars};

/// A set of inline resources applied together, optionally once per input set.
#[derive(CustomResource, Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[kube(
    group = "keel.dev",
    version = "v1",
    kind = "ResourceGroup",
    namespaced,
    status = "ManagedStatus",
    shortname = "rg",
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#,
    printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.conditions[?(@.type==\"Ready\")].message"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ResourceGroupSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub common_metadata: Option<CommonMetadata>,
    /// One copy of `resources` is rendered per entry, with `<< inputs.KEY >>` bound to it.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inputs: Vec<BTreeMap<String, String>>,
    #[serde(default)]
    #[schemars(schema_with = "crate::preserve_unknown_list")]
    pub resources: Vec<Json>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub patches: Vec<ResourcePatch>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<Dependency>,
    /// Wait for applied resources to become ready.
    #[serde(default)]
    pub wait: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,
}

impl ManagedObject for ResourceGroup {
    fn identity(&self) -> ResourceRef {
        ResourceRef::new("keel.dev/v1", "ResourceGroup", self.metadata.namespace.as_deref(), self.metadata.name.as_deref().unwrap_or_default())
    }
    fn generation(&self) -> Option<i64> { self.metadata.generation }
    fn annotations(&self) -> BTreeMap<String, String> { self.metadata.annotations.clone().unwrap_or_default() }
    fn finalizers(&self) -> Vec<String> { self.metadata.finalizers.clone().unwrap_or_default() }
    fn is_deleting(&self) -> bool { self.metadata.deletion_timestamp.is_some() }

    fn depends_on(&self) -> &[Dependency] { &self.spec.depends_on }
    fn wait(&self) -> bool { self.spec.wait }
    fn timeout(&self) -> Option<&str> { self.spec.timeout.as_deref() }
    fn interval(&self) -> Option<&str> { self.spec.interval.as_deref() }

    fn status(&self) -> &ManagedStatus { self.status.as_ref().unwrap_or(&crate::EMPTY_STATUS) }
    fn status_mut(&mut self) -> &mut ManagedStatus { self.status.get_or_insert_with(ManagedStatus::default) }

    fn render(&self, _inputs: &BuildInputs) -> Result<Vec<Json>, BuildError> {
        let sets = if self.spec.inputs.is_empty() { vec![BTreeMap::new()] } else { self.spec.inputs.clone() };
        let mut out = Vec::with_capacity(sets.len() * self.spec.resources.len());
        for set in sets {
            let vars = TemplateVars::new().with("inputs", set);
            for r in &self.spec.resources {
                out.push(render_value(r, &vars)?);
            }
        }
        if let Some(common) = &self.spec.common_metadata {
            apply_common_metadata(&mut out, common);
        }
        apply_patches(&mut out, &self.spec.patches)?;
        Ok(out)
    }
}

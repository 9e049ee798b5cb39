use std::collections::BTreeMap;

use keel_core::{ArtifactSource, BuildError, BuildInputs, Dependency, ManagedObject, ManagedStatus, ResourceRef};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::builder::{apply_patches, parse_manifests, render_value, ResourcePatch, TemplateVars};

fn default_wait() -> bool { true }

/// Installer for a software distribution pinned to an OCI artifact.
#[derive(CustomResource, Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[kube(
    group = "keel.dev",
    version = "v1",
    kind = "Distribution",
    namespaced,
    status = "ManagedStatus",
    shortname = "dist",
    printcolumn = r#"{"name":"Version","type":"string","jsonPath":".spec.version"}"#,
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct DistributionSpec {
    pub artifact: ArtifactSource,
    pub version: String,
    /// Namespace for namespaced resources that do not set one. Defaults to the object's namespace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_namespace: Option<String>,
    /// Multi-document YAML with `<< distribution.digest|name|namespace|version >>` placeholders.
    pub manifests: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub patches: Vec<ResourcePatch>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<Dependency>,
    #[serde(default = "default_wait")]
    pub wait: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,
}

impl Distribution {
    fn vars(&self, inputs: &BuildInputs) -> TemplateVars {
        let mut values = BTreeMap::from([
            ("name".to_string(), self.metadata.name.clone().unwrap_or_default()),
            ("namespace".to_string(), self.target_namespace()),
            ("version".to_string(), self.spec.version.clone()),
        ]);
        if let Some(d) = &inputs.artifact_digest {
            values.insert("digest".to_string(), d.clone());
        }
        TemplateVars::new().with("distribution", values)
    }
}

impl ManagedObject for Distribution {
    fn identity(&self) -> ResourceRef {
        ResourceRef::new("keel.dev/v1", "Distribution", self.metadata.namespace.as_deref(), self.metadata.name.as_deref().unwrap_or_default())
    }
    fn generation(&self) -> Option<i64> { self.metadata.generation }
    fn annotations(&self) -> BTreeMap<String, String> { self.metadata.annotations.clone().unwrap_or_default() }
    fn finalizers(&self) -> Vec<String> { self.metadata.finalizers.clone().unwrap_or_default() }
    fn is_deleting(&self) -> bool { self.metadata.deletion_timestamp.is_some() }

    fn depends_on(&self) -> &[Dependency] { &self.spec.depends_on }
    fn wait(&self) -> bool { self.spec.wait }
    fn timeout(&self) -> Option<&str> { self.spec.timeout.as_deref() }
    fn interval(&self) -> Option<&str> { self.spec.interval.as_deref() }
    fn artifact(&self) -> Option<&ArtifactSource> { Some(&self.spec.artifact) }

    // Uninstalling must not take CRDs (and every custom resource with them) or namespaces along
    fn prune_skip_kinds(&self) -> Vec<String> {
        vec!["apiextensions.k8s.io/CustomResourceDefinition".to_string(), "Namespace".to_string()]
    }

    fn target_namespace(&self) -> String {
        self.spec.target_namespace.clone().unwrap_or_else(|| self.metadata.namespace.clone().unwrap_or_default())
    }

    fn status(&self) -> &ManagedStatus { self.status.as_ref().unwrap_or(&crate::EMPTY_STATUS) }
    fn status_mut(&mut self) -> &mut ManagedStatus { self.status.get_or_insert_with(ManagedStatus::default) }

    fn render(&self, inputs: &BuildInputs) -> Result<Vec<Json>, BuildError> {
        let vars = self.vars(inputs);
        let mut out = parse_manifests(&self.spec.manifests)?
            .iter()
            .map(|doc| render_value(doc, &vars))
            .collect::<Result<Vec<_>, _>>()?;
        apply_patches(&mut out, &self.spec.patches)?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFESTS: &str = r#"
apiVersion: v1
kind: Namespace
metadata:
  name: << distribution.namespace >>
---
apiVersion: apps/v1
kind: Deployment
metadata:
  name: << distribution.name >>-controller
  labels:
    app.kubernetes.io/version: "<< distribution.version >>"
spec:
  template:
    spec:
      containers:
        - name: manager
          image: ghcr.io/acme/platform@<< distribution.digest >>
"#;

    fn dist() -> Distribution {
        let mut d = Distribution::new(
            "platform",
            DistributionSpec {
                artifact: ArtifactSource { url: "oci://ghcr.io/acme/platform:1.2".into(), ..Default::default() },
                version: "1.2.0".into(),
                target_namespace: Some("platform-system".into()),
                manifests: MANIFESTS.into(),
                wait: true,
                ..Default::default()
            },
        );
        d.metadata.namespace = Some("keel-system".into());
        d
    }

    #[test]
    fn renders_with_digest_and_target_namespace() {
        let inputs = BuildInputs { artifact_digest: Some("sha256:abc".into()) };
        let out = dist().render(&inputs).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0]["metadata"]["name"], "platform-system");
        assert_eq!(out[1]["metadata"]["name"], "platform-controller");
        assert_eq!(out[1]["metadata"]["labels"]["app.kubernetes.io/version"], "1.2.0");
        assert_eq!(out[1]["spec"]["template"]["spec"]["containers"][0]["image"], "ghcr.io/acme/platform@sha256:abc");
    }

    #[test]
    fn unresolved_digest_is_a_build_error() {
        assert!(matches!(dist().render(&BuildInputs::default()), Err(BuildError::Template(_))));
    }

    #[test]
    fn installer_defaults() {
        let d = dist();
        assert_eq!(d.target_namespace(), "platform-system");
        assert!(d.prune_skip_kinds().iter().any(|k| k == "Namespace"));
        assert_eq!(d.artifact().map(|a| a.url.as_str()), Some("oci://ghcr.io/acme/platform:1.2"));
        let spec: DistributionSpec = serde_json::from_value(serde_json::json!({
            "artifact": { "url": "oci://r/a:1" }, "version": "1", "manifests": ""
        }))
        .unwrap();
        assert!(spec.wait);
    }
}

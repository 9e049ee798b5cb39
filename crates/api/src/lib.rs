//! Keel custom resources.
//!
//! `ResourceGroup` applies inline resources; `Distribution` installs a manifest bundle
//! pinned to an OCI artifact. Both implement [`keel_core::ManagedObject`] and share
//! the builders in [`builder`].

#![forbid(unsafe_code)]

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use keel_core::json::canonicalize;
use keel_core::ManagedStatus;
use kube::CustomResourceExt;
use once_cell::sync::Lazy;
use schemars::gen::SchemaGenerator;
use schemars::schema::{ArrayValidation, InstanceType, Schema, SchemaObject};
use serde_json::Value as Json;

pub mod builder;
mod distribution;
mod resource_group;

pub use distribution::{Distribution, DistributionSpec};
pub use resource_group::{ResourceGroup, ResourceGroupSpec};

pub const GROUP: &str = "keel.dev";
pub const VERSION: &str = "v1";

pub(crate) static EMPTY_STATUS: Lazy<ManagedStatus> = Lazy::new(ManagedStatus::default);

fn object_preserving_unknown() -> SchemaObject {
    let mut obj = SchemaObject { instance_type: Some(InstanceType::Object.into()), ..Default::default() };
    obj.extensions.insert("x-kubernetes-preserve-unknown-fields".to_string(), Json::Bool(true));
    obj
}

pub(crate) fn preserve_unknown_object(_: &mut SchemaGenerator) -> Schema { Schema::Object(object_preserving_unknown()) }

pub(crate) fn preserve_unknown_list(_: &mut SchemaGenerator) -> Schema {
    Schema::Object(SchemaObject {
        instance_type: Some(InstanceType::Array.into()),
        array: Some(Box::new(ArrayValidation {
            items: Some(Schema::Object(object_preserving_unknown()).into()),
            ..Default::default()
        })),
        ..Default::default()
    })
}

/// Content revision of a rendered resource set: `blake3:<hex>` over its canonical form.
pub fn revision(resources: &[Json]) -> String {
    let mut hasher = blake3::Hasher::new();
    for r in resources {
        let canonical = canonicalize(r.clone()).to_string();
        hasher.update(canonical.as_bytes());
        hasher.update(b"\n");
    }
    format!("blake3:{}", hasher.finalize().to_hex())
}

pub fn crds() -> Vec<CustomResourceDefinition> { vec![ResourceGroup::crd(), Distribution::crd()] }

/// All CRDs as one multi-document YAML stream.
pub fn crds_yaml() -> Result<String, serde_yaml::Error> {
    let docs = crds().iter().map(serde_yaml::to_string).collect::<Result<Vec<_>, _>>()?;
    Ok(docs.join("---\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn revision_ignores_key_order() {
        let a = vec![json!({ "kind": "ConfigMap", "metadata": { "name": "a" }, "data": { "x": "1", "y": "2" } })];
        let b = vec![json!({ "data": { "y": "2", "x": "1" }, "metadata": { "name": "a" }, "kind": "ConfigMap" })];
        assert_eq!(revision(&a), revision(&b));
        assert!(revision(&a).starts_with("blake3:"));
        let c = vec![json!({ "kind": "ConfigMap", "metadata": { "name": "a" }, "data": { "x": "2" } })];
        assert_ne!(revision(&a), revision(&c));
    }

    #[test]
    fn crds_carry_group_and_status_subresource() {
        let crds = crds();
        assert_eq!(crds.len(), 2);
        for crd in &crds {
            assert_eq!(crd.spec.group, GROUP);
            let v = &crd.spec.versions[0];
            assert_eq!(v.name, VERSION);
            assert!(v.subresources.as_ref().and_then(|s| s.status.as_ref()).is_some());
        }
        assert_eq!(crds[0].spec.names.kind, "ResourceGroup");
        let yaml = crds_yaml().unwrap();
        assert!(yaml.contains("x-kubernetes-preserve-unknown-fields"));
        assert_eq!(yaml.matches("kind: CustomResourceDefinition").count(), 2);
    }
}

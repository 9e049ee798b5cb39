//! Resource builders shared by the custom resources: placeholder substitution,
//! multi-document manifest parsing, common metadata and targeted merge patches.

use std::collections::BTreeMap;

use keel_core::json::{merge_patch, namespace, set_annotation, set_label};
use keel_core::{BuildError, ResourceRef};
use once_cell::sync::Lazy;
use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<<\s*([A-Za-z_][A-Za-z0-9_]*)\.([A-Za-z0-9_-]+)\s*>>").expect("static regex"));

pub fn max_manifest_bytes() -> usize {
    std::env::var("KEEL_MAX_MANIFEST_BYTES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(4 * 1024 * 1024)
}

/// Placeholder values, grouped by prefix (`inputs`, `distribution`).
#[derive(Debug, Clone, Default)]
pub struct TemplateVars(BTreeMap<String, BTreeMap<String, String>>);

impl TemplateVars {
    pub fn new() -> Self { Self::default() }

    pub fn with(mut self, prefix: &str, values: BTreeMap<String, String>) -> Self {
        self.0.insert(prefix.to_string(), values);
        self
    }

    pub fn lookup(&self, prefix: &str, key: &str) -> Option<&str> {
        self.0.get(prefix).and_then(|m| m.get(key)).map(|s| s.as_str())
    }
}

/// Replace every `<< prefix.key >>` in `s`. Unknown keys are errors.
pub fn substitute(s: &str, vars: &TemplateVars) -> Result<String, BuildError> {
    let mut out = String::with_capacity(s.len());
    let mut last = 0;
    for cap in PLACEHOLDER.captures_iter(s) {
        let Some(whole) = cap.get(0) else { continue };
        let value = vars
            .lookup(&cap[1], &cap[2])
            .ok_or_else(|| BuildError::Template(format!("unknown placeholder {}.{}", &cap[1], &cap[2])))?;
        out.push_str(&s[last..whole.start()]);
        out.push_str(value);
        last = whole.end();
    }
    out.push_str(&s[last..]);
    Ok(out)
}

/// Substitute placeholders in every string leaf of `v`.
pub fn render_value(v: &Json, vars: &TemplateVars) -> Result<Json, BuildError> {
    Ok(match v {
        Json::String(s) => Json::String(substitute(s, vars)?),
        Json::Array(items) => Json::Array(items.iter().map(|i| render_value(i, vars)).collect::<Result<_, _>>()?),
        Json::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), render_value(v, vars)?);
            }
            Json::Object(out)
        }
        other => other.clone(),
    })
}

/// Split a multi-document YAML stream into objects. Empty documents are skipped and
/// `kind: List` documents are flattened.
pub fn parse_manifests(yaml: &str) -> Result<Vec<Json>, BuildError> {
    if yaml.len() > max_manifest_bytes() {
        return Err(BuildError::Manifest(format!("manifests too large (>{} bytes)", max_manifest_bytes())));
    }
    let mut out = Vec::new();
    for (i, doc) in serde_yaml::Deserializer::from_str(yaml).enumerate() {
        let val = serde_yaml::Value::deserialize(doc).map_err(|e| BuildError::Manifest(format!("document {}: {}", i + 1, e)))?;
        if val.is_null() {
            continue;
        }
        let json = serde_json::to_value(val).map_err(|e| BuildError::Manifest(format!("document {}: {}", i + 1, e)))?;
        if !json.is_object() {
            return Err(BuildError::Manifest(format!("document {} is not a map", i + 1)));
        }
        match json.get("kind").and_then(|k| k.as_str()) {
            Some("List") => {
                let items = json.get("items").and_then(|i| i.as_array()).cloned().unwrap_or_default();
                out.extend(items);
            }
            _ => out.push(json),
        }
    }
    tracing::debug!(objects = out.len(), bytes = yaml.len(), "parsed manifests");
    Ok(out)
}

/// Labels and annotations added to every rendered resource.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CommonMetadata {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

pub fn apply_common_metadata(resources: &mut [Json], common: &CommonMetadata) {
    for r in resources.iter_mut() {
        for (k, v) in &common.labels {
            set_label(r, k, v);
        }
        for (k, v) in &common.annotations {
            set_annotation(r, k, v);
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PatchTarget {
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

impl PatchTarget {
    fn matches(&self, obj: &Json) -> bool {
        let Ok(r) = ResourceRef::from_object(obj) else { return false };
        r.kind == self.kind
            && self.name.as_ref().map(|n| *n == r.name).unwrap_or(true)
            && self.namespace.as_ref().map(|ns| Some(ns.as_str()) == namespace(obj)).unwrap_or(true)
    }
}

/// RFC 7386 merge patch applied to every resource matching `target`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourcePatch {
    pub target: PatchTarget,
    #[schemars(schema_with = "crate::preserve_unknown_object")]
    pub patch: Json,
}

pub fn apply_patches(resources: &mut [Json], patches: &[ResourcePatch]) -> Result<(), BuildError> {
    for p in patches {
        let target = match &p.target.name {
            Some(n) => format!("{}/{}", p.target.kind, n),
            None => p.target.kind.clone(),
        };
        if !p.patch.is_object() {
            return Err(BuildError::Patch(format!("patch for {} must be an object", target)));
        }
        let mut matched = 0usize;
        for r in resources.iter_mut().filter(|r| p.target.matches(r)) {
            merge_patch(r, &p.patch);
            matched += 1;
        }
        if matched == 0 {
            return Err(BuildError::Patch(format!("target {} matched no resource", target)));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vars() -> TemplateVars {
        TemplateVars::new().with("inputs", BTreeMap::from([("env".to_string(), "prod".to_string())]))
    }

    #[test]
    fn substitutes_known_placeholders() {
        assert_eq!(substitute("app-<< inputs.env >>-<<inputs.env>>", &vars()).unwrap(), "app-prod-prod");
        assert_eq!(substitute("no placeholders", &vars()).unwrap(), "no placeholders");
    }

    #[test]
    fn unknown_placeholder_is_an_error() {
        let err = substitute("<< inputs.region >>", &vars()).unwrap_err();
        assert_eq!(err, BuildError::Template("unknown placeholder inputs.region".into()));
        assert!(substitute("<< distribution.digest >>", &vars()).is_err());
    }

    #[test]
    fn renders_nested_string_leaves_only() {
        let v = json!({ "metadata": { "name": "cfg-<< inputs.env >>" }, "data": { "n": 3, "l": ["<< inputs.env >>"] } });
        let out = render_value(&v, &vars()).unwrap();
        assert_eq!(out, json!({ "metadata": { "name": "cfg-prod" }, "data": { "n": 3, "l": ["prod"] } }));
    }

    #[test]
    fn parses_multi_document_streams() {
        let yaml = "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: a\n---\n---\napiVersion: v1\nkind: List\nitems:\n- apiVersion: v1\n  kind: Secret\n  metadata:\n    name: b\n";
        let docs = parse_manifests(yaml).unwrap();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[1]["kind"], "Secret");
        assert!(parse_manifests("- a\n- b\n").is_err());
        assert!(matches!(parse_manifests("a: [").unwrap_err(), BuildError::Manifest(_)));
    }

    #[test]
    fn patches_hit_matching_targets() {
        let mut res = vec![
            json!({ "apiVersion": "apps/v1", "kind": "Deployment", "metadata": { "name": "web" }, "spec": { "replicas": 1 } }),
            json!({ "apiVersion": "apps/v1", "kind": "Deployment", "metadata": { "name": "api" }, "spec": { "replicas": 1 } }),
        ];
        let p = ResourcePatch {
            target: PatchTarget { kind: "Deployment".into(), name: Some("web".into()), namespace: None },
            patch: json!({ "spec": { "replicas": 3 } }),
        };
        apply_patches(&mut res, &[p]).unwrap();
        assert_eq!(res[0]["spec"]["replicas"], 3);
        assert_eq!(res[1]["spec"]["replicas"], 1);
    }

    #[test]
    fn bad_patches_are_build_errors() {
        let mut res = vec![json!({ "apiVersion": "v1", "kind": "ConfigMap", "metadata": { "name": "a" } })];
        let miss = ResourcePatch { target: PatchTarget { kind: "Secret".into(), ..Default::default() }, patch: json!({}) };
        assert!(matches!(apply_patches(&mut res, &[miss]), Err(BuildError::Patch(_))));
        let scalar = ResourcePatch { target: PatchTarget { kind: "ConfigMap".into(), ..Default::default() }, patch: json!("x") };
        assert!(matches!(apply_patches(&mut res, &[scalar]), Err(BuildError::Patch(_))));
    }

    #[test]
    fn common_metadata_is_stamped() {
        let mut res = vec![json!({ "apiVersion": "v1", "kind": "ConfigMap", "metadata": { "name": "a" } })];
        let common = CommonMetadata { labels: BTreeMap::from([("team".into(), "core".into())]), annotations: BTreeMap::new() };
        apply_common_metadata(&mut res, &common);
        assert_eq!(res[0]["metadata"]["labels"]["team"], "core");
    }
}

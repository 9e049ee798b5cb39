//! Unstructured JSON helpers: canonical form, metadata accessors and merge patches.

use std::collections::BTreeMap;

use base64::Engine as _;
use serde_json::{Map, Value as Json};

use crate::{ObjectError, ResourceRef};

pub fn max_object_nodes() -> usize {
    std::env::var("KEEL_MAX_OBJECT_NODES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(100_000)
}

pub fn node_budget_exceeded(v: &Json, max: usize) -> bool {
    // Bail as soon as the running count reaches max
    fn walk(v: &Json, cur: &mut usize, max: usize) {
        if *cur >= max { return; }
        *cur += 1;
        match v {
            Json::Object(map) => {
                for vv in map.values() {
                    if *cur >= max { break; }
                    walk(vv, cur, max);
                }
            }
            Json::Array(arr) => {
                for vv in arr.iter() {
                    if *cur >= max { break; }
                    walk(vv, cur, max);
                }
            }
            _ => {}
        }
    }
    let mut count = 0usize;
    walk(v, &mut count, max);
    count >= max
}

/// Drop server-populated fields so live and desired documents compare cleanly.
pub fn strip_server_fields(v: &mut Json) {
    if let Some(meta) = v.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        for k in ["managedFields", "resourceVersion", "generation", "creationTimestamp", "uid", "selfLink"] {
            meta.remove(k);
        }
    }
    if let Some(obj) = v.as_object_mut() {
        obj.remove("status");
    }
}

/// Recursively rebuild maps in sorted key order.
pub fn canonicalize(v: Json) -> Json {
    match v {
        Json::Object(map) => {
            let sorted: BTreeMap<String, Json> = map.into_iter().map(|(k, v)| (k, canonicalize(v))).collect();
            Json::Object(sorted.into_iter().collect::<Map<String, Json>>())
        }
        Json::Array(arr) => Json::Array(arr.into_iter().map(canonicalize).collect()),
        other => other,
    }
}

/// Canonical form of a desired object. Pure: no namespace defaulting here, that needs
/// scope information from the store.
pub fn normalize(mut obj: Json, max_nodes: usize) -> Result<Json, ObjectError> {
    let id = ResourceRef::from_object(&obj)?;
    if node_budget_exceeded(&obj, max_nodes) {
        return Err(ObjectError::TooComplex { id: id.to_string(), max: max_nodes });
    }
    strip_server_fields(&mut obj);
    if id.group.is_empty() && id.kind == "Secret" {
        fold_string_data(&mut obj).map_err(|reason| ObjectError::Invalid { id: id.to_string(), reason })?;
    }
    if let Some(meta) = obj.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        for k in ["labels", "annotations"] {
            let empty = meta.get(k).map(|v| v.is_null() || v.as_object().map(|m| m.is_empty()).unwrap_or(false)).unwrap_or(false);
            if empty {
                meta.remove(k);
            }
        }
        if meta.get("namespace").and_then(|v| v.as_str()) == Some("") {
            meta.remove("namespace");
        }
    }
    Ok(canonicalize(obj))
}

/// Move `stringData` entries into base64 `data`, like the API server does on write.
fn fold_string_data(obj: &mut Json) -> Result<(), String> {
    let Some(map) = obj.as_object_mut() else { return Ok(()) };
    let Some(sd) = map.remove("stringData") else { return Ok(()) };
    let sd = sd.as_object().cloned().ok_or_else(|| "stringData must be a map".to_string())?;
    let data = map.entry("data").or_insert_with(|| Json::Object(Map::new()));
    let data = data.as_object_mut().ok_or_else(|| "data must be a map".to_string())?;
    for (k, v) in sd {
        let s = v.as_str().ok_or_else(|| format!("stringData.{} must be a string", k))?;
        data.insert(k, Json::String(base64::engine::general_purpose::STANDARD.encode(s.as_bytes())));
    }
    Ok(())
}

pub fn namespace(obj: &Json) -> Option<&str> {
    obj.get("metadata").and_then(|m| m.get("namespace")).and_then(|v| v.as_str()).filter(|s| !s.is_empty())
}

pub fn set_namespace(obj: &mut Json, ns: &str) {
    if let Some(meta) = metadata_mut(obj) {
        meta.insert("namespace".into(), Json::String(ns.to_string()));
    }
}

pub fn clear_namespace(obj: &mut Json) {
    if let Some(meta) = metadata_mut(obj) {
        meta.remove("namespace");
    }
}

fn metadata_mut(obj: &mut Json) -> Option<&mut Map<String, Json>> {
    let map = obj.as_object_mut()?;
    map.entry("metadata").or_insert_with(|| Json::Object(Map::new())).as_object_mut()
}

fn string_map(obj: &Json, key: &str) -> BTreeMap<String, String> {
    obj.get("metadata")
        .and_then(|m| m.get(key))
        .and_then(|m| m.as_object())
        .map(|m| m.iter().filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string()))).collect())
        .unwrap_or_default()
}

pub fn labels(obj: &Json) -> BTreeMap<String, String> { string_map(obj, "labels") }
pub fn annotations(obj: &Json) -> BTreeMap<String, String> { string_map(obj, "annotations") }

fn set_in(obj: &mut Json, key: &str, k: &str, v: &str) {
    if let Some(meta) = metadata_mut(obj) {
        let m = meta.entry(key).or_insert_with(|| Json::Object(Map::new()));
        if !m.is_object() {
            *m = Json::Object(Map::new());
        }
        if let Some(m) = m.as_object_mut() {
            m.insert(k.to_string(), Json::String(v.to_string()));
        }
    }
}

pub fn set_label(obj: &mut Json, k: &str, v: &str) { set_in(obj, "labels", k, v) }
pub fn set_annotation(obj: &mut Json, k: &str, v: &str) { set_in(obj, "annotations", k, v) }

/// Remove the given label/annotation keys; returns true when something was removed.
pub fn remove_metadata_keys(obj: &mut Json, annotations: &[String], labels: &[String]) -> bool {
    let mut removed = false;
    if let Some(meta) = obj.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        for (field, keys) in [("annotations", annotations), ("labels", labels)] {
            if let Some(m) = meta.get_mut(field).and_then(|m| m.as_object_mut()) {
                for k in keys {
                    removed |= m.remove(k).is_some();
                }
            }
        }
    }
    removed
}

/// RFC 7386 JSON merge patch.
pub fn merge_patch(target: &mut Json, patch: &Json) {
    match patch {
        Json::Object(pm) => {
            if !target.is_object() {
                *target = Json::Object(Map::new());
            }
            if let Some(tm) = target.as_object_mut() {
                for (k, pv) in pm {
                    if pv.is_null() {
                        tm.remove(k);
                    } else {
                        merge_patch(tm.entry(k.clone()).or_insert(Json::Null), pv);
                    }
                }
            }
        }
        other => *target = other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn normalize_prunes_server_fields_and_empty_maps() {
        let v = json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {
                "name": "x",
                "namespace": "",
                "labels": {},
                "managedFields": [ {"foo": "bar"} ],
                "resourceVersion": "123",
                "generation": 5,
                "creationTimestamp": "2020-01-01T00:00:00Z"
            },
            "status": { "obs": true },
            "data": { "k": "v" }
        });
        let n = normalize(v, 1000).unwrap();
        let meta = n["metadata"].as_object().unwrap();
        assert_eq!(meta.keys().collect::<Vec<_>>(), vec!["name"]);
        assert!(n.get("status").is_none());
        assert_eq!(n["data"]["k"], "v");
    }

    #[test]
    fn normalize_folds_secret_string_data() {
        let v = json!({ "apiVersion": "v1", "kind": "Secret", "metadata": { "name": "s" }, "stringData": { "token": "abc" }, "data": { "x": "eA==" } });
        let n = normalize(v, 1000).unwrap();
        assert!(n.get("stringData").is_none());
        assert_eq!(n["data"]["token"], "YWJj");
        assert_eq!(n["data"]["x"], "eA==");
    }

    #[test]
    fn normalize_rejects_oversized_and_malformed() {
        let big = json!({ "apiVersion": "v1", "kind": "ConfigMap", "metadata": { "name": "x" }, "data": { "a": "1", "b": "2", "c": "3" } });
        assert!(matches!(normalize(big, 4), Err(ObjectError::TooComplex { .. })));
        assert_eq!(normalize(json!({ "kind": "ConfigMap" }), 100), Err(ObjectError::Missing("apiVersion")));
    }

    #[test]
    fn normalize_is_insensitive_to_key_order() {
        let a: Json = serde_json::from_str(r#"{"kind":"ConfigMap","apiVersion":"v1","metadata":{"name":"x"},"data":{"b":"2","a":"1"}}"#).unwrap();
        let b: Json = serde_json::from_str(r#"{"apiVersion":"v1","data":{"a":"1","b":"2"},"metadata":{"name":"x"},"kind":"ConfigMap"}"#).unwrap();
        assert_eq!(
            serde_json::to_string(&normalize(a, 100).unwrap()).unwrap(),
            serde_json::to_string(&normalize(b, 100).unwrap()).unwrap()
        );
    }

    #[test]
    fn merge_patch_follows_rfc7386() {
        let mut t = json!({ "a": "b", "c": { "d": "e", "f": "g" } });
        merge_patch(&mut t, &json!({ "a": "z", "c": { "f": null } }));
        assert_eq!(t, json!({ "a": "z", "c": { "d": "e" } }));
        let mut t = json!({ "a": [1, 2] });
        merge_patch(&mut t, &json!({ "a": [3] }));
        assert_eq!(t, json!({ "a": [3] }));
    }

    #[test]
    fn metadata_helpers_round_trip() {
        let mut o = json!({ "metadata": { "name": "x", "annotations": { "kubectl.kubernetes.io/last-applied-configuration": "{}" } } });
        set_label(&mut o, "keel.dev/name", "app");
        set_annotation(&mut o, "a", "b");
        assert_eq!(labels(&o).get("keel.dev/name").map(|s| s.as_str()), Some("app"));
        assert!(remove_metadata_keys(&mut o, &["kubectl.kubernetes.io/last-applied-configuration".to_string()], &[]));
        assert!(!remove_metadata_keys(&mut o, &["missing".to_string()], &["missing".to_string()]));
        assert_eq!(annotations(&o).len(), 1);
    }
}

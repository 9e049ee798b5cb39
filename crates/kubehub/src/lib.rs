//! Keel kubehub: the live-cluster [`ClusterStore`] built on kube-rs.
//!
//! Objects are addressed dynamically (`DynamicObject` + discovery), applied with
//! server-side apply under a single field manager and deleted with background propagation.

#![forbid(unsafe_code)]

use std::sync::RwLock;

use async_trait::async_trait;
use keel_core::json::{canonicalize, merge_patch, remove_metadata_keys, strip_server_fields};
use keel_core::store::{ApplyOptions, ApplyPolicy, DeleteOptions};
use keel_core::{ChangeAction, ChangeSet, ClusterStore, ResourceRef, StoreError};
use kube::{
    api::{Api, DeleteParams, Patch, PatchParams},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::{self, Scope},
    Client,
};
use metrics::{counter, histogram};
use rustc_hash::FxHashMap;
use serde_json::{json, Value as Json};
use tracing::{debug, info, warn};

pub async fn get_kube_client() -> anyhow::Result<Client> {
    Ok(Client::try_default().await?)
}

fn map_kube_err(r: &ResourceRef, e: kube::Error) -> StoreError {
    match e {
        kube::Error::Api(ae) if ae.code == 404 => StoreError::NotFound(r.to_string()),
        kube::Error::Api(ae) if ae.code == 409 => StoreError::Conflict { object: r.to_string(), message: ae.message },
        kube::Error::Api(ae) => StoreError::Api { object: r.to_string(), message: ae.message },
        other => StoreError::Transport(format!("{}: {}", r, other)),
    }
}

/// A group/version the server does not serve (404) and a served group/version that lacks
/// the kind (`DiscoveryError`) both mean the kind does not exist yet, or any more.
fn map_discovery_err(key: &str, e: kube::Error) -> StoreError {
    match e {
        kube::Error::Api(ae) if ae.code == 404 => StoreError::UnknownKind(key.to_string()),
        kube::Error::Discovery(_) => StoreError::UnknownKind(key.to_string()),
        other => StoreError::Transport(format!("discovery for {}: {}", key, other)),
    }
}

fn gvk_key(group: &str, version: &str, kind: &str) -> String {
    if group.is_empty() { format!("{}/{}", version, kind) } else { format!("{}/{}/{}", group, version, kind) }
}

/// Reassign managedFields entries owned by takeover managers to `manager`, merging
/// duplicate entries. `None` when there is nothing to take over.
pub fn takeover_managed_fields(live: &Json, manager: &str, takeover: &[String]) -> Option<Vec<Json>> {
    let entries = live.get("metadata")?.get("managedFields")?.as_array()?;
    let foreign = |e: &Json| {
        let m = e.get("manager").and_then(|v| v.as_str()).unwrap_or("");
        let sub = e.get("subresource").and_then(|v| v.as_str()).unwrap_or("");
        sub.is_empty() && takeover.iter().any(|t| t == m)
    };
    if !entries.iter().any(foreign) {
        return None;
    }
    let mut out: Vec<Json> = Vec::with_capacity(entries.len());
    for e in entries {
        let mut e = e.clone();
        if foreign(&e) {
            e["manager"] = json!(manager);
            e["operation"] = json!("Apply");
        }
        let key = |x: &Json| {
            (
                x.get("manager").cloned(),
                x.get("operation").cloned(),
                x.get("apiVersion").cloned(),
                x.get("subresource").cloned(),
            )
        };
        match out.iter_mut().find(|o| key(o) == key(&e)) {
            Some(existing) => {
                if let (Some(target), Some(fields)) = (existing.get_mut("fieldsV1"), e.get("fieldsV1")) {
                    merge_patch(target, fields);
                }
            }
            None => out.push(e),
        }
    }
    Some(out)
}

/// Merge patch nulling out legacy annotation/label keys present on `live`.
pub fn cleanup_patch(live: &Json, opts: &ApplyOptions) -> Option<Json> {
    let mut stripped = live.clone();
    if !remove_metadata_keys(&mut stripped, &opts.cleanup_annotations, &opts.cleanup_labels) {
        return None;
    }
    let present = |field: &str, keys: &[String]| -> serde_json::Map<String, Json> {
        let m = live.get("metadata").and_then(|m| m.get(field)).and_then(|m| m.as_object());
        keys.iter().filter(|k| m.map(|m| m.contains_key(*k)).unwrap_or(false)).map(|k| (k.clone(), Json::Null)).collect()
    };
    Some(json!({
        "metadata": {
            "annotations": present("annotations", &opts.cleanup_annotations),
            "labels": present("labels", &opts.cleanup_labels),
        }
    }))
}

/// [`ClusterStore`] over a kube client. Discovery results are cached per GVK.
pub struct KubeStore {
    client: Client,
    resources: RwLock<FxHashMap<String, (ApiResource, bool)>>,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client, resources: RwLock::new(FxHashMap::default()) }
    }

    pub async fn try_default() -> anyhow::Result<Self> {
        Ok(Self::new(get_kube_client().await?))
    }

    pub fn client(&self) -> Client { self.client.clone() }

    async fn resolve(&self, api_version: &str, kind: &str) -> Result<(ApiResource, bool), StoreError> {
        let (group, version) = keel_core::split_api_version(api_version);
        let key = gvk_key(group, version, kind);
        if let Some(hit) = self.resources.read().unwrap_or_else(|e| e.into_inner()).get(&key) {
            return Ok(hit.clone());
        }
        let gvk = GroupVersionKind { group: group.to_string(), version: version.to_string(), kind: kind.to_string() };
        let (ar, caps) = discovery::pinned_kind(&self.client, &gvk)
            .await
            .map_err(|e| map_discovery_err(&key, e))?;
        let namespaced = matches!(caps.scope, Scope::Namespaced);
        debug!(gvk = %key, namespaced, "discovered api resource");
        self.resources
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key, (ar.clone(), namespaced));
        Ok((ar, namespaced))
    }

    async fn api_for(&self, r: &ResourceRef) -> Result<Api<DynamicObject>, StoreError> {
        let (ar, namespaced) = self.resolve(&r.api_version(), &r.kind).await?;
        if namespaced {
            match r.namespace.as_deref() {
                Some(ns) => Ok(Api::namespaced_with(self.client.clone(), ns, &ar)),
                None => Err(StoreError::Api { object: r.to_string(), message: "namespace required for namespaced kind".into() }),
            }
        } else {
            Ok(Api::all_with(self.client.clone(), &ar))
        }
    }

    async fn apply_one(&self, obj: &Json, opts: &ApplyOptions) -> Result<ChangeAction, StoreError> {
        let r = ResourceRef::from_object(obj).map_err(|e| StoreError::Api { object: "<invalid>".into(), message: e.to_string() })?;
        let api = self.api_for(&r).await?;
        let live = api.get_opt(&r.name).await.map_err(|e| map_kube_err(&r, e))?;
        let live = live.map(|o| serde_json::to_value(&o)).transpose().map_err(|e| StoreError::Transport(e.to_string()))?;

        match (ApplyPolicy::of(obj), &live) {
            (ApplyPolicy::Ignore, _) | (ApplyPolicy::IfNotPresent, Some(_)) => return Ok(ChangeAction::Unmanaged),
            _ => {}
        }

        let mut pp = PatchParams::apply(&opts.field_manager);
        if opts.force {
            pp = pp.force();
        }

        let Some(live) = live else {
            api.patch(&r.name, &pp, &Patch::Apply(obj)).await.map_err(|e| map_kube_err(&r, e))?;
            return Ok(ChangeAction::Created);
        };

        let mut touched = false;
        if let Some(fields) = takeover_managed_fields(&live, &opts.field_manager, &opts.takeover_managers) {
            let rv = live.get("metadata").and_then(|m| m.get("resourceVersion")).cloned().unwrap_or(Json::Null);
            let patch = json!({ "metadata": { "managedFields": fields, "resourceVersion": rv } });
            api.patch(&r.name, &PatchParams::default(), &Patch::Merge(&patch)).await.map_err(|e| map_kube_err(&r, e))?;
            info!(object = %r, "took over fields from foreign managers");
            touched = true;
        }
        if let Some(patch) = cleanup_patch(&live, opts) {
            api.patch(&r.name, &PatchParams::default(), &Patch::Merge(&patch)).await.map_err(|e| map_kube_err(&r, e))?;
            debug!(object = %r, "removed legacy metadata keys");
            touched = true;
        }

        // Dry-run first: only a real difference gets written
        let dry = api.patch(&r.name, &pp.clone().dry_run(), &Patch::Apply(obj)).await.map_err(|e| map_kube_err(&r, e))?;
        let mut after = serde_json::to_value(&dry).map_err(|e| StoreError::Transport(e.to_string()))?;
        let mut before = live;
        strip_server_fields(&mut after);
        strip_server_fields(&mut before);
        if canonicalize(after.clone()) == canonicalize(before.clone()) {
            return Ok(if touched { ChangeAction::Updated } else { ChangeAction::Unchanged });
        }
        debug!(object = %r, "drift detected");
        api.patch(&r.name, &pp, &Patch::Apply(obj)).await.map_err(|e| map_kube_err(&r, e))?;
        Ok(ChangeAction::Updated)
    }
}

#[async_trait]
impl ClusterStore for KubeStore {
    async fn get(&self, r: &ResourceRef) -> Result<Json, StoreError> {
        let api = self.api_for(r).await?;
        let obj = api.get(&r.name).await.map_err(|e| map_kube_err(r, e))?;
        serde_json::to_value(&obj).map_err(|e| StoreError::Transport(e.to_string()))
    }

    async fn is_namespaced(&self, api_version: &str, kind: &str) -> Result<bool, StoreError> {
        Ok(self.resolve(api_version, kind).await?.1)
    }

    async fn apply(&self, objects: &[Json], opts: &ApplyOptions) -> Result<ChangeSet, StoreError> {
        let t0 = std::time::Instant::now();
        let mut cs = ChangeSet::new();
        for obj in objects {
            let r = ResourceRef::from_object(obj).map_err(|e| StoreError::Api { object: "<invalid>".into(), message: e.to_string() })?;
            match self.apply_one(obj, opts).await {
                Ok(action) => cs.push(r, action),
                Err(e) => {
                    counter!("kubehub_apply_err_total", 1u64);
                    return Err(e);
                }
            }
        }
        histogram!("kubehub_apply_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        counter!("kubehub_apply_total", objects.len() as u64);
        Ok(cs)
    }

    async fn delete(&self, refs: &[ResourceRef], opts: &DeleteOptions) -> Result<ChangeSet, StoreError> {
        let mut cs = ChangeSet::new();
        for r in refs {
            let api = match self.api_for(r).await {
                Ok(api) => api,
                // The kind itself is gone (CRD removed): nothing left to delete
                Err(StoreError::UnknownKind(_)) => continue,
                Err(e) => return Err(e),
            };
            let Some(live) = api.get_opt(&r.name).await.map_err(|e| map_kube_err(r, e))? else { continue };
            let live = serde_json::to_value(&live).map_err(|e| StoreError::Transport(e.to_string()))?;
            if !opts.owner.matches(&keel_core::json::labels(&live)) {
                warn!(object = %r, owner = %opts.owner.to_selector_string(), "not deleting object without matching ownership labels");
                cs.push(r.clone(), ChangeAction::Unmanaged);
                continue;
            }
            if opts.is_excluded(&live) {
                info!(object = %r, "prune disabled; keeping object");
                cs.push(r.clone(), ChangeAction::Unmanaged);
                continue;
            }
            match api.delete(&r.name, &DeleteParams::background()).await {
                Ok(_) => cs.push(r.clone(), ChangeAction::Deleted),
                Err(kube::Error::Api(ae)) if ae.code == 404 => {}
                Err(e) => return Err(map_kube_err(r, e)),
            }
        }
        counter!("kubehub_delete_total", cs.count(ChangeAction::Deleted) as u64);
        Ok(cs)
    }

    async fn patch_status(&self, r: &ResourceRef, patch: &Json) -> Result<(), StoreError> {
        let api = self.api_for(r).await?;
        api.patch_status(&r.name, &PatchParams::default(), &Patch::Merge(patch)).await.map_err(|e| map_kube_err(r, e))?;
        Ok(())
    }

    async fn patch_metadata(&self, r: &ResourceRef, patch: &Json) -> Result<(), StoreError> {
        let api = self.api_for(r).await?;
        api.patch(&r.name, &PatchParams::default(), &Patch::Merge(patch)).await.map_err(|e| map_kube_err(r, e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    #[test]
    fn gvk_key_formats_core_and_grouped() {
        assert_eq!(gvk_key("", "v1", "ConfigMap"), "v1/ConfigMap");
        assert_eq!(gvk_key("apps", "v1", "Deployment"), "apps/v1/Deployment");
    }

    #[test]
    fn discovery_misses_are_unknown_kinds() {
        let missing_kind = kube::Error::Discovery(kube::error::DiscoveryError::MissingKind("Widget".into()));
        assert!(matches!(map_discovery_err("example.com/v1/Widget", missing_kind), StoreError::UnknownKind(k) if k == "example.com/v1/Widget"));

        let not_served = kube::Error::Api(ErrorResponse {
            status: "Failure".into(),
            message: "the server could not find the requested resource".into(),
            reason: "NotFound".into(),
            code: 404,
        });
        assert!(matches!(map_discovery_err("example.com/v1/Widget", not_served), StoreError::UnknownKind(_)));

        let forbidden = kube::Error::Api(ErrorResponse {
            status: "Failure".into(),
            message: "forbidden".into(),
            reason: "Forbidden".into(),
            code: 403,
        });
        assert!(matches!(map_discovery_err("example.com/v1/Widget", forbidden), StoreError::Transport(_)));
    }

    #[test]
    fn takeover_renames_and_merges_foreign_entries() {
        let live = json!({ "metadata": { "managedFields": [
            { "manager": "keel", "operation": "Apply", "apiVersion": "v1", "fieldsType": "FieldsV1", "fieldsV1": { "f:data": { "f:a": {} } } },
            { "manager": "kubectl-client-side-apply", "operation": "Update", "apiVersion": "v1", "fieldsType": "FieldsV1", "fieldsV1": { "f:data": { "f:b": {} } } },
            { "manager": "kube-controller-manager", "operation": "Update", "apiVersion": "v1", "fieldsV1": {} },
            { "manager": "kubectl", "operation": "Update", "apiVersion": "v1", "subresource": "status", "fieldsV1": {} }
        ] } });
        let takeover = vec!["kubectl-client-side-apply".to_string(), "kubectl".to_string()];
        let out = takeover_managed_fields(&live, "keel", &takeover).unwrap();
        assert_eq!(out.len(), 3);
        assert_eq!(out[0]["fieldsV1"], json!({ "f:data": { "f:a": {}, "f:b": {} } }));
        assert_eq!(out[1]["manager"], "kube-controller-manager");
        // status subresource entries are left alone
        assert_eq!(out[2]["manager"], "kubectl");
    }

    #[test]
    fn takeover_is_none_without_foreign_managers() {
        let live = json!({ "metadata": { "managedFields": [ { "manager": "keel", "operation": "Apply" } ] } });
        assert!(takeover_managed_fields(&live, "keel", &["kubectl".to_string()]).is_none());
        assert!(takeover_managed_fields(&json!({}), "keel", &[]).is_none());
    }

    #[test]
    fn cleanup_patch_nulls_only_present_keys() {
        let live = json!({ "metadata": {
            "annotations": { "kubectl.kubernetes.io/last-applied-configuration": "{}", "keep": "x" },
            "labels": { "app": "web" }
        } });
        let opts = ApplyOptions::default();
        let patch = cleanup_patch(&live, &opts).unwrap();
        assert_eq!(patch["metadata"]["annotations"], json!({ "kubectl.kubernetes.io/last-applied-configuration": null }));
        assert_eq!(patch["metadata"]["labels"], json!({}));
        let clean = json!({ "metadata": { "annotations": { "keep": "x" } } });
        assert!(cleanup_patch(&clean, &opts).is_none());
    }
}

//! Keel in-RAM cluster store.
//!
//! [`MemStore`] implements [`ClusterStore`] over an immutable [`World`] snapshot that is
//! swapped atomically on every write. Readers never block; writers are serialized.
//! Server-side apply is approximated with merge patches plus per-manager bookkeeping of
//! the last applied document, which is enough to model created/configured/unchanged,
//! field removal, ownership takeover, cascading namespace deletes and finalizers.

#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;
use async_trait::async_trait;
use keel_core::conditions::now_rfc3339;
use keel_core::json::{canonicalize, clear_namespace, labels, merge_patch, remove_metadata_keys, strip_server_fields};
use keel_core::store::{ApplyOptions, ApplyPolicy, DeleteOptions};
use keel_core::{ChangeAction, ChangeSet, ClusterStore, ResourceRef, StoreError};
use metrics::counter;
use rustc_hash::FxHashMap;
use serde_json::{json, Map, Value as Json};
use tracing::debug;

/// Built-in kinds and their scope. More are added with [`MemStore::register_kind`]
/// or by applying a CustomResourceDefinition.
const BUILTIN_KINDS: &[(&str, &str, bool)] = &[
    ("", "Namespace", false),
    ("", "Node", false),
    ("", "PersistentVolume", false),
    ("apiextensions.k8s.io", "CustomResourceDefinition", false),
    ("rbac.authorization.k8s.io", "ClusterRole", false),
    ("rbac.authorization.k8s.io", "ClusterRoleBinding", false),
    ("storage.k8s.io", "StorageClass", false),
    ("scheduling.k8s.io", "PriorityClass", false),
    ("networking.k8s.io", "IngressClass", false),
    ("admissionregistration.k8s.io", "ValidatingWebhookConfiguration", false),
    ("admissionregistration.k8s.io", "MutatingWebhookConfiguration", false),
    ("", "ConfigMap", true),
    ("", "Secret", true),
    ("", "Service", true),
    ("", "ServiceAccount", true),
    ("", "Pod", true),
    ("", "PersistentVolumeClaim", true),
    ("apps", "Deployment", true),
    ("apps", "StatefulSet", true),
    ("apps", "DaemonSet", true),
    ("batch", "Job", true),
    ("batch", "CronJob", true),
    ("rbac.authorization.k8s.io", "Role", true),
    ("rbac.authorization.k8s.io", "RoleBinding", true),
    ("networking.k8s.io", "Ingress", true),
    ("networking.k8s.io", "NetworkPolicy", true),
    ("policy", "PodDisruptionBudget", true),
    ("autoscaling", "HorizontalPodAutoscaler", true),
    ("keel.dev", "ResourceGroup", true),
    ("keel.dev", "Distribution", true),
];

const SEED_NAMESPACES: &[&str] = &["default", "kube-system"];

fn kind_key(group: &str, kind: &str) -> String { format!("{}/{}", group, kind) }

#[derive(Debug, Clone)]
pub struct StoredObject {
    pub object: Json,
    pub managers: BTreeSet<String>,
    /// Last document applied by our field manager; drives field removal.
    applied: Option<Json>,
}

/// One immutable generation of the store.
#[derive(Debug, Clone, Default)]
pub struct World {
    pub epoch: u64,
    objects: FxHashMap<String, StoredObject>,
    kinds: FxHashMap<String, bool>,
    failures: FxHashMap<String, String>,
}

impl World {
    fn seeded() -> Self {
        let mut w = World::default();
        for (g, k, namespaced) in BUILTIN_KINDS {
            w.kinds.insert(kind_key(g, k), *namespaced);
        }
        for ns in SEED_NAMESPACES {
            let r = ResourceRef::new("v1", "Namespace", None, ns);
            let obj = json!({ "apiVersion": "v1", "kind": "Namespace", "metadata": { "name": ns }, "status": { "phase": "Active" } });
            w.insert_raw(&r, obj, BTreeSet::new());
        }
        w
    }

    pub fn len(&self) -> usize { self.objects.len() }
    pub fn is_empty(&self) -> bool { self.objects.is_empty() }

    pub fn get(&self, r: &ResourceRef) -> Option<&StoredObject> {
        let r = self.locate(r).ok()?;
        self.objects.get(&r.id())
    }

    /// All objects of a kind, in no particular order.
    pub fn list(&self, group: &str, kind: &str) -> Vec<&Json> {
        self.objects
            .values()
            .filter(|s| {
                ResourceRef::from_object(&s.object).map(|r| r.group == group && r.kind == kind).unwrap_or(false)
            })
            .map(|s| &s.object)
            .collect()
    }

    fn scope(&self, group: &str, kind: &str) -> Option<bool> { self.kinds.get(&kind_key(group, kind)).copied() }

    fn next_rv(&mut self) -> String {
        self.epoch += 1;
        self.epoch.to_string()
    }

    /// Resolve a reference against the kind table: cluster-scoped refs lose their namespace,
    /// namespaced refs must name one.
    fn locate(&self, r: &ResourceRef) -> Result<ResourceRef, StoreError> {
        let namespaced = self.scope(&r.group, &r.kind).ok_or_else(|| StoreError::UnknownKind(kind_key(&r.group, &r.kind)))?;
        let mut out = r.clone();
        if !namespaced {
            out.namespace = None;
        } else if out.namespace.is_none() {
            return Err(StoreError::Api { object: r.to_string(), message: "namespace required for namespaced kind".into() });
        }
        Ok(out)
    }

    fn namespace_exists(&self, ns: &str) -> bool {
        let r = ResourceRef::new("v1", "Namespace", None, ns);
        self.objects.get(&r.id()).map(|s| !is_deleting(&s.object)).unwrap_or(false)
    }

    fn insert_raw(&mut self, r: &ResourceRef, mut obj: Json, managers: BTreeSet<String>) {
        let rv = self.next_rv();
        if let Some(meta) = obj.get_mut("metadata").and_then(|m| m.as_object_mut()) {
            meta.entry("uid").or_insert_with(|| json!(uuid::Uuid::new_v4().to_string()));
            meta.entry("generation").or_insert(json!(1));
            meta.entry("creationTimestamp").or_insert_with(|| json!(now_rfc3339()));
            meta.insert("resourceVersion".into(), json!(rv));
        }
        self.on_created(&obj);
        self.objects.insert(r.id(), StoredObject { object: obj, managers, applied: None });
    }

    /// CRDs register their kind on creation.
    fn on_created(&mut self, obj: &Json) {
        let Ok(r) = ResourceRef::from_object(obj) else { return };
        if r.group == "apiextensions.k8s.io" && r.kind == "CustomResourceDefinition" {
            let spec = obj.get("spec");
            let group = spec.and_then(|s| s.get("group")).and_then(|v| v.as_str());
            let kind = spec.and_then(|s| s.get("names")).and_then(|n| n.get("kind")).and_then(|v| v.as_str());
            let namespaced = spec.and_then(|s| s.get("scope")).and_then(|v| v.as_str()) != Some("Cluster");
            if let (Some(g), Some(k)) = (group, kind) {
                debug!(group = g, kind = k, namespaced, "registered custom kind");
                self.kinds.insert(kind_key(g, k), namespaced);
            }
        }
    }

    /// Delete honoring finalizers, cascading to namespace contents and custom resources.
    fn remove(&mut self, r: &ResourceRef) {
        let id = r.id();
        let Some(stored) = self.objects.get_mut(&id) else { return };
        let has_finalizers = stored
            .object
            .get("metadata")
            .and_then(|m| m.get("finalizers"))
            .and_then(|f| f.as_array())
            .map(|f| !f.is_empty())
            .unwrap_or(false);
        if has_finalizers {
            if !is_deleting(&stored.object) {
                stored.object["metadata"]["deletionTimestamp"] = json!(now_rfc3339());
                let rv = self.next_rv();
                if let Some(s) = self.objects.get_mut(&id) {
                    s.object["metadata"]["resourceVersion"] = json!(rv);
                }
            }
            return;
        }
        let Some(stored) = self.objects.remove(&id) else { return };
        self.next_rv();
        if r.group.is_empty() && r.kind == "Namespace" {
            let inside: Vec<ResourceRef> = self
                .objects
                .values()
                .filter_map(|s| ResourceRef::from_object(&s.object).ok())
                .filter(|o| o.namespace.as_deref() == Some(r.name.as_str()))
                .collect();
            for o in inside {
                self.remove(&o);
            }
        }
        if r.group == "apiextensions.k8s.io" && r.kind == "CustomResourceDefinition" {
            let spec = stored.object.get("spec");
            let group = spec.and_then(|s| s.get("group")).and_then(|v| v.as_str()).unwrap_or("");
            let kind = spec.and_then(|s| s.get("names")).and_then(|n| n.get("kind")).and_then(|v| v.as_str()).unwrap_or("");
            let owned: Vec<ResourceRef> = self
                .objects
                .values()
                .filter_map(|s| ResourceRef::from_object(&s.object).ok())
                .filter(|o| o.group == group && o.kind == kind)
                .collect();
            for o in owned {
                self.objects.remove(&o.id());
            }
            self.kinds.remove(&kind_key(group, kind));
        }
    }

    fn apply_one(&mut self, obj: &Json, opts: &ApplyOptions) -> Result<(ResourceRef, ChangeAction), StoreError> {
        let r = ResourceRef::from_object(obj).map_err(|e| StoreError::Api { object: "<invalid>".into(), message: e.to_string() })?;
        let r = self.locate(&r)?;
        if let Some(ns) = r.namespace.as_deref() {
            if !self.namespace_exists(ns) {
                return Err(StoreError::Api { object: r.to_string(), message: format!("namespaces \"{}\" not found", ns) });
            }
        }
        if let Some(message) = self.failures.get(&r.id()) {
            return Err(StoreError::Api { object: r.to_string(), message: message.clone() });
        }
        let id = r.id();
        let live = self.objects.get(&id).cloned();
        match (ApplyPolicy::of(obj), &live) {
            (ApplyPolicy::Ignore, _) | (ApplyPolicy::IfNotPresent, Some(_)) => return Ok((r, ChangeAction::Unmanaged)),
            _ => {}
        }

        let mut desired = obj.clone();
        if r.namespace.is_none() {
            clear_namespace(&mut desired);
        }

        let Some(mut stored) = live else {
            let mut created = desired.clone();
            if r.group == "apiextensions.k8s.io" && r.kind == "CustomResourceDefinition" {
                created["status"] = json!({ "conditions": [ { "type": "Established", "status": "True" } ] });
            } else if r.group.is_empty() && r.kind == "Namespace" {
                created["status"] = json!({ "phase": "Active" });
            }
            self.insert_raw(&r, created, BTreeSet::from([opts.field_manager.clone()]));
            if let Some(s) = self.objects.get_mut(&id) {
                s.applied = Some(desired);
            }
            return Ok((r, ChangeAction::Created));
        };

        let mut touched = false;
        let before = stored.managers.len();
        stored.managers.retain(|m| !opts.takeover_managers.contains(m));
        touched |= stored.managers.len() != before;
        stored.managers.insert(opts.field_manager.clone());
        touched |= remove_metadata_keys(&mut stored.object, &opts.cleanup_annotations, &opts.cleanup_labels);

        let mut next = stored.object.clone();
        if let Some(prev) = &stored.applied {
            merge_patch(&mut next, &removals(prev, &desired));
        }
        merge_patch(&mut next, &desired);

        let changed = comparable(&next) != comparable(&stored.object);
        stored.applied = Some(desired);
        if !changed && !touched {
            self.objects.insert(id, stored);
            return Ok((r, ChangeAction::Unchanged));
        }
        if body(&next) != body(&stored.object) {
            let generation = next["metadata"]["generation"].as_i64().unwrap_or(0);
            next["metadata"]["generation"] = json!(generation + 1);
        }
        next["metadata"]["resourceVersion"] = json!(self.next_rv());
        stored.object = next;
        self.objects.insert(id, stored);
        Ok((r, ChangeAction::Updated))
    }

    fn delete_one(&mut self, r: &ResourceRef, opts: &DeleteOptions) -> Option<ChangeAction> {
        // The kind itself is gone (CRD removed): nothing left to delete
        let r = self.locate(r).ok()?;
        let stored = self.objects.get(&r.id())?;
        if !opts.owner.matches(&labels(&stored.object)) {
            debug!(object = %r, "skipping delete of object without matching ownership labels");
            return Some(ChangeAction::Unmanaged);
        }
        if opts.is_excluded(&stored.object) {
            return Some(ChangeAction::Unmanaged);
        }
        self.remove(&r);
        Some(ChangeAction::Deleted)
    }
}

fn is_deleting(obj: &Json) -> bool {
    obj.get("metadata").and_then(|m| m.get("deletionTimestamp")).map(|v| !v.is_null()).unwrap_or(false)
}

fn comparable(v: &Json) -> Json {
    let mut c = v.clone();
    strip_server_fields(&mut c);
    canonicalize(c)
}

/// Everything except metadata and status; a change here bumps `metadata.generation`.
fn body(v: &Json) -> Json {
    let mut c = v.clone();
    if let Some(m) = c.as_object_mut() {
        m.remove("metadata");
        m.remove("status");
    }
    canonicalize(c)
}

/// Merge patch nulling fields present in `prev` but no longer in `desired`.
fn removals(prev: &Json, desired: &Json) -> Json {
    let (Some(p), Some(d)) = (prev.as_object(), desired.as_object()) else { return Json::Object(Map::new()) };
    let mut out = Map::new();
    for (k, pv) in p {
        match d.get(k) {
            None => {
                out.insert(k.clone(), Json::Null);
            }
            Some(dv) if pv.is_object() && dv.is_object() => {
                let nested = removals(pv, dv);
                if nested.as_object().map(|m| !m.is_empty()).unwrap_or(false) {
                    out.insert(k.clone(), nested);
                }
            }
            Some(_) => {}
        }
    }
    Json::Object(out)
}

#[derive(Debug, Default)]
struct Counters {
    gets: AtomicU64,
    lookups: AtomicU64,
    applies: AtomicU64,
    deletes: AtomicU64,
    patches: AtomicU64,
}

/// Number of store calls made, per operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemStoreStats {
    pub gets: u64,
    pub lookups: u64,
    pub applies: u64,
    pub deletes: u64,
    pub patches: u64,
}

impl MemStoreStats {
    pub fn total(&self) -> u64 { self.gets + self.lookups + self.applies + self.deletes + self.patches }
    pub fn mutations(&self) -> u64 { self.applies + self.deletes + self.patches }
}

pub struct MemStore {
    world: ArcSwap<World>,
    writer: Mutex<()>,
    counters: Counters,
}

impl Default for MemStore {
    fn default() -> Self { Self::new() }
}

impl MemStore {
    /// A store with the built-in kinds and the `default` and `kube-system` namespaces.
    pub fn new() -> Self {
        Self { world: ArcSwap::from_pointee(World::seeded()), writer: Mutex::new(()), counters: Counters::default() }
    }

    pub fn snapshot(&self) -> Arc<World> { self.world.load_full() }

    fn commit<R>(&self, f: impl FnOnce(&mut World) -> R) -> R {
        let _guard = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        let mut next = World::clone(&self.world.load());
        let out = f(&mut next);
        self.world.store(Arc::new(next));
        out
    }

    pub fn stats(&self) -> MemStoreStats {
        MemStoreStats {
            gets: self.counters.gets.load(Ordering::Relaxed),
            lookups: self.counters.lookups.load(Ordering::Relaxed),
            applies: self.counters.applies.load(Ordering::Relaxed),
            deletes: self.counters.deletes.load(Ordering::Relaxed),
            patches: self.counters.patches.load(Ordering::Relaxed),
        }
    }

    pub fn register_kind(&self, api_version: &str, kind: &str, namespaced: bool) {
        let (group, _) = keel_core::split_api_version(api_version);
        self.commit(|w| w.kinds.insert(kind_key(group, kind), namespaced));
    }

    /// Store an object as-is, as if created by another client. Replaces any existing object.
    pub fn insert(&self, obj: Json) -> Result<ResourceRef, StoreError> {
        let r = ResourceRef::from_object(&obj).map_err(|e| StoreError::Api { object: "<invalid>".into(), message: e.to_string() })?;
        self.commit(|w| {
            let r = w.locate(&r)?;
            w.insert_raw(&r, obj, BTreeSet::new());
            Ok(r)
        })
    }

    /// Record a foreign field manager on an existing object.
    pub fn add_manager(&self, r: &ResourceRef, manager: &str) -> Result<(), StoreError> {
        self.commit(|w| {
            let r = w.locate(r)?;
            let stored = w.objects.get_mut(&r.id()).ok_or_else(|| StoreError::NotFound(r.to_string()))?;
            stored.managers.insert(manager.to_string());
            Ok(())
        })
    }

    pub fn managers(&self, r: &ResourceRef) -> BTreeSet<String> {
        self.snapshot().get(r).map(|s| s.managers.clone()).unwrap_or_default()
    }

    /// Replace the status of an object, as a workload controller would.
    pub fn set_status(&self, r: &ResourceRef, status: Json) -> Result<(), StoreError> {
        self.commit(|w| {
            let r = w.locate(r)?;
            let rv = w.next_rv();
            let stored = w.objects.get_mut(&r.id()).ok_or_else(|| StoreError::NotFound(r.to_string()))?;
            stored.object["status"] = status;
            stored.object["metadata"]["resourceVersion"] = json!(rv);
            Ok(())
        })
    }

    /// Delete as a user would: finalizers hold the object in a deleting state.
    pub fn request_delete(&self, r: &ResourceRef) -> Result<(), StoreError> {
        self.commit(|w| {
            let r = w.locate(r)?;
            if !w.objects.contains_key(&r.id()) {
                return Err(StoreError::NotFound(r.to_string()));
            }
            w.remove(&r);
            Ok(())
        })
    }

    /// Make every apply touching `r` fail with `message` until [`MemStore::clear_failures`].
    pub fn fail_apply(&self, r: &ResourceRef, message: &str) {
        self.commit(|w| w.failures.insert(r.id(), message.to_string()));
    }

    pub fn clear_failures(&self) {
        self.commit(|w| w.failures.clear());
    }

    pub fn contains(&self, r: &ResourceRef) -> bool { self.snapshot().get(r).is_some() }
}

#[async_trait]
impl ClusterStore for MemStore {
    async fn get(&self, r: &ResourceRef) -> Result<Json, StoreError> {
        self.counters.gets.fetch_add(1, Ordering::Relaxed);
        counter!("memstore_get_total", 1u64);
        let world = self.snapshot();
        let located = world.locate(r)?;
        world.objects.get(&located.id()).map(|s| s.object.clone()).ok_or_else(|| StoreError::NotFound(r.to_string()))
    }

    async fn is_namespaced(&self, api_version: &str, kind: &str) -> Result<bool, StoreError> {
        self.counters.lookups.fetch_add(1, Ordering::Relaxed);
        let (group, _) = keel_core::split_api_version(api_version);
        self.snapshot().scope(group, kind).ok_or_else(|| StoreError::UnknownKind(format!("{}/{}", api_version, kind)))
    }

    async fn apply(&self, objects: &[Json], opts: &ApplyOptions) -> Result<ChangeSet, StoreError> {
        self.counters.applies.fetch_add(1, Ordering::Relaxed);
        counter!("memstore_apply_total", objects.len() as u64);
        self.commit(|w| {
            let mut cs = ChangeSet::new();
            for obj in objects {
                let (r, action) = w.apply_one(obj, opts)?;
                debug!(object = %r, %action, "applied");
                cs.push(r, action);
            }
            Ok(cs)
        })
    }

    async fn delete(&self, refs: &[ResourceRef], opts: &DeleteOptions) -> Result<ChangeSet, StoreError> {
        self.counters.deletes.fetch_add(1, Ordering::Relaxed);
        let cs = self.commit(|w| {
            let mut cs = ChangeSet::new();
            for r in refs {
                if let Some(action) = w.delete_one(r, opts) {
                    cs.push(r.clone(), action);
                }
            }
            cs
        });
        counter!("memstore_delete_total", cs.count(ChangeAction::Deleted) as u64);
        Ok(cs)
    }

    async fn patch_status(&self, r: &ResourceRef, patch: &Json) -> Result<(), StoreError> {
        self.counters.patches.fetch_add(1, Ordering::Relaxed);
        self.commit(|w| {
            let r = w.locate(r)?;
            let rv = w.next_rv();
            let stored = w.objects.get_mut(&r.id()).ok_or_else(|| StoreError::NotFound(r.to_string()))?;
            if let Some(status) = patch.get("status") {
                merge_patch(&mut stored.object["status"], status);
            }
            stored.object["metadata"]["resourceVersion"] = json!(rv);
            Ok(())
        })
    }

    async fn patch_metadata(&self, r: &ResourceRef, patch: &Json) -> Result<(), StoreError> {
        self.counters.patches.fetch_add(1, Ordering::Relaxed);
        self.commit(|w| {
            let r = w.locate(r)?;
            let rv = w.next_rv();
            let stored = w.objects.get_mut(&r.id()).ok_or_else(|| StoreError::NotFound(r.to_string()))?;
            merge_patch(&mut stored.object, patch);
            stored.object["metadata"]["resourceVersion"] = json!(rv);
            let released = is_deleting(&stored.object)
                && stored.object["metadata"]["finalizers"].as_array().map(|f| f.is_empty()).unwrap_or(true);
            if released {
                w.remove(&r);
            }
            Ok(())
        })
    }
}

//! Keel apply engine: staged server-side apply of a rendered resource set, change-set
//! accounting, inventory diff and garbage collection of stale objects.
//!
//! Every resource is stamped with the owner's labels and normalized before the first
//! store call, so malformed input never results in a partial apply.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use keel_core::json::{clear_namespace, max_object_nodes, namespace, normalize, set_label, set_namespace};
use keel_core::store::{ApplyOptions, DeleteOptions, OwnerSelector};
use keel_core::{ChangeAction, ChangeSet, ClusterStore, Inventory, ObjectError, ResourceRef, StoreError};
use metrics::{counter, histogram};
use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::Value as Json;
use tracing::{debug, info};

/// Poll interval while waiting for applied objects to become ready.
pub const WAIT_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, thiserror::Error)]
pub enum ApplyError {
    #[error(transparent)]
    Invalid(#[from] ObjectError),
    #[error("{object}: {source}")]
    Scope { object: String, #[source] source: StoreError },
    #[error("{stage} apply failed: {source}")]
    Apply { stage: &'static str, #[source] source: StoreError },
    #[error("{stage} not established: {source}")]
    Establish { stage: &'static str, #[source] source: StoreError },
    #[error("garbage collection failed: {0}")]
    Prune(#[source] StoreError),
    #[error("readiness check failed: {0}")]
    NotReady(#[source] StoreError),
}

impl ApplyError {
    pub fn is_validation(&self) -> bool { matches!(self, ApplyError::Invalid(_)) }
}

/// Apply order. Definitions are applied and established before anything that may need them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    Definitions,
    Classes,
    Resources,
}

impl Stage {
    pub const ALL: [Stage; 3] = [Stage::Definitions, Stage::Classes, Stage::Resources];

    pub fn of(r: &ResourceRef) -> Stage {
        match (r.group.as_str(), r.kind.as_str()) {
            ("", "Namespace") | ("apiextensions.k8s.io", "CustomResourceDefinition") => Stage::Definitions,
            (_, k) if k.ends_with("Class") => Stage::Classes,
            _ => Stage::Resources,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Stage::Definitions => "definitions",
            Stage::Classes => "classes",
            Stage::Resources => "resources",
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Injected into namespaced objects that do not name one.
    pub default_namespace: Option<String>,
    /// Delete objects that dropped out of the inventory.
    pub prune: bool,
    /// Kinds never garbage collected, as `Kind` or `group/Kind`.
    pub skip_kinds: Vec<String>,
    /// Upper bound for establishing Namespaces and CRDs.
    pub timeout: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self { default_namespace: None, prune: true, skip_kinds: Vec::new(), timeout: Duration::from_secs(300) }
    }
}

impl EngineOptions {
    fn skips(&self, r: &ResourceRef) -> bool {
        self.skip_kinds.iter().any(|k| *k == r.kind || *k == format!("{}/{}", r.group, r.kind))
    }
}

#[derive(Debug, Clone, Default)]
pub struct ApplyOutcome {
    pub change_set: ChangeSet,
    /// Every desired object, whatever its change action. Replaces the old inventory.
    pub inventory: Inventory,
}

pub struct ApplyEngine {
    store: Arc<dyn ClusterStore>,
    apply_opts: ApplyOptions,
    max_nodes: usize,
}

impl ApplyEngine {
    pub fn new(store: Arc<dyn ClusterStore>) -> Self {
        Self { store, apply_opts: ApplyOptions::default(), max_nodes: max_object_nodes() }
    }

    pub fn with_apply_options(mut self, opts: ApplyOptions) -> Self {
        self.apply_opts = opts;
        self
    }

    pub fn store(&self) -> &Arc<dyn ClusterStore> { &self.store }

    /// Stamp, normalize, resolve scope and order `resources`. No mutations.
    pub async fn prepare(&self, owner: &OwnerSelector, resources: Vec<Json>, opts: &EngineOptions) -> Result<Vec<(ResourceRef, Json)>, ApplyError> {
        let owner_labels = owner.labels();
        let mut normalized = Vec::with_capacity(resources.len());
        for mut obj in resources {
            ResourceRef::from_object(&obj)?;
            for (k, v) in &owner_labels {
                set_label(&mut obj, k, v);
            }
            normalized.push(normalize(obj, self.max_nodes)?);
        }

        // Kinds defined by CRDs in this same set are not discoverable yet
        let mut pending_kinds: FxHashMap<String, bool> = FxHashMap::default();
        for obj in &normalized {
            if let Some((key, namespaced)) = crd_kind(obj) {
                pending_kinds.insert(key, namespaced);
            }
        }

        let mut out = Vec::with_capacity(normalized.len());
        let mut seen = FxHashSet::default();
        for mut obj in normalized {
            let r = ResourceRef::from_object(&obj)?;
            let namespaced = match self.store.is_namespaced(&r.api_version(), &r.kind).await {
                Ok(n) => n,
                Err(StoreError::UnknownKind(kind)) => match pending_kinds.get(&format!("{}/{}", r.group, r.kind)) {
                    Some(n) => *n,
                    None => return Err(ApplyError::Scope { object: r.to_string(), source: StoreError::UnknownKind(kind) }),
                },
                Err(source) => return Err(ApplyError::Scope { object: r.to_string(), source }),
            };
            if namespaced {
                if namespace(&obj).is_none() {
                    match opts.default_namespace.as_deref() {
                        Some(ns) => set_namespace(&mut obj, ns),
                        None => return Err(ObjectError::Invalid { id: r.to_string(), reason: "namespace required for namespaced kind".into() }.into()),
                    }
                }
            } else {
                clear_namespace(&mut obj);
            }
            let r = ResourceRef::from_object(&obj)?;
            if !seen.insert(r.id()) {
                return Err(ObjectError::Duplicate(r.to_string()).into());
            }
            out.push((r, obj));
        }
        out.sort_by_key(|(r, _)| Stage::of(r));
        Ok(out)
    }

    /// Apply `resources` for `owner` and garbage-collect whatever left `old`.
    pub async fn apply(&self, owner: &OwnerSelector, resources: Vec<Json>, old: &Inventory, opts: &EngineOptions) -> Result<ApplyOutcome, ApplyError> {
        let t0 = Instant::now();
        counter!("apply_total", 1u64);
        let res = self.apply_inner(owner, resources, old, opts).await;
        histogram!("apply_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        if res.is_err() {
            counter!("apply_err_total", 1u64);
        }
        res
    }

    async fn apply_inner(&self, owner: &OwnerSelector, resources: Vec<Json>, old: &Inventory, opts: &EngineOptions) -> Result<ApplyOutcome, ApplyError> {
        let objects = self.prepare(owner, resources, opts).await?;
        let mut change_set = ChangeSet::new();

        for stage in Stage::ALL {
            let batch: Vec<Json> = objects.iter().filter(|(r, _)| Stage::of(r) == stage).map(|(_, o)| o.clone()).collect();
            if batch.is_empty() {
                continue;
            }
            let cs = self.store.apply(&batch, &self.apply_opts).await.map_err(|source| ApplyError::Apply { stage: stage.name(), source })?;
            debug!(stage = stage.name(), objects = batch.len(), changed = cs.changed().len(), "applied stage");
            if stage == Stage::Definitions {
                let changed = cs.changed();
                if !changed.is_empty() {
                    self.store
                        .wait(&changed, WAIT_INTERVAL, opts.timeout)
                        .await
                        .map_err(|source| ApplyError::Establish { stage: stage.name(), source })?;
                }
            }
            change_set.append(cs);
        }

        let inventory = Inventory::from_refs(objects.into_iter().map(|(r, _)| r));
        if opts.prune {
            let gc = self.prune(owner, Inventory::diff(old, &inventory), opts).await?;
            change_set.append(gc);
        }
        Ok(ApplyOutcome { change_set, inventory })
    }

    /// Delete `stale` objects owned by `owner`, resources before definitions.
    async fn prune(&self, owner: &OwnerSelector, mut stale: Vec<ResourceRef>, opts: &EngineOptions) -> Result<ChangeSet, ApplyError> {
        stale.retain(|r| !opts.skips(r));
        if stale.is_empty() {
            return Ok(ChangeSet::new());
        }
        stale.sort_by_key(|r| std::cmp::Reverse(Stage::of(r)));
        let cs = self.store.delete(&stale, &DeleteOptions::new(owner.clone())).await.map_err(ApplyError::Prune)?;
        let deleted = cs.count(ChangeAction::Deleted);
        counter!("gc_deleted_total", deleted as u64);
        if deleted > 0 {
            info!(owner = %owner.to_selector_string(), deleted, "garbage collected stale objects");
        }
        Ok(cs)
    }

    /// Delete everything in `inventory`; the uninstall path.
    pub async fn delete_all(&self, owner: &OwnerSelector, inventory: &Inventory, opts: &EngineOptions) -> Result<ChangeSet, ApplyError> {
        self.prune(owner, inventory.list().to_vec(), opts).await
    }

    /// Wait until every created or updated object is ready. The first failed object aborts.
    pub async fn wait_ready(&self, outcome: &ApplyOutcome, timeout: Duration) -> Result<(), ApplyError> {
        let refs = outcome.change_set.changed();
        if refs.is_empty() {
            return Ok(());
        }
        self.store.wait(&refs, WAIT_INTERVAL, timeout).await.map_err(ApplyError::NotReady)
    }
}

/// `group/Kind` and scope declared by a CustomResourceDefinition document.
fn crd_kind(obj: &Json) -> Option<(String, bool)> {
    let r = ResourceRef::from_object(obj).ok()?;
    if r.group != "apiextensions.k8s.io" || r.kind != "CustomResourceDefinition" {
        return None;
    }
    let spec = obj.get("spec")?;
    let group = spec.get("group")?.as_str()?;
    let kind = spec.get("names")?.get("kind")?.as_str()?;
    let namespaced = spec.get("scope").and_then(|s| s.as_str()) != Some("Cluster");
    Some((format!("{}/{}", group, kind), namespaced))
}

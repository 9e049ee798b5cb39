use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use keel_apply::{ApplyEngine, EngineOptions};
use keel_artifact::{ArtifactError, ArtifactResolver};
use keel_core::conditions::{reasons, READY};
use keel_core::{ApplyOptions, BuildInputs, ChangeAction, ClusterStore, ManagedObject, OwnerSelector, ResourceRef, FINALIZER};
use keel_schema::{format_duration, ReconcileConfig, REQUESTED_AT_ANNOTATION};
use metrics::{counter, histogram};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::artifact::credentials_for;
use crate::attempt::{panic_message, ReconcileAttempt};
use crate::events::{EventSink, Notification};
use crate::gate::check_dependencies;
use crate::{ReconcileError, Requeue, RequeueScheduler};

/// Drives managed objects of any kind to their desired state.
pub struct Reconciler {
    store: Arc<dyn ClusterStore>,
    engine: ApplyEngine,
    resolver: Option<Arc<dyn ArtifactResolver>>,
    events: Arc<dyn EventSink>,
    schedule: RequeueScheduler,
}

impl Reconciler {
    pub fn new(store: Arc<dyn ClusterStore>, events: Arc<dyn EventSink>) -> Self {
        Self {
            engine: ApplyEngine::new(store.clone()),
            store,
            resolver: None,
            events,
            schedule: RequeueScheduler::default(),
        }
    }

    pub fn with_apply_options(mut self, opts: ApplyOptions) -> Self {
        self.engine = ApplyEngine::new(self.store.clone()).with_apply_options(opts);
        self
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn ArtifactResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn with_scheduler(mut self, schedule: RequeueScheduler) -> Self {
        self.schedule = schedule;
        self
    }

    pub fn scheduler(&self) -> &RequeueScheduler { &self.schedule }
    pub fn store(&self) -> &Arc<dyn ClusterStore> { &self.store }

    /// Reconcile one observed state of `obj`. Never panics.
    pub async fn reconcile<K: ManagedObject + Clone>(&self, obj: &K) -> Result<Requeue, ReconcileError> {
        let t0 = Instant::now();
        counter!("reconcile_total", 1u64);
        let res = self.dispatch(obj).await;
        histogram!("reconcile_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        if let Err(e) = &res {
            counter!("reconcile_err_total", 1u64);
            warn!(object = %obj.identity(), error = %e, "reconciliation failed");
        }
        res
    }

    async fn dispatch<K: ManagedObject + Clone>(&self, obj: &K) -> Result<Requeue, ReconcileError> {
        let cfg = ReconcileConfig::from_object(obj);
        if obj.is_deleting() {
            return self.uninstall(obj, cfg.ok()).await;
        }
        let cfg = match cfg {
            Ok(cfg) => cfg,
            Err(e) => {
                let mut attempt = ReconcileAttempt::new(self.store.as_ref(), obj.clone(), None);
                let msg = e.to_string();
                attempt.object_mut().conditions_mut().stalled(reasons::INVALID_CONFIGURATION, &msg);
                self.notify(&obj.identity(), Notification::warning(reasons::INVALID_CONFIGURATION, msg)).await;
                return attempt.finish(Ok(Requeue::AwaitChange)).await;
            }
        };
        if !obj.has_finalizer() {
            return self.initialize(obj, &cfg).await;
        }
        if cfg.disabled {
            debug!(object = %obj.identity(), "reconciliation disabled");
            return Ok(Requeue::AwaitChange);
        }

        let mut attempt = ReconcileAttempt::new(self.store.as_ref(), obj.clone(), cfg.requested_at.clone());
        let started = attempt.started();
        let outcome = AssertUnwindSafe(self.converge(attempt.object_mut(), &cfg, started))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(ReconcileError::Panicked(panic_message(panic.as_ref()))));
        attempt.finish(outcome).await
    }

    /// First sight of the object: seed the conditions and attach the finalizer.
    async fn initialize<K: ManagedObject + Clone>(&self, obj: &K, cfg: &ReconcileConfig) -> Result<Requeue, ReconcileError> {
        let id = obj.identity();
        let mut working = obj.clone();
        working.conditions_mut().initialize(cfg.disabled);
        let mut finalizers = obj.finalizers();
        finalizers.push(FINALIZER.to_string());
        self.store.patch_metadata(&id, &json!({ "metadata": { "finalizers": finalizers } })).await?;
        self.store.patch_status(&id, &json!({ "status": { "conditions": working.conditions() } })).await?;
        let n = if cfg.disabled {
            Notification::normal(reasons::RECONCILIATION_DISABLED, "Reconciliation is disabled")
        } else {
            Notification::normal(reasons::PROGRESSING, "Reconciliation in progress")
        };
        self.notify(&id, n).await;
        info!(object = %id, disabled = cfg.disabled, "finalizer attached");
        Ok(Requeue::AwaitChange)
    }

    async fn converge<K: ManagedObject>(&self, obj: &mut K, cfg: &ReconcileConfig, started: Instant) -> Result<Requeue, ReconcileError> {
        let id = obj.identity();
        obj.conditions_mut().begin();

        let gate = check_dependencies(self.store.as_ref(), obj.depends_on(), id.namespace.as_deref()).await;
        if let Err(e) = gate {
            let msg = e.to_string();
            info!(object = %id, reason = %msg, "waiting on dependencies");
            obj.conditions_mut().dependency_not_ready(&msg);
            self.notify(&id, Notification::normal(reasons::DEPENDENCY_NOT_READY, msg)).await;
            return Ok(Requeue::Blocked(self.schedule.dependency_retry()));
        }

        let mut inputs = BuildInputs::default();
        if let Some(source) = obj.artifact().cloned() {
            match self.resolve_artifact(&source, &obj.namespace()).await {
                Ok(digest) => inputs.artifact_digest = Some(digest),
                Err(e) => {
                    let msg = e.to_string();
                    obj.conditions_mut().failed(reasons::ARTIFACT_FAILED, &msg);
                    self.notify(&id, Notification::warning(reasons::ARTIFACT_FAILED, msg)).await;
                    return Err(e.into());
                }
            }
        }

        let resources = match obj.render(&inputs) {
            Ok(r) => r,
            Err(e) => return Ok(self.stall_build(obj, &id, e.to_string()).await),
        };
        let revision = keel_api::revision(&resources);
        obj.status_mut().last_attempted_revision = Some(revision.clone());

        let owner = OwnerSelector::of(&id);
        let defaults = EngineOptions::default();
        let opts = EngineOptions {
            default_namespace: Some(obj.target_namespace()).filter(|ns| !ns.is_empty()),
            skip_kinds: obj.prune_skip_kinds(),
            timeout: cfg.timeout.unwrap_or(defaults.timeout),
            ..defaults
        };
        let old = obj.status().inventory.clone().unwrap_or_default();
        let outcome = match self.engine.apply(&owner, resources, &old, &opts).await {
            Ok(o) => o,
            Err(e) if e.is_validation() => return Ok(self.stall_build(obj, &id, e.to_string()).await),
            Err(e) => {
                let msg = e.to_string();
                obj.conditions_mut().failed(reasons::RECONCILIATION_FAILED, &msg);
                self.notify(&id, Notification::warning(reasons::RECONCILIATION_FAILED, msg)).await;
                return Err(e.into());
            }
        };

        let status = obj.status_mut();
        status.inventory = Some(outcome.inventory.clone());
        status.last_applied_revision = Some(revision);
        if let Some(digest) = inputs.artifact_digest {
            status.last_artifact_revision = Some(digest);
        }
        if outcome.change_set.has_notable() {
            self.notify(&id, Notification::normal(reasons::APPLY_SUCCEEDED, outcome.change_set.to_log())).await;
        }
        let deleted = outcome.change_set.count(ChangeAction::Deleted);
        if deleted > 0 {
            let msg = format!("Garbage collected {} object(s)", deleted);
            self.notify(&id, Notification::normal(reasons::GARBAGE_COLLECTION_SUCCEEDED, msg)).await;
        }

        if obj.wait() {
            if let Err(e) = self.engine.wait_ready(&outcome, opts.timeout).await {
                let msg = e.to_string();
                obj.conditions_mut().failed(reasons::RECONCILIATION_FAILED, &msg);
                self.notify(&id, Notification::warning(reasons::RECONCILIATION_FAILED, msg)).await;
                return Err(e.into());
            }
        }

        let msg = format!("Reconciliation finished in {}", format_duration(started.elapsed()));
        obj.conditions_mut().succeeded(&msg);
        self.notify(&id, Notification::normal(reasons::RECONCILIATION_SUCCEEDED, msg)).await;
        info!(object = %id, objects = outcome.inventory.len(), "reconciled");
        Ok(Requeue::After(self.schedule.next_interval(cfg)))
    }

    async fn resolve_artifact(&self, source: &keel_core::ArtifactSource, namespace: &str) -> Result<String, ArtifactError> {
        let resolver = self.resolver.as_ref().ok_or_else(|| ArtifactError::Registry {
            reference: source.url.clone(),
            message: "no artifact resolver configured".into(),
        })?;
        let creds = credentials_for(self.store.as_ref(), source, namespace).await?;
        resolver.resolve_digest(&source.url, &creds).await
    }

    /// Terminal build problem: only an edit of the object gets it out of here.
    async fn stall_build<K: ManagedObject>(&self, obj: &mut K, id: &ResourceRef, msg: String) -> Requeue {
        warn!(object = %id, error = %msg, "build failed");
        obj.conditions_mut().stalled(reasons::BUILD_FAILED, &msg);
        self.notify(id, Notification::warning(reasons::BUILD_FAILED, msg)).await;
        Requeue::AwaitChange
    }

    /// Deletion requested: collect everything in the inventory, then release the finalizer.
    /// Disabled objects are released without touching what they applied.
    async fn uninstall<K: ManagedObject + Clone>(&self, obj: &K, cfg: Option<ReconcileConfig>) -> Result<Requeue, ReconcileError> {
        if !obj.has_finalizer() {
            return Ok(Requeue::Released);
        }
        let id = obj.identity();
        let disabled = cfg.as_ref().map(|c| c.disabled).unwrap_or(false);
        let inventory = obj.status().inventory.clone().unwrap_or_default();
        if disabled {
            info!(object = %id, "reconciliation disabled; releasing without garbage collection");
        } else if !inventory.is_empty() {
            let owner = OwnerSelector::of(&id);
            let opts = EngineOptions { skip_kinds: obj.prune_skip_kinds(), ..EngineOptions::default() };
            match self.engine.delete_all(&owner, &inventory, &opts).await {
                Ok(cs) => {
                    let msg = format!("Garbage collected {} object(s)", cs.count(ChangeAction::Deleted));
                    info!(object = %id, deleted = cs.count(ChangeAction::Deleted), "uninstalled");
                    self.notify(&id, Notification::normal(reasons::GARBAGE_COLLECTION_SUCCEEDED, msg)).await;
                }
                Err(e) => {
                    let msg = e.to_string();
                    let mut attempt = ReconcileAttempt::new(self.store.as_ref(), obj.clone(), cfg.and_then(|c| c.requested_at));
                    attempt.object_mut().conditions_mut().failed(reasons::TERMINATION_FAILED, &msg);
                    self.notify(&id, Notification::warning(reasons::TERMINATION_FAILED, msg)).await;
                    return attempt.finish(Err(e.into())).await;
                }
            }
        }
        let finalizers: Vec<String> = obj.finalizers().into_iter().filter(|f| f != FINALIZER).collect();
        self.store.patch_metadata(&id, &json!({ "metadata": { "finalizers": finalizers } })).await?;
        debug!(object = %id, "finalizer released");
        Ok(Requeue::Released)
    }

    async fn notify(&self, id: &ResourceRef, n: Notification) { self.events.publish(id, n).await; }
}

/// Nothing left to do for this observation: the object is Ready for its current
/// generation and the last reconcile request was handled.
pub fn is_settled<K: ManagedObject>(obj: &K) -> bool {
    let status = obj.status();
    let requested = obj.annotations().get(REQUESTED_AT_ANNOTATION).cloned();
    let handled = requested.is_none() || requested == status.last_handled_reconcile_at;
    obj.has_finalizer()
        && !obj.is_deleting()
        && handled
        && obj.conditions().is_true(READY)
        && status.observed_generation == obj.generation()
}

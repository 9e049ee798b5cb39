//! kube-runtime wiring: one controller per managed kind plus the artifact drift loop.

use std::fmt::Debug;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::StreamExt;
use keel_api::{Distribution, ResourceGroup};
use keel_artifact::{ArtifactResolver, DriftDetector};
use keel_core::{ApplyOptions, ClusterStore, ManagedObject};
use keel_kubehub::KubeStore;
use keel_schema::ReconcileConfig;
use kube::runtime::controller::{self, Action, Controller};
use kube::runtime::watcher;
use kube::{Api, Client, Resource};
use rustc_hash::FxHashMap;
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use crate::{is_settled, Backoff, DriftLoop, KubeEvents, ReconcileError, Reconciler, Requeue, RequeueScheduler};

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub concurrency: u16,
    pub default_interval: Duration,
    pub artifact_interval: Duration,
    pub field_manager: String,
    /// Watch a single namespace instead of the whole cluster.
    pub namespace: Option<String>,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            default_interval: crate::DEFAULT_INTERVAL,
            artifact_interval: crate::DEFAULT_ARTIFACT_INTERVAL,
            field_manager: keel_core::FIELD_MANAGER.to_string(),
            namespace: None,
            backoff_base: Duration::from_secs(5),
            backoff_max: Duration::from_secs(300),
        }
    }
}

struct Context {
    reconciler: Reconciler,
    backoff: Backoff,
    /// Last successful reconcile per object, to absorb watch events caused by our own status writes.
    settled: Mutex<FxHashMap<String, Instant>>,
}

struct DriftContext {
    drift: DriftLoop,
    backoff: Backoff,
}

impl Context {
    /// Drop everything remembered about an object whose finalizer was released.
    fn forget(&self, key: &str) {
        self.backoff.reset(key);
        self.settled.lock().unwrap_or_else(|e| e.into_inner()).remove(key);
    }
}

fn to_action(r: Requeue) -> Action {
    match r {
        Requeue::After(d) | Requeue::Blocked(d) => Action::requeue(d),
        Requeue::AwaitChange | Requeue::Released => Action::await_change(),
    }
}

fn api<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<DynamicType = (), Scope = k8s_openapi::NamespaceResourceScope>,
{
    match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

async fn reconcile<K>(obj: Arc<K>, ctx: Arc<Context>) -> Result<Action, ReconcileError>
where
    K: ManagedObject + Clone,
{
    let key = obj.identity().id();
    if is_settled(obj.as_ref()) {
        let last = ctx.settled.lock().unwrap_or_else(|e| e.into_inner()).get(&key).copied();
        if let Some(last) = last {
            let interval = ReconcileConfig::from_object(obj.as_ref())
                .map(|cfg| ctx.reconciler.scheduler().next_interval(&cfg))
                .unwrap_or(ctx.reconciler.scheduler().default_interval);
            let elapsed = last.elapsed();
            if elapsed < interval {
                debug!(object = %obj.identity(), "already reconciled; waiting for the next interval");
                return Ok(Action::requeue(interval - elapsed));
            }
        }
    }
    let requeue = ctx.reconciler.reconcile(obj.as_ref()).await?;
    match requeue {
        Requeue::Released => ctx.forget(&key),
        Requeue::After(_) => {
            ctx.backoff.reset(&key);
            ctx.settled.lock().unwrap_or_else(|e| e.into_inner()).insert(key, Instant::now());
        }
        Requeue::Blocked(_) | Requeue::AwaitChange => {
            ctx.backoff.reset(&key);
            ctx.settled.lock().unwrap_or_else(|e| e.into_inner()).remove(&key);
        }
    }
    Ok(to_action(requeue))
}

fn error_policy<K: ManagedObject>(obj: Arc<K>, err: &ReconcileError, ctx: Arc<Context>) -> Action {
    let delay = ctx.backoff.next(&obj.identity().id());
    warn!(object = %obj.identity(), error = %err, retry_in = ?delay, "reconcile error");
    Action::requeue(delay)
}

async fn check_artifact<K>(obj: Arc<K>, ctx: Arc<DriftContext>) -> Result<Action, ReconcileError>
where
    K: ManagedObject,
{
    let requeue = ctx.drift.check(obj.as_ref()).await?;
    ctx.backoff.reset(&obj.identity().id());
    Ok(to_action(requeue))
}

fn drift_error_policy<K: ManagedObject>(obj: Arc<K>, err: &ReconcileError, ctx: Arc<DriftContext>) -> Action {
    let delay = ctx.backoff.next(&obj.identity().id());
    warn!(object = %obj.identity(), error = %err, retry_in = ?delay, "artifact check failed");
    Action::requeue(delay)
}

async fn run_kind<K>(api: Api<K>, ctx: Arc<Context>, concurrency: u16)
where
    K: ManagedObject + Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    Controller::new(api, watcher::Config::default())
        .with_config(controller::Config::default().concurrency(concurrency))
        .shutdown_on_signal()
        .run(reconcile::<K>, error_policy::<K>, ctx)
        .for_each(|res| async move {
            match res {
                Ok((obj, _)) => debug!(object = %obj, "reconciled"),
                Err(e) => debug!(error = %e, "controller error"),
            }
        })
        .await;
}

async fn run_drift<K>(api: Api<K>, ctx: Arc<DriftContext>, concurrency: u16)
where
    K: ManagedObject + Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    Controller::new(api, watcher::Config::default())
        .with_config(controller::Config::default().concurrency(concurrency))
        .shutdown_on_signal()
        .run(check_artifact::<K>, drift_error_policy::<K>, ctx)
        .for_each(|res| async move {
            if let Err(e) = res {
                debug!(error = %e, "drift controller error");
            }
        })
        .await;
}

/// Run the controllers until a shutdown signal arrives.
pub async fn run(client: Client, config: RuntimeConfig, resolver: Arc<dyn ArtifactResolver>) {
    let schedule = RequeueScheduler::new(config.default_interval, config.artifact_interval);
    let store: Arc<dyn ClusterStore> = Arc::new(KubeStore::new(client.clone()));
    let apply_opts = ApplyOptions { field_manager: config.field_manager.clone(), ..ApplyOptions::default() };
    let events = Arc::new(KubeEvents::new(client.clone(), &config.field_manager));

    let ctx = Arc::new(Context {
        reconciler: Reconciler::new(store.clone(), events)
            .with_apply_options(apply_opts)
            .with_resolver(resolver.clone())
            .with_scheduler(schedule),
        backoff: Backoff::new(config.backoff_base, config.backoff_max),
        settled: Mutex::new(FxHashMap::default()),
    });
    let drift = Arc::new(DriftContext {
        drift: DriftLoop::new(store, DriftDetector::new(resolver), schedule),
        backoff: Backoff::new(config.backoff_base, config.backoff_max),
    });

    let ns = config.namespace.as_deref();
    info!(namespace = ns.unwrap_or("*"), concurrency = config.concurrency, "starting controllers");
    tokio::join!(
        run_kind(api::<ResourceGroup>(&client, ns), ctx.clone(), config.concurrency),
        run_kind(api::<Distribution>(&client, ns), ctx, config.concurrency),
        run_drift(api::<Distribution>(&client, ns), drift, config.concurrency),
    );
    info!("controllers stopped");
}

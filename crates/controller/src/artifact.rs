use std::str::FromStr;
use std::sync::Arc;

use keel_artifact::{ArtifactError, Credentials, DriftDetector, OciReference};
use keel_core::conditions::now_rfc3339;
use keel_core::{ArtifactSource, ClusterStore, ManagedObject, ResourceRef};
use keel_schema::{ReconcileConfig, REQUESTED_AT_ANNOTATION};
use metrics::counter;
use serde_json::json;
use tracing::{debug, info};

use crate::{ReconcileError, Requeue, RequeueScheduler};

/// Registry credentials for `source`, read from its pull secret in `namespace` when one is named.
pub async fn credentials_for(store: &dyn ClusterStore, source: &ArtifactSource, namespace: &str) -> Result<Credentials, ArtifactError> {
    let Some(secret_name) = &source.pull_secret else {
        return Ok(Credentials::anonymous(source.insecure));
    };
    let reference = OciReference::from_str(&source.url)?;
    let secret = store
        .get(&ResourceRef::new("v1", "Secret", Some(namespace), secret_name))
        .await
        .map_err(|e| ArtifactError::Credentials(format!("pull secret {}: {}", secret_name, e)))?;
    Credentials::from_secret(&secret, &reference.registry, source.insecure)
}

/// Periodic artifact check. A changed digest is turned into a reconcile request by
/// stamping `keel.dev/requestedAt`; the main loop does the actual work.
pub struct DriftLoop {
    store: Arc<dyn ClusterStore>,
    detector: DriftDetector,
    schedule: RequeueScheduler,
}

impl DriftLoop {
    pub fn new(store: Arc<dyn ClusterStore>, detector: DriftDetector, schedule: RequeueScheduler) -> Self {
        Self { store, detector, schedule }
    }

    pub async fn check<K: ManagedObject>(&self, obj: &K) -> Result<Requeue, ReconcileError> {
        let Some(source) = obj.artifact() else {
            return Ok(Requeue::AwaitChange);
        };
        let id = obj.identity();
        let cfg = ReconcileConfig::from_object(obj)?;
        if cfg.disabled || obj.is_deleting() {
            debug!(object = %id, "skipping artifact check");
            return Ok(Requeue::AwaitChange);
        }
        let last = obj.status().last_artifact_revision.clone().unwrap_or_default();
        let creds = credentials_for(self.store.as_ref(), source, &obj.namespace()).await?;
        let (digest, changed) = self.detector.should_reconcile(&source.url, &last, &creds).await?;
        if changed {
            let patch = json!({ "metadata": { "annotations": { REQUESTED_AT_ANNOTATION: now_rfc3339() } } });
            self.store.patch_metadata(&id, &patch).await?;
            counter!("artifact_drift_total", 1u64);
            info!(object = %id, %digest, "artifact changed; reconciliation requested");
        }
        Ok(Requeue::After(self.schedule.next_artifact_interval(&cfg)))
    }
}

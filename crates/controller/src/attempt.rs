use std::any::Any;
use std::time::Instant;

use keel_core::{ClusterStore, Conditions, ManagedObject};
use serde_json::json;
use tracing::{debug, warn};

use crate::{ReconcileError, Requeue};

/// One reconciliation attempt over a working copy of the object.
///
/// [`ReconcileAttempt::finish`] must run on every exit path: it records the handled
/// reconcile request, settles the conditions and writes the status back. A failed
/// status write never hides the attempt's own error; both are returned together.
pub struct ReconcileAttempt<'a, K> {
    store: &'a dyn ClusterStore,
    object: K,
    before: Conditions,
    requested_at: Option<String>,
    started: Instant,
}

impl<'a, K: ManagedObject> ReconcileAttempt<'a, K> {
    pub fn new(store: &'a dyn ClusterStore, object: K, requested_at: Option<String>) -> Self {
        Self { store, before: object.conditions().clone(), object, requested_at, started: Instant::now() }
    }

    pub fn object(&self) -> &K { &self.object }
    pub fn object_mut(&mut self) -> &mut K { &mut self.object }
    pub fn started(&self) -> Instant { self.started }

    pub async fn finish(mut self, outcome: Result<Requeue, ReconcileError>) -> Result<Requeue, ReconcileError> {
        let id = self.object.identity();
        if let Err(ReconcileError::Panicked(msg)) = &outcome {
            self.object.conditions_mut().failed(keel_core::conditions::reasons::RECONCILIATION_FAILED, msg);
        }
        let generation = self.object.generation();
        self.object.status_mut().finalize(self.requested_at.as_deref(), generation);
        let before = std::mem::take(&mut self.before);
        self.object.conditions_mut().settle_transitions(&before);

        let written = match serde_json::to_value(self.object.status()) {
            Ok(status) => self.store.patch_status(&id, &json!({ "status": status })).await,
            Err(e) => Err(keel_core::StoreError::Api { object: id.to_string(), message: format!("encode status: {}", e) }),
        };
        debug!(object = %id, elapsed_ms = self.started.elapsed().as_millis() as u64, "attempt finished");
        match (outcome, written) {
            (outcome, Ok(())) => outcome,
            (Ok(_), Err(e)) => Err(ReconcileError::Status(e)),
            (Err(primary), Err(status)) => {
                warn!(object = %id, error = %status, "status patch failed after a failed attempt");
                Err(ReconcileError::Aggregate { primary: Box::new(primary), status })
            }
        }
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

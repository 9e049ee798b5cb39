//! Keel control loop.
//!
//! [`Reconciler`] drives one managed object from its desired state to the cluster:
//! dependency gate, artifact digest, render, staged apply with garbage collection,
//! readiness wait and status bookkeeping. [`DriftLoop`] watches artifact digests and
//! requests reconciliations. [`runtime`] wires both into kube-runtime controllers.

#![forbid(unsafe_code)]

use std::time::Duration;

use keel_apply::ApplyError;
use keel_artifact::ArtifactError;
use keel_core::{BuildError, StoreError};
use keel_schema::SchemaError;

mod artifact;
mod attempt;
pub mod events;
mod gate;
mod reconcile;
pub mod runtime;
mod schedule;

pub use artifact::{credentials_for, DriftLoop};
pub use attempt::ReconcileAttempt;
pub use events::{EventSink, KubeEvents, Notification, RecordingSink, Severity};
pub use gate::{check_dependencies, DependencyError};
pub use reconcile::{is_settled, Reconciler};
pub use schedule::{Backoff, RequeueScheduler, DEFAULT_ARTIFACT_INTERVAL, DEFAULT_INTERVAL, DEPENDENCY_RETRY};

/// When the object should be looked at again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requeue {
    After(Duration),
    /// Dependencies are not ready; look again after the delay.
    Blocked(Duration),
    /// Only a change to the object itself brings it back.
    AwaitChange,
    /// The finalizer is gone and the object with it.
    Released,
}

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("invalid configuration: {0}")]
    Config(#[from] SchemaError),
    #[error(transparent)]
    Dependency(#[from] DependencyError),
    #[error(transparent)]
    Artifact(#[from] ArtifactError),
    #[error("build failed: {0}")]
    Build(#[from] BuildError),
    #[error(transparent)]
    Apply(#[from] ApplyError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("status patch failed: {0}")]
    Status(#[source] StoreError),
    #[error("{primary}; status patch also failed: {status}")]
    Aggregate { primary: Box<ReconcileError>, status: StoreError },
    #[error("reconciler panicked: {0}")]
    Panicked(String),
}

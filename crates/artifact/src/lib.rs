//! Keel artifacts: OCI registry digest resolution and drift detection.
//!
//! The drift detector never requests a reconciliation it cannot justify: no recorded
//! digest or a failed lookup both mean "no change".

#![forbid(unsafe_code)]

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

mod credentials;
mod reference;
mod registry;

pub use credentials::Credentials;
pub use reference::OciReference;
pub use registry::{BearerChallenge, RegistryResolver, DIGEST_HEADER};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ArtifactError {
    #[error("invalid artifact reference {0}")]
    InvalidReference(String),
    #[error("registry credentials: {0}")]
    Credentials(String),
    #[error("registry authentication failed: {0}")]
    Auth(String),
    #[error("artifact {0} not found")]
    NotFound(String),
    #[error("registry error for {reference}: {message}")]
    Registry { reference: String, message: String },
    #[error("registry transport: {0}")]
    Transport(String),
}

/// Maps a mutable artifact reference to its current immutable digest.
#[async_trait]
pub trait ArtifactResolver: Send + Sync {
    async fn resolve_digest(&self, reference: &str, creds: &Credentials) -> Result<String, ArtifactError>;
}

pub struct DriftDetector {
    resolver: Arc<dyn ArtifactResolver>,
}

impl DriftDetector {
    pub fn new(resolver: Arc<dyn ArtifactResolver>) -> Self { Self { resolver } }

    pub fn resolver(&self) -> &Arc<dyn ArtifactResolver> { &self.resolver }

    /// Current digest of `url` and whether it differs from `last_known`.
    /// An empty `last_known` never counts as a change.
    pub async fn should_reconcile(&self, url: &str, last_known: &str, creds: &Credentials) -> Result<(String, bool), ArtifactError> {
        let digest = self.resolver.resolve_digest(url, creds).await?;
        if last_known.is_empty() {
            debug!(%url, %digest, "no recorded digest yet; skipping drift decision");
            return Ok((digest, false));
        }
        let changed = digest != last_known;
        if changed {
            info!(%url, from = %last_known, to = %digest, "artifact digest changed");
        }
        Ok((digest, changed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixed(Result<String, ArtifactError>, AtomicUsize);

    #[async_trait]
    impl ArtifactResolver for Fixed {
        async fn resolve_digest(&self, _: &str, _: &Credentials) -> Result<String, ArtifactError> {
            self.1.fetch_add(1, Ordering::SeqCst);
            self.0.clone()
        }
    }

    fn detector(res: Result<String, ArtifactError>) -> DriftDetector {
        DriftDetector::new(Arc::new(Fixed(res, AtomicUsize::new(0))))
    }

    #[tokio::test]
    async fn empty_last_digest_never_requests_reconcile() {
        let d = detector(Ok("sha256:new".into()));
        let (digest, changed) = d.should_reconcile("oci://r/a:1", "", &Credentials::default()).await.unwrap();
        assert_eq!(digest, "sha256:new");
        assert!(!changed);
    }

    #[tokio::test]
    async fn mismatch_requests_reconcile() {
        let d = detector(Ok("sha256:new".into()));
        assert!(d.should_reconcile("oci://r/a:1", "sha256:old", &Credentials::default()).await.unwrap().1);
        assert!(!d.should_reconcile("oci://r/a:1", "sha256:new", &Credentials::default()).await.unwrap().1);
    }

    #[tokio::test]
    async fn resolution_errors_propagate() {
        let d = detector(Err(ArtifactError::NotFound("r/a:1".into())));
        let err = d.should_reconcile("oci://r/a:1", "sha256:old", &Credentials::default()).await.unwrap_err();
        assert_eq!(err, ArtifactError::NotFound("r/a:1".into()));
    }
}

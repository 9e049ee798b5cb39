//! Dependency gate: every declared dependency must exist, and be ready when asked to,
//! before anything is applied.

use keel_core::{compute_health, ClusterStore, Dependency, Health, StoreError};
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum DependencyError {
    #[error("dependency {0} not found")]
    Missing(String),
    #[error("dependency {object} is not ready: {message}")]
    NotReady { object: String, message: String },
    #[error("dependency {object}: {source}")]
    Store {
        object: String,
        #[source]
        source: StoreError,
    },
}

/// Check `deps` in declaration order and stop at the first one that blocks.
/// Dependencies without a namespace resolve in `default_namespace`.
pub async fn check_dependencies(
    store: &dyn ClusterStore,
    deps: &[Dependency],
    default_namespace: Option<&str>,
) -> Result<(), DependencyError> {
    for dep in deps {
        let r = dep.to_ref(default_namespace);
        let live = match store.get_opt(&r).await {
            Ok(Some(obj)) => obj,
            Ok(None) => return Err(DependencyError::Missing(r.to_string())),
            Err(source) => return Err(DependencyError::Store { object: r.to_string(), source }),
        };
        if !dep.require_ready {
            continue;
        }
        match compute_health(&live) {
            Health::Current => debug!(dependency = %r, "dependency ready"),
            Health::InProgress(message) | Health::Failed(message) => {
                return Err(DependencyError::NotReady { object: r.to_string(), message })
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use keel_core::{ApplyOptions, ChangeSet, DeleteOptions, ResourceRef};
    use serde_json::{json, Value as Json};

    struct Fixed(Vec<Json>);

    #[async_trait]
    impl ClusterStore for Fixed {
        async fn get(&self, r: &ResourceRef) -> Result<Json, StoreError> {
            self.0
                .iter()
                .find(|o| ResourceRef::from_object(o).map(|x| x.same_object(r)).unwrap_or(false))
                .cloned()
                .ok_or_else(|| StoreError::NotFound(r.to_string()))
        }
        async fn is_namespaced(&self, _: &str, _: &str) -> Result<bool, StoreError> { Ok(true) }
        async fn apply(&self, _: &[Json], _: &ApplyOptions) -> Result<ChangeSet, StoreError> { unreachable!() }
        async fn delete(&self, _: &[ResourceRef], _: &DeleteOptions) -> Result<ChangeSet, StoreError> { unreachable!() }
        async fn patch_status(&self, _: &ResourceRef, _: &Json) -> Result<(), StoreError> { unreachable!() }
        async fn patch_metadata(&self, _: &ResourceRef, _: &Json) -> Result<(), StoreError> { unreachable!() }
    }

    fn group(name: &str, ready: &str) -> Json {
        json!({
            "apiVersion": "keel.dev/v1", "kind": "ResourceGroup",
            "metadata": { "name": name, "namespace": "team", "generation": 2 },
            "status": { "observedGeneration": 2, "conditions": [{ "type": "Ready", "status": ready, "reason": "R", "message": "m" }] }
        })
    }

    fn dep(name: &str, require_ready: bool) -> Dependency {
        Dependency { api_version: "keel.dev/v1".into(), kind: "ResourceGroup".into(), name: name.into(), namespace: None, require_ready }
    }

    #[tokio::test]
    async fn missing_dependency_is_named() {
        let store = Fixed(vec![group("infra", "True")]);
        let err = check_dependencies(&store, &[dep("infra", true), dep("db", false)], Some("team")).await.unwrap_err();
        assert!(matches!(&err, DependencyError::Missing(o) if o == "ResourceGroup/team/db"));
    }

    #[tokio::test]
    async fn readiness_only_checked_when_required() {
        let store = Fixed(vec![group("infra", "False")]);
        check_dependencies(&store, &[dep("infra", false)], Some("team")).await.unwrap();
        let err = check_dependencies(&store, &[dep("infra", true)], Some("team")).await.unwrap_err();
        assert!(matches!(err, DependencyError::NotReady { .. }));
    }

    #[tokio::test]
    async fn stale_generation_is_not_ready() {
        let mut obj = group("infra", "True");
        obj["metadata"]["generation"] = json!(3);
        let store = Fixed(vec![obj]);
        assert!(check_dependencies(&store, &[dep("infra", true)], Some("team")).await.is_err());
        assert!(check_dependencies(&store, &[], Some("team")).await.is_ok());
    }
}

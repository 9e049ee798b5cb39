//! Readiness of arbitrary objects.
//!
//! Built-in workload kinds get dedicated rules; everything else follows the generic
//! `status.conditions` convention (Stalled → failed, Reconciling → in progress,
//! Ready decides otherwise). Objects without any status signal are considered current.

use serde_json::Value as Json;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Health {
    Current,
    InProgress(String),
    Failed(String),
}

impl Health {
    pub fn is_current(&self) -> bool { matches!(self, Health::Current) }
}

fn status(obj: &Json) -> Option<&Json> { obj.get("status") }

fn int_at(v: Option<&Json>, key: &str) -> Option<i64> {
    v.and_then(|s| s.get(key)).and_then(|x| x.as_i64())
}

fn str_at<'a>(v: Option<&'a Json>, key: &str) -> Option<&'a str> {
    v.and_then(|s| s.get(key)).and_then(|x| x.as_str())
}

/// `(status, reason, message)` of a condition type, if present.
fn condition<'a>(obj: &'a Json, type_: &str) -> Option<(&'a str, &'a str, &'a str)> {
    let conds = status(obj)?.get("conditions")?.as_array()?;
    conds.iter().find(|c| c.get("type").and_then(|t| t.as_str()) == Some(type_)).map(|c| {
        (
            c.get("status").and_then(|s| s.as_str()).unwrap_or("Unknown"),
            c.get("reason").and_then(|s| s.as_str()).unwrap_or(""),
            c.get("message").and_then(|s| s.as_str()).unwrap_or(""),
        )
    })
}

pub fn compute_health(obj: &Json) -> Health {
    let meta = obj.get("metadata");
    if meta.and_then(|m| m.get("deletionTimestamp")).map(|v| !v.is_null()).unwrap_or(false) {
        return Health::InProgress("object is being deleted".into());
    }
    let generation = int_at(meta, "generation");
    let observed = int_at(status(obj), "observedGeneration");
    if let (Some(g), Some(o)) = (generation, observed) {
        if o < g {
            return Health::InProgress(format!("observed generation {} is behind generation {}", o, g));
        }
    }

    let group_kind = (
        obj.get("apiVersion").and_then(|v| v.as_str()).map(|s| crate::split_api_version(s).0).unwrap_or(""),
        obj.get("kind").and_then(|v| v.as_str()).unwrap_or(""),
    );
    match group_kind {
        ("", "Namespace") => namespace_health(obj),
        ("apiextensions.k8s.io", "CustomResourceDefinition") => crd_health(obj),
        ("apps", "Deployment") => deployment_health(obj),
        ("apps", "StatefulSet") => statefulset_health(obj),
        ("apps", "DaemonSet") => daemonset_health(obj),
        ("", "Pod") => pod_health(obj),
        ("batch", "Job") => job_health(obj),
        ("", "PersistentVolumeClaim") => match str_at(status(obj), "phase") {
            Some("Bound") => Health::Current,
            other => Health::InProgress(format!("claim phase {}", other.unwrap_or("Pending"))),
        },
        _ => conditions_health(obj),
    }
}

fn conditions_health(obj: &Json) -> Health {
    if let Some(("True", reason, msg)) = condition(obj, "Stalled") {
        return Health::Failed(format!("{}: {}", reason, msg));
    }
    if let Some(("True", _, msg)) = condition(obj, "Reconciling") {
        return Health::InProgress(msg.to_string());
    }
    match condition(obj, "Ready") {
        Some(("True", _, _)) | None => Health::Current,
        Some((_, reason, msg)) => Health::InProgress(format!("{}: {}", reason, msg)),
    }
}

fn namespace_health(obj: &Json) -> Health {
    match str_at(status(obj), "phase") {
        None | Some("Active") => Health::Current,
        Some(p) => Health::InProgress(format!("namespace phase {}", p)),
    }
}

fn crd_health(obj: &Json) -> Health {
    match condition(obj, "Established") {
        Some(("True", _, _)) => Health::Current,
        _ => Health::InProgress("CRD is not established".into()),
    }
}

fn desired_replicas(obj: &Json) -> i64 {
    obj.get("spec").and_then(|s| s.get("replicas")).and_then(|r| r.as_i64()).unwrap_or(1)
}

fn deployment_health(obj: &Json) -> Health {
    if let Some(("False", "ProgressDeadlineExceeded", msg)) = condition(obj, "Progressing") {
        return Health::Failed(msg.to_string());
    }
    let st = status(obj);
    if st.is_none() {
        return Health::InProgress("status not yet observed".into());
    }
    let want = desired_replicas(obj);
    let updated = int_at(st, "updatedReplicas").unwrap_or(0);
    let available = int_at(st, "availableReplicas").unwrap_or(0);
    let total = int_at(st, "replicas").unwrap_or(0);
    if updated < want {
        return Health::InProgress(format!("updated replicas {}/{}", updated, want));
    }
    if total > updated {
        return Health::InProgress(format!("{} old replicas pending termination", total - updated));
    }
    if available < want {
        return Health::InProgress(format!("available replicas {}/{}", available, want));
    }
    Health::Current
}

fn statefulset_health(obj: &Json) -> Health {
    let st = status(obj);
    if st.is_none() {
        return Health::InProgress("status not yet observed".into());
    }
    let want = desired_replicas(obj);
    let ready = int_at(st, "readyReplicas").unwrap_or(0);
    if ready < want {
        return Health::InProgress(format!("ready replicas {}/{}", ready, want));
    }
    match (str_at(st, "currentRevision"), str_at(st, "updateRevision")) {
        (Some(c), Some(u)) if c != u => Health::InProgress("rollout in progress".into()),
        _ => Health::Current,
    }
}

fn daemonset_health(obj: &Json) -> Health {
    let st = status(obj);
    let desired = match int_at(st, "desiredNumberScheduled") {
        Some(d) => d,
        None => return Health::InProgress("status not yet observed".into()),
    };
    let updated = int_at(st, "updatedNumberScheduled").unwrap_or(0);
    let available = int_at(st, "numberAvailable").unwrap_or(0);
    if updated < desired || available < desired {
        return Health::InProgress(format!("available {}/{} (updated {})", available, desired, updated));
    }
    Health::Current
}

fn pod_health(obj: &Json) -> Health {
    match str_at(status(obj), "phase") {
        Some("Succeeded") => Health::Current,
        Some("Failed") => Health::Failed("pod failed".into()),
        Some("Running") => match condition(obj, "Ready") {
            Some(("True", _, _)) => Health::Current,
            _ => Health::InProgress("pod is not ready".into()),
        },
        other => Health::InProgress(format!("pod phase {}", other.unwrap_or("Pending"))),
    }
}

fn job_health(obj: &Json) -> Health {
    if let Some(("True", reason, msg)) = condition(obj, "Failed") {
        return Health::Failed(format!("{}: {}", reason, msg));
    }
    match condition(obj, "Complete") {
        Some(("True", _, _)) => Health::Current,
        _ => Health::InProgress("job has not completed".into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn plain_objects_are_current() {
        let cm = json!({ "apiVersion": "v1", "kind": "ConfigMap", "metadata": { "name": "x" }, "data": {} });
        assert_eq!(compute_health(&cm), Health::Current);
    }

    #[test]
    fn generic_conditions_are_honoured() {
        let mut obj = json!({
            "apiVersion": "keel.dev/v1", "kind": "ResourceGroup",
            "metadata": { "name": "x", "generation": 2 },
            "status": { "observedGeneration": 2, "conditions": [ { "type": "Ready", "status": "False", "reason": "DependencyNotReady", "message": "waiting" } ] }
        });
        assert!(matches!(compute_health(&obj), Health::InProgress(_)));
        obj["status"]["conditions"][0]["status"] = json!("True");
        assert_eq!(compute_health(&obj), Health::Current);
        obj["status"]["observedGeneration"] = json!(1);
        assert!(matches!(compute_health(&obj), Health::InProgress(m) if m.contains("generation")));
    }

    #[test]
    fn stalled_is_failed() {
        let obj = json!({
            "apiVersion": "keel.dev/v1", "kind": "ResourceGroup", "metadata": { "name": "x" },
            "status": { "conditions": [
                { "type": "Stalled", "status": "True", "reason": "BuildFailed", "message": "bad" },
                { "type": "Ready", "status": "False", "reason": "BuildFailed", "message": "bad" }
            ] }
        });
        assert_eq!(compute_health(&obj), Health::Failed("BuildFailed: bad".into()));
    }

    #[test]
    fn deployment_rollout_rules() {
        let mut d = json!({
            "apiVersion": "apps/v1", "kind": "Deployment", "metadata": { "name": "web", "generation": 1 },
            "spec": { "replicas": 2 },
            "status": { "observedGeneration": 1, "replicas": 2, "updatedReplicas": 2, "availableReplicas": 1 }
        });
        assert!(matches!(compute_health(&d), Health::InProgress(_)));
        d["status"]["availableReplicas"] = json!(2);
        assert_eq!(compute_health(&d), Health::Current);
        d["status"]["conditions"] = json!([{ "type": "Progressing", "status": "False", "reason": "ProgressDeadlineExceeded", "message": "too slow" }]);
        assert_eq!(compute_health(&d), Health::Failed("too slow".into()));
    }

    #[test]
    fn job_and_crd_rules() {
        let job = json!({ "apiVersion": "batch/v1", "kind": "Job", "metadata": { "name": "j" },
            "status": { "conditions": [ { "type": "Failed", "status": "True", "reason": "BackoffLimitExceeded", "message": "" } ] } });
        assert!(matches!(compute_health(&job), Health::Failed(_)));
        let crd = json!({ "apiVersion": "apiextensions.k8s.io/v1", "kind": "CustomResourceDefinition", "metadata": { "name": "a.b" } });
        assert!(matches!(compute_health(&crd), Health::InProgress(_)));
    }

    #[test]
    fn terminating_objects_are_in_progress() {
        let ns = json!({ "apiVersion": "v1", "kind": "Namespace", "metadata": { "name": "x", "deletionTimestamp": "2024-01-01T00:00:00Z" } });
        assert!(matches!(compute_health(&ns), Health::InProgress(_)));
    }
}

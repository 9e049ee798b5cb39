//! Notifications about reconcile outcomes. Delivery is best effort: a sink logs its
//! own failures and never fails a reconciliation.

use std::sync::Mutex;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use keel_core::ResourceRef;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Client;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Normal,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub severity: Severity,
    /// One of `keel_core::conditions::reasons`.
    pub reason: &'static str,
    pub message: String,
}

impl Notification {
    pub fn normal(reason: &'static str, message: impl Into<String>) -> Self {
        Self { severity: Severity::Normal, reason, message: message.into() }
    }

    pub fn warning(reason: &'static str, message: impl Into<String>) -> Self {
        Self { severity: Severity::Warning, reason, message: message.into() }
    }
}

#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, object: &ResourceRef, notification: Notification);
}

/// Kubernetes Events attached to the managed object.
pub struct KubeEvents {
    client: Client,
    reporter: Reporter,
}

impl KubeEvents {
    pub fn new(client: Client, controller: &str) -> Self {
        let reporter = Reporter { controller: controller.to_string(), instance: std::env::var("POD_NAME").ok() };
        Self { client, reporter }
    }
}

fn object_reference(r: &ResourceRef) -> ObjectReference {
    ObjectReference {
        api_version: Some(r.api_version()),
        kind: Some(r.kind.clone()),
        name: Some(r.name.clone()),
        namespace: r.namespace.clone(),
        ..Default::default()
    }
}

#[async_trait]
impl EventSink for KubeEvents {
    async fn publish(&self, object: &ResourceRef, n: Notification) {
        let recorder = Recorder::new(self.client.clone(), self.reporter.clone(), object_reference(object));
        let event = Event {
            type_: match n.severity {
                Severity::Normal => EventType::Normal,
                Severity::Warning => EventType::Warning,
            },
            reason: n.reason.to_string(),
            note: Some(n.message),
            action: "Reconcile".to_string(),
            secondary: None,
        };
        match recorder.publish(event).await {
            Ok(()) => debug!(object = %object, reason = n.reason, "event published"),
            Err(e) => warn!(object = %object, reason = n.reason, error = %e, "failed to publish event"),
        }
    }
}

/// Keeps every notification in memory.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<(ResourceRef, Notification)>>,
}

impl RecordingSink {
    pub fn new() -> Self { Self::default() }

    pub fn events(&self) -> Vec<(ResourceRef, Notification)> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn reasons(&self) -> Vec<&'static str> { self.events().into_iter().map(|(_, n)| n.reason).collect() }

    pub fn warnings(&self) -> usize { self.events().iter().filter(|(_, n)| n.severity == Severity::Warning).count() }

    pub fn clear(&self) { self.events.lock().unwrap_or_else(|e| e.into_inner()).clear(); }
}

#[async_trait]
impl EventSink for RecordingSink {
    async fn publish(&self, object: &ResourceRef, notification: Notification) {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).push((object.clone(), notification));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_reference_carries_identity() {
        let r = ResourceRef::new("keel.dev/v1", "ResourceGroup", Some("team"), "apps");
        let o = object_reference(&r);
        assert_eq!(o.api_version.as_deref(), Some("keel.dev/v1"));
        assert_eq!(o.namespace.as_deref(), Some("team"));
        assert_eq!(o.name.as_deref(), Some("apps"));
    }

    #[tokio::test]
    async fn recording_sink_counts_warnings() {
        let sink = RecordingSink::new();
        let r = ResourceRef::new("v1", "ConfigMap", Some("ns"), "a");
        sink.publish(&r, Notification::normal("ApplySucceeded", "ok")).await;
        sink.publish(&r, Notification::warning("BuildFailed", "bad")).await;
        assert_eq!(sink.reasons(), ["ApplySucceeded", "BuildFailed"]);
        assert_eq!(sink.warnings(), 1);
        sink.clear();
        assert!(sink.events().is_empty());
    }
}

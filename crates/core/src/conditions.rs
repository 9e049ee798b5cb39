//! Status conditions and the Ready/Reconciling/Stalled lifecycle shared by every managed kind.
//!
//! Invariants kept by the transition methods on [`Conditions`]:
//! - at most one condition per type;
//! - `Stalled=True` implies `Ready=False`;
//! - `Reconciling` is dropped once Ready or Stalled is True (see [`Conditions::finalize`]).

use chrono::{SecondsFormat, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub const READY: &str = "Ready";
pub const RECONCILING: &str = "Reconciling";
pub const STALLED: &str = "Stalled";

/// Reason codes. Shared by all managed kinds and by emitted events.
pub mod reasons {
    pub const PROGRESSING: &str = "Progressing";
    pub const PROGRESSING_WITH_RETRY: &str = "ProgressingWithRetry";
    pub const RECONCILIATION_DISABLED: &str = "ReconciliationDisabled";
    pub const RECONCILIATION_SUCCEEDED: &str = "ReconciliationSucceeded";
    pub const RECONCILIATION_FAILED: &str = "ReconciliationFailed";
    pub const DEPENDENCY_NOT_READY: &str = "DependencyNotReady";
    pub const BUILD_FAILED: &str = "BuildFailed";
    pub const INVALID_CONFIGURATION: &str = "InvalidConfiguration";
    pub const ARTIFACT_FAILED: &str = "ArtifactFailed";
    pub const TERMINATION_FAILED: &str = "TerminationFailed";
    // Event-only reasons
    pub const APPLY_SUCCEEDED: &str = "ApplySucceeded";
    pub const GARBAGE_COLLECTION_SUCCEEDED: &str = "GarbageCollectionSucceeded";
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: ConditionStatus,
    pub reason: String,
    #[serde(default)]
    pub message: String,
    pub last_transition_time: String,
}

pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(transparent)]
pub struct Conditions(pub Vec<Condition>);

impl Conditions {
    pub fn new() -> Self { Self::default() }

    pub fn get(&self, type_: &str) -> Option<&Condition> {
        self.0.iter().find(|c| c.type_ == type_)
    }

    pub fn has(&self, type_: &str) -> bool { self.get(type_).is_some() }

    pub fn is_true(&self, type_: &str) -> bool {
        self.get(type_).map(|c| c.status == ConditionStatus::True).unwrap_or(false)
    }

    pub fn is_false(&self, type_: &str) -> bool {
        self.get(type_).map(|c| c.status == ConditionStatus::False).unwrap_or(false)
    }

    pub fn reason(&self, type_: &str) -> Option<&str> {
        self.get(type_).map(|c| c.reason.as_str())
    }

    /// Upsert a condition. The transition time only moves when the status does.
    pub fn set(&mut self, type_: &str, status: ConditionStatus, reason: &str, message: &str) {
        let now = now_rfc3339();
        match self.0.iter_mut().find(|c| c.type_ == type_) {
            Some(c) => {
                if c.status != status {
                    c.last_transition_time = now;
                }
                c.status = status;
                c.reason = reason.to_string();
                c.message = message.to_string();
            }
            None => self.0.push(Condition {
                type_: type_.to_string(),
                status,
                reason: reason.to_string(),
                message: message.to_string(),
                last_transition_time: now,
            }),
        }
    }

    pub fn delete(&mut self, type_: &str) { self.0.retain(|c| c.type_ != type_); }

    pub fn as_slice(&self) -> &[Condition] { &self.0 }

    // ---- lifecycle transitions ----

    /// First observation of an object (finalizer not yet attached).
    pub fn initialize(&mut self, disabled: bool) {
        if disabled {
            self.set(READY, ConditionStatus::True, reasons::RECONCILIATION_DISABLED, "Reconciliation is disabled");
        } else {
            self.set(READY, ConditionStatus::Unknown, reasons::PROGRESSING, "Reconciliation in progress");
            self.set(RECONCILING, ConditionStatus::True, reasons::PROGRESSING, "Reconciliation in progress");
        }
    }

    /// Start of a build/apply attempt. A fresh attempt is never stalled.
    pub fn begin(&mut self) {
        self.delete(STALLED);
        self.set(RECONCILING, ConditionStatus::True, reasons::PROGRESSING, "Reconciliation in progress");
        self.set(READY, ConditionStatus::Unknown, reasons::PROGRESSING, "Reconciliation in progress");
    }

    pub fn dependency_not_ready(&mut self, message: &str) {
        self.ensure_reconciling();
        self.set(READY, ConditionStatus::False, reasons::DEPENDENCY_NOT_READY, message);
    }

    /// Transient failure: Ready=False, Reconciling kept so finalize escalates it to a retry.
    pub fn failed(&mut self, reason: &str, message: &str) {
        self.ensure_reconciling();
        self.set(READY, ConditionStatus::False, reason, message);
    }

    /// Terminal failure: only a spec change gets the object out of here.
    pub fn stalled(&mut self, reason: &str, message: &str) {
        self.set(STALLED, ConditionStatus::True, reason, message);
        self.set(READY, ConditionStatus::False, reason, message);
        self.delete(RECONCILING);
    }

    pub fn succeeded(&mut self, message: &str) {
        self.set(READY, ConditionStatus::True, reasons::RECONCILIATION_SUCCEEDED, message);
        self.delete(STALLED);
        self.delete(RECONCILING);
    }

    /// Runs after every attempt, whatever its outcome.
    pub fn finalize(&mut self) {
        if self.is_true(READY) || self.is_true(STALLED) {
            self.delete(RECONCILING);
            return;
        }
        if self.is_false(READY) {
            if let Some(c) = self.0.iter_mut().find(|c| c.type_ == RECONCILING) {
                c.reason = reasons::PROGRESSING_WITH_RETRY.to_string();
            }
        }
    }

    /// Keep the transition times of `before` for every condition whose status ended up
    /// where it started. Intermediate flips inside one attempt are not transitions.
    pub fn settle_transitions(&mut self, before: &Conditions) {
        for c in self.0.iter_mut() {
            if let Some(prev) = before.get(&c.type_).filter(|p| p.status == c.status) {
                c.last_transition_time = prev.last_transition_time.clone();
            }
        }
    }

    fn ensure_reconciling(&mut self) {
        if !self.has(RECONCILING) {
            self.set(RECONCILING, ConditionStatus::True, reasons::PROGRESSING, "Reconciliation in progress");
        }
    }
}

//! Keel annotation schema: recognized keys, typed reconcile configuration and admission checks.
//!
//! Every managed object is configured through a small fixed set of annotations. They are
//! parsed once per reconcile into a [`ReconcileConfig`]; invalid values are an error here
//! and are expected to be rejected at admission by [`validate_object`] long before that.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::time::Duration;

use keel_core::ManagedObject;
use serde::Serialize;
use serde_json::Value as Json;

pub const RECONCILE_ANNOTATION: &str = "keel.dev/reconcile";
pub const REQUESTED_AT_ANNOTATION: &str = "keel.dev/requestedAt";
pub const RECONCILE_EVERY_ANNOTATION: &str = "keel.dev/reconcileEvery";
pub const RECONCILE_TIMEOUT_ANNOTATION: &str = "keel.dev/reconcileTimeout";
pub const RECONCILE_ARTIFACT_EVERY_ANNOTATION: &str = "keel.dev/reconcileArtifactEvery";

pub const ENABLED_VALUE: &str = "enabled";
pub const DISABLED_VALUE: &str = "disabled";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ValueKind {
    /// `enabled` | `disabled`
    Toggle,
    /// Go-style positive duration, e.g. `90s`, `10m`, `1h30m`
    Duration,
    /// Opaque string
    Token,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnnotationSpec {
    pub key: &'static str,
    pub kind: ValueKind,
    pub default: &'static str,
    pub effect: &'static str,
}

pub const KNOWN_ANNOTATIONS: &[AnnotationSpec] = &[
    AnnotationSpec { key: RECONCILE_ANNOTATION, kind: ValueKind::Toggle, default: ENABLED_VALUE, effect: "disabled skips all reconciliation work" },
    AnnotationSpec { key: REQUESTED_AT_ANNOTATION, kind: ValueKind::Token, default: "", effect: "a new value requests an immediate reconciliation" },
    AnnotationSpec { key: RECONCILE_EVERY_ANNOTATION, kind: ValueKind::Duration, default: "spec.interval or controller default", effect: "periodic reconciliation interval" },
    AnnotationSpec { key: RECONCILE_TIMEOUT_ANNOTATION, kind: ValueKind::Duration, default: "spec.timeout or 5m", effect: "apply and readiness wait timeout" },
    AnnotationSpec { key: RECONCILE_ARTIFACT_EVERY_ANNOTATION, kind: ValueKind::Duration, default: "controller default", effect: "artifact drift polling interval" },
];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid value {value:?} for {field}: {reason}")]
pub struct SchemaError {
    pub field: String,
    pub value: String,
    pub reason: String,
}

impl SchemaError {
    fn new(field: &str, value: &str, reason: impl Into<String>) -> Self {
        Self { field: field.to_string(), value: value.to_string(), reason: reason.into() }
    }
}

/// Parse a Go-style duration: one or more `<number><unit>` groups with units `ms`, `s`, `m`, `h`.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration".into());
    }
    if s == "0" {
        return Ok(Duration::ZERO);
    }
    let mut total = 0f64;
    let mut rest = s;
    while !rest.is_empty() {
        let num_len = rest.find(|c: char| !(c.is_ascii_digit() || c == '.')).unwrap_or(rest.len());
        if num_len == 0 {
            return Err(format!("expected a number at {:?}", rest));
        }
        let value: f64 = rest[..num_len].parse().map_err(|_| format!("bad number {:?}", &rest[..num_len]))?;
        rest = &rest[num_len..];
        let unit_len = rest.find(|c: char| c.is_ascii_digit() || c == '.').unwrap_or(rest.len());
        let secs = match &rest[..unit_len] {
            "ms" => value / 1000.0,
            "s" => value,
            "m" => value * 60.0,
            "h" => value * 3600.0,
            "" => return Err("missing unit".into()),
            u => return Err(format!("unknown unit {:?}", u)),
        };
        total += secs;
        rest = &rest[unit_len..];
    }
    Ok(Duration::from_secs_f64(total))
}

/// Short human form: `850ms`, `2.1s`, `1m30s`, `2h`.
pub fn format_duration(d: Duration) -> String {
    let ms = d.as_millis();
    if ms < 1000 {
        return format!("{}ms", ms);
    }
    if ms < 60_000 {
        let s = format!("{:.1}", d.as_secs_f64());
        return format!("{}s", s.trim_end_matches(".0"));
    }
    let total = d.as_secs();
    let (h, m, s) = (total / 3600, (total % 3600) / 60, total % 60);
    let mut out = String::new();
    if h > 0 { out.push_str(&format!("{}h", h)); }
    if m > 0 { out.push_str(&format!("{}m", m)); }
    if s > 0 { out.push_str(&format!("{}s", s)); }
    out
}

fn positive_duration(field: &str, raw: &str) -> Result<Duration, SchemaError> {
    match parse_duration(raw) {
        Ok(d) if d.is_zero() => Err(SchemaError::new(field, raw, "must be greater than zero")),
        Ok(d) => Ok(d),
        Err(e) => Err(SchemaError::new(field, raw, e)),
    }
}

/// Typed view of the per-object configuration, computed once per reconcile.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileConfig {
    pub disabled: bool,
    pub requested_at: Option<String>,
    /// Annotation override, else `spec.interval`.
    pub interval: Option<Duration>,
    /// Annotation override, else `spec.timeout`.
    pub timeout: Option<Duration>,
    pub artifact_interval: Option<Duration>,
}

impl ReconcileConfig {
    pub fn from_parts(
        annotations: &BTreeMap<String, String>,
        spec_interval: Option<&str>,
        spec_timeout: Option<&str>,
    ) -> Result<Self, SchemaError> {
        let disabled = match annotations.get(RECONCILE_ANNOTATION).map(|s| s.as_str()) {
            None | Some(ENABLED_VALUE) => false,
            Some(DISABLED_VALUE) => true,
            Some(other) => return Err(SchemaError::new(RECONCILE_ANNOTATION, other, "expected enabled or disabled")),
        };
        let interval = match annotations.get(RECONCILE_EVERY_ANNOTATION) {
            Some(v) => Some(positive_duration(RECONCILE_EVERY_ANNOTATION, v)?),
            None => spec_interval.map(|v| positive_duration("spec.interval", v)).transpose()?,
        };
        let timeout = match annotations.get(RECONCILE_TIMEOUT_ANNOTATION) {
            Some(v) => Some(positive_duration(RECONCILE_TIMEOUT_ANNOTATION, v)?),
            None => spec_timeout.map(|v| positive_duration("spec.timeout", v)).transpose()?,
        };
        let artifact_interval = annotations
            .get(RECONCILE_ARTIFACT_EVERY_ANNOTATION)
            .map(|v| positive_duration(RECONCILE_ARTIFACT_EVERY_ANNOTATION, v))
            .transpose()?;
        Ok(Self {
            disabled,
            requested_at: annotations.get(REQUESTED_AT_ANNOTATION).cloned(),
            interval,
            timeout,
            artifact_interval,
        })
    }

    pub fn from_object(obj: &dyn ManagedObject) -> Result<Self, SchemaError> {
        Self::from_parts(&obj.annotations(), obj.interval(), obj.timeout())
    }
}

/// Admission-time validation of a managed object document. Returns every problem found.
pub fn validate_object(obj: &Json) -> Result<(), Vec<SchemaError>> {
    let mut errs = Vec::new();
    let annotations = keel_core::json::annotations(obj);
    let spec = obj.get("spec");
    fn spec_str<'a>(spec: Option<&'a Json>, k: &str) -> Option<&'a str> {
        spec.and_then(|s| s.get(k)).and_then(|v| v.as_str())
    }
    if let Err(e) = ReconcileConfig::from_parts(&annotations, spec_str(spec, "interval"), spec_str(spec, "timeout")) {
        errs.push(e);
    }
    // from_parts stops at the first problem; spec.interval and spec.timeout get their own pass
    for field in ["interval", "timeout"] {
        if let Some(v) = spec_str(spec, field) {
            if let Err(e) = positive_duration(&format!("spec.{}", field), v) {
                if !errs.contains(&e) {
                    errs.push(e);
                }
            }
        }
    }
    if let Some(deps) = spec.and_then(|s| s.get("dependsOn")).and_then(|d| d.as_array()) {
        for (i, d) in deps.iter().enumerate() {
            for k in ["apiVersion", "kind", "name"] {
                if d.get(k).and_then(|v| v.as_str()).map(|s| s.is_empty()).unwrap_or(true) {
                    errs.push(SchemaError::new(&format!("spec.dependsOn[{}].{}", i, k), "", "required"));
                }
            }
        }
    }
    if errs.is_empty() { Ok(()) } else { Err(errs) }
}

use std::sync::Mutex;
use std::time::Duration;

use keel_schema::ReconcileConfig;
use rustc_hash::FxHashMap;

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(60 * 60);
pub const DEFAULT_ARTIFACT_INTERVAL: Duration = Duration::from_secs(10 * 60);
pub const DEPENDENCY_RETRY: Duration = Duration::from_secs(5);

/// Picks the delay before the next scheduled reconciliation of an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequeueScheduler {
    pub default_interval: Duration,
    pub artifact_interval: Duration,
}

impl Default for RequeueScheduler {
    fn default() -> Self { Self { default_interval: DEFAULT_INTERVAL, artifact_interval: DEFAULT_ARTIFACT_INTERVAL } }
}

impl RequeueScheduler {
    pub fn new(default_interval: Duration, artifact_interval: Duration) -> Self { Self { default_interval, artifact_interval } }

    /// Main loop: annotation override, then `spec.interval`, then the global default.
    /// `ReconcileConfig` already resolved the first two.
    pub fn next_interval(&self, cfg: &ReconcileConfig) -> Duration { cfg.interval.unwrap_or(self.default_interval) }

    /// Artifact loop: only the annotation overrides the global default.
    pub fn next_artifact_interval(&self, cfg: &ReconcileConfig) -> Duration {
        cfg.artifact_interval.unwrap_or(self.artifact_interval)
    }

    pub fn dependency_retry(&self) -> Duration { DEPENDENCY_RETRY }
}

/// Per-object exponential failure backoff: `base * 2^n`, capped at `max`.
#[derive(Debug)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    failures: Mutex<FxHashMap<String, u32>>,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self { Self { base, max, failures: Mutex::new(FxHashMap::default()) } }

    /// Record one more failure for `key` and return the delay before retrying.
    pub fn next(&self, key: &str) -> Duration {
        let mut failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
        let n = failures.entry(key.to_string()).or_insert(0);
        let delay = delay(self.base, self.max, *n);
        *n = n.saturating_add(1);
        delay
    }

    pub fn reset(&self, key: &str) {
        self.failures.lock().unwrap_or_else(|e| e.into_inner()).remove(key);
    }

    pub fn failures(&self, key: &str) -> u32 {
        self.failures.lock().unwrap_or_else(|e| e.into_inner()).get(key).copied().unwrap_or(0)
    }
}

fn delay(base: Duration, max: Duration, n: u32) -> Duration {
    1u32.checked_shl(n).and_then(|factor| base.checked_mul(factor)).unwrap_or(max).min(max)
}

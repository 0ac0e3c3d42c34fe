//! Metrics sink injected into every component.
//!
//! Components never touch a process-wide registry directly. They receive an
//! `Arc<dyn MetricsSink>` at construction:
//! - [`NoopMetrics`] discards everything
//! - [`RecordingMetrics`] keeps values in memory for tests and diagnostics
//! - [`MetricsFacade`] forwards to the `metrics` crate so the host's exporter
//!   (Prometheus or otherwise) picks them up

use std::sync::Arc;

use dashmap::DashMap;

/// Metric names as constants for consistency.
pub mod names {
    // Key cache
    pub const JWKS_CACHE_HITS_TOTAL: &str = "jwks_cache_hits_total";
    pub const JWKS_CACHE_MISSES_TOTAL: &str = "jwks_cache_misses_total";
    pub const JWKS_FETCH_ERRORS_TOTAL: &str = "jwks_fetch_errors_total";
    pub const JWKS_KEYS_TOTAL: &str = "jwks_keys_total";
    pub const JWKS_KEY_ROTATIONS_TOTAL: &str = "jwks_key_rotations_total";
    pub const JWKS_KEYS_ADDED_TOTAL: &str = "jwks_keys_added_total";
    pub const JWKS_KEYS_REMOVED_TOTAL: &str = "jwks_keys_removed_total";
    pub const JWKS_LAST_ROTATION_TIMESTAMP: &str = "jwks_last_rotation_timestamp";

    // OIDC flow
    pub const OIDC_LOGINS_TOTAL: &str = "oidc_logins_total";
    pub const OIDC_TOKEN_REFRESHES_TOTAL: &str = "oidc_token_refreshes_total";

    // Replay tracker
    pub const JTI_REPLAY_ATTEMPTS_TOTAL: &str = "jti_replay_attempts_total";
    pub const JTI_STORED_TOTAL: &str = "jti_stored_total";
    pub const JTI_ENTRIES: &str = "jti_entries";

    // Lockout
    pub const AUTH_LOCKOUTS_TOTAL: &str = "auth_lockouts_total";
    pub const AUTH_FAILED_ATTEMPTS_TOTAL: &str = "auth_failed_attempts_total";

    // CSRF
    pub const CSRF_REJECTIONS_TOTAL: &str = "csrf_rejections_total";

    // Sessions
    pub const SESSIONS_CREATED_TOTAL: &str = "sessions_created_total";
    pub const SESSIONS_REVOKED_TOTAL: &str = "sessions_revoked_total";
    pub const BACKCHANNEL_LOGOUT_TOTAL: &str = "backchannel_logout_total";

    // Event queue
    pub const SECURITY_EVENTS_DROPPED_TOTAL: &str = "security_events_dropped_total";
}

/// Destination for counters and gauges.
pub trait MetricsSink: Send + Sync {
    /// Adds one to a counter.
    fn increment_counter(&self, name: &'static str, labels: &[(&'static str, &str)]) {
        self.add_counter(name, labels, 1);
    }

    /// Adds `value` to a counter.
    fn add_counter(&self, name: &'static str, labels: &[(&'static str, &str)], value: u64);

    /// Sets a gauge to `value`.
    fn set_gauge(&self, name: &'static str, labels: &[(&'static str, &str)], value: f64);
}

/// Sink that discards every observation.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn add_counter(&self, _name: &'static str, _labels: &[(&'static str, &str)], _value: u64) {}

    fn set_gauge(&self, _name: &'static str, _labels: &[(&'static str, &str)], _value: f64) {}
}

/// Returns a shared no-op sink.
#[must_use]
pub fn noop() -> Arc<dyn MetricsSink> {
    Arc::new(NoopMetrics)
}

/// Sink forwarding to the `metrics` crate facade.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsFacade;

fn to_labels(labels: &[(&'static str, &str)]) -> Vec<metrics::Label> {
    labels
        .iter()
        .map(|(k, v)| metrics::Label::new(*k, v.to_string()))
        .collect()
}

impl MetricsSink for MetricsFacade {
    fn add_counter(&self, name: &'static str, labels: &[(&'static str, &str)], value: u64) {
        metrics::counter!(name, to_labels(labels)).increment(value);
    }

    fn set_gauge(&self, name: &'static str, labels: &[(&'static str, &str)], value: f64) {
        metrics::gauge!(name, to_labels(labels)).set(value);
    }
}

/// In-memory sink that can be inspected afterwards.
#[derive(Debug, Default)]
pub struct RecordingMetrics {
    counters: DashMap<String, u64>,
    gauges: DashMap<String, f64>,
}

impl RecordingMetrics {
    /// Creates an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Counter value for an exact label set.
    #[must_use]
    pub fn counter_with(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        self.counters
            .get(&series_key(name, labels))
            .map(|v| *v)
            .unwrap_or(0)
    }

    /// Counter value summed over every label set.
    #[must_use]
    pub fn counter(&self, name: &str) -> u64 {
        self.counters
            .iter()
            .filter(|entry| series_name(entry.key()) == name)
            .map(|entry| *entry.value())
            .sum()
    }

    /// Gauge value for an exact label set.
    #[must_use]
    pub fn gauge(&self, name: &str, labels: &[(&str, &str)]) -> Option<f64> {
        self.gauges.get(&series_key(name, labels)).map(|v| *v)
    }
}

impl MetricsSink for RecordingMetrics {
    fn add_counter(&self, name: &'static str, labels: &[(&'static str, &str)], value: u64) {
        *self.counters.entry(series_key(name, labels)).or_insert(0) += value;
    }

    fn set_gauge(&self, name: &'static str, labels: &[(&'static str, &str)], value: f64) {
        self.gauges.insert(series_key(name, labels), value);
    }
}

/// `name{a=1,b=2}` with labels sorted by key.
fn series_key(name: &str, labels: &[(&str, &str)]) -> String {
    if labels.is_empty() {
        return name.to_string();
    }
    let mut sorted: Vec<_> = labels.to_vec();
    sorted.sort_unstable();
    let rendered: Vec<String> = sorted.iter().map(|(k, v)| format!("{k}={v}")).collect();
    format!("{name}{{{}}}", rendered.join(","))
}

fn series_name(key: &str) -> &str {
    key.split('{').next().unwrap_or(key)
}

//! Metrics collection for the Live Camera Gateway
//!
//! Provides basic counters for monitoring session churn and artifact traffic.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Gateway metrics collector
#[derive(Default)]
pub struct Metrics {
    /// Sessions started since startup
    sessions_started: AtomicU64,

    /// Sessions stopped on request since startup
    sessions_stopped: AtomicU64,

    /// Launch failures and encoder crashes since startup
    sessions_failed: AtomicU64,

    /// Sessions currently holding a device
    active_sessions: AtomicU64,

    /// Playback tokens minted
    tokens_issued: AtomicU64,

    /// Artifacts served
    artifacts_served: AtomicU64,

    /// Artifact bytes served
    bytes_served: AtomicU64,

    /// Artifact requests rejected for token or path reasons
    access_denied: AtomicU64,

    /// Startup timestamp (unix seconds)
    startup_time: AtomicU64,
}

impl Metrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();

        Self {
            startup_time: AtomicU64::new(now),
            ..Default::default()
        }
    }

    pub fn session_started(&self) {
        self.sessions_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_stopped(&self) {
        self.sessions_stopped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_failed(&self) {
        self.sessions_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Overwrite the active-session gauge
    pub fn set_active_sessions(&self, count: u64) {
        self.active_sessions.store(count, Ordering::Relaxed);
    }

    pub fn token_issued(&self) {
        self.tokens_issued.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one served artifact of `bytes` length
    pub fn artifact_served(&self, bytes: u64) {
        self.artifacts_served.fetch_add(1, Ordering::Relaxed);
        self.bytes_served.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn access_denied(&self) {
        self.access_denied.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();

        let uptime_secs = now.saturating_sub(self.startup_time.load(Ordering::Relaxed));

        MetricsSnapshot {
            sessions_started: self.sessions_started.load(Ordering::Relaxed),
            sessions_stopped: self.sessions_stopped.load(Ordering::Relaxed),
            sessions_failed: self.sessions_failed.load(Ordering::Relaxed),
            active_sessions: self.active_sessions.load(Ordering::Relaxed),
            tokens_issued: self.tokens_issued.load(Ordering::Relaxed),
            artifacts_served: self.artifacts_served.load(Ordering::Relaxed),
            bytes_served: self.bytes_served.load(Ordering::Relaxed),
            access_denied: self.access_denied.load(Ordering::Relaxed),
            uptime_secs,
        }
    }
}

/// Snapshot of current metrics
#[derive(Debug, Clone, serde::Serialize)]
pub struct MetricsSnapshot {
    pub sessions_started: u64,
    pub sessions_stopped: u64,
    pub sessions_failed: u64,
    pub active_sessions: u64,
    pub tokens_issued: u64,
    pub artifacts_served: u64,
    pub bytes_served: u64,
    pub access_denied: u64,
    pub uptime_secs: u64,
}

impl MetricsSnapshot {
    /// Bytes served per second of uptime
    pub fn bytes_per_second(&self) -> f64 {
        if self.uptime_secs == 0 {
            0.0
        } else {
            self.bytes_served as f64 / self.uptime_secs as f64
        }
    }
}

/// Global metrics instance
static GLOBAL_METRICS: std::sync::OnceLock<Arc<Metrics>> = std::sync::OnceLock::new();

/// Get the global metrics instance
pub fn global_metrics() -> Arc<Metrics> {
    GLOBAL_METRICS
        .get_or_init(|| Arc::new(Metrics::new()))
        .clone()
}

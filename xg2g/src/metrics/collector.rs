//! Metrics collector implementation.
//!
//! Collects counters for the session control plane. Gauges that already live
//! elsewhere (pool occupancy, breaker state) are read at export time.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::control::admission::AdmissionClass;
use crate::control::breaker::CircuitState;
use crate::session::{EvictionReport, SessionState};

/// Metrics collector for the session control plane.
#[derive(Debug)]
pub struct MetricsCollector {
    // Session metrics
    sessions_started: AtomicU64,
    active_sessions: AtomicU64,
    session_outcomes: DashMap<String, AtomicU64>,
    session_duration_total_ms: AtomicU64,
    session_count: AtomicU64,
    bytes_transcoded_total: AtomicU64,
    intents_rejected: DashMap<String, AtomicU64>,

    // Admission metrics
    admission_granted: DashMap<String, AtomicU64>,
    admission_denied: DashMap<String, AtomicU64>,

    // Breaker metrics
    breaker_rejections: DashMap<String, AtomicU64>,
    breaker_opened: DashMap<String, AtomicU64>,

    // Resolver metrics
    duration_cache_hits: AtomicU64,
    duration_cache_misses: AtomicU64,

    // Eviction metrics
    evictions_total: AtomicU64,
    eviction_errors_total: AtomicU64,
    orphans_removed_total: AtomicU64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            sessions_started: AtomicU64::new(0),
            active_sessions: AtomicU64::new(0),
            session_outcomes: DashMap::new(),
            session_duration_total_ms: AtomicU64::new(0),
            session_count: AtomicU64::new(0),
            bytes_transcoded_total: AtomicU64::new(0),
            intents_rejected: DashMap::new(),
            admission_granted: DashMap::new(),
            admission_denied: DashMap::new(),
            breaker_rejections: DashMap::new(),
            breaker_opened: DashMap::new(),
            duration_cache_hits: AtomicU64::new(0),
            duration_cache_misses: AtomicU64::new(0),
            evictions_total: AtomicU64::new(0),
            eviction_errors_total: AtomicU64::new(0),
            orphans_removed_total: AtomicU64::new(0),
        }
    }

    fn bump(map: &DashMap<String, AtomicU64>, key: impl Into<String>) {
        map.entry(key.into())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    fn collect(map: &DashMap<String, AtomicU64>) -> HashMap<String, u64> {
        map.iter()
            .map(|e| (e.key().clone(), e.value().load(Ordering::Relaxed)))
            .collect()
    }

    // ========== Session Metrics ==========

    pub fn record_session_started(&self) {
        self.sessions_started.fetch_add(1, Ordering::Relaxed);
        self.active_sessions.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a session reaching a terminal state.
    pub fn record_session_finished(&self, state: SessionState, duration: Duration, bytes: u64) {
        // Saturating: a finish without a matching start must not wrap.
        let _ = self
            .active_sessions
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                Some(n.saturating_sub(1))
            });
        Self::bump(&self.session_outcomes, state.to_string());
        self.session_duration_total_ms
            .fetch_add(duration.as_millis() as u64, Ordering::Relaxed);
        self.session_count.fetch_add(1, Ordering::Relaxed);
        self.bytes_transcoded_total
            .fetch_add(bytes, Ordering::Relaxed);
    }

    /// Record an intent rejected before a session was created.
    pub fn record_intent_rejected(&self, reason: &str) {
        Self::bump(&self.intents_rejected, reason);
    }

    pub fn active_sessions(&self) -> u64 {
        self.active_sessions.load(Ordering::Relaxed)
    }

    // ========== Admission Metrics ==========

    pub fn record_admission_granted(&self, class: AdmissionClass) {
        Self::bump(&self.admission_granted, class.to_string());
    }

    pub fn record_admission_denied(&self, class: AdmissionClass) {
        Self::bump(&self.admission_denied, class.to_string());
    }

    // ========== Breaker Metrics ==========

    pub fn record_breaker_rejection(&self, name: &str) {
        Self::bump(&self.breaker_rejections, name);
    }

    pub fn record_breaker_transition(&self, name: &str, to: CircuitState) {
        if to == CircuitState::Open {
            Self::bump(&self.breaker_opened, name);
        }
    }

    // ========== Resolver Metrics ==========

    pub fn record_duration_cache(&self, hit: bool) {
        if hit {
            self.duration_cache_hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.duration_cache_misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    // ========== Eviction Metrics ==========

    pub fn record_eviction(&self, report: &EvictionReport) {
        self.evictions_total
            .fetch_add(report.evicted as u64, Ordering::Relaxed);
        self.eviction_errors_total
            .fetch_add(report.failed as u64, Ordering::Relaxed);
        self.orphans_removed_total
            .fetch_add(report.orphans_removed as u64, Ordering::Relaxed);
    }

    // ========== Snapshot ==========

    /// Get a snapshot of all metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let session_outcomes = Self::collect(&self.session_outcomes);
        MetricsSnapshot {
            sessions_started_total: self.sessions_started.load(Ordering::Relaxed),
            active_sessions: self.active_sessions.load(Ordering::Relaxed),
            stalls_total: session_outcomes
                .get(&SessionState::Stalled.to_string())
                .copied()
                .unwrap_or(0),
            session_outcomes,
            session_duration_total_ms: self.session_duration_total_ms.load(Ordering::Relaxed),
            session_count: self.session_count.load(Ordering::Relaxed),
            session_duration_avg_ms: self.avg_session_duration_ms(),
            bytes_transcoded_total: self.bytes_transcoded_total.load(Ordering::Relaxed),
            intents_rejected: Self::collect(&self.intents_rejected),
            admission_granted: Self::collect(&self.admission_granted),
            admission_denied: Self::collect(&self.admission_denied),
            breaker_rejections: Self::collect(&self.breaker_rejections),
            breaker_opened: Self::collect(&self.breaker_opened),
            duration_cache_hits: self.duration_cache_hits.load(Ordering::Relaxed),
            duration_cache_misses: self.duration_cache_misses.load(Ordering::Relaxed),
            evictions_total: self.evictions_total.load(Ordering::Relaxed),
            eviction_errors_total: self.eviction_errors_total.load(Ordering::Relaxed),
            orphans_removed_total: self.orphans_removed_total.load(Ordering::Relaxed),
        }
    }

    fn avg_session_duration_ms(&self) -> f64 {
        let count = self.session_count.load(Ordering::Relaxed);
        if count == 0 {
            return 0.0;
        }
        let total = self.session_duration_total_ms.load(Ordering::Relaxed);
        total as f64 / count as f64
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

/// A snapshot of all metrics at a point in time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    // Session metrics
    pub sessions_started_total: u64,
    pub active_sessions: u64,
    pub session_outcomes: HashMap<String, u64>,
    pub stalls_total: u64,
    pub session_duration_total_ms: u64,
    pub session_count: u64,
    pub session_duration_avg_ms: f64,
    pub bytes_transcoded_total: u64,
    pub intents_rejected: HashMap<String, u64>,

    // Admission metrics
    pub admission_granted: HashMap<String, u64>,
    pub admission_denied: HashMap<String, u64>,

    // Breaker metrics
    pub breaker_rejections: HashMap<String, u64>,
    pub breaker_opened: HashMap<String, u64>,

    // Resolver metrics
    pub duration_cache_hits: u64,
    pub duration_cache_misses: u64,

    // Eviction metrics
    pub evictions_total: u64,
    pub eviction_errors_total: u64,
    pub orphans_removed_total: u64,
}

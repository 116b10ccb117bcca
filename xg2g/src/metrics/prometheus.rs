//! Prometheus metrics exporter.
//!
//! Exports metrics in Prometheus text format.

use std::fmt::Write as _;
use std::sync::Arc;

use super::collector::MetricsCollector;
use crate::control::admission::AdmissionController;
use crate::control::breaker::{BreakerRegistry, CircuitState};

pub struct PrometheusExporter {
    collector: Arc<MetricsCollector>,
    admission: Option<Arc<AdmissionController>>,
    breakers: Option<Arc<BreakerRegistry>>,
    namespace: String,
}

impl PrometheusExporter {
    pub fn new(collector: Arc<MetricsCollector>) -> Self {
        Self {
            collector,
            admission: None,
            breakers: None,
            namespace: "xg2g".to_string(),
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Export pool occupancy gauges from `admission`.
    pub fn with_admission(mut self, admission: Arc<AdmissionController>) -> Self {
        self.admission = Some(admission);
        self
    }

    /// Export breaker state gauges from `breakers`.
    pub fn with_breakers(mut self, breakers: Arc<BreakerRegistry>) -> Self {
        self.breakers = Some(breakers);
        self
    }

    /// Export metrics in Prometheus text format.
    pub fn export(&self) -> String {
        let snapshot = self.collector.snapshot();
        let mut output = String::new();

        // Session metrics
        self.write_counter(
            &mut output,
            "sessions_started_total",
            "Total sessions admitted and started",
            snapshot.sessions_started_total as f64,
        );
        self.write_gauge(
            &mut output,
            "sessions_active",
            "Sessions not yet in a terminal state",
            snapshot.active_sessions as f64,
        );
        for (state, count) in sorted(&snapshot.session_outcomes) {
            self.write_counter_with_labels(
                &mut output,
                "sessions_finished_total",
                "Sessions finished by terminal state",
                count as f64,
                &[("state", state)],
            );
        }
        self.write_counter(
            &mut output,
            "watchdog_stalls_total",
            "Sessions terminated by the progress watchdog",
            snapshot.stalls_total as f64,
        );
        self.write_counter(
            &mut output,
            "session_duration_ms_sum",
            "Total wall time of finished sessions in milliseconds",
            snapshot.session_duration_total_ms as f64,
        );
        self.write_counter(
            &mut output,
            "session_duration_ms_count",
            "Number of finished sessions",
            snapshot.session_count as f64,
        );
        self.write_counter(
            &mut output,
            "transcoded_bytes_total",
            "Total bytes written by finished sessions",
            snapshot.bytes_transcoded_total as f64,
        );
        for (reason, count) in sorted(&snapshot.intents_rejected) {
            self.write_counter_with_labels(
                &mut output,
                "intents_rejected_total",
                "Intents rejected before a session was created",
                count as f64,
                &[("reason", reason)],
            );
        }

        // Admission metrics
        for (class, count) in sorted(&snapshot.admission_granted) {
            self.write_counter_with_labels(
                &mut output,
                "admission_granted_total",
                "Admission tickets granted by class",
                count as f64,
                &[("class", class)],
            );
        }
        for (class, count) in sorted(&snapshot.admission_denied) {
            self.write_counter_with_labels(
                &mut output,
                "admission_denied_total",
                "Admission requests rejected by class",
                count as f64,
                &[("class", class)],
            );
        }
        if let Some(admission) = &self.admission {
            for pool in admission.snapshots() {
                let class = pool.class.to_string();
                self.write_gauge_with_labels(
                    &mut output,
                    "admission_in_use",
                    "Admission units currently held by class",
                    pool.in_use as f64,
                    &[("class", &class)],
                );
                self.write_gauge_with_labels(
                    &mut output,
                    "admission_capacity",
                    "Admission capacity by class",
                    pool.capacity as f64,
                    &[("class", &class)],
                );
            }
        }

        // Breaker metrics
        for (name, count) in sorted(&snapshot.breaker_rejections) {
            self.write_counter_with_labels(
                &mut output,
                "breaker_rejections_total",
                "Calls rejected by an open circuit",
                count as f64,
                &[("breaker", name)],
            );
        }
        for (name, count) in sorted(&snapshot.breaker_opened) {
            self.write_counter_with_labels(
                &mut output,
                "breaker_opened_total",
                "Times a circuit opened",
                count as f64,
                &[("breaker", name)],
            );
        }
        if let Some(breakers) = &self.breakers {
            for breaker in breakers.snapshots() {
                let value = match breaker.state {
                    CircuitState::Closed => 0.0,
                    CircuitState::HalfOpen => 1.0,
                    CircuitState::Open => 2.0,
                };
                self.write_gauge_with_labels(
                    &mut output,
                    "breaker_state",
                    "Circuit state (0 closed, 1 half-open, 2 open)",
                    value,
                    &[("breaker", &breaker.name)],
                );
            }
        }

        // Resolver metrics
        self.write_counter(
            &mut output,
            "duration_cache_hits_total",
            "Recording duration cache hits",
            snapshot.duration_cache_hits as f64,
        );
        self.write_counter(
            &mut output,
            "duration_cache_misses_total",
            "Recording duration cache misses",
            snapshot.duration_cache_misses as f64,
        );

        // Eviction metrics
        self.write_counter(
            &mut output,
            "evictions_total",
            "Sessions evicted after retention",
            snapshot.evictions_total as f64,
        );
        self.write_counter(
            &mut output,
            "eviction_errors_total",
            "Session evictions that failed and will be retried",
            snapshot.eviction_errors_total as f64,
        );
        self.write_counter(
            &mut output,
            "orphans_removed_total",
            "Orphaned session directories removed",
            snapshot.orphans_removed_total as f64,
        );

        output
    }

    fn write_header(&self, output: &mut String, full_name: &str, help: &str, kind: &str) {
        let _ = writeln!(output, "# HELP {} {}", full_name, help);
        let _ = writeln!(output, "# TYPE {} {}", full_name, kind);
    }

    fn write_gauge(&self, output: &mut String, name: &str, help: &str, value: f64) {
        let full_name = format!("{}_{}", self.namespace, name);
        self.write_header(output, &full_name, help, "gauge");
        let _ = writeln!(output, "{} {}", full_name, value);
    }

    fn write_gauge_with_labels(
        &self,
        output: &mut String,
        name: &str,
        help: &str,
        value: f64,
        labels: &[(&str, &str)],
    ) {
        let full_name = format!("{}_{}", self.namespace, name);
        self.write_header(output, &full_name, help, "gauge");
        let _ = writeln!(output, "{}{{{}}} {}", full_name, format_labels(labels), value);
    }

    fn write_counter(&self, output: &mut String, name: &str, help: &str, value: f64) {
        let full_name = format!("{}_{}", self.namespace, name);
        self.write_header(output, &full_name, help, "counter");
        let _ = writeln!(output, "{} {}", full_name, value);
    }

    fn write_counter_with_labels(
        &self,
        output: &mut String,
        name: &str,
        help: &str,
        value: f64,
        labels: &[(&str, &str)],
    ) {
        let full_name = format!("{}_{}", self.namespace, name);
        self.write_header(output, &full_name, help, "counter");
        let _ = writeln!(output, "{}{{{}}} {}", full_name, format_labels(labels), value);
    }
}

fn sorted(map: &std::collections::HashMap<String, u64>) -> Vec<(&str, u64)> {
    let mut entries: Vec<_> = map.iter().map(|(k, v)| (k.as_str(), *v)).collect();
    entries.sort_by(|a, b| a.0.cmp(b.0));
    entries
}

fn format_labels(labels: &[(&str, &str)]) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{}=\"{}\"", k, v.replace('\\', "\\\\").replace('"', "\\\"")))
        .collect::<Vec<_>>()
        .join(",")
}

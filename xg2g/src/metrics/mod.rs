//! Metrics and monitoring.
//!
//! Prometheus-compatible counters for the session control plane plus the
//! health checks behind `/health`, `/health/live` and `/health/ready`.
//!
//! # Example
//!
//! ```ignore
//! use xg2g::metrics::{MetricsCollector, PrometheusExporter};
//!
//! let collector = Arc::new(MetricsCollector::new());
//! collector.record_session_started();
//! let text = PrometheusExporter::new(collector).export();
//! ```

mod collector;
mod health;
mod prometheus;

pub use collector::{MetricsCollector, MetricsSnapshot};
pub use health::{
    ComponentHealth, DiskThresholds, HealthCheckFn, HealthChecker, HealthReport, HealthStatus, admission_check,
    breaker_check, writable_check,
};
pub use prometheus::PrometheusExporter;

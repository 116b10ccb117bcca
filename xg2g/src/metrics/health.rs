//! Component health aggregation.
//!
//! Each registered check yields a [`ComponentHealth`]; the report status is
//! the worst component status. Checks run concurrently and a check that
//! overruns its deadline counts as unhealthy.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::{BoxFuture, join_all};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use sysinfo::{CpuRefreshKind, MemoryRefreshKind, RefreshKind, System};
use tracing::{debug, warn};

use crate::control::admission::AdmissionController;
use crate::control::breaker::{BreakerRegistry, CircuitState};
use crate::utils::fs;

/// Deadline for a single check before it is reported unhealthy.
const DEFAULT_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// Ordered from best to worst so aggregation is a `max`.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum::Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub name: String,
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub checked_at: DateTime<Utc>,
    pub elapsed_ms: u64,
}

impl ComponentHealth {
    fn new(name: impl Into<String>, status: HealthStatus, message: Option<String>) -> Self {
        Self {
            name: name.into(),
            status,
            message,
            checked_at: Utc::now(),
            elapsed_ms: 0,
        }
    }

    pub fn healthy(name: impl Into<String>) -> Self {
        Self::new(name, HealthStatus::Healthy, None)
    }

    pub fn degraded(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(name, HealthStatus::Degraded, Some(message.into()))
    }

    pub fn unhealthy(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(name, HealthStatus::Unhealthy, Some(message.into()))
    }

    fn timed(mut self, elapsed: Duration) -> Self {
        self.elapsed_ms = elapsed.as_millis() as u64;
        self
    }
}

/// Result of one pass over every registered check.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    /// Sorted by component name.
    pub components: Vec<ComponentHealth>,
    pub version: &'static str,
    pub uptime_secs: u64,
    /// Global CPU usage in percent.
    pub cpu_usage: f32,
    /// Used memory in percent of total.
    pub memory_usage: f32,
}

impl HealthReport {
    /// Degraded still accepts intents; unhealthy does not.
    pub fn is_ready(&self) -> bool {
        self.status < HealthStatus::Unhealthy
    }
}

pub type HealthCheckFn = Arc<dyn Fn() -> BoxFuture<'static, ComponentHealth> + Send + Sync>;

/// Disk usage ratios (used / total) that degrade or fail health.
#[derive(Debug, Clone, Copy)]
pub struct DiskThresholds {
    pub warning: f64,
    pub critical: f64,
}

impl Default for DiskThresholds {
    fn default() -> Self {
        Self {
            warning: 0.80,
            critical: 0.95,
        }
    }
}

impl DiskThresholds {
    pub fn classify(&self, label: &str, available: u64, total: u64) -> ComponentHealth {
        let name = format!("disk:{label}");
        if total == 0 {
            return ComponentHealth::unhealthy(name, "Unable to determine disk space");
        }

        let used = 1.0 - available as f64 / total as f64;
        let summary = format!(
            "{:.1}% used, {:.1} GiB free",
            used * 100.0,
            available as f64 / GIB
        );
        if used >= self.critical {
            warn!(disk = label, "Disk space critical: {}", summary);
            ComponentHealth::unhealthy(name, summary)
        } else if used >= self.warning {
            warn!(disk = label, "Disk space low: {}", summary);
            ComponentHealth::degraded(name, summary)
        } else {
            debug!(disk = label, "Disk space ok: {}", summary);
            ComponentHealth::healthy(name)
        }
    }
}

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

pub struct HealthChecker {
    checks: RwLock<BTreeMap<String, HealthCheckFn>>,
    check_timeout: Duration,
    disk: DiskThresholds,
    started: Instant,
    system: Mutex<System>,
}

impl Default for HealthChecker {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthChecker {
    pub fn new() -> Self {
        Self {
            checks: RwLock::new(BTreeMap::new()),
            check_timeout: DEFAULT_CHECK_TIMEOUT,
            disk: DiskThresholds::default(),
            started: Instant::now(),
            system: Mutex::new(System::new_with_specifics(
                RefreshKind::nothing()
                    .with_cpu(CpuRefreshKind::nothing().with_cpu_usage())
                    .with_memory(MemoryRefreshKind::nothing().with_ram()),
            )),
        }
    }

    pub fn with_check_timeout(mut self, timeout: Duration) -> Self {
        self.check_timeout = timeout;
        self
    }

    pub fn with_disk_thresholds(mut self, disk: DiskThresholds) -> Self {
        self.disk = disk;
        self
    }

    /// Register (or replace) the check called `name`.
    pub fn register(&self, name: impl Into<String>, check: HealthCheckFn) {
        self.checks.write().insert(name.into(), check);
    }

    pub fn unregister(&self, name: &str) -> bool {
        self.checks.write().remove(name).is_some()
    }

    /// Register a check for the filesystem holding `path`.
    pub fn register_disk_check(&self, path: PathBuf) {
        let thresholds = self.disk;
        self.register(
            "disk",
            Arc::new(move || {
                let path = path.clone();
                async move {
                    let label = path.display().to_string();
                    match tokio::task::spawn_blocking(move || fs::disk_space(&path)).await {
                        Ok(Some((available, total))) => {
                            thresholds.classify(&label, available, total)
                        }
                        _ => ComponentHealth::degraded(
                            format!("disk:{label}"),
                            "Unable to determine disk space",
                        ),
                    }
                }
                .boxed()
            }),
        );
    }

    pub async fn check_all(&self) -> HealthReport {
        let checks: Vec<(String, HealthCheckFn)> = self
            .checks
            .read()
            .iter()
            .map(|(name, check)| (name.clone(), check.clone()))
            .collect();

        let timeout = self.check_timeout;
        let components: Vec<ComponentHealth> =
            join_all(checks.into_iter().map(|(name, check)| async move {
                let start = Instant::now();
                match tokio::time::timeout(timeout, check()).await {
                    Ok(health) => health.timed(start.elapsed()),
                    Err(_) => {
                        warn!(check = %name, "Health check timed out after {:?}", timeout);
                        ComponentHealth::unhealthy(name, "check timed out").timed(start.elapsed())
                    }
                }
            }))
            .await;

        let status = components
            .iter()
            .map(|c| c.status)
            .max()
            .unwrap_or(HealthStatus::Healthy);
        let (cpu_usage, memory_usage) = self.sample_usage();

        HealthReport {
            status,
            components,
            version: env!("CARGO_PKG_VERSION"),
            uptime_secs: self.started.elapsed().as_secs(),
            cpu_usage,
            memory_usage,
        }
    }

    pub async fn check_ready(&self) -> bool {
        self.check_all().await.is_ready()
    }

    fn sample_usage(&self) -> (f32, f32) {
        let mut system = self.system.lock();
        system.refresh_cpu_usage();
        system.refresh_memory();
        let total = system.total_memory();
        let memory = if total == 0 {
            0.0
        } else {
            (system.used_memory() as f64 / total as f64 * 100.0) as f32
        };
        (system.global_cpu_usage(), memory)
    }
}

/// Degraded while any breaker is open.
pub fn breaker_check(breakers: Arc<BreakerRegistry>) -> HealthCheckFn {
    Arc::new(move || {
        let open: Vec<String> = breakers
            .snapshots()
            .into_iter()
            .filter(|b| b.state == CircuitState::Open)
            .map(|b| b.name)
            .collect();
        let health = if open.is_empty() {
            ComponentHealth::healthy("breakers")
        } else {
            ComponentHealth::degraded("breakers", format!("open: {}", open.join(", ")))
        };
        futures::future::ready(health).boxed()
    })
}

/// Degraded while every admission pool is full.
pub fn admission_check(admission: Arc<AdmissionController>) -> HealthCheckFn {
    Arc::new(move || {
        let pools = admission.snapshots();
        let health = if !pools.is_empty() && pools.iter().all(|p| p.is_full()) {
            ComponentHealth::degraded("admission", "all admission pools are saturated")
        } else {
            ComponentHealth::healthy("admission")
        };
        futures::future::ready(health).boxed()
    })
}

/// Unhealthy when sessions cannot write their output.
pub fn writable_check(dir: PathBuf) -> HealthCheckFn {
    Arc::new(move || {
        let dir = dir.clone();
        async move {
            match fs::probe_writable(&dir).await {
                Ok(()) => ComponentHealth::healthy("hls_root"),
                Err(e) => ComponentHealth::unhealthy("hls_root", e.to_string()),
            }
        }
        .boxed()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::admission::{AdmissionClass, AdmissionConfig};
    use crate::control::breaker::BreakerConfig;

    fn ready(health: ComponentHealth) -> HealthCheckFn {
        Arc::new(move || futures::future::ready(health.clone()).boxed())
    }

    #[tokio::test]
    async fn test_empty_checker_is_healthy() {
        let report = HealthChecker::new().check_all().await;
        assert_eq!(report.status, HealthStatus::Healthy);
        assert!(report.components.is_empty());
        assert!(report.is_ready());
    }

    #[tokio::test]
    async fn test_worst_component_wins() {
        let checker = HealthChecker::new();
        checker.register("b", ready(ComponentHealth::degraded("b", "slow")));
        checker.register("a", ready(ComponentHealth::healthy("a")));
        let report = checker.check_all().await;
        assert_eq!(report.status, HealthStatus::Degraded);
        assert!(report.is_ready());
        let names: Vec<_> = report.components.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, ["a", "b"]);

        checker.register("c", ready(ComponentHealth::unhealthy("c", "down")));
        let report = checker.check_all().await;
        assert_eq!(report.status, HealthStatus::Unhealthy);
        assert!(!report.is_ready());

        assert!(checker.unregister("c"));
        assert!(checker.check_ready().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_check_times_out_unhealthy() {
        let checker = HealthChecker::new().with_check_timeout(Duration::from_millis(100));
        checker.register(
            "slow",
            Arc::new(|| {
                async {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    ComponentHealth::healthy("slow")
                }
                .boxed()
            }),
        );
        let report = checker.check_all().await;
        assert_eq!(report.status, HealthStatus::Unhealthy);
        assert_eq!(report.components[0].message.as_deref(), Some("check timed out"));
    }

    #[test]
    fn test_disk_space_thresholds() {
        let disk = DiskThresholds::default();
        const GB: u64 = 1024 * 1024 * 1024;
        assert_eq!(disk.classify("/data", 50 * GB, 100 * GB).status, HealthStatus::Healthy);
        assert_eq!(disk.classify("/data", 15 * GB, 100 * GB).status, HealthStatus::Degraded);
        assert_eq!(disk.classify("/data", 3 * GB, 100 * GB).status, HealthStatus::Unhealthy);
        assert_eq!(disk.classify("/data", 0, 0).status, HealthStatus::Unhealthy);
    }

    #[test]
    fn test_status_display() {
        assert_eq!(HealthStatus::Degraded.to_string(), "degraded");
        assert!(HealthStatus::Healthy < HealthStatus::Unhealthy);
    }

    #[tokio::test]
    async fn test_admission_saturation_degrades() {
        let admission = Arc::new(AdmissionController::new(&AdmissionConfig {
            transcode_capacity: 1,
            cpu_heavy_capacity: 1,
        }));
        let check = admission_check(admission.clone());
        assert_eq!(check().await.status, HealthStatus::Healthy);

        let _a = admission.try_admit(AdmissionClass::Transcode, 1).unwrap();
        assert_eq!(check().await.status, HealthStatus::Healthy);
        let _b = admission.try_admit(AdmissionClass::CpuHeavy, 1).unwrap();
        assert_eq!(check().await.status, HealthStatus::Degraded);
    }

    #[tokio::test]
    async fn test_open_breaker_degrades() {
        let breakers = Arc::new(BreakerRegistry::new(BreakerConfig {
            failure_threshold: 1,
            ..BreakerConfig::default()
        }));
        let check = breaker_check(breakers.clone());
        assert_eq!(check().await.status, HealthStatus::Healthy);

        let _ = breakers
            .get("receiver.status")
            .execute(|| async { Err::<(), _>(crate::Error::Other("down".into())) })
            .await;
        let health = check().await;
        assert_eq!(health.status, HealthStatus::Degraded);
        assert!(health.message.unwrap().contains("receiver.status"));
    }

    #[tokio::test]
    async fn test_writable_check() {
        let dir = tempfile::tempdir().unwrap();
        let check = writable_check(dir.path().to_path_buf());
        assert_eq!(check().await.status, HealthStatus::Healthy);

        let missing = writable_check(dir.path().join("missing"));
        assert_eq!(missing().await.status, HealthStatus::Unhealthy);
    }
}

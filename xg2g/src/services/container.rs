//! Service container for dependency injection.
//!
//! The ServiceContainer builds every control-plane component once, wires
//! them together by `Arc` and owns their background tasks.

use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::Result;
use crate::api::middleware::TokenAuth;
use crate::config::AppConfig;
use crate::control::{
    AdmissionController, BreakerRegistry, CircuitState, DurationStore, PathMapper, RecordingsResolver,
    SessionSupervisor, SupervisorConfig,
};
use crate::executor::{FfmpegExecutor, FfprobeProber};
use crate::metrics::{
    ComponentHealth, HealthCheckFn, HealthChecker, MetricsCollector, PrometheusExporter,
    admission_check, breaker_check, writable_check,
};
use crate::receiver::{OpenWebIfClient, ReceiverClient};
use crate::session::{CacheEvicter, SessionStore};
use crate::utils::fs;

/// Default shutdown timeout.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Service container holding all application services.
pub struct ServiceContainer {
    pub config: AppConfig,
    pub metrics: Arc<MetricsCollector>,
    pub admission: Arc<AdmissionController>,
    pub breakers: Arc<BreakerRegistry>,
    pub store: Arc<SessionStore>,
    pub durations: Arc<DurationStore>,
    pub supervisor: Arc<SessionSupervisor>,
    pub evicter: Arc<CacheEvicter>,
    pub health_checker: Arc<HealthChecker>,
    pub exporter: Arc<PrometheusExporter>,
    pub auth: TokenAuth,
    /// Cancellation token for graceful shutdown.
    cancellation_token: CancellationToken,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl ServiceContainer {
    /// Build every component from `config`.
    pub async fn new(config: AppConfig) -> Result<Self> {
        Self::with_cancellation(config, CancellationToken::new()).await
    }

    pub async fn with_cancellation(
        config: AppConfig,
        cancellation_token: CancellationToken,
    ) -> Result<Self> {
        info!("Initializing service container");

        let hls_root = config.hls_root();
        fs::ensure_dir_all_with_op("create HLS root", &hls_root).await?;

        let metrics = Arc::new(MetricsCollector::new());
        let admission =
            Arc::new(AdmissionController::new(&config.admission).with_metrics(metrics.clone()));
        let breakers =
            Arc::new(BreakerRegistry::new(config.breaker.clone()).with_metrics(metrics.clone()));
        let store = Arc::new(SessionStore::new(hls_root.clone()));

        // Resolver with cached ffprobe durations
        let durations = Arc::new(DurationStore::new());
        let prober = Arc::new(FfprobeProber::new(
            config.ffmpeg.ffprobe_path.clone(),
            config.ffmpeg.probe_timeout,
        ));
        let resolver = RecordingsResolver::new(PathMapper::new(&config.path_mappings)?)
            .with_durations(durations.clone(), prober)
            .with_require_existing(config.resolve_require_existing)
            .with_metrics(metrics.clone());

        let executor = Arc::new(FfmpegExecutor::new(config.ffmpeg.clone()));
        match executor.version() {
            Some(version) => info!("Using {}", version),
            None => warn!(
                binary = %config.ffmpeg.binary_path,
                "ffmpeg not found; sessions will fail to start"
            ),
        }

        let supervisor_config = SupervisorConfig {
            watchdog: config.watchdog.clone(),
            segment_seconds: config.ffmpeg.segment_seconds,
            kill_timeout: config.ffmpeg.kill_timeout,
        };
        let mut supervisor = SessionSupervisor::new(
            admission.clone(),
            Arc::new(resolver),
            executor.clone(),
            breakers.clone(),
            store.clone(),
            metrics.clone(),
            supervisor_config,
            cancellation_token.child_token(),
        );
        if let Some(receiver_config) = &config.receiver {
            let client: Arc<dyn ReceiverClient> =
                Arc::new(OpenWebIfClient::new(receiver_config.clone())?);
            supervisor = supervisor.with_receiver(client);
            info!(base_url = %receiver_config.base_url, "Receiver integration enabled");
        }
        let supervisor = Arc::new(supervisor);

        let evicter =
            Arc::new(CacheEvicter::new(store.clone(), config.evicter.clone()).with_metrics(metrics.clone()));

        let health_checker = Arc::new(HealthChecker::new());
        health_checker.register("breakers", breaker_check(breakers.clone()));
        health_checker.register("admission", admission_check(admission.clone()));
        health_checker.register("hls_root", writable_check(hls_root.clone()));
        health_checker.register("ffmpeg", ffmpeg_check(executor.is_available()));
        health_checker.register_disk_check(config.data_dir.clone());

        let exporter = Arc::new(
            PrometheusExporter::new(metrics.clone())
                .with_admission(admission.clone())
                .with_breakers(breakers.clone()),
        );

        let auth = TokenAuth::new(&config.api_tokens);

        info!("Service container initialized");
        Ok(Self {
            config,
            metrics,
            admission,
            breakers,
            store,
            durations,
            supervisor,
            evicter,
            health_checker,
            exporter,
            auth,
            cancellation_token,
            background: Mutex::new(Vec::new()),
        })
    }

    /// Start the periodic background tasks.
    pub fn start_background_tasks(&self) {
        let handle = self
            .evicter
            .clone()
            .start(self.cancellation_token.child_token());
        self.background.lock().push(handle);
    }

    /// Track a task that must finish before shutdown completes.
    pub fn track_task(&self, handle: JoinHandle<()>) {
        self.background.lock().push(handle);
    }

    /// Shutdown all services gracefully.
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown_with_timeout(DEFAULT_SHUTDOWN_TIMEOUT).await
    }

    /// Shutdown all services gracefully with a custom timeout.
    ///
    /// Session tasks kill their processes and release their tickets before
    /// this returns, unless the timeout is hit first.
    pub async fn shutdown_with_timeout(&self, timeout: Duration) -> Result<()> {
        info!("Shutting down services (timeout: {:?})", timeout);

        // Signal all background tasks to stop
        self.cancellation_token.cancel();

        info!(
            active_sessions = self.store.count_active(),
            "Stopping session supervisor..."
        );
        self.supervisor.shutdown(timeout).await;

        let handles: Vec<_> = std::mem::take(&mut *self.background.lock());
        let joined = tokio::time::timeout(timeout, futures::future::join_all(handles)).await;
        if joined.is_err() {
            warn!("Shutdown timeout reached, forcing shutdown");
        }

        info!("Services shut down");
        Ok(())
    }

    /// Get the cancellation token for external use.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    /// Check if shutdown has been requested.
    pub fn is_shutting_down(&self) -> bool {
        self.cancellation_token.is_cancelled()
    }

    /// Get service statistics.
    pub fn stats(&self) -> ServiceStats {
        ServiceStats {
            session_count: self.store.len(),
            active_sessions: self.store.count_active(),
            cached_durations: self.durations.len(),
            open_breakers: self
                .breakers
                .snapshots()
                .iter()
                .filter(|b| b.state != CircuitState::Closed)
                .count(),
        }
    }
}

fn ffmpeg_check(available: bool) -> HealthCheckFn {
    Arc::new(move || {
        async move {
            if available {
                ComponentHealth::healthy("ffmpeg")
            } else {
                ComponentHealth::unhealthy("ffmpeg", "ffmpeg binary not found")
            }
        }
        .boxed()
    })
}

/// Service statistics.
#[derive(Debug, Clone)]
pub struct ServiceStats {
    /// Sessions in the store, terminal ones included.
    pub session_count: usize,
    pub active_sessions: usize,
    pub cached_durations: usize,
    /// Breakers that are open or half-open.
    pub open_breakers: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_container_wires_components() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig {
            data_dir: dir.path().join("data"),
            log_dir: dir.path().join("logs"),
            ..AppConfig::default()
        };

        let container = ServiceContainer::new(config).await.unwrap();
        assert!(dir.path().join("data/hls/sessions").is_dir());
        assert!(!container.auth.is_enabled());

        let stats = container.stats();
        assert_eq!(stats.session_count, 0);
        assert_eq!(stats.open_breakers, 0);

        container.start_background_tasks();
        container
            .shutdown_with_timeout(Duration::from_secs(5))
            .await
            .unwrap();
        assert!(container.is_shutting_down());
    }
}

//! Session supervision.
//!
//! [`SessionSupervisor::submit`] admits and resolves an intent synchronously.
//! Either failure is returned to the caller and no session is created. After
//! that, a task per session starts the transcoder, runs the watchdog and
//! records the terminal state. The session's admission ticket is owned by
//! that task and released when it ends, whatever the outcome.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use super::admission::{AdmissionController, AdmissionTicket};
use super::breaker::BreakerRegistry;
use super::intent::{Intent, TargetRef};
use super::resolver::{Resolver, extract_receiver_path};
use super::watchdog::{Watchdog, WatchdogConfig};
use crate::executor::args::{InputSource, build_hls_args};
use crate::executor::{Executor, StartRequest};
use crate::metrics::MetricsCollector;
use crate::receiver::{ReceiverClient, is_recording_in_progress};
use crate::session::{Session, SessionState, SessionStore};
use crate::utils::fs;
use crate::{Error, Result};

/// Breaker guarding the receiver connectivity probe for live intents.
pub const BREAKER_RECEIVER_STATUS: &str = "receiver.status";
/// Breaker guarding timer-list queries.
pub const BREAKER_RECEIVER_TIMERS: &str = "receiver.timers";
/// Breaker guarding transcoder process starts.
pub const BREAKER_TRANSCODE_START: &str = "transcode.start";

/// Weight of one session in its admission pool.
const SESSION_WEIGHT: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    pub watchdog: WatchdogConfig,
    pub segment_seconds: u32,
    /// How long to wait for a stopped process to be reaped.
    pub kill_timeout: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            watchdog: WatchdogConfig::default(),
            segment_seconds: 4,
            kill_timeout: Duration::from_secs(5),
        }
    }
}

pub struct SessionSupervisor {
    admission: Arc<AdmissionController>,
    resolver: Arc<dyn Resolver>,
    executor: Arc<dyn Executor>,
    receiver: Option<Arc<dyn ReceiverClient>>,
    breakers: Arc<BreakerRegistry>,
    store: Arc<SessionStore>,
    metrics: Arc<MetricsCollector>,
    config: SupervisorConfig,
    shutdown: CancellationToken,
    cancels: DashMap<String, CancellationToken>,
    tasks: TaskTracker,
}

impl SessionSupervisor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        admission: Arc<AdmissionController>,
        resolver: Arc<dyn Resolver>,
        executor: Arc<dyn Executor>,
        breakers: Arc<BreakerRegistry>,
        store: Arc<SessionStore>,
        metrics: Arc<MetricsCollector>,
        config: SupervisorConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            admission,
            resolver,
            executor,
            receiver: None,
            breakers,
            store,
            metrics,
            config,
            shutdown,
            cancels: DashMap::new(),
            tasks: TaskTracker::new(),
        }
    }

    pub fn with_receiver(mut self, receiver: Arc<dyn ReceiverClient>) -> Self {
        self.receiver = Some(receiver);
        self
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    /// Admit, resolve and start supervising an intent.
    pub async fn submit(self: &Arc<Self>, intent: Intent) -> Result<Session> {
        if self.shutdown.is_cancelled() {
            return Err(Error::Other("server is shutting down".to_string()));
        }

        let class = intent.profile.admission_class();
        let ticket = self.admission.try_admit(class, SESSION_WEIGHT)?;

        let input = match self.resolve_input(&intent.target).await {
            Ok(input) => input,
            Err(e) => {
                self.metrics.record_intent_rejected(e.kind());
                debug!(target = %intent.target.describe(), "Intent rejected: {}", e);
                return Err(e);
            }
        };

        let session = self.store.create(intent);
        self.store.set_source(&session.id, input.describe());
        let cancel = self.shutdown.child_token();
        self.cancels.insert(session.id.clone(), cancel.clone());
        self.metrics.record_session_started();

        info!(
            session_id = %session.id,
            target = %session.intent.target.describe(),
            profile = %session.intent.profile,
            %class,
            "Session admitted"
        );

        let this = Arc::clone(self);
        let id = session.id.clone();
        self.tasks
            .spawn(async move { this.supervise(id, ticket, input, cancel).await });

        Ok(self.store.get(&session.id).unwrap_or(session))
    }

    /// Ask a live session to stop.
    pub fn cancel(&self, id: &str) -> Result<Session> {
        let session = self
            .store
            .get(id)
            .ok_or_else(|| Error::not_found("Session", id))?;
        if session.is_terminal() {
            return Err(Error::InvalidStateTransition {
                from: session.state.to_string(),
                to: SessionState::Cancelled.to_string(),
            });
        }
        if let Some(token) = self.cancels.get(id) {
            token.cancel();
        }
        info!(session_id = %id, "Session cancellation requested");
        Ok(session)
    }

    /// Cancel every session and wait for their tasks to finish.
    pub async fn shutdown(&self, timeout: Duration) {
        self.shutdown.cancel();
        self.tasks.close();
        if tokio::time::timeout(timeout, self.tasks.wait()).await.is_err() {
            warn!(
                remaining = self.tasks.len(),
                "Session tasks did not finish before shutdown timeout"
            );
        }
    }

    async fn resolve_input(&self, target: &TargetRef) -> Result<InputSource> {
        match target {
            TargetRef::Recording { id } => {
                let recording = self.resolver.resolve(id).await?;
                let growing = self.recording_in_progress(id).await;
                Ok(InputSource::File {
                    path: recording.path,
                    growing,
                })
            }
            TargetRef::Live { service_ref } => {
                let receiver = self.receiver.as_ref().ok_or_else(|| {
                    Error::validation("live playback requires a configured receiver")
                })?;
                self.breakers
                    .get(BREAKER_RECEIVER_STATUS)
                    .execute(|| receiver.status())
                    .await?;
                let url = receiver.stream_url(service_ref)?;
                Ok(InputSource::Stream { url })
            }
        }
    }

    /// Best effort. Any failure, including an open breaker, means "no".
    async fn recording_in_progress(&self, logical_id: &str) -> bool {
        let Some(receiver) = &self.receiver else {
            return false;
        };
        match self
            .breakers
            .get(BREAKER_RECEIVER_TIMERS)
            .execute(|| receiver.timers())
            .await
        {
            Ok(timers) => is_recording_in_progress(&timers, extract_receiver_path(logical_id)),
            Err(e) => {
                debug!(logical_id, "Timer lookup skipped: {}", e);
                false
            }
        }
    }

    async fn supervise(
        self: Arc<Self>,
        id: String,
        ticket: AdmissionTicket,
        input: InputSource,
        cancel: CancellationToken,
    ) {
        let started = Instant::now();
        let outcome = self.run(&id, &input, &cancel).await;

        let (state, detail) = match &outcome {
            Ok(()) => (SessionState::Completed, None),
            Err(Error::Cancelled) => (SessionState::Cancelled, None),
            Err(e @ Error::StallDetected { .. }) => (SessionState::Stalled, Some(e.to_string())),
            Err(e) => (SessionState::Failed, Some(e.to_string())),
        };

        let bytes = match self.store.update_state(&id, state, detail.clone()) {
            Ok(session) => session.progress.map(|p| p.total_size).unwrap_or(0),
            Err(e) => {
                warn!(session_id = %id, "Failed to record terminal state: {}", e);
                0
            }
        };
        self.cancels.remove(&id);
        self.metrics
            .record_session_finished(state, started.elapsed(), bytes);
        self.admission.release(ticket);

        match detail {
            Some(detail) => warn!(session_id = %id, %state, %detail, "Session ended"),
            None => info!(session_id = %id, %state, "Session ended"),
        }
    }

    async fn run(&self, id: &str, input: &InputSource, cancel: &CancellationToken) -> Result<()> {
        let session = self
            .store
            .get(id)
            .ok_or_else(|| Error::not_found("Session", id))?;
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        fs::ensure_dir_all_with_op("create session directory", &session.output_dir).await?;
        let request = StartRequest {
            session_id: id.to_string(),
            args: build_hls_args(
                input,
                session.intent.profile,
                &session.output_dir,
                self.config.segment_seconds,
            ),
            working_dir: session.output_dir.clone(),
        };

        let process_scope = self.shutdown.child_token();
        let executor = &self.executor;
        let mut process = self
            .breakers
            .get(BREAKER_TRANSCODE_START)
            .execute(|| executor.start(&process_scope, request))
            .await?;

        self.store.update_state(id, SessionState::Running, None)?;

        let watchdog = Watchdog::new(self.config.watchdog.clone(), id);
        let store = &self.store;
        let result = watchdog
            .watch(
                cancel,
                &mut process.done,
                &mut process.progress,
                Some(process.handle.as_ref()),
                |sample| store.record_progress(id, sample),
            )
            .await;

        match result {
            Err(Error::Cancelled) => {
                process.stop(self.config.kill_timeout).await;
                Err(Error::Cancelled)
            }
            Err(stall @ Error::StallDetected { .. }) => {
                // Already killed by the watchdog; wait for the reap.
                let _ = tokio::time::timeout(self.config.kill_timeout, process.done).await;
                Err(stall)
            }
            other => other,
        }
    }
}

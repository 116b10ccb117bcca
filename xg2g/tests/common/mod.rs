//! Scripted fakes and a control-plane harness shared by the integration tests.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tempfile::TempDir;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use xg2g::control::{
    AdmissionConfig, AdmissionController, BreakerConfig, BreakerRegistry, DurationStore,
    PathMapper, PathMapping, RecordingsResolver, SessionSupervisor, SupervisorConfig,
    WatchdogConfig,
};
use xg2g::executor::{
    Executor, MediaInfo, PROGRESS_CHANNEL_CAPACITY, ProcessHandle, Prober, ProgressSample,
    RunningProcess, StartRequest,
};
use xg2g::metrics::MetricsCollector;
use xg2g::receiver::{ReceiverClient, StatusInfo, Timer};
use xg2g::session::{Session, SessionStore};
use xg2g::{Error, Result};

/// Receiver-side root used by every test mapping.
pub const RECEIVER_ROOT: &str = "/media/hdd/movie";

/// How a fake process behaves once started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Script {
    /// Emit `samples` progress samples, then exit 0.
    Complete { samples: u32 },
    /// Exit with code 1 without progress.
    ExitNonZero,
    /// Fail before a process exists.
    FailStart,
    /// Emit progress until killed.
    RunUntilKilled,
    /// Never report progress; exit only when killed.
    Hang,
}

#[derive(Debug)]
struct FakeHandle {
    kill: CancellationToken,
    kills: Arc<AtomicUsize>,
}

impl ProcessHandle for FakeHandle {
    fn pid(&self) -> Option<u32> {
        Some(4242)
    }

    fn kill(&self) {
        self.kills.fetch_add(1, Ordering::SeqCst);
        self.kill.cancel();
    }
}

pub struct FakeExecutor {
    script: Mutex<Script>,
    pub starts: AtomicUsize,
    pub kills: Arc<AtomicUsize>,
    pub requests: Mutex<Vec<StartRequest>>,
}

impl FakeExecutor {
    pub fn new(script: Script) -> Self {
        Self {
            script: Mutex::new(script),
            starts: AtomicUsize::new(0),
            kills: Arc::new(AtomicUsize::new(0)),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn set_script(&self, script: Script) {
        *self.script.lock() = script;
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn kills(&self) -> usize {
        self.kills.load(Ordering::SeqCst)
    }
}

fn sample(n: u32) -> ProgressSample {
    ProgressSample {
        out_time: Duration::from_secs(n as u64),
        total_size: n as u64 * 1000,
        speed: Some(1.0),
    }
}

#[async_trait]
impl Executor for FakeExecutor {
    async fn start(
        &self,
        cancel: &CancellationToken,
        request: StartRequest,
    ) -> Result<RunningProcess> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().push(request);
        let script = *self.script.lock();
        if script == Script::FailStart {
            return Err(Error::ProcessStartFailed("fake spawn failure".to_string()));
        }

        let (progress_tx, progress_rx) = mpsc::channel(PROGRESS_CHANNEL_CAPACITY);
        let (done_tx, done_rx) = oneshot::channel();
        let kill = cancel.child_token();
        let handle = FakeHandle {
            kill: kill.clone(),
            kills: self.kills.clone(),
        };

        tokio::spawn(async move {
            let result = match script {
                Script::Complete { samples } => {
                    for n in 1..=samples {
                        let _ = progress_tx.send(sample(n)).await;
                        tokio::time::sleep(Duration::from_millis(5)).await;
                    }
                    Ok(())
                }
                Script::ExitNonZero => Err(Error::ProcessExitNonZero {
                    code: Some(1),
                    detail: "Invalid data found when processing input".to_string(),
                }),
                Script::RunUntilKilled => {
                    let mut n = 0;
                    loop {
                        tokio::select! {
                            _ = kill.cancelled() => break Err(Error::Cancelled),
                            _ = tokio::time::sleep(Duration::from_millis(10)) => {
                                n += 1;
                                let _ = progress_tx.try_send(sample(n));
                            }
                        }
                    }
                }
                Script::Hang => {
                    kill.cancelled().await;
                    Err(Error::Cancelled)
                }
                Script::FailStart => unreachable!("handled before spawn"),
            };
            drop(progress_tx);
            let _ = done_tx.send(result);
        });

        Ok(RunningProcess {
            handle: Box::new(handle),
            progress: progress_rx,
            done: done_rx,
        })
    }
}

/// Reports a fixed duration and counts its calls.
pub struct FakeProber {
    pub calls: AtomicUsize,
    pub duration: Duration,
}

impl FakeProber {
    pub fn new(duration: Duration) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            duration,
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Prober for FakeProber {
    async fn probe(&self, _path: &Path) -> Result<MediaInfo> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(MediaInfo {
            duration: Some(self.duration),
            format_name: Some("mpegts".to_string()),
            ..MediaInfo::default()
        })
    }
}

/// Receiver whose reachability and timer list are set by the test.
pub struct FakeReceiver {
    pub reachable: AtomicBool,
    pub timers: Mutex<Vec<Timer>>,
    pub status_calls: AtomicUsize,
}

impl FakeReceiver {
    pub fn new() -> Self {
        Self {
            reachable: AtomicBool::new(true),
            timers: Mutex::new(Vec::new()),
            status_calls: AtomicUsize::new(0),
        }
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Report a running timer writing `receiver_path`.
    pub fn recording(&self, receiver_path: &str) {
        self.timers.lock().push(Timer {
            name: "News".to_string(),
            state: 2,
            filename: Some(receiver_path.to_string()),
            ..Timer::default()
        });
    }
}

#[async_trait]
impl ReceiverClient for FakeReceiver {
    async fn status(&self) -> Result<StatusInfo> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        if self.reachable.load(Ordering::SeqCst) {
            Ok(StatusInfo::default())
        } else {
            Err(Error::Other("receiver unreachable".to_string()))
        }
    }

    async fn timers(&self) -> Result<Vec<Timer>> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(self.timers.lock().clone())
        } else {
            Err(Error::Other("receiver unreachable".to_string()))
        }
    }

    fn stream_url(&self, service_ref: &str) -> Result<String> {
        Ok(format!("http://receiver.test:8001/{service_ref}"))
    }
}

pub struct HarnessOptions {
    pub script: Script,
    pub admission: AdmissionConfig,
    pub breaker: BreakerConfig,
    pub watchdog: WatchdogConfig,
    pub receiver: Option<Arc<FakeReceiver>>,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            script: Script::Complete { samples: 3 },
            admission: AdmissionConfig::default(),
            breaker: BreakerConfig {
                failure_threshold: 2,
                open_duration: Duration::from_secs(60),
                ..BreakerConfig::default()
            },
            watchdog: WatchdogConfig {
                startup_grace: Duration::ZERO,
                stall_timeout: Duration::from_millis(150),
                tick: Duration::from_millis(20),
            },
            receiver: None,
        }
    }
}

/// The control plane wired with fakes.
pub struct Harness {
    pub supervisor: Arc<SessionSupervisor>,
    pub admission: Arc<AdmissionController>,
    pub breakers: Arc<BreakerRegistry>,
    pub store: Arc<SessionStore>,
    pub metrics: Arc<MetricsCollector>,
    pub durations: Arc<DurationStore>,
    pub executor: Arc<FakeExecutor>,
    pub prober: Arc<FakeProber>,
    pub shutdown: CancellationToken,
    dir: TempDir,
}

impl Harness {
    pub fn new(script: Script) -> Self {
        Self::with_options(HarnessOptions {
            script,
            ..HarnessOptions::default()
        })
    }

    pub fn with_options(options: HarnessOptions) -> Self {
        let dir = tempfile::tempdir().expect("create temp dir");
        let sessions_root = dir.path().join("hls/sessions");
        std::fs::create_dir_all(&sessions_root).expect("create sessions root");

        let metrics = Arc::new(MetricsCollector::new());
        let admission = Arc::new(
            AdmissionController::new(&options.admission).with_metrics(metrics.clone()),
        );
        let breakers =
            Arc::new(BreakerRegistry::new(options.breaker).with_metrics(metrics.clone()));
        let store = Arc::new(SessionStore::new(sessions_root));

        let mapper = PathMapper::new(&[PathMapping {
            id: Some("movies".to_string()),
            receiver_root: RECEIVER_ROOT.to_string(),
            local_root: dir.path().join("recordings").display().to_string(),
        }])
        .expect("valid mapping");
        let durations = Arc::new(DurationStore::new());
        let prober = Arc::new(FakeProber::new(Duration::from_secs(3600)));
        let resolver = RecordingsResolver::new(mapper)
            .with_durations(durations.clone(), prober.clone())
            .with_metrics(metrics.clone());

        let executor = Arc::new(FakeExecutor::new(options.script));
        let shutdown = CancellationToken::new();
        let mut supervisor = SessionSupervisor::new(
            admission.clone(),
            Arc::new(resolver),
            executor.clone(),
            breakers.clone(),
            store.clone(),
            metrics.clone(),
            SupervisorConfig {
                watchdog: options.watchdog,
                segment_seconds: 4,
                kill_timeout: Duration::from_secs(2),
            },
            shutdown.clone(),
        );
        if let Some(receiver) = options.receiver {
            supervisor = supervisor.with_receiver(receiver);
        }

        Self {
            supervisor: Arc::new(supervisor),
            admission,
            breakers,
            store,
            metrics,
            durations,
            executor,
            prober,
            shutdown,
            dir,
        }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn sessions_root(&self) -> PathBuf {
        self.dir.path().join("hls/sessions")
    }

    /// Poll until the session is terminal.
    pub async fn wait_terminal(&self, id: &str) -> Session {
        wait_terminal(&self.store, id).await
    }
}

pub async fn wait_terminal(store: &SessionStore, id: &str) -> Session {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let session = store.get(id).expect("session exists");
        if session.is_terminal() {
            return session;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "session {id} still {} after 5s",
            session.state
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Poll until `check` holds or fail after 5s.
pub async fn eventually<F: Fn() -> bool>(what: &str, check: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// A logical recording id under the mapped root.
pub fn recording_id(name: &str) -> String {
    format!("{RECEIVER_ROOT}/{name}")
}

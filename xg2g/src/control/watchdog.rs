//! Progress watchdog for running transcodes.
//!
//! The watchdog races four events: the terminal result, the caller's
//! cancellation, a progress sample and a periodic tick. Receiving any sample
//! counts as liveness. After the startup grace period, a tick that finds no
//! sample for longer than the stall timeout kills the process and returns
//! [`Error::StallDetected`].

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::executor::{ProcessHandle, ProgressSample};
use crate::{Error, Result};

/// Watchdog timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchdogConfig {
    /// No stall checks before this much time has passed since start.
    pub startup_grace: Duration,
    /// Longest tolerated gap between progress samples.
    pub stall_timeout: Duration,
    /// Polling interval.
    pub tick: Duration,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            startup_grace: Duration::from_secs(30),
            stall_timeout: Duration::from_secs(300),
            tick: Duration::from_secs(5),
        }
    }
}

/// Supervises one process.
#[derive(Debug, Clone)]
pub struct Watchdog {
    config: WatchdogConfig,
    session_id: String,
}

impl Watchdog {
    pub fn new(config: WatchdogConfig, session_id: impl Into<String>) -> Self {
        Self {
            config,
            session_id: session_id.into(),
        }
    }

    /// Run until the process finishes, stalls, or `cancel` fires.
    ///
    /// Samples are handed to `on_progress` in arrival order. Cancellation
    /// returns [`Error::Cancelled`] and leaves the process running.
    pub async fn watch<F>(
        &self,
        cancel: &CancellationToken,
        done: &mut oneshot::Receiver<Result<()>>,
        progress: &mut mpsc::Receiver<ProgressSample>,
        handle: Option<&dyn ProcessHandle>,
        mut on_progress: F,
    ) -> Result<()>
    where
        F: FnMut(&ProgressSample),
    {
        let start = Instant::now();
        let mut last_progress_at = start;
        let mut progress_open = true;

        let mut ticker = tokio::time::interval_at(start + self.config.tick, self.config.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                result = &mut *done => {
                    while let Ok(sample) = progress.try_recv() {
                        on_progress(&sample);
                    }
                    return match result {
                        Ok(result) => result,
                        Err(_) => Err(Error::Other(format!(
                            "executor for session {} dropped its result",
                            self.session_id
                        ))),
                    };
                }
                _ = cancel.cancelled() => {
                    debug!(session_id = %self.session_id, "Watchdog cancelled");
                    return Err(Error::Cancelled);
                }
                sample = progress.recv(), if progress_open => {
                    match sample {
                        Some(sample) => {
                            last_progress_at = Instant::now();
                            on_progress(&sample);
                        }
                        // Producer finished. Keep waiting for the terminal result.
                        None => progress_open = false,
                    }
                }
                _ = ticker.tick() => {
                    let now = Instant::now();
                    if now.duration_since(start) < self.config.startup_grace {
                        continue;
                    }
                    let silent_for = now.duration_since(last_progress_at);
                    if silent_for > self.config.stall_timeout {
                        error!(
                            session_id = %self.session_id,
                            silent_ms = silent_for.as_millis() as u64,
                            stall_timeout_ms = self.config.stall_timeout.as_millis() as u64,
                            "Transcode stalled, killing process"
                        );
                        if let Some(handle) = handle {
                            handle.kill();
                        }
                        return Err(Error::StallDetected {
                            session_id: self.session_id.clone(),
                            stall_timeout: self.config.stall_timeout,
                        });
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Debug, Default)]
    struct FlagHandle {
        killed: AtomicBool,
    }

    impl ProcessHandle for FlagHandle {
        fn pid(&self) -> Option<u32> {
            None
        }

        fn kill(&self) {
            self.killed.store(true, Ordering::SeqCst);
        }
    }

    fn config() -> WatchdogConfig {
        WatchdogConfig {
            startup_grace: Duration::from_millis(100),
            stall_timeout: Duration::from_millis(200),
            tick: Duration::from_millis(50),
        }
    }

    fn channels() -> (
        mpsc::Sender<ProgressSample>,
        mpsc::Receiver<ProgressSample>,
        oneshot::Sender<Result<()>>,
        oneshot::Receiver<Result<()>>,
    ) {
        let (ptx, prx) = mpsc::channel(64);
        let (dtx, drx) = oneshot::channel();
        (ptx, prx, dtx, drx)
    }

    fn sample(ms: u64) -> ProgressSample {
        ProgressSample {
            out_time: Duration::from_millis(ms),
            ..ProgressSample::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stall_after_silence() {
        let (ptx, mut prx, _dtx, mut drx) = channels();
        let handle = FlagHandle::default();
        let dog = Watchdog::new(config(), "sess-1");

        let last_sample_at = Instant::now() + Duration::from_millis(40);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            ptx.send(sample(1)).await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
            ptx.send(sample(2)).await.unwrap();
            // Sender stays alive but silent.
            tokio::time::sleep(Duration::from_secs(3600)).await;
            drop(ptx);
        });

        let mut seen = 0;
        let err = dog
            .watch(
                &CancellationToken::new(),
                &mut drx,
                &mut prx,
                Some(&handle),
                |_| seen += 1,
            )
            .await
            .unwrap_err();

        let stalled_at = Instant::now();
        assert_eq!(seen, 2);
        assert!(matches!(err, Error::StallDetected { .. }));
        let msg = err.to_string();
        assert!(msg.contains("no progress"));
        assert!(msg.contains("200ms"));
        assert!(msg.contains("sess-1"));
        assert!(handle.killed.load(Ordering::SeqCst));

        let waited = stalled_at.duration_since(last_sample_at);
        assert!(waited > Duration::from_millis(200), "declared too early: {waited:?}");
        assert!(
            waited <= Duration::from_millis(300),
            "declared too late: {waited:?}"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_continuous_progress_then_completion() {
        let (ptx, mut prx, dtx, mut drx) = channels();
        let dog = Watchdog::new(config(), "sess-2");

        tokio::spawn(async move {
            for i in 0..17 {
                tokio::time::sleep(Duration::from_millis(30)).await;
                ptx.send(sample(i * 30)).await.unwrap();
            }
            dtx.send(Ok(())).unwrap();
        });

        let mut seen = 0;
        let result = dog
            .watch(&CancellationToken::new(), &mut drx, &mut prx, None, |_| {
                seen += 1
            })
            .await;
        assert!(result.is_ok());
        assert_eq!(seen, 17);
    }

    #[tokio::test(start_paused = true)]
    async fn test_completion_within_grace_without_samples() {
        let (_ptx, mut prx, dtx, mut drx) = channels();
        let dog = Watchdog::new(config(), "sess-3");

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(80)).await;
            dtx.send(Ok(())).unwrap();
        });

        let result = dog
            .watch(&CancellationToken::new(), &mut drx, &mut prx, None, |_| {})
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_grace_suppresses_stall_checks() {
        let (_ptx, mut prx, _dtx, mut drx) = channels();
        let dog = Watchdog::new(
            WatchdogConfig {
                startup_grace: Duration::from_secs(2),
                stall_timeout: Duration::from_millis(100),
                tick: Duration::from_millis(50),
            },
            "sess-4",
        );

        let start = Instant::now();
        let err = dog
            .watch(&CancellationToken::new(), &mut drx, &mut prx, None, |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, Error::StallDetected { .. }));
        assert!(start.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_error_is_returned() {
        let (ptx, mut prx, dtx, mut drx) = channels();
        let dog = Watchdog::new(config(), "sess-5");

        tokio::spawn(async move {
            ptx.send(sample(1)).await.unwrap();
            drop(ptx);
            dtx.send(Err(Error::ProcessExitNonZero {
                code: Some(1),
                detail: "bad input".into(),
            }))
            .unwrap();
        });

        let err = dog
            .watch(&CancellationToken::new(), &mut drx, &mut prx, None, |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ProcessExitNonZero { code: Some(1), .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_does_not_kill() {
        let (ptx, mut prx, _dtx, mut drx) = channels();
        let handle = FlagHandle::default();
        let dog = Watchdog::new(config(), "sess-6");
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            trigger.cancel();
        });

        // Keep feeding samples so no stall is declared.
        let feeder = {
            let ptx = ptx.clone();
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    if ptx.send(sample(0)).await.is_err() {
                        break;
                    }
                }
            })
        };

        let err = dog
            .watch(&cancel, &mut drx, &mut prx, Some(&handle), |_| {})
            .await
            .unwrap_err();
        feeder.abort();
        assert!(matches!(err, Error::Cancelled));
        assert!(!handle.killed.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_progress_channel_still_detects_stall() {
        let (ptx, mut prx, _dtx, mut drx) = channels();
        drop(ptx);
        let dog = Watchdog::new(config(), "sess-7");
        let err = dog
            .watch(&CancellationToken::new(), &mut drx, &mut prx, None, |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, Error::StallDetected { .. }));
    }
}

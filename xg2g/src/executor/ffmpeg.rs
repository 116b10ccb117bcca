//! ffmpeg-backed [`Executor`].

use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::progress::ProgressParser;
use super::{Executor, PROGRESS_CHANNEL_CAPACITY, ProcessHandle, RunningProcess, StartRequest};
use crate::{Error, Result};

/// Number of trailing stderr lines kept for exit diagnostics.
const STDERR_TAIL_LINES: usize = 32;

/// Transcoder binaries and timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FfmpegConfig {
    pub binary_path: String,
    pub ffprobe_path: String,
    /// HLS segment length in seconds.
    pub segment_seconds: u32,
    /// How long to wait for a killed process to be reaped.
    pub kill_timeout: Duration,
    /// Deadline for a single ffprobe run.
    pub probe_timeout: Duration,
}

impl Default for FfmpegConfig {
    fn default() -> Self {
        Self {
            binary_path: "ffmpeg".to_string(),
            ffprobe_path: "ffprobe".to_string(),
            segment_seconds: 4,
            kill_timeout: Duration::from_secs(5),
            probe_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug)]
struct FfmpegHandle {
    pid: Option<u32>,
    kill: CancellationToken,
}

impl ProcessHandle for FfmpegHandle {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn kill(&self) {
        self.kill.cancel();
    }
}

/// Spawns ffmpeg with a machine-readable progress stream on stdout.
pub struct FfmpegExecutor {
    config: FfmpegConfig,
    version: Option<String>,
}

impl FfmpegExecutor {
    pub fn new(config: FfmpegConfig) -> Self {
        let version = Self::detect_version(&config.binary_path);
        Self { config, version }
    }

    fn detect_version(path: &str) -> Option<String> {
        std::process::Command::new(path)
            .arg("-version")
            .output()
            .ok()
            .and_then(|output| {
                String::from_utf8(output.stdout)
                    .ok()
                    .and_then(|s| s.lines().next().map(|l| l.to_string()))
            })
    }

    pub fn is_available(&self) -> bool {
        self.version.is_some()
    }

    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    pub fn config(&self) -> &FfmpegConfig {
        &self.config
    }
}

#[async_trait]
impl Executor for FfmpegExecutor {
    async fn start(
        &self,
        cancel: &CancellationToken,
        request: StartRequest,
    ) -> Result<RunningProcess> {
        let session_id = request.session_id;

        let mut child = Command::new(&self.config.binary_path)
            .args(["-hide_banner", "-nostdin", "-nostats", "-progress", "pipe:1"])
            .args(&request.args)
            .current_dir(&request.working_dir)
            .env("LC_ALL", "C")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                Error::ProcessStartFailed(format!(
                    "failed to spawn {}: {e}",
                    self.config.binary_path
                ))
            })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::ProcessStartFailed("ffmpeg stdout not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::ProcessStartFailed("ffmpeg stderr not captured".to_string()))?;

        let pid = child.id();
        let kill = cancel.child_token();
        let (progress_tx, progress_rx) = mpsc::channel(PROGRESS_CHANNEL_CAPACITY);
        let (done_tx, done_rx) = oneshot::channel();
        let tail = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));

        info!(session_id = %session_id, ?pid, "Started ffmpeg");

        // Progress reader. Dropping the sender closes the channel at EOF.
        let sid = session_id.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            let mut parser = ProgressParser::new();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let Some(sample) = parser.feed(&line) else {
                            continue;
                        };
                        match progress_tx.try_send(sample) {
                            Ok(()) => {}
                            Err(mpsc::error::TrySendError::Full(_)) => {
                                trace!(session_id = %sid, "Progress channel full, dropping sample");
                            }
                            // Keep draining so ffmpeg never blocks on a full pipe.
                            Err(mpsc::error::TrySendError::Closed(_)) => {}
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(session_id = %sid, "Error reading ffmpeg progress: {}", e);
                        break;
                    }
                }
            }
            debug!(session_id = %sid, finished = parser.is_finished(), "Progress stream closed");
        });

        let stderr_tail = tail.clone();
        let sid = session_id.clone();
        let stderr_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                trace!(session_id = %sid, "ffmpeg: {}", line);
                let mut tail = stderr_tail.lock();
                if tail.len() == STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
        });

        let waiter_kill = kill.clone();
        tokio::spawn(async move {
            let result = tokio::select! {
                _ = waiter_kill.cancelled() => {
                    if let Err(e) = child.kill().await {
                        warn!(session_id = %session_id, "Failed to kill ffmpeg: {}", e);
                    }
                    debug!(session_id = %session_id, "ffmpeg killed");
                    Err(Error::Cancelled)
                }
                status = child.wait() => {
                    // stderr reaches EOF once the process is gone.
                    let _ = tokio::time::timeout(Duration::from_secs(1), stderr_task).await;
                    match status {
                        Ok(status) if status.success() => Ok(()),
                        Ok(status) => {
                            let detail = tail.lock().iter().cloned().collect::<Vec<_>>().join("\n");
                            warn!(session_id = %session_id, %status, "ffmpeg exited unsuccessfully");
                            Err(Error::ProcessExitNonZero {
                                code: status.code(),
                                detail,
                            })
                        }
                        Err(e) => {
                            error!(session_id = %session_id, "Error waiting for ffmpeg: {}", e);
                            Err(Error::Other(format!("failed to wait for ffmpeg: {e}")))
                        }
                    }
                }
            };
            let _ = done_tx.send(result);
        });

        Ok(RunningProcess {
            handle: Box::new(FfmpegHandle { pid, kill }),
            progress: progress_rx,
            done: done_rx,
        })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn fake_ffmpeg(dir: &std::path::Path, body: &str) -> String {
        let path = dir.join("fake-ffmpeg.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().into_owned()
    }

    fn executor(binary: String) -> FfmpegExecutor {
        FfmpegExecutor::new(FfmpegConfig {
            binary_path: binary,
            ..FfmpegConfig::default()
        })
    }

    fn request(dir: &std::path::Path) -> StartRequest {
        StartRequest {
            session_id: "s1".to_string(),
            args: vec![],
            working_dir: dir.to_path_buf(),
        }
    }

    #[tokio::test]
    async fn test_progress_then_non_zero_exit() {
        let dir = tempfile::tempdir().unwrap();
        let bin = fake_ffmpeg(
            dir.path(),
            "printf 'out_time_us=1000000\\ntotal_size=100\\nprogress=continue\\n'\n\
             printf 'out_time_us=2000000\\nprogress=end\\n'\n\
             echo 'Invalid data found when processing input' >&2\n\
             exit 3",
        );

        let mut process = executor(bin)
            .start(&CancellationToken::new(), request(dir.path()))
            .await
            .unwrap();

        let mut samples = Vec::new();
        while let Some(sample) = process.progress.recv().await {
            samples.push(sample);
        }
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[1].out_time, Duration::from_secs(2));

        match process.done.await.unwrap() {
            Err(Error::ProcessExitNonZero { code, detail }) => {
                assert_eq!(code, Some(3));
                assert!(detail.contains("Invalid data"));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_kill_reports_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let bin = fake_ffmpeg(dir.path(), "exec sleep 30");

        let process = executor(bin)
            .start(&CancellationToken::new(), request(dir.path()))
            .await
            .unwrap();
        assert!(process.handle.pid().is_some());

        let result = process.stop(Duration::from_secs(5)).await;
        assert!(matches!(result, Some(Err(Error::Cancelled))));
    }

    #[tokio::test]
    async fn test_missing_binary_fails_to_start() {
        let dir = tempfile::tempdir().unwrap();
        let err = executor("/nonexistent/ffmpeg".to_string())
            .start(&CancellationToken::new(), request(dir.path()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ProcessStartFailed(_)));
    }
}

//! External transcoder processes.
//!
//! The control plane only sees the [`Executor`] and [`Prober`] capabilities.
//! A started process is represented by a [`RunningProcess`]:
//!
//! - `handle` can terminate the process.
//! - `progress` yields parsed progress samples and is closed when the
//!   process exits.
//! - `done` resolves exactly once with the terminal result.

pub mod args;
pub mod ffmpeg;
pub mod probe;
pub mod progress;

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::Result;

pub use ffmpeg::{FfmpegConfig, FfmpegExecutor};
pub use probe::FfprobeProber;

/// Capacity of the progress channel between parser and watchdog.
pub const PROGRESS_CHANNEL_CAPACITY: usize = 64;

/// One progress report from a running transcode.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProgressSample {
    /// Media time written so far.
    pub out_time: Duration,
    /// Bytes written so far.
    pub total_size: u64,
    /// Encode speed relative to realtime, if reported.
    pub speed: Option<f64>,
}

/// Metadata extracted by a [`Prober`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MediaInfo {
    pub duration: Option<Duration>,
    pub format_name: Option<String>,
    pub video_codec: Option<String>,
    pub audio_codec: Option<String>,
}

/// What to run.
#[derive(Debug, Clone)]
pub struct StartRequest {
    pub session_id: String,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
}

/// Control over a spawned process.
pub trait ProcessHandle: Send + Sync + fmt::Debug {
    fn pid(&self) -> Option<u32>;

    /// Request termination. Does not wait for the process to be reaped.
    fn kill(&self);
}

/// A started process and its two output channels.
#[derive(Debug)]
pub struct RunningProcess {
    pub handle: Box<dyn ProcessHandle>,
    pub progress: mpsc::Receiver<ProgressSample>,
    pub done: oneshot::Receiver<Result<()>>,
}

impl RunningProcess {
    /// Kill the process and wait up to `timeout` for it to be reaped.
    ///
    /// Must only be called while `done` has not yet resolved.
    pub async fn stop(self, timeout: Duration) -> Option<Result<()>> {
        self.handle.kill();
        match tokio::time::timeout(timeout, self.done).await {
            Ok(Ok(result)) => Some(result),
            Ok(Err(_)) => None,
            Err(_) => {
                warn!(
                    pid = ?self.handle.pid(),
                    timeout_ms = timeout.as_millis() as u64,
                    "Process did not exit before stop timeout"
                );
                None
            }
        }
    }
}

/// Spawns transcoder processes.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Start a process. Cancelling `cancel` kills it.
    async fn start(
        &self,
        cancel: &CancellationToken,
        request: StartRequest,
    ) -> Result<RunningProcess>;
}

/// Reads media metadata without modifying the file.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, path: &Path) -> Result<MediaInfo>;
}

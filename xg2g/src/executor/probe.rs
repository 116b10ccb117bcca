//! ffprobe-backed [`Prober`].

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::debug;

use super::{MediaInfo, Prober};
use crate::{Error, Result};

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    format: Option<ProbeFormat>,
    #[serde(default)]
    streams: Vec<ProbeStream>,
}

#[derive(Debug, Deserialize)]
struct ProbeFormat {
    format_name: Option<String>,
    duration: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    codec_type: Option<String>,
    codec_name: Option<String>,
}

/// Runs `ffprobe -print_format json` with a deadline.
pub struct FfprobeProber {
    binary_path: String,
    timeout: Duration,
}

impl FfprobeProber {
    pub fn new(binary_path: impl Into<String>, timeout: Duration) -> Self {
        Self {
            binary_path: binary_path.into(),
            timeout,
        }
    }
}

/// Parse ffprobe's JSON report.
pub fn parse_probe_output(json: &[u8]) -> Result<MediaInfo> {
    let output: ProbeOutput = serde_json::from_slice(json)?;

    let duration = output
        .format
        .as_ref()
        .and_then(|f| f.duration.as_deref())
        .and_then(|d| d.parse::<f64>().ok())
        .filter(|d| d.is_finite() && *d > 0.0)
        .map(Duration::from_secs_f64);

    let codec_of = |kind: &str| {
        output
            .streams
            .iter()
            .find(|s| s.codec_type.as_deref() == Some(kind))
            .and_then(|s| s.codec_name.clone())
    };

    Ok(MediaInfo {
        duration,
        format_name: output.format.as_ref().and_then(|f| f.format_name.clone()),
        video_codec: codec_of("video"),
        audio_codec: codec_of("audio"),
    })
}

#[async_trait]
impl Prober for FfprobeProber {
    async fn probe(&self, path: &Path) -> Result<MediaInfo> {
        let run = Command::new(&self.binary_path)
            .args(["-v", "error", "-print_format", "json", "-show_format", "-show_streams"])
            .arg(path)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(self.timeout, run)
            .await
            .map_err(|_| {
                Error::Other(format!(
                    "ffprobe timed out after {:?} on {}",
                    self.timeout,
                    path.display()
                ))
            })?
            .map_err(|e| Error::io_path("probe", path, e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Other(format!(
                "ffprobe failed on {}: {}",
                path.display(),
                stderr.trim()
            )));
        }

        let info = parse_probe_output(&output.stdout)?;
        debug!(path = %path.display(), ?info.duration, "Probed media");
        Ok(info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_probe_output() {
        let json = br#"{
            "streams": [
                {"index": 0, "codec_type": "video", "codec_name": "mpeg2video"},
                {"index": 1, "codec_type": "audio", "codec_name": "mp2"},
                {"index": 2, "codec_type": "audio", "codec_name": "ac3"}
            ],
            "format": {"format_name": "mpegts", "duration": "3600.480000"}
        }"#;
        let info = parse_probe_output(json).unwrap();
        assert_eq!(info.duration.map(|d| d.as_millis()), Some(3_600_480));
        assert_eq!(info.format_name.as_deref(), Some("mpegts"));
        assert_eq!(info.video_codec.as_deref(), Some("mpeg2video"));
        assert_eq!(info.audio_codec.as_deref(), Some("mp2"));
    }

    #[test]
    fn test_missing_duration() {
        let info = parse_probe_output(br#"{"format": {"duration": "N/A"}}"#).unwrap();
        assert_eq!(info.duration, None);
        assert_eq!(info.video_codec, None);
    }

    #[test]
    fn test_invalid_json() {
        assert!(matches!(
            parse_probe_output(b"not json"),
            Err(Error::Serialization(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_binary() {
        let prober = FfprobeProber::new("/nonexistent/ffprobe", Duration::from_secs(1));
        assert!(prober.probe(Path::new("/tmp/x.ts")).await.is_err());
    }
}

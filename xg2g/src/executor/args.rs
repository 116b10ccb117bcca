//! ffmpeg argument construction for HLS output.

use std::path::{Path, PathBuf};

use crate::control::intent::OutputProfile;

/// Playlist file written into every session directory.
pub const PLAYLIST_NAME: &str = "index.m3u8";

/// Segment file pattern, relative to the session directory.
pub const SEGMENT_PATTERN: &str = "seg_%05d.ts";

/// Segments kept in a sliding live playlist.
const LIVE_LIST_SIZE: u32 = 10;

/// Where ffmpeg reads from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputSource {
    /// A recording on local disk. `growing` is set while the receiver is
    /// still writing it.
    File { path: PathBuf, growing: bool },
    /// A live stream served by the receiver.
    Stream { url: String },
}

impl InputSource {
    pub fn describe(&self) -> String {
        match self {
            InputSource::File { path, .. } => path.display().to_string(),
            InputSource::Stream { url } => url.clone(),
        }
    }

    fn is_live(&self) -> bool {
        matches!(self, InputSource::Stream { .. })
    }
}

/// Build the arguments that follow ffmpeg's global options.
pub fn build_hls_args(
    input: &InputSource,
    profile: OutputProfile,
    output_dir: &Path,
    segment_seconds: u32,
) -> Vec<String> {
    let mut args: Vec<String> = Vec::new();
    let mut push = |items: &[&str]| args.extend(items.iter().map(|s| s.to_string()));

    match input {
        InputSource::File { path, growing } => {
            if *growing {
                push(&["-follow", "1"]);
            }
            push(&["-fflags", "+genpts", "-i"]);
            args.push(path.to_string_lossy().into_owned());
        }
        InputSource::Stream { url } => {
            push(&[
                "-reconnect",
                "1",
                "-reconnect_streamed",
                "1",
                "-reconnect_delay_max",
                "5",
                "-fflags",
                "+genpts",
                "-i",
            ]);
            args.push(url.clone());
        }
    }

    let mut push = |items: &[&str]| args.extend(items.iter().map(|s| s.to_string()));
    push(&["-map", "0:v:0?", "-map", "0:a:0?", "-sn", "-dn"]);

    match profile {
        OutputProfile::Passthrough => push(&["-c:v", "copy", "-c:a", "copy"]),
        OutputProfile::Compatible => push(&[
            "-c:v", "libx264", "-preset", "veryfast", "-crf", "23", "-pix_fmt", "yuv420p",
            "-c:a", "aac", "-b:a", "192k", "-ac", "2",
        ]),
        OutputProfile::LowBandwidth => push(&[
            "-vf", "scale=-2:720", "-c:v", "libx264", "-preset", "veryfast", "-b:v", "2500k",
            "-maxrate", "3000k", "-bufsize", "6000k", "-pix_fmt", "yuv420p", "-c:a", "aac",
            "-b:a", "128k", "-ac", "2",
        ]),
    }

    let segment = segment_seconds.max(1).to_string();
    if profile.reencodes_video() {
        args.push("-force_key_frames".to_string());
        args.push(format!("expr:gte(t,n_forced*{segment})"));
    }

    args.extend(["-f".to_string(), "hls".to_string(), "-hls_time".to_string(), segment]);
    if input.is_live() {
        args.extend([
            "-hls_list_size".to_string(),
            LIVE_LIST_SIZE.to_string(),
            "-hls_flags".to_string(),
            "delete_segments+independent_segments+temp_file".to_string(),
        ]);
    } else {
        args.extend([
            "-hls_list_size".to_string(),
            "0".to_string(),
            "-hls_playlist_type".to_string(),
            "event".to_string(),
            "-hls_flags".to_string(),
            "independent_segments+temp_file".to_string(),
        ]);
    }

    args.push("-hls_segment_filename".to_string());
    args.push(output_dir.join(SEGMENT_PATTERN).to_string_lossy().into_owned());
    args.push("-y".to_string());
    args.push(output_dir.join(PLAYLIST_NAME).to_string_lossy().into_owned());
    args
}

#[cfg(test)]
mod tests {
    use super::*;

    fn value_after<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
        args.iter()
            .position(|a| a == flag)
            .and_then(|i| args.get(i + 1))
            .map(String::as_str)
    }

    #[test]
    fn test_passthrough_recording() {
        let input = InputSource::File {
            path: PathBuf::from("/mnt/rec/a.ts"),
            growing: false,
        };
        let args = build_hls_args(&input, OutputProfile::Passthrough, Path::new("/data/hls/s1"), 4);

        assert_eq!(value_after(&args, "-i"), Some("/mnt/rec/a.ts"));
        assert_eq!(value_after(&args, "-c:v"), Some("copy"));
        assert_eq!(value_after(&args, "-hls_playlist_type"), Some("event"));
        assert_eq!(value_after(&args, "-hls_time"), Some("4"));
        assert!(!args.contains(&"-follow".to_string()));
        assert!(!args.contains(&"-force_key_frames".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("/data/hls/s1/index.m3u8"));
    }

    #[test]
    fn test_growing_recording_follows_file() {
        let input = InputSource::File {
            path: PathBuf::from("/mnt/rec/live.ts"),
            growing: true,
        };
        let args = build_hls_args(&input, OutputProfile::Compatible, Path::new("/d"), 6);
        assert_eq!(value_after(&args, "-follow"), Some("1"));
        assert_eq!(value_after(&args, "-c:v"), Some("libx264"));
        assert_eq!(
            value_after(&args, "-force_key_frames"),
            Some("expr:gte(t,n_forced*6)")
        );
    }

    #[test]
    fn test_live_uses_sliding_playlist() {
        let input = InputSource::Stream {
            url: "http://receiver:8001/1:0:19:2B66:3F3:1:C00000:0:0:0:".to_string(),
        };
        let args = build_hls_args(&input, OutputProfile::LowBandwidth, Path::new("/d"), 4);
        assert_eq!(value_after(&args, "-hls_list_size"), Some("10"));
        assert_eq!(value_after(&args, "-vf"), Some("scale=-2:720"));
        assert!(value_after(&args, "-hls_flags").unwrap().contains("delete_segments"));
        assert!(!args.contains(&"-hls_playlist_type".to_string()));
    }
}

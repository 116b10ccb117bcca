//! Process-wide panic reporting.
//!
//! Panics inside breaker-protected calls are recovered and counted as
//! failures, but they are still reported here so the crash is never silent.

use std::backtrace::Backtrace;
use std::fs::OpenOptions;
use std::io::Write;
use std::panic::{PanicHookInfo, take_hook};
use std::path::Path;

use chrono::{DateTime, Local};
use serde::Serialize;

/// File (inside the log directory) that collects one JSON object per panic.
pub const PANIC_LOG_FILE: &str = "xg2g-panics.jsonl";

/// One captured panic.
#[derive(Debug, Serialize)]
pub struct PanicRecord {
    pub at: DateTime<Local>,
    pub thread: String,
    pub location: Option<String>,
    pub message: String,
    pub backtrace: String,
}

impl PanicRecord {
    fn capture(info: &PanicHookInfo<'_>) -> Self {
        Self {
            at: Local::now(),
            thread: std::thread::current()
                .name()
                .unwrap_or("<unnamed>")
                .to_string(),
            location: info
                .location()
                .map(|loc| format!("{}:{}:{}", loc.file(), loc.line(), loc.column())),
            message: payload_message(info.payload()),
            backtrace: Backtrace::capture().to_string(),
        }
    }
}

/// Install the hook. The previously installed hook still runs afterwards.
pub fn install(log_dir: impl AsRef<Path>) {
    let log_dir = log_dir.as_ref().to_path_buf();
    let previous_hook = take_hook();

    std::panic::set_hook(Box::new(move |info: &PanicHookInfo<'_>| {
        // A panic while reporting must not abort the process.
        let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let record = PanicRecord::capture(info);
            tracing::error!(
                target: "xg2g::panic",
                thread = %record.thread,
                location = record.location.as_deref().unwrap_or("<unknown>"),
                "panic: {}",
                record.message
            );
            if let Err(e) = append_record(&log_dir, &record) {
                tracing::warn!("Failed to persist panic record: {}", e);
            }
        }));

        previous_hook(info);
    }));
}

fn append_record(log_dir: &Path, record: &PanicRecord) -> std::io::Result<()> {
    let line = serde_json::to_string(record).map_err(std::io::Error::other)?;
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_dir.join(PANIC_LOG_FILE))?;
    writeln!(file, "{line}")
}

/// Extract the human-readable message from a panic payload.
pub fn payload_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "<non-string panic payload>".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_message() {
        let boxed: Box<dyn std::any::Any + Send> = Box::new("static");
        assert_eq!(payload_message(boxed.as_ref()), "static");

        let boxed: Box<dyn std::any::Any + Send> = Box::new(String::from("owned"));
        assert_eq!(payload_message(boxed.as_ref()), "owned");

        let boxed: Box<dyn std::any::Any + Send> = Box::new(42u32);
        assert_eq!(payload_message(boxed.as_ref()), "<non-string panic payload>");
    }

    #[test]
    fn test_append_record_writes_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let record = PanicRecord {
            at: Local::now(),
            thread: "worker".into(),
            location: Some("src/lib.rs:1:1".into()),
            message: "boom".into(),
            backtrace: String::new(),
        };
        append_record(dir.path(), &record).unwrap();
        append_record(dir.path(), &record).unwrap();

        let content = std::fs::read_to_string(dir.path().join(PANIC_LOG_FILE)).unwrap();
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let parsed: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed["message"], "boom");
        assert_eq!(parsed["thread"], "worker");
    }
}

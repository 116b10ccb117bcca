//! Application-wide error types.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Application-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Application-wide error type.
///
/// The first group of variants is the control-plane taxonomy. Everything
/// below `NotFound` is ambient plumbing.
#[derive(Error, Debug)]
pub enum Error {
    #[error("admission rejected: class {class} has {in_use}/{capacity} in use, requested {requested}")]
    AdmissionRejected {
        class: String,
        requested: u32,
        in_use: u32,
        capacity: u32,
    },

    #[error("unresolvable reference: {0}")]
    Unresolvable(String),

    #[error("process start failed: {0}")]
    ProcessStartFailed(String),

    #[error("no progress for {stall_timeout:?} in session {session_id}")]
    StallDetected {
        session_id: String,
        stall_timeout: Duration,
    },

    #[error("process exited with {}: {detail}", exit_code_label(.code))]
    ProcessExitNonZero { code: Option<i32>, detail: String },

    #[error("circuit '{name}' is open")]
    CircuitOpen { name: String },

    #[error("cancelled")]
    Cancelled,

    #[error("Entity not found: {entity_type} with id {id}")]
    NotFound { entity_type: String, id: String },

    #[error("Invalid state transition: cannot transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to {op} {}: {source}", .path.display())]
    IoPath {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{0}")]
    Other(String),
}

fn exit_code_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("code {code}"),
        None => "signal".to_string(),
    }
}

impl Error {
    pub fn not_found(entity_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity_type: entity_type.into(),
            id: id.into(),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn unresolvable(msg: impl Into<String>) -> Self {
        Self::Unresolvable(msg.into())
    }

    pub fn io_path(op: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::IoPath {
            op,
            path: path.into(),
            source,
        }
    }

    /// Stable label used for metrics and session detail strings.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AdmissionRejected { .. } => "admission_rejected",
            Self::Unresolvable(_) => "resolve_failed",
            Self::ProcessStartFailed(_) => "process_start_failed",
            Self::StallDetected { .. } => "stall_detected",
            Self::ProcessExitNonZero { .. } => "process_exit_non_zero",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::Cancelled => "cancelled",
            Self::NotFound { .. } => "not_found",
            Self::InvalidStateTransition { .. } => "invalid_state_transition",
            Self::Validation(_) => "validation",
            Self::Configuration(_) => "configuration",
            Self::Io(_) | Self::IoPath { .. } => "io",
            Self::Serialization(_) => "serialization",
            Self::Http(_) => "http",
            Self::Other(_) => "other",
        }
    }

    /// Whether a caller may reasonably retry the same request later.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::AdmissionRejected { .. } | Self::CircuitOpen { .. } | Self::Http(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stall_message_mentions_timeout_and_session() {
        let err = Error::StallDetected {
            session_id: "abc".to_string(),
            stall_timeout: Duration::from_millis(200),
        };
        let msg = err.to_string();
        assert!(msg.contains("no progress"));
        assert!(msg.contains("200ms"));
        assert!(msg.contains("abc"));
    }

    #[test]
    fn test_exit_message() {
        let err = Error::ProcessExitNonZero {
            code: Some(1),
            detail: "boom".to_string(),
        };
        assert_eq!(err.to_string(), "process exited with code 1: boom");

        let err = Error::ProcessExitNonZero {
            code: None,
            detail: "killed".to_string(),
        };
        assert_eq!(err.to_string(), "process exited with signal: killed");
    }

    #[test]
    fn test_transient_classification() {
        assert!(Error::CircuitOpen { name: "x".into() }.is_transient());
        assert!(!Error::unresolvable("nope").is_transient());
        assert!(!Error::Cancelled.is_transient());
        assert_eq!(Error::unresolvable("x").kind(), "resolve_failed");
    }
}

//! Session entity and lifecycle states.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::control::admission::AdmissionClass;
use crate::control::intent::Intent;
use crate::executor::ProgressSample;

/// Lifecycle state of a session.
///
/// ```text
/// Starting -> Running -> Completed | Failed | Stalled | Cancelled
/// Starting -> Failed | Cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, strum::Display, strum::EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SessionState {
    Starting,
    Running,
    Completed,
    Failed,
    Stalled,
    Cancelled,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Stalled | Self::Cancelled
        )
    }

    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Starting, Running | Failed | Cancelled)
                | (Running, Completed | Failed | Stalled | Cancelled)
        )
    }
}

/// Latest progress reported by the transcoder.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProgressSnapshot {
    pub out_time_ms: u64,
    pub total_size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
}

impl From<&ProgressSample> for ProgressSnapshot {
    fn from(sample: &ProgressSample) -> Self {
        Self {
            out_time_ms: sample.out_time.as_millis() as u64,
            total_size: sample.total_size,
            speed: sample.speed,
        }
    }
}

/// One tracked transcode.
#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub id: String,
    pub intent: Intent,
    pub admission_class: AdmissionClass,
    pub state: SessionState,
    /// Resolved input, a local path or a stream URL.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    pub output_dir: PathBuf,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_progress_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_access_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<ProgressSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl Session {
    pub fn new(id: String, intent: Intent, output_dir: PathBuf) -> Self {
        let now = Utc::now();
        Self {
            id,
            admission_class: intent.profile.admission_class(),
            intent,
            state: SessionState::Starting,
            source: None,
            output_dir,
            created_at: now,
            updated_at: now,
            last_progress_at: None,
            last_access_at: None,
            progress: None,
            last_error: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Latest of the last state/progress update and the last client read.
    /// Idle time for eviction is measured from here.
    pub fn last_activity_at(&self) -> DateTime<Utc> {
        self.last_access_at
            .map_or(self.updated_at, |accessed| accessed.max(self.updated_at))
    }

    /// Wall time from creation to the last update.
    pub fn elapsed(&self) -> chrono::Duration {
        self.updated_at - self.created_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitions() {
        use SessionState::*;
        assert!(Starting.can_transition_to(Running));
        assert!(Starting.can_transition_to(Cancelled));
        assert!(Starting.can_transition_to(Failed));
        assert!(!Starting.can_transition_to(Completed));
        assert!(!Starting.can_transition_to(Stalled));

        for next in [Completed, Failed, Stalled, Cancelled] {
            assert!(Running.can_transition_to(next));
            assert!(next.is_terminal());
            for any in [Starting, Running, Completed, Failed, Stalled, Cancelled] {
                assert!(!next.can_transition_to(any));
            }
        }
        assert!(!Running.can_transition_to(Starting));
    }

    #[test]
    fn test_state_names() {
        assert_eq!(SessionState::Stalled.to_string(), "stalled");
        assert_eq!(
            serde_json::to_string(&SessionState::Running).unwrap(),
            "\"running\""
        );
    }

    #[test]
    fn test_last_activity_counts_client_reads() {
        use crate::control::intent::{Intent, OutputProfile, TargetRef};

        let intent = Intent::new(
            TargetRef::Recording {
                id: "/media/hdd/movie/a.ts".into(),
            },
            OutputProfile::Passthrough,
        );
        let mut session = Session::new("s1".into(), intent, PathBuf::from("/tmp/s1"));
        assert_eq!(session.last_activity_at(), session.updated_at);

        let read_later = session.updated_at + chrono::Duration::minutes(5);
        session.last_access_at = Some(read_later);
        assert_eq!(session.last_activity_at(), read_later);

        session.last_access_at = Some(session.updated_at - chrono::Duration::minutes(5));
        assert_eq!(session.last_activity_at(), session.updated_at);
    }
}

//! Playback intents accepted from the HTTP boundary.

use serde::{Deserialize, Serialize};

use super::admission::AdmissionClass;

/// What the caller wants to watch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TargetRef {
    /// A stored recording, by receiver path or Enigma2 service reference.
    Recording { id: String },
    /// A live channel, by Enigma2 service reference.
    Live { service_ref: String },
}

impl TargetRef {
    pub fn describe(&self) -> String {
        match self {
            TargetRef::Recording { id } => format!("recording:{id}"),
            TargetRef::Live { service_ref } => format!("live:{service_ref}"),
        }
    }
}

/// Requested output profile.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum OutputProfile {
    /// Remux only, codecs are copied.
    #[default]
    Passthrough,
    /// H.264 + AAC re-encode at source resolution.
    Compatible,
    /// H.264 + AAC re-encode scaled down to 720p.
    LowBandwidth,
}

impl OutputProfile {
    /// Pool this profile draws its admission ticket from.
    pub fn admission_class(self) -> AdmissionClass {
        match self {
            OutputProfile::Passthrough => AdmissionClass::Transcode,
            OutputProfile::Compatible | OutputProfile::LowBandwidth => AdmissionClass::CpuHeavy,
        }
    }

    pub fn reencodes_video(self) -> bool {
        !matches!(self, OutputProfile::Passthrough)
    }
}

/// An immutable request to start a transcode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Intent {
    pub target: TargetRef,
    #[serde(default)]
    pub profile: OutputProfile,
    /// Identity of the caller, taken from the authenticated token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requested_by: Option<String>,
}

impl Intent {
    pub fn new(target: TargetRef, profile: OutputProfile) -> Self {
        Self {
            target,
            profile,
            requested_by: None,
        }
    }

    pub fn with_requested_by(mut self, principal: impl Into<String>) -> Self {
        self.requested_by = Some(principal.into());
        self
    }
}

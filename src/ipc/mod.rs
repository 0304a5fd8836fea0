//! IPC protocol types for the host application.
//!
//! Events use `{"event": "<name>", "data": {...}}` format (tutor -> host).
//! Commands use `{"command": "<name>", ...}` format (host -> tutor).

pub mod bridge;

use serde::{Deserialize, Serialize};

use crate::audio::devices::AudioDeviceInfo;
use crate::controller::{Notification, VoiceSessionState};
use crate::error::VoiceError;
use crate::tutor::Language;

// ---------------------------------------------------------------------------
// Events: tutor -> host (stdout)
// ---------------------------------------------------------------------------

/// All events emitted to the host via stdout as JSON lines.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data")]
#[serde(rename_all = "snake_case")]
pub enum TutorEvent {
    Starting {},
    Ready {},
    StateChange { state: String },
    SpeakingStart {},
    SpeakingEnd {},
    Error { kind: String, message: String },
    Status { state: String, speaking: bool },
    AudioDevices {
        input: Vec<AudioDeviceInfo>,
        output: Vec<AudioDeviceInfo>,
    },
    Pong {},
    Stopping {},
}

impl TutorEvent {
    pub fn state_change(state: VoiceSessionState) -> Self {
        Self::StateChange {
            state: state.as_str().to_string(),
        }
    }

    pub fn status(state: VoiceSessionState, speaking: bool) -> Self {
        Self::Status {
            state: state.as_str().to_string(),
            speaking,
        }
    }

    pub fn error(err: &VoiceError) -> Self {
        Self::Error {
            kind: err.kind().to_string(),
            message: err.user_message(),
        }
    }
}

impl From<&Notification> for TutorEvent {
    fn from(notification: &Notification) -> Self {
        match notification {
            Notification::StateChanged(state) => Self::state_change(*state),
            Notification::SpeakingChanged(true) => Self::SpeakingStart {},
            Notification::SpeakingChanged(false) => Self::SpeakingEnd {},
            Notification::Error(err) => Self::error(err),
        }
    }
}

// ---------------------------------------------------------------------------
// Commands: host -> tutor (stdin)
// ---------------------------------------------------------------------------

/// All commands received from the host via stdin as JSON lines.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "command")]
#[serde(rename_all = "snake_case")]
pub enum TutorCommand {
    StartSession {
        context: String,
        /// Falls back to the configured language.
        #[serde(default)]
        language: Option<Language>,
    },
    StopSession {},
    Status {},
    ListAudioDevices {},
    Ping {},
    Shutdown {},
}

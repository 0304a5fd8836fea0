//! Error taxonomy for the voice session.
//!
//! Capture and connection failures end the session and are surfaced to the
//! host as one human-readable string. Decode failures only ever drop a single
//! inbound chunk.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VoiceError {
    /// The user or OS refused microphone access.
    #[error("microphone permission denied")]
    PermissionDenied,

    /// No audio input device exists.
    #[error("no audio input device available")]
    DeviceUnavailable,

    /// Any other capture or output platform failure.
    #[error("audio device error: {0}")]
    DeviceError(String),

    /// The tutor endpoint was unreachable or rejected the handshake.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// The tutor endpoint closed the session while it was active.
    #[error("connection lost")]
    ConnectionLost,

    /// A single inbound audio payload could not be decoded.
    #[error("audio decode error: {0}")]
    Decode(String),
}

impl VoiceError {
    /// Stable tag used on the IPC wire.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::PermissionDenied => "permission_denied",
            Self::DeviceUnavailable => "device_unavailable",
            Self::DeviceError(_) => "device_error",
            Self::ConnectionFailed(_) => "connection_failed",
            Self::ConnectionLost => "connection_lost",
            Self::Decode(_) => "decode",
        }
    }

    /// Text shown to the user when a session fails.
    pub fn user_message(&self) -> String {
        match self {
            Self::PermissionDenied => "Microphone access denied. Allow microphone access for this \
                 application in your system privacy settings, then try again."
                .to_string(),
            Self::DeviceUnavailable => {
                "No microphone detected. Please connect a microphone and try again.".to_string()
            }
            Self::DeviceError(msg) => format!("Could not access audio device: {msg}"),
            Self::ConnectionFailed(_) => "Connection failed: The AI tutor is currently unavailable. \
                 Please try again in a few moments."
                .to_string(),
            Self::ConnectionLost => {
                "Connection to the AI tutor was lost. Please start a new session.".to_string()
            }
            Self::Decode(msg) => format!("Could not decode tutor audio: {msg}"),
        }
    }
}

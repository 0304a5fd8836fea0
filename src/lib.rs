//! Real-time voice tutoring core.
//!
//! Streams microphone audio to a hosted tutor session and plays the tutor's
//! spoken replies back without gaps, with barge-in and deterministic
//! teardown. The binary drives it over JSON-line IPC.

pub mod audio;
pub mod config;
pub mod controller;
pub mod error;
pub mod ipc;
pub mod logger;
pub mod tutor;

pub use controller::{
    ControllerOptions, Notification, StartOutcome, VoiceController, VoiceSessionState,
};
pub use error::VoiceError;

//! Streaming session with the hosted tutor.
//!
//! The controller depends only on `TutorTransport` / `SessionHandle`; `live`
//! implements them over a WebSocket. Any provider that can open a
//! bidirectional audio session seeded with a system instruction fits.

pub mod live;
pub mod protocol;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::audio::pcm::EncodedChunk;
use crate::controller::events::EventSink;
use crate::error::VoiceError;

pub use live::{LiveClient, LiveConfig, LiveSession};

/// Maximum number of characters of study material sent as session context.
pub const DEFAULT_CONTEXT_CHAR_LIMIT: usize = 20_000;

/// Tutoring language preference.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    #[default]
    En,
    Ar,
}

impl Language {
    pub fn tag(&self) -> &'static str {
        match self {
            Self::En => "en",
            Self::Ar => "ar",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for Language {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "en" => Ok(Self::En),
            "ar" => Ok(Self::Ar),
            other => Err(format!("Unsupported language: {other}")),
        }
    }
}

/// What a session is seeded with at open time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSetup {
    pub context: String,
    pub language: Language,
}

impl SessionSetup {
    pub fn new(context: impl Into<String>, language: Language) -> Self {
        Self {
            context: context.into(),
            language,
        }
    }

    /// System instruction with the context cut to `char_limit` characters.
    pub fn system_instruction(&self, char_limit: usize) -> String {
        let context: String = self.context.chars().take(char_limit).collect();
        format!("Tutor the user on this: {}. Lang: {}", context, self.language)
    }
}

/// A message from the tutor that the controller acts on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteEvent {
    /// Base64 PCM16LE, 24 kHz mono.
    AudioDelta(String),
    /// The tutor dropped its in-flight turn (barge-in).
    Interrupted,
}

/// Opens sessions with the tutor service.
#[allow(async_fn_in_trait)]
pub trait TutorTransport {
    type Handle: SessionHandle;

    /// Establish a session. Resolves once it can send and receive.
    ///
    /// Remote events and the single close notification are delivered on
    /// `events`.
    async fn open(&self, setup: &SessionSetup, events: EventSink)
        -> Result<Self::Handle, VoiceError>;
}

/// An open tutor session.
pub trait SessionHandle {
    /// Fire-and-forget send of one audio chunk. Never blocks; failures are
    /// swallowed.
    fn send(&self, chunk: &EncodedChunk);

    /// Close the session. Idempotent.
    fn close(&mut self);
}

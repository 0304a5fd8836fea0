//! JSON frames exchanged with the live tutor endpoint.
//!
//! Client frames: `{"setup": {...}}` once, then
//! `{"realtimeInput": {"mediaChunks": [...]}}` per captured frame.
//! Server frames: `{"setupComplete": {}}`, then `{"serverContent": {...}}`
//! carrying audio parts or an interruption flag.

use serde::{Deserialize, Serialize};

use super::RemoteEvent;
use crate::audio::pcm::EncodedChunk;

// ---------------------------------------------------------------------------
// Client -> server
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ClientMessage<'a> {
    Setup(Setup),
    RealtimeInput(RealtimeInput<'a>),
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Setup {
    pub model: String,
    pub generation_config: GenerationConfig,
    pub system_instruction: Content,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub response_modalities: Vec<String>,
    pub speech_config: SpeechConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeechConfig {
    pub voice_config: VoiceConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConfig {
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrebuiltVoiceConfig {
    pub voice_name: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInput<'a> {
    pub media_chunks: Vec<MediaChunk<'a>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaChunk<'a> {
    pub mime_type: &'a str,
    pub data: &'a str,
}

impl<'a> ClientMessage<'a> {
    /// Session setup: audio responses, prebuilt voice, system instruction.
    pub fn setup(model: &str, voice_name: &str, instruction: String) -> Self {
        let model = if model.starts_with("models/") {
            model.to_string()
        } else {
            format!("models/{model}")
        };
        Self::Setup(Setup {
            model,
            generation_config: GenerationConfig {
                response_modalities: vec!["AUDIO".to_string()],
                speech_config: SpeechConfig {
                    voice_config: VoiceConfig {
                        prebuilt_voice_config: PrebuiltVoiceConfig {
                            voice_name: voice_name.to_string(),
                        },
                    },
                },
            },
            system_instruction: Content {
                parts: vec![Part {
                    text: Some(instruction),
                    inline_data: None,
                }],
            },
        })
    }

    /// One captured audio frame.
    pub fn audio(chunk: &'a EncodedChunk) -> Self {
        Self::RealtimeInput(RealtimeInput {
            media_chunks: vec![MediaChunk {
                mime_type: chunk.mime_type,
                data: &chunk.data,
            }],
        })
    }
}

// ---------------------------------------------------------------------------
// Shared
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Content {
    #[serde(default)]
    pub parts: Vec<Part>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline_data: Option<InlineData>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InlineData {
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub data: String,
}

// ---------------------------------------------------------------------------
// Server -> client
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    #[serde(default)]
    pub setup_complete: Option<serde_json::Value>,
    #[serde(default)]
    pub server_content: Option<ServerContent>,
    #[serde(default)]
    pub go_away: Option<serde_json::Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerContent {
    #[serde(default)]
    pub model_turn: Option<Content>,
    #[serde(default)]
    pub interrupted: bool,
    #[serde(default)]
    pub turn_complete: bool,
}

impl ServerMessage {
    pub fn parse(raw: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(raw)
    }

    pub fn is_setup_complete(&self) -> bool {
        self.setup_complete.is_some()
    }

    /// The tutor finished its current reply.
    pub fn is_turn_complete(&self) -> bool {
        self.server_content
            .as_ref()
            .is_some_and(|content| content.turn_complete)
    }

    /// The server announced it will close the connection soon.
    pub fn is_go_away(&self) -> bool {
        self.go_away.is_some()
    }

    /// Events for the controller, in wire order.
    ///
    /// An interruption supersedes any audio in the same message.
    pub fn into_events(self) -> Vec<RemoteEvent> {
        let Some(content) = self.server_content else {
            return Vec::new();
        };
        if content.interrupted {
            return vec![RemoteEvent::Interrupted];
        }
        content
            .model_turn
            .map(|turn| {
                turn.parts
                    .into_iter()
                    .filter_map(|part| part.inline_data)
                    .filter(|inline| !inline.data.is_empty())
                    .map(|inline| RemoteEvent::AudioDelta(inline.data))
                    .collect()
            })
            .unwrap_or_default()
    }
}

//! WebSocket transport for the hosted live tutor.
//!
//! `open` connects, sends the setup frame and waits for `setupComplete`.
//! After that the socket is split: a writer task owns the sink and drains an
//! unbounded queue (so `send` never blocks the control loop), a reader task
//! turns server frames into `RemoteEvent`s and reports the end of the session
//! exactly once.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, info, warn};

use super::protocol::{ClientMessage, ServerMessage};
use super::{SessionHandle, SessionSetup, TutorTransport, DEFAULT_CONTEXT_CHAR_LIMIT};
use crate::audio::pcm::EncodedChunk;
use crate::controller::events::EventSink;
use crate::error::VoiceError;

pub const DEFAULT_MODEL: &str = "gemini-2.5-flash-native-audio-preview-12-2025";
pub const DEFAULT_VOICE: &str = "Kore";
pub const DEFAULT_ENDPOINT: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

/// Connection settings for the live tutor.
#[derive(Clone)]
pub struct LiveConfig {
    pub api_key: Option<String>,
    pub model: String,
    pub voice_name: String,
    pub endpoint: String,
    pub context_char_limit: usize,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            model: DEFAULT_MODEL.into(),
            voice_name: DEFAULT_VOICE.into(),
            endpoint: DEFAULT_ENDPOINT.into(),
            context_char_limit: DEFAULT_CONTEXT_CHAR_LIMIT,
        }
    }
}

// Keeps the API key out of logs.
impl fmt::Debug for LiveConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveConfig")
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("model", &self.model)
            .field("voice_name", &self.voice_name)
            .field("endpoint", &self.endpoint)
            .field("context_char_limit", &self.context_char_limit)
            .finish()
    }
}

impl LiveConfig {
    fn api_key(&self) -> Result<&str, VoiceError> {
        self.api_key
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .ok_or_else(|| VoiceError::ConnectionFailed("API key missing".into()))
    }

    fn url(&self, key: &str) -> String {
        let sep = if self.endpoint.contains('?') { '&' } else { '?' };
        format!("{}{}key={}", self.endpoint, sep, key)
    }
}

/// Opens live tutor sessions.
#[derive(Debug, Clone)]
pub struct LiveClient {
    config: LiveConfig,
}

impl LiveClient {
    pub fn new(config: LiveConfig) -> Self {
        Self { config }
    }
}

impl TutorTransport for LiveClient {
    type Handle = LiveSession;

    async fn open(&self, setup: &SessionSetup, events: EventSink) -> Result<LiveSession, VoiceError> {
        let key = self.config.api_key()?;
        info!(
            endpoint = %self.config.endpoint,
            model = %self.config.model,
            language = %setup.language,
            "Connecting to tutor"
        );

        let (mut socket, _response) = connect_async(self.config.url(key))
            .await
            .map_err(|e| VoiceError::ConnectionFailed(format!("WebSocket connect failed: {e}")))?;

        let instruction = setup.system_instruction(self.config.context_char_limit);
        let setup_frame = serde_json::to_string(&ClientMessage::setup(
            &self.config.model,
            &self.config.voice_name,
            instruction,
        ))
        .map_err(|e| VoiceError::ConnectionFailed(format!("Failed to encode setup: {e}")))?;

        socket
            .send(Message::Text(setup_frame.into()))
            .await
            .map_err(|e| VoiceError::ConnectionFailed(format!("Failed to send setup: {e}")))?;

        await_setup_complete(&mut socket).await?;
        info!(session = events.session(), "Tutor session ready");

        let (sink, stream) = socket.split();
        Ok(LiveSession::spawn(sink, stream, events))
    }
}

/// Read frames until the server acknowledges setup.
async fn await_setup_complete<S>(socket: &mut S) -> Result<(), VoiceError>
where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
{
    while let Some(frame) = socket.next().await {
        let raw = match frame {
            Ok(Message::Text(text)) => text.as_bytes().to_vec(),
            Ok(Message::Binary(data)) => data.to_vec(),
            Ok(Message::Close(frame)) => {
                let reason = frame
                    .map(|f| f.reason.to_string())
                    .filter(|r| !r.is_empty())
                    .unwrap_or_else(|| "closed during setup".into());
                return Err(VoiceError::ConnectionFailed(reason));
            }
            Ok(_) => continue,
            Err(e) => return Err(VoiceError::ConnectionFailed(e.to_string())),
        };

        match ServerMessage::parse(&raw) {
            Ok(msg) if msg.is_setup_complete() => return Ok(()),
            Ok(_) => debug!("Ignoring frame before setup complete"),
            Err(e) => debug!("Unparseable frame during setup: {}", e),
        }
    }
    Err(VoiceError::ConnectionFailed("closed before setup complete".into()))
}

enum Outbound {
    Text(String),
    Close,
}

async fn write_loop<K>(mut sink: K, mut outbound: mpsc::UnboundedReceiver<Outbound>)
where
    K: Sink<Message> + Unpin,
    K::Error: fmt::Display,
{
    while let Some(msg) = outbound.recv().await {
        match msg {
            Outbound::Text(text) => {
                if let Err(e) = sink.send(Message::Text(text.into())).await {
                    debug!("Tutor send failed: {}", e);
                    break;
                }
            }
            Outbound::Close => break,
        }
    }
    let _ = sink.close().await;
}

async fn read_loop<S>(mut stream: S, events: EventSink, closed: Arc<AtomicBool>)
where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
{
    let mut reason = None;
    while let Some(frame) = stream.next().await {
        let msg = match frame {
            Ok(Message::Text(text)) => ServerMessage::parse(text.as_bytes()),
            Ok(Message::Binary(data)) => ServerMessage::parse(&data),
            Ok(Message::Close(frame)) => {
                reason = frame.map(|f| f.reason.to_string()).filter(|r| !r.is_empty());
                break;
            }
            Ok(_) => continue,
            Err(e) => {
                warn!("Tutor connection error: {}", e);
                reason = Some(e.to_string());
                break;
            }
        };

        let msg = match msg {
            Ok(msg) => msg,
            Err(e) => {
                debug!("Skipping unparseable tutor frame: {}", e);
                continue;
            }
        };
        if msg.is_go_away() {
            debug!("Tutor announced goAway");
        }
        if msg.is_turn_complete() {
            debug!("Tutor turn complete");
        }
        let remote_events = msg.into_events();
        if remote_events.is_empty() {
            debug!("Tutor message without audio, ignored");
        }
        for event in remote_events {
            if !events.remote(event) {
                // Controller gone.
                return;
            }
        }
    }
    notify_closed(&closed, &events, reason);
}

fn notify_closed(closed: &AtomicBool, events: &EventSink, reason: Option<String>) {
    if !closed.swap(true, Ordering::SeqCst) {
        info!(session = events.session(), reason = ?reason, "Tutor session closed");
        events.remote_closed(reason);
    }
}

/// An open live tutor session.
pub struct LiveSession {
    outbound: mpsc::UnboundedSender<Outbound>,
    closed: Arc<AtomicBool>,
    closing: bool,
    events: EventSink,
    reader: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
}

impl LiveSession {
    /// Start the writer and reader tasks over an established connection.
    fn spawn<K, S>(sink: K, stream: S, events: EventSink) -> Self
    where
        K: Sink<Message> + Unpin + Send + 'static,
        K::Error: fmt::Display + Send,
        S: Stream<Item = Result<Message, WsError>> + Unpin + Send + 'static,
    {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));

        let writer = tokio::spawn(write_loop(sink, outbound_rx));
        let reader = tokio::spawn(read_loop(stream, events.clone(), closed.clone()));

        Self {
            outbound: outbound_tx,
            closed,
            closing: false,
            events,
            reader: Some(reader),
            writer: Some(writer),
        }
    }
}

impl SessionHandle for LiveSession {
    fn send(&self, chunk: &EncodedChunk) {
        if self.closing || self.closed.load(Ordering::SeqCst) {
            return;
        }
        match serde_json::to_string(&ClientMessage::audio(chunk)) {
            Ok(text) => {
                let _ = self.outbound.send(Outbound::Text(text));
            }
            Err(e) => debug!("Failed to encode audio frame: {}", e),
        }
    }

    fn close(&mut self) {
        if self.closing {
            return;
        }
        self.closing = true;
        let _ = self.outbound.send(Outbound::Close);
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        // The writer finishes on its own after flushing the close frame.
        self.writer.take();
        notify_closed(&self.closed, &self.events, None);
    }
}

impl Drop for LiveSession {
    fn drop(&mut self) {
        self.close();
    }
}

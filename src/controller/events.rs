//! Internal event channel of the voice controller.
//!
//! Capture frames, tutor messages, the tutor close notification and playback
//! completions all funnel into one unbounded queue consumed by the control
//! loop. Each event carries the generation of the session that produced it so
//! stragglers from a torn-down session are recognisable.

use tokio::sync::mpsc;

use crate::audio::ChunkId;
use crate::tutor::{Language, RemoteEvent};

#[derive(Debug, Clone, PartialEq)]
pub struct ControllerEvent {
    pub session: u64,
    pub kind: EventKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    /// One captured 16 kHz mono frame.
    CaptureFrame(Vec<f32>),
    Remote(RemoteEvent),
    /// The tutor session ended. Sent at most once per session.
    RemoteClosed { reason: Option<String> },
    /// A scheduled chunk played to its end.
    PlaybackEnded(ChunkId),
}

/// Producer side handed to devices and the transport for one session.
#[derive(Debug, Clone)]
pub struct EventSink {
    session: u64,
    tx: mpsc::UnboundedSender<ControllerEvent>,
}

impl EventSink {
    pub fn new(session: u64, tx: mpsc::UnboundedSender<ControllerEvent>) -> Self {
        Self { session, tx }
    }

    pub fn session(&self) -> u64 {
        self.session
    }

    /// Returns `false` once the controller is gone.
    pub fn capture_frame(&self, samples: Vec<f32>) -> bool {
        self.emit(EventKind::CaptureFrame(samples))
    }

    pub fn remote(&self, event: RemoteEvent) -> bool {
        self.emit(EventKind::Remote(event))
    }

    pub fn remote_closed(&self, reason: Option<String>) -> bool {
        self.emit(EventKind::RemoteClosed { reason })
    }

    pub fn playback_ended(&self, chunk: ChunkId) -> bool {
        self.emit(EventKind::PlaybackEnded(chunk))
    }

    fn emit(&self, kind: EventKind) -> bool {
        self.tx
            .send(ControllerEvent {
                session: self.session,
                kind,
            })
            .is_ok()
    }
}

/// Requests from the host to the control loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    Start { context: String, language: Language },
    Stop,
    /// Stop any session and leave the control loop.
    Shutdown,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sink_tags_events_with_session() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = EventSink::new(7, tx);
        assert!(sink.playback_ended(3));
        assert!(sink.remote(RemoteEvent::Interrupted));

        let first = rx.try_recv().unwrap();
        assert_eq!(first.session, 7);
        assert_eq!(first.kind, EventKind::PlaybackEnded(3));
        assert_eq!(rx.try_recv().unwrap().kind, EventKind::Remote(RemoteEvent::Interrupted));
    }

    #[test]
    fn test_sink_reports_dropped_receiver() {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = EventSink::new(1, tx);
        drop(rx);
        assert!(!sink.capture_frame(vec![0.0; 4]));
    }
}

//! Voice session controller: mic -> tutor -> speaker.
//!
//! Owns the lifecycle of one tutoring session. `start` acquires the
//! microphone, opens the output device and the tutor session, then wires
//! captured frames to the tutor. Everything after that arrives as a
//! `ControllerEvent` on one internal queue and is handled by
//! `handle_event`, either from `run` or from `drain_events`.
//!
//! All teardown paths (user stop, failed start, remote close) go through the
//! same idempotent `teardown`, in reverse dependency order.

pub mod events;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::audio::pcm::{decode_chunk, encode_frame};
use crate::audio::{
    AudioInput, AudioOutput, CaptureSession, PlaybackContext, PlaybackScheduler,
    PLAYBACK_SAMPLE_RATE,
};
use crate::error::VoiceError;
use crate::tutor::{Language, RemoteEvent, SessionHandle, SessionSetup, TutorTransport};

use events::{ControlCommand, ControllerEvent, EventKind, EventSink};

/// Default bound on establishing the tutor session.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

// ── States ──────────────────────────────────────────────────────────

/// Lifecycle phase, independent of the speaking sub-state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Idle,
    Connecting,
    Active,
}

/// State reported to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VoiceSessionState {
    Idle,
    Connecting,
    ActiveListening,
    ActiveSpeaking,
    /// Idle after a failed or lost session.
    Error,
}

impl VoiceSessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::ActiveListening => "active_listening",
            Self::ActiveSpeaking => "active_speaking",
            Self::Error => "error",
        }
    }
}

/// How a `start` call ended when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Active,
    /// A stop was requested while the session was being set up.
    Cancelled,
    /// A session is already connecting or active; nothing was acquired.
    AlreadyRunning,
}

/// Outbound notifications for the host.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    StateChanged(VoiceSessionState),
    SpeakingChanged(bool),
    Error(VoiceError),
}

#[derive(Debug, Clone)]
pub struct ControllerOptions {
    /// `None` waits for the tutor handshake indefinitely.
    pub connect_timeout: Option<Duration>,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Some(DEFAULT_CONNECT_TIMEOUT),
        }
    }
}

/// Requests a stop while `start` is in flight.
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn request_stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

// ── Controller ──────────────────────────────────────────────────────

pub struct VoiceController<I, O, T>
where
    I: AudioInput,
    O: AudioOutput,
    T: TutorTransport,
{
    input: I,
    output: O,
    transport: T,
    options: ControllerOptions,

    phase: SessionPhase,
    /// Bumped on every start; events tagged with an older value are stale.
    generation: u64,
    last_error: Option<VoiceError>,
    stop: StopHandle,

    capture: Option<I::Session>,
    playback: Option<PlaybackScheduler<O::Context>>,
    session: Option<T::Handle>,

    events_tx: mpsc::UnboundedSender<ControllerEvent>,
    events_rx: mpsc::UnboundedReceiver<ControllerEvent>,
    notify: mpsc::UnboundedSender<Notification>,
    /// Last (state, speaking) pair sent to the host.
    published: (VoiceSessionState, bool),
}

impl<I, O, T> VoiceController<I, O, T>
where
    I: AudioInput,
    O: AudioOutput,
    T: TutorTransport,
{
    pub fn new(
        input: I,
        output: O,
        transport: T,
        options: ControllerOptions,
    ) -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (notify, notifications) = mpsc::unbounded_channel();
        let controller = Self {
            input,
            output,
            transport,
            options,
            phase: SessionPhase::Idle,
            generation: 0,
            last_error: None,
            stop: StopHandle::default(),
            capture: None,
            playback: None,
            session: None,
            events_tx,
            events_rx,
            notify,
            published: (VoiceSessionState::Idle, false),
        };
        (controller, notifications)
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn state(&self) -> VoiceSessionState {
        match self.phase {
            SessionPhase::Idle if self.last_error.is_some() => VoiceSessionState::Error,
            SessionPhase::Idle => VoiceSessionState::Idle,
            SessionPhase::Connecting => VoiceSessionState::Connecting,
            SessionPhase::Active if self.is_speaking() => VoiceSessionState::ActiveSpeaking,
            SessionPhase::Active => VoiceSessionState::ActiveListening,
        }
    }

    /// True while any tutor audio is scheduled.
    pub fn is_speaking(&self) -> bool {
        self.phase == SessionPhase::Active
            && self.playback.as_ref().is_some_and(|p| p.is_speaking())
    }

    pub fn last_error(&self) -> Option<&VoiceError> {
        self.last_error.as_ref()
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Start a tutoring session on `context`.
    ///
    /// Only valid from idle. On failure every acquired resource is released
    /// before the error is returned, and the error is also published.
    pub async fn start(
        &mut self,
        context: impl Into<String>,
        language: Language,
    ) -> Result<StartOutcome, VoiceError> {
        if self.phase != SessionPhase::Idle {
            warn!(phase = ?self.phase, "Session already running, ignoring start");
            return Ok(StartOutcome::AlreadyRunning);
        }

        self.stop.reset();
        self.generation += 1;
        self.last_error = None;
        self.phase = SessionPhase::Connecting;
        self.publish();
        info!(session = self.generation, language = %language, "Starting voice session");

        let setup = SessionSetup::new(context, language);
        let sink = EventSink::new(self.generation, self.events_tx.clone());

        match self.connect(&setup, sink).await {
            Ok(()) if !self.stop.is_requested() => {
                self.phase = SessionPhase::Active;
                self.publish();
                info!(session = self.generation, "Voice session active");
                Ok(StartOutcome::Active)
            }
            Ok(()) => {
                info!("Stop requested during connect, tearing down");
                self.teardown();
                self.phase = SessionPhase::Idle;
                self.publish();
                Ok(StartOutcome::Cancelled)
            }
            Err(e) if self.stop.is_requested() => {
                debug!("Start failed after stop was requested: {}", e);
                self.teardown();
                self.phase = SessionPhase::Idle;
                self.publish();
                Ok(StartOutcome::Cancelled)
            }
            Err(e) => {
                self.teardown();
                self.fail(e.clone());
                Err(e)
            }
        }
    }

    /// Acquire resources in dependency order. Each one is stored as soon as
    /// it exists so `teardown` can release it on any later failure.
    async fn connect(&mut self, setup: &SessionSetup, sink: EventSink) -> Result<(), VoiceError> {
        let capture = self.input.acquire().await?;
        self.capture = Some(capture);
        if self.stop.is_requested() {
            return Ok(());
        }

        let mut context = self.output.open(sink.clone()).await?;
        if let Err(e) = context.resume().await {
            context.close();
            return Err(e);
        }
        self.playback = Some(PlaybackScheduler::new(context, PLAYBACK_SAMPLE_RATE));
        if let Some(capture) = self.capture.as_mut() {
            capture.resume().await?;
        }
        if self.stop.is_requested() {
            return Ok(());
        }

        let open = self.transport.open(setup, sink.clone());
        let handle = match self.options.connect_timeout {
            Some(limit) => tokio::time::timeout(limit, open).await.map_err(|_| {
                warn!(timeout_secs = limit.as_secs_f64(), "Tutor handshake timed out");
                VoiceError::ConnectionFailed(format!(
                    "no response within {}s",
                    limit.as_secs_f64()
                ))
            })??,
            None => open.await?,
        };
        self.session = Some(handle);
        if self.stop.is_requested() {
            return Ok(());
        }

        if let Some(capture) = self.capture.as_mut() {
            capture.on_frame(sink);
        }
        Ok(())
    }

    /// End the current session, if any. Safe to call repeatedly.
    pub fn stop(&mut self) {
        if self.phase == SessionPhase::Idle {
            debug!("Stop while idle");
            self.teardown();
            return;
        }
        info!(session = self.generation, "Stopping voice session");
        self.teardown();
        self.phase = SessionPhase::Idle;
        self.publish();
    }

    /// Release everything in reverse dependency order: stop forwarding
    /// frames, silence and close playback, free the microphone, close the
    /// tutor session.
    fn teardown(&mut self) {
        if let Some(capture) = self.capture.as_mut() {
            capture.detach();
        }
        if let Some(mut playback) = self.playback.take() {
            let flushed = playback.flush();
            if flushed > 0 {
                debug!(flushed, "Discarded scheduled tutor audio");
            }
            playback.teardown();
        }
        if let Some(mut capture) = self.capture.take() {
            capture.release();
        }
        if let Some(mut session) = self.session.take() {
            session.close();
        }
    }

    fn fail(&mut self, err: VoiceError) {
        error!(kind = err.kind(), "Voice session failed: {}", err);
        self.phase = SessionPhase::Idle;
        self.last_error = Some(err.clone());
        let _ = self.notify.send(Notification::Error(err));
        self.publish();
    }

    /// Apply one internal event.
    pub fn handle_event(&mut self, event: ControllerEvent) {
        if event.session != self.generation {
            debug!(
                event_session = event.session,
                current = self.generation,
                "Ignoring stale event"
            );
            return;
        }
        if self.phase != SessionPhase::Active {
            debug!(phase = ?self.phase, "Ignoring event outside an active session");
            return;
        }

        match event.kind {
            EventKind::CaptureFrame(samples) => {
                if let Some(session) = self.session.as_ref() {
                    session.send(&encode_frame(&samples));
                }
            }
            EventKind::Remote(RemoteEvent::AudioDelta(payload)) => self.on_audio_delta(&payload),
            EventKind::Remote(RemoteEvent::Interrupted) => {
                if let Some(playback) = self.playback.as_mut() {
                    let flushed = playback.flush();
                    info!(flushed, "Tutor interrupted, playback flushed");
                }
            }
            EventKind::RemoteClosed { reason } => {
                warn!(reason = ?reason, "Tutor closed the session unexpectedly");
                self.teardown();
                self.fail(VoiceError::ConnectionLost);
                return;
            }
            EventKind::PlaybackEnded(chunk) => {
                if let Some(playback) = self.playback.as_mut() {
                    playback.on_chunk_ended(chunk);
                }
            }
        }
        self.publish();
    }

    fn on_audio_delta(&mut self, payload: &str) {
        let samples = match decode_chunk(payload) {
            Ok(samples) => samples,
            Err(e) => {
                warn!("Dropping tutor audio chunk: {}", e);
                return;
            }
        };
        if samples.is_empty() {
            return;
        }
        if let Some(playback) = self.playback.as_mut() {
            if let Err(e) = playback.enqueue(samples) {
                warn!("Failed to schedule tutor audio: {}", e);
            }
        }
    }

    /// Handle every event already queued. Returns how many were handled.
    pub fn drain_events(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(event) = self.events_rx.try_recv() {
            self.handle_event(event);
            handled += 1;
        }
        handled
    }

    /// The control loop. Returns on `Shutdown` or when `commands` closes,
    /// with any session stopped.
    pub async fn run(&mut self, mut commands: mpsc::UnboundedReceiver<ControlCommand>) {
        info!("Voice controller running");
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(ControlCommand::Start { context, language }) => {
                        if self.run_start(context, language, &mut commands).await {
                            break;
                        }
                    }
                    Some(ControlCommand::Stop) => self.stop(),
                    Some(ControlCommand::Shutdown) | None => break,
                },
                Some(event) = self.events_rx.recv() => self.handle_event(event),
            }
        }
        self.stop();
        info!("Voice controller stopped");
    }

    /// Drive `start` while still reading commands, so a stop during connect
    /// is honoured. Returns `true` if shutdown was requested meanwhile.
    async fn run_start(
        &mut self,
        context: String,
        language: Language,
        commands: &mut mpsc::UnboundedReceiver<ControlCommand>,
    ) -> bool {
        let stop = self.stop_handle();
        let mut shutdown = false;

        let start = self.start(context, language);
        tokio::pin!(start);

        let outcome = loop {
            tokio::select! {
                biased;
                outcome = &mut start => break outcome,
                command = commands.recv(), if !shutdown => match command {
                    Some(ControlCommand::Stop) => stop.request_stop(),
                    Some(ControlCommand::Start { .. }) => {
                        warn!("Session already starting, ignoring start");
                    }
                    Some(ControlCommand::Shutdown) | None => {
                        shutdown = true;
                        stop.request_stop();
                    }
                },
            }
        };

        match outcome {
            Ok(outcome) => debug!(?outcome, "Start finished"),
            // Already published by `start`.
            Err(e) => debug!("Start failed: {}", e),
        }
        shutdown
    }

    /// Publish state and speaking edges since the last call.
    fn publish(&mut self) {
        let current = (self.state(), self.is_speaking());
        if current.0 != self.published.0 {
            let _ = self.notify.send(Notification::StateChanged(current.0));
        }
        if current.1 != self.published.1 {
            let _ = self.notify.send(Notification::SpeakingChanged(current.1));
        }
        self.published = current;
    }
}

impl<I, O, T> Drop for VoiceController<I, O, T>
where
    I: AudioInput,
    O: AudioOutput,
    T: TutorTransport,
{
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use tokio::sync::oneshot;

    use crate::audio::pcm::EncodedChunk;
    use crate::audio::{CaptureSession, ChunkId};

    // ── Fakes ───────────────────────────────────────────────────────

    #[derive(Default)]
    struct Rig {
        // microphone
        acquire_error: Option<VoiceError>,
        acquired: usize,
        released: usize,
        frame_sink: Option<EventSink>,
        // speaker
        now: f64,
        contexts_opened: usize,
        contexts_closed: usize,
        scheduled: Vec<(ChunkId, f64)>,
        stop_alls: usize,
        // tutor
        open_gate: Option<oneshot::Receiver<()>>,
        open_hangs: bool,
        open_error: Option<VoiceError>,
        open_attempts: usize,
        sessions_opened: usize,
        sessions_closed: usize,
        last_setup: Option<SessionSetup>,
        remote_sink: Option<EventSink>,
        sent: Vec<EncodedChunk>,
    }

    type Shared = Arc<Mutex<Rig>>;

    struct FakeInput(Shared);
    struct FakeCapture {
        rig: Shared,
        released: bool,
    }

    impl AudioInput for FakeInput {
        type Session = FakeCapture;

        async fn acquire(&self) -> Result<FakeCapture, VoiceError> {
            let mut rig = self.0.lock().unwrap();
            if let Some(e) = rig.acquire_error.take() {
                return Err(e);
            }
            rig.acquired += 1;
            Ok(FakeCapture {
                rig: Arc::clone(&self.0),
                released: false,
            })
        }
    }

    impl CaptureSession for FakeCapture {
        async fn resume(&mut self) -> Result<(), VoiceError> {
            Ok(())
        }

        fn on_frame(&mut self, sink: EventSink) {
            self.rig.lock().unwrap().frame_sink = Some(sink);
        }

        fn detach(&mut self) {
            self.rig.lock().unwrap().frame_sink = None;
        }

        fn release(&mut self) {
            if !std::mem::replace(&mut self.released, true) {
                self.rig.lock().unwrap().released += 1;
            }
        }
    }

    struct FakeOutput(Shared);
    struct FakeContext {
        rig: Shared,
        closed: bool,
    }

    impl AudioOutput for FakeOutput {
        type Context = FakeContext;

        async fn open(&self, _events: EventSink) -> Result<FakeContext, VoiceError> {
            self.0.lock().unwrap().contexts_opened += 1;
            Ok(FakeContext {
                rig: Arc::clone(&self.0),
                closed: false,
            })
        }
    }

    impl PlaybackContext for FakeContext {
        fn current_time(&self) -> f64 {
            self.rig.lock().unwrap().now
        }

        fn schedule(
            &mut self,
            chunk: ChunkId,
            _samples: Arc<[f32]>,
            start_at: f64,
        ) -> Result<(), VoiceError> {
            self.rig.lock().unwrap().scheduled.push((chunk, start_at));
            Ok(())
        }

        fn stop_all(&mut self) {
            self.rig.lock().unwrap().stop_alls += 1;
        }

        fn close(&mut self) {
            if !std::mem::replace(&mut self.closed, true) {
                self.rig.lock().unwrap().contexts_closed += 1;
            }
        }
    }

    struct FakeTransport(Shared);
    struct FakeHandle {
        rig: Shared,
        closed: bool,
    }

    impl TutorTransport for FakeTransport {
        type Handle = FakeHandle;

        async fn open(&self, setup: &SessionSetup, events: EventSink) -> Result<FakeHandle, VoiceError> {
            let (gate, hangs) = {
                let mut rig = self.0.lock().unwrap();
                rig.open_attempts += 1;
                rig.last_setup = Some(setup.clone());
                (rig.open_gate.take(), rig.open_hangs)
            };
            if let Some(gate) = gate {
                let _ = gate.await;
            }
            if hangs {
                std::future::pending::<()>().await;
            }

            let mut rig = self.0.lock().unwrap();
            if let Some(e) = rig.open_error.take() {
                return Err(e);
            }
            rig.sessions_opened += 1;
            rig.remote_sink = Some(events);
            Ok(FakeHandle {
                rig: Arc::clone(&self.0),
                closed: false,
            })
        }
    }

    impl SessionHandle for FakeHandle {
        fn send(&self, chunk: &EncodedChunk) {
            self.rig.lock().unwrap().sent.push(chunk.clone());
        }

        fn close(&mut self) {
            if !std::mem::replace(&mut self.closed, true) {
                self.rig.lock().unwrap().sessions_closed += 1;
            }
        }
    }

    type TestController = VoiceController<FakeInput, FakeOutput, FakeTransport>;

    fn controller_with(
        options: ControllerOptions,
    ) -> (TestController, mpsc::UnboundedReceiver<Notification>, Shared) {
        let rig: Shared = Arc::new(Mutex::new(Rig::default()));
        let (controller, notifications) = VoiceController::new(
            FakeInput(Arc::clone(&rig)),
            FakeOutput(Arc::clone(&rig)),
            FakeTransport(Arc::clone(&rig)),
            options,
        );
        (controller, notifications, rig)
    }

    fn controller() -> (TestController, mpsc::UnboundedReceiver<Notification>, Shared) {
        controller_with(ControllerOptions::default())
    }

    fn notifications(rx: &mut mpsc::UnboundedReceiver<Notification>) -> Vec<Notification> {
        let mut out = Vec::new();
        while let Ok(n) = rx.try_recv() {
            out.push(n);
        }
        out
    }

    fn remote(rig: &Shared) -> EventSink {
        rig.lock().unwrap().remote_sink.clone().expect("session opened")
    }

    /// Base64 PCM16 payload of `secs` seconds at 24 kHz.
    fn audio(secs: f64) -> RemoteEvent {
        let samples = vec![0.25f32; (secs * PLAYBACK_SAMPLE_RATE as f64) as usize];
        RemoteEvent::AudioDelta(encode_frame(&samples).data)
    }

    fn set_now(rig: &Shared, now: f64) {
        rig.lock().unwrap().now = now;
    }

    fn start_times(rig: &Shared) -> Vec<f64> {
        rig.lock().unwrap().scheduled.iter().map(|(_, at)| *at).collect()
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    #[tokio::test]
    async fn test_start_reaches_active_listening() {
        let (mut c, mut rx, rig) = controller();

        let outcome = c.start("Cell biology notes", Language::Ar).await.unwrap();

        assert_eq!(outcome, StartOutcome::Active);
        assert_eq!(c.state(), VoiceSessionState::ActiveListening);
        assert_eq!(c.phase(), SessionPhase::Active);
        assert!(!c.is_speaking());
        assert_eq!(
            notifications(&mut rx),
            vec![
                Notification::StateChanged(VoiceSessionState::Connecting),
                Notification::StateChanged(VoiceSessionState::ActiveListening),
            ]
        );

        let p = rig.lock().unwrap();
        assert_eq!(p.acquired, 1);
        assert_eq!(p.contexts_opened, 1);
        assert_eq!(p.sessions_opened, 1);
        assert!(p.frame_sink.is_some());
        assert_eq!(
            p.last_setup,
            Some(SessionSetup::new("Cell biology notes", Language::Ar))
        );
    }

    #[tokio::test]
    async fn test_second_start_is_rejected() {
        let (mut c, _rx, rig) = controller();
        c.start("notes", Language::En).await.unwrap();

        let again = c.start("other notes", Language::En).await.unwrap();

        assert_eq!(again, StartOutcome::AlreadyRunning);
        assert_eq!(c.state(), VoiceSessionState::ActiveListening);
        let p = rig.lock().unwrap();
        assert_eq!(p.acquired, 1);
        assert_eq!(p.open_attempts, 1);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let (mut c, mut rx, rig) = controller();
        c.stop();
        assert_eq!(c.state(), VoiceSessionState::Idle);

        c.start("notes", Language::En).await.unwrap();
        notifications(&mut rx);
        c.stop();
        c.stop();

        assert_eq!(c.state(), VoiceSessionState::Idle);
        assert_eq!(
            notifications(&mut rx),
            vec![Notification::StateChanged(VoiceSessionState::Idle)]
        );
        let p = rig.lock().unwrap();
        assert_eq!(p.released, 1);
        assert_eq!(p.contexts_closed, 1);
        assert_eq!(p.sessions_closed, 1);
        assert!(p.frame_sink.is_none());
    }

    #[tokio::test]
    async fn test_permission_denied_returns_to_idle_with_error() {
        let (mut c, mut rx, rig) = controller();
        rig.lock().unwrap().acquire_error = Some(VoiceError::PermissionDenied);

        let err = c.start("notes", Language::En).await.unwrap_err();

        assert_eq!(err, VoiceError::PermissionDenied);
        assert_eq!(c.phase(), SessionPhase::Idle);
        assert_eq!(c.state(), VoiceSessionState::Error);
        assert_eq!(c.last_error(), Some(&VoiceError::PermissionDenied));
        assert_eq!(
            notifications(&mut rx),
            vec![
                Notification::StateChanged(VoiceSessionState::Connecting),
                Notification::Error(VoiceError::PermissionDenied),
                Notification::StateChanged(VoiceSessionState::Error),
            ]
        );
        let p = rig.lock().unwrap();
        assert_eq!(p.contexts_opened, 0);
        assert_eq!(p.open_attempts, 0);
    }

    #[tokio::test]
    async fn test_open_failure_releases_capture_before_reporting() {
        let (mut c, _rx, rig) = controller();
        rig.lock().unwrap().open_error = Some(VoiceError::ConnectionFailed("refused".into()));

        let err = c.start("notes", Language::En).await.unwrap_err();

        assert_eq!(err, VoiceError::ConnectionFailed("refused".into()));
        assert_eq!(c.phase(), SessionPhase::Idle);
        {
            let p = rig.lock().unwrap();
            assert_eq!(p.acquired, 1);
            assert_eq!(p.released, 1);
            assert_eq!(p.contexts_closed, 1);
            assert_eq!(p.sessions_opened, 0);
        }

        // A fresh start succeeds and clears the error.
        let outcome = c.start("notes", Language::En).await.unwrap();
        assert_eq!(outcome, StartOutcome::Active);
        assert_eq!(c.state(), VoiceSessionState::ActiveListening);
        assert!(c.last_error().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout_fails_start() {
        let (mut c, _rx, rig) = controller_with(ControllerOptions {
            connect_timeout: Some(Duration::from_secs(15)),
        });
        rig.lock().unwrap().open_hangs = true;

        let err = c.start("notes", Language::En).await.unwrap_err();

        assert!(matches!(err, VoiceError::ConnectionFailed(_)));
        assert_eq!(c.state(), VoiceSessionState::Error);
        let p = rig.lock().unwrap();
        assert_eq!(p.released, 1);
        assert_eq!(p.contexts_closed, 1);
    }

    #[tokio::test]
    async fn test_stop_during_connect_tears_down_once_open_settles() {
        let (mut c, _rx, rig) = controller();
        let (gate_tx, gate_rx) = oneshot::channel();
        rig.lock().unwrap().open_gate = Some(gate_rx);
        let stop = c.stop_handle();

        let (outcome, ()) = tokio::join!(c.start("notes", Language::En), async {
            assert_eq!(rig.lock().unwrap().open_attempts, 1);
            stop.request_stop();
            let _ = gate_tx.send(());
        });

        assert_eq!(outcome.unwrap(), StartOutcome::Cancelled);
        assert_eq!(c.state(), VoiceSessionState::Idle);
        assert!(c.last_error().is_none());
        let p = rig.lock().unwrap();
        assert_eq!(p.sessions_opened, 1);
        assert_eq!(p.sessions_closed, 1);
        assert_eq!(p.released, 1);
        assert_eq!(p.contexts_closed, 1);
    }

    #[tokio::test]
    async fn test_stop_during_connect_with_failed_open_is_not_an_error() {
        let (mut c, _rx, rig) = controller();
        let (gate_tx, gate_rx) = oneshot::channel();
        {
            let mut p = rig.lock().unwrap();
            p.open_gate = Some(gate_rx);
            p.open_error = Some(VoiceError::ConnectionFailed("refused".into()));
        }
        let stop = c.stop_handle();

        let (outcome, ()) = tokio::join!(c.start("notes", Language::En), async {
            stop.request_stop();
            let _ = gate_tx.send(());
        });

        assert_eq!(outcome.unwrap(), StartOutcome::Cancelled);
        assert_eq!(c.state(), VoiceSessionState::Idle);
        assert_eq!(rig.lock().unwrap().released, 1);
    }

    // ── Playback ────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_audio_deltas_play_back_to_back() {
        let (mut c, _rx, rig) = controller();
        set_now(&rig, 2.0);
        c.start("notes", Language::En).await.unwrap();
        let tutor = remote(&rig);

        // Arrivals 20-30 ms apart, far faster than playback.
        tutor.remote(audio(0.5));
        assert_eq!(c.drain_events(), 1);
        set_now(&rig, 2.02);
        tutor.remote(audio(0.5));
        c.drain_events();
        set_now(&rig, 2.05);
        tutor.remote(audio(0.5));
        c.drain_events();

        assert_eq!(start_times(&rig), vec![2.0, 2.5, 3.0]);
        assert_eq!(c.state(), VoiceSessionState::ActiveSpeaking);
    }

    #[tokio::test]
    async fn test_interrupt_flushes_and_resets_cursor() {
        let (mut c, mut rx, rig) = controller();
        c.start("notes", Language::En).await.unwrap();
        let tutor = remote(&rig);

        tutor.remote(audio(2.0));
        tutor.remote(audio(2.0));
        c.drain_events();
        assert!(c.is_speaking());
        notifications(&mut rx);

        set_now(&rig, 0.3);
        tutor.remote(RemoteEvent::Interrupted);
        c.drain_events();

        assert!(!c.is_speaking());
        assert_eq!(c.state(), VoiceSessionState::ActiveListening);
        assert_eq!(rig.lock().unwrap().stop_alls, 1);
        assert_eq!(
            notifications(&mut rx),
            vec![
                Notification::StateChanged(VoiceSessionState::ActiveListening),
                Notification::SpeakingChanged(false),
            ]
        );

        tutor.remote(audio(1.0));
        c.drain_events();
        assert_eq!(start_times(&rig).last(), Some(&0.3));
    }

    #[tokio::test]
    async fn test_interrupt_wins_over_following_audio_in_queue() {
        let (mut c, _rx, rig) = controller();
        c.start("notes", Language::En).await.unwrap();
        let tutor = remote(&rig);

        tutor.remote(audio(1.0));
        tutor.remote(RemoteEvent::Interrupted);
        tutor.remote(audio(1.0));
        c.drain_events();

        assert_eq!(rig.lock().unwrap().stop_alls, 1);
        assert_eq!(start_times(&rig), vec![0.0, 0.0]);
        assert!(c.is_speaking());
    }

    #[tokio::test]
    async fn test_speaking_ends_with_last_chunk() {
        let (mut c, mut rx, rig) = controller();
        c.start("notes", Language::En).await.unwrap();
        let tutor = remote(&rig);

        tutor.remote(audio(0.5));
        tutor.remote(audio(0.5));
        c.drain_events();
        assert!(c.is_speaking());

        tutor.playback_ended(0);
        c.drain_events();
        assert!(c.is_speaking(), "first completion keeps speaking");
        assert_eq!(rig.lock().unwrap().stop_alls, 0, "queued audio keeps playing");

        tutor.playback_ended(1);
        c.drain_events();
        assert!(!c.is_speaking());

        let speaking: Vec<_> = notifications(&mut rx)
            .into_iter()
            .filter(|n| matches!(n, Notification::SpeakingChanged(_)))
            .collect();
        assert_eq!(
            speaking,
            vec![
                Notification::SpeakingChanged(true),
                Notification::SpeakingChanged(false)
            ]
        );
    }

    #[tokio::test]
    async fn test_bad_audio_payload_is_dropped() {
        let (mut c, mut rx, rig) = controller();
        c.start("notes", Language::En).await.unwrap();
        notifications(&mut rx);

        let tutor = remote(&rig);
        tutor.remote(RemoteEvent::AudioDelta("not base64!".into()));
        tutor.remote(RemoteEvent::AudioDelta("AQID".into()));
        c.drain_events();

        assert_eq!(c.state(), VoiceSessionState::ActiveListening);
        assert!(c.last_error().is_none());
        assert!(rig.lock().unwrap().scheduled.is_empty());
        assert!(notifications(&mut rx).is_empty());
    }

    // ── Capture ─────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_capture_frames_are_sent_encoded() {
        let (mut c, _rx, rig) = controller();
        c.start("notes", Language::En).await.unwrap();
        let mic = rig.lock().unwrap().frame_sink.clone().unwrap();

        let frame = vec![0.5f32; crate::audio::FRAME_SAMPLES];
        mic.capture_frame(frame.clone());
        mic.capture_frame(vec![-0.5; crate::audio::FRAME_SAMPLES]);
        c.drain_events();

        let p = rig.lock().unwrap();
        assert_eq!(p.sent.len(), 2);
        assert_eq!(p.sent[0], encode_frame(&frame));
        assert_eq!(p.sent[0].mime_type, "audio/pcm;rate=16000");
    }

    // ── Remote close and stale events ───────────────────────────────

    #[tokio::test]
    async fn test_remote_close_reports_connection_lost() {
        let (mut c, mut rx, rig) = controller();
        c.start("notes", Language::En).await.unwrap();
        notifications(&mut rx);

        remote(&rig).remote_closed(Some("server restart".into()));
        c.drain_events();

        assert_eq!(c.state(), VoiceSessionState::Error);
        assert_eq!(c.last_error(), Some(&VoiceError::ConnectionLost));
        assert_eq!(
            notifications(&mut rx),
            vec![
                Notification::Error(VoiceError::ConnectionLost),
                Notification::StateChanged(VoiceSessionState::Error),
            ]
        );
        let p = rig.lock().unwrap();
        assert_eq!(p.released, 1);
        assert_eq!(p.contexts_closed, 1);
        assert_eq!(p.sessions_closed, 1);
    }

    #[tokio::test]
    async fn test_close_after_local_stop_is_ignored() {
        let (mut c, _rx, rig) = controller();
        c.start("notes", Language::En).await.unwrap();
        let tutor = remote(&rig);

        c.stop();
        tutor.remote_closed(None);
        c.drain_events();

        assert_eq!(c.state(), VoiceSessionState::Idle);
        assert!(c.last_error().is_none());
    }

    #[tokio::test]
    async fn test_events_from_previous_session_are_ignored() {
        let (mut c, _rx, rig) = controller();
        c.start("notes", Language::En).await.unwrap();
        let old = remote(&rig);
        c.stop();

        c.start("notes", Language::En).await.unwrap();
        old.remote(audio(1.0));
        old.remote_closed(None);
        c.drain_events();

        assert_eq!(c.state(), VoiceSessionState::ActiveListening);
        assert!(rig.lock().unwrap().scheduled.is_empty());
    }

    // ── Control loop ────────────────────────────────────────────────

    #[tokio::test]
    async fn test_run_honours_stop_while_connecting() {
        let (mut c, mut rx, rig) = controller();
        let (gate_tx, gate_rx) = oneshot::channel();
        rig.lock().unwrap().open_gate = Some(gate_rx);
        let (commands, command_rx) = mpsc::unbounded_channel();

        let driver = async {
            commands
                .send(ControlCommand::Start {
                    context: "notes".into(),
                    language: Language::En,
                })
                .unwrap();
            while rig.lock().unwrap().open_attempts == 0 {
                tokio::task::yield_now().await;
            }
            commands
                .send(ControlCommand::Start {
                    context: "again".into(),
                    language: Language::En,
                })
                .unwrap();
            commands.send(ControlCommand::Stop).unwrap();
            for _ in 0..4 {
                tokio::task::yield_now().await;
            }
            let _ = gate_tx.send(());
            for _ in 0..4 {
                tokio::task::yield_now().await;
            }
            commands.send(ControlCommand::Shutdown).unwrap();
        };
        tokio::join!(c.run(command_rx), driver);

        assert_eq!(c.state(), VoiceSessionState::Idle);
        {
            let p = rig.lock().unwrap();
            assert_eq!(p.acquired, 1);
            assert_eq!(p.released, 1);
            assert_eq!(p.sessions_opened, 1);
            assert_eq!(p.sessions_closed, 1);
        }
        assert!(!notifications(&mut rx)
            .contains(&Notification::StateChanged(VoiceSessionState::ActiveListening)));
    }

    #[tokio::test]
    async fn test_run_routes_events_and_stops_on_shutdown() {
        let (mut c, _rx, rig) = controller();
        let (commands, command_rx) = mpsc::unbounded_channel();

        let driver = async {
            commands
                .send(ControlCommand::Start {
                    context: "notes".into(),
                    language: Language::En,
                })
                .unwrap();
            while rig.lock().unwrap().remote_sink.is_none() {
                tokio::task::yield_now().await;
            }
            remote(&rig).remote(audio(0.5));
            while rig.lock().unwrap().scheduled.is_empty() {
                tokio::task::yield_now().await;
            }
            commands.send(ControlCommand::Shutdown).unwrap();
        };
        tokio::join!(c.run(command_rx), driver);

        assert_eq!(c.state(), VoiceSessionState::Idle);
        let p = rig.lock().unwrap();
        assert_eq!(p.scheduled.len(), 1);
        assert_eq!(p.released, 1);
        assert_eq!(p.sessions_closed, 1);
    }
}

//! Microphone capture via cpal.
//!
//! Opens the default (or named) input device at its native format, down-mixes
//! to mono, resamples to 16 kHz and cuts the signal into `FRAME_SAMPLES`
//! frames. The cpal `Stream` is `!Send` on some platforms, so it lives on a
//! dedicated thread for the whole session and is controlled over a channel.

use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, Stream, StreamConfig};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use super::{join_device_thread, AudioInput, CaptureSession, CAPTURE_SAMPLE_RATE, FRAME_SAMPLES};
use crate::controller::events::EventSink;
use crate::error::VoiceError;

type SharedSink = Arc<Mutex<Option<EventSink>>>;

enum StreamControl {
    Play(oneshot::Sender<Result<(), VoiceError>>),
    Release,
}

/// Microphone source backed by the default cpal host.
#[derive(Debug, Clone, Default)]
pub struct CpalInput {
    device_name: Option<String>,
}

impl CpalInput {
    /// `device_name` of `None` uses the system default input.
    pub fn new(device_name: Option<String>) -> Self {
        Self { device_name }
    }
}

impl AudioInput for CpalInput {
    type Session = CpalCapture;

    async fn acquire(&self) -> Result<CpalCapture, VoiceError> {
        let sink: SharedSink = Arc::new(Mutex::new(None));
        let (ready_tx, ready_rx) = oneshot::channel();
        let (control_tx, control_rx) = std_mpsc::channel();

        let device_name = self.device_name.clone();
        let thread_sink = Arc::clone(&sink);
        let thread = std::thread::Builder::new()
            .name("tutor-capture".into())
            .spawn(move || run_capture_thread(device_name, thread_sink, ready_tx, control_rx))
            .map_err(|e| VoiceError::DeviceError(format!("Failed to spawn capture thread: {e}")))?;

        match ready_rx.await {
            Ok(Ok(())) => Ok(CpalCapture {
                sink,
                control: Some(control_tx),
                thread: Some(thread),
            }),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(VoiceError::DeviceError(
                "Capture thread exited during setup".into(),
            )),
        }
    }
}

/// A running microphone session.
pub struct CpalCapture {
    sink: SharedSink,
    control: Option<std_mpsc::Sender<StreamControl>>,
    thread: Option<JoinHandle<()>>,
}

impl CaptureSession for CpalCapture {
    async fn resume(&mut self) -> Result<(), VoiceError> {
        let Some(control) = self.control.as_ref() else {
            return Err(VoiceError::DeviceError("Capture already released".into()));
        };
        let (reply_tx, reply_rx) = oneshot::channel();
        control
            .send(StreamControl::Play(reply_tx))
            .map_err(|_| VoiceError::DeviceError("Capture thread is gone".into()))?;
        reply_rx
            .await
            .map_err(|_| VoiceError::DeviceError("Capture thread is gone".into()))?
    }

    fn on_frame(&mut self, sink: EventSink) {
        if let Ok(mut guard) = self.sink.lock() {
            *guard = Some(sink);
        }
    }

    fn detach(&mut self) {
        if let Ok(mut guard) = self.sink.lock() {
            guard.take();
        }
    }

    fn release(&mut self) {
        self.detach();
        if let Some(control) = self.control.take() {
            let _ = control.send(StreamControl::Release);
        }
        if let Some(thread) = self.thread.take() {
            join_device_thread(thread, "tutor-capture");
        }
    }
}

impl Drop for CpalCapture {
    fn drop(&mut self) {
        self.release();
    }
}

/// Owns the cpal stream for the lifetime of one capture session.
fn run_capture_thread(
    device_name: Option<String>,
    sink: SharedSink,
    ready: oneshot::Sender<Result<(), VoiceError>>,
    control: std_mpsc::Receiver<StreamControl>,
) {
    let stream = match build_stream(device_name.as_deref(), sink) {
        Ok(stream) => {
            let _ = ready.send(Ok(()));
            stream
        }
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };

    // A dropped sender ends the session just like an explicit release.
    while let Ok(cmd) = control.recv() {
        match cmd {
            StreamControl::Play(reply) => {
                let result = stream
                    .play()
                    .map_err(|e| classify_play_error(&e));
                if result.is_ok() {
                    info!("Audio capture started");
                }
                let _ = reply.send(result);
            }
            StreamControl::Release => break,
        }
    }

    drop(stream);
    info!("Audio capture released");
}

fn resolve_device(host: &cpal::Host, device_name: Option<&str>) -> Result<cpal::Device, VoiceError> {
    if let Some(name) = device_name {
        let found = host
            .input_devices()
            .map_err(|e| classify_backend(&e.to_string()))?
            .find(|d| d.name().map(|n| n == name).unwrap_or(false));
        match found {
            Some(device) => return Ok(device),
            None => warn!(device = %name, "Configured input device not found, falling back to default"),
        }
    }
    host.default_input_device()
        .ok_or(VoiceError::DeviceUnavailable)
}

fn build_stream(device_name: Option<&str>, sink: SharedSink) -> Result<Stream, VoiceError> {
    let host = cpal::default_host();
    let device = resolve_device(&host, device_name)?;

    let dev_name = device.name().unwrap_or_else(|_| "unknown".into());
    info!(device = %dev_name, "Selected input device");

    let supported = device
        .default_input_config()
        .map_err(|e| classify_default_config_error(&e))?;
    let native_rate = supported.sample_rate().0;
    let channels = supported.channels();
    let sample_format = supported.sample_format();

    let stream_config = StreamConfig {
        channels,
        sample_rate: cpal::SampleRate(native_rate),
        buffer_size: cpal::BufferSize::Default,
    };

    info!(
        native_rate,
        channels,
        ?sample_format,
        "Input device config (will resample to {}Hz mono if needed)",
        CAPTURE_SAMPLE_RATE,
    );

    let mut assembler = FrameAssembler::new(channels, native_rate);
    let err_fn = |err: cpal::StreamError| error!("Audio input stream error: {}", err);

    let stream = match sample_format {
        SampleFormat::I16 => device.build_input_stream(
            &stream_config,
            move |data: &[i16], _info: &cpal::InputCallbackInfo| {
                let floats: Vec<f32> = data.iter().map(|&s| s as f32 / 32768.0).collect();
                deliver(&mut assembler, &floats, &sink);
            },
            err_fn,
            None,
        ),
        _ => device.build_input_stream(
            &stream_config,
            move |data: &[f32], _info: &cpal::InputCallbackInfo| {
                deliver(&mut assembler, data, &sink);
            },
            err_fn,
            None,
        ),
    }
    .map_err(|e| classify_build_error(&e))?;

    Ok(stream)
}

fn deliver(assembler: &mut FrameAssembler, data: &[f32], sink: &Mutex<Option<EventSink>>) {
    for frame in assembler.push(data) {
        let Ok(guard) = sink.lock() else {
            return;
        };
        // Frames captured before wiring or after detach are dropped.
        if let Some(sink) = guard.as_ref() {
            sink.capture_frame(frame);
        }
    }
}

/// Turns native-format callback buffers into fixed 16 kHz mono frames.
pub(crate) struct FrameAssembler {
    channels: u16,
    resampler: LinearResampler,
    pending: Vec<f32>,
}

impl FrameAssembler {
    pub(crate) fn new(channels: u16, native_rate: u32) -> Self {
        Self {
            channels,
            resampler: LinearResampler::new(native_rate, CAPTURE_SAMPLE_RATE),
            pending: Vec::with_capacity(FRAME_SAMPLES * 2),
        }
    }

    /// Feed one interleaved callback buffer; returns every completed frame.
    pub(crate) fn push(&mut self, data: &[f32]) -> Vec<Vec<f32>> {
        let mono = to_mono(data, self.channels);
        self.resampler.process(&mono, &mut self.pending);

        let mut frames = Vec::new();
        while self.pending.len() >= FRAME_SAMPLES {
            frames.push(self.pending.drain(..FRAME_SAMPLES).collect());
        }
        if !frames.is_empty() {
            debug!(frames = frames.len(), "Captured frames ready");
        }
        frames
    }
}

/// Streaming linear resampler for mono f32 samples.
///
/// Callback buffers rarely hold a whole number of output periods, so the
/// source position and the last input sample carry over between calls. The
/// position is kept in units of `1 / to_rate` input samples, which keeps the
/// phase exact however the input is split.
struct LinearResampler {
    from_rate: u64,
    to_rate: u64,
    /// Position of the next output sample, relative to `last` when present.
    pos: u64,
    last: Option<f32>,
}

impl LinearResampler {
    fn new(from_rate: u32, to_rate: u32) -> Self {
        Self {
            from_rate: from_rate as u64,
            to_rate: to_rate as u64,
            pos: 0,
            last: None,
        }
    }

    /// Resample `input` and append the result to `output`.
    fn process(&mut self, input: &[f32], output: &mut Vec<f32>) {
        if self.from_rate == self.to_rate {
            output.extend_from_slice(input);
            return;
        }

        let mut window = Vec::with_capacity(input.len() + 1);
        window.extend(self.last);
        window.extend_from_slice(input);
        let Some(&tail) = window.last() else {
            return;
        };

        // An output sample needs both of its neighbours.
        loop {
            let idx0 = (self.pos / self.to_rate) as usize;
            if idx0 + 1 >= window.len() {
                break;
            }
            let frac = (self.pos % self.to_rate) as f32 / self.to_rate as f32;
            let (s0, s1) = (window[idx0], window[idx0 + 1]);
            output.push(s0 + frac * (s1 - s0));
            self.pos += self.from_rate;
        }

        // Rebase on the final sample, which opens the next window.
        self.pos -= (window.len() as u64 - 1) * self.to_rate;
        self.last = Some(tail);
    }
}

/// Down-mix interleaved audio to mono by averaging channels.
fn to_mono(samples: &[f32], channels: u16) -> Vec<f32> {
    if channels <= 1 {
        return samples.to_vec();
    }
    let ch = channels as usize;
    samples
        .chunks_exact(ch)
        .map(|frame| frame.iter().sum::<f32>() / ch as f32)
        .collect()
}

// ── Error classification ───────────────────────────────────────────

/// cpal reports OS permission refusals as backend-specific text.
fn classify_backend(description: &str) -> VoiceError {
    let lower = description.to_lowercase();
    let refused = ["permission", "denied", "not authorized", "unauthorized"]
        .iter()
        .any(|needle| lower.contains(needle));
    if refused {
        VoiceError::PermissionDenied
    } else {
        VoiceError::DeviceError(description.to_string())
    }
}

fn classify_build_error(err: &cpal::BuildStreamError) -> VoiceError {
    match err {
        cpal::BuildStreamError::DeviceNotAvailable => VoiceError::DeviceUnavailable,
        cpal::BuildStreamError::BackendSpecific { err } => classify_backend(&err.description),
        other => VoiceError::DeviceError(format!("Failed to build input stream: {other}")),
    }
}

fn classify_default_config_error(err: &cpal::DefaultStreamConfigError) -> VoiceError {
    match err {
        cpal::DefaultStreamConfigError::DeviceNotAvailable => VoiceError::DeviceUnavailable,
        cpal::DefaultStreamConfigError::BackendSpecific { err } => {
            classify_backend(&err.description)
        }
        other => VoiceError::DeviceError(format!("Failed to get default input config: {other}")),
    }
}

fn classify_play_error(err: &cpal::PlayStreamError) -> VoiceError {
    match err {
        cpal::PlayStreamError::DeviceNotAvailable => VoiceError::DeviceUnavailable,
        cpal::PlayStreamError::BackendSpecific { err } => classify_backend(&err.description),
    }
}

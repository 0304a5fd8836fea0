//! Audio capture, playback scheduling, and the device seams between them.
//!
//! The controller only talks to the traits in this module. `capture` and
//! `playback` provide the cpal / rodio implementations; tests substitute
//! fakes with a hand-driven clock.

pub mod capture;
pub mod devices;
pub mod pcm;
pub mod playback;
pub mod scheduler;

use std::sync::Arc;
use std::thread::JoinHandle;

use tokio::runtime::{Handle, RuntimeFlavor};
use tracing::error;

use crate::controller::events::EventSink;
use crate::error::VoiceError;

pub use capture::CpalInput;
pub use playback::RodioOutput;
pub use scheduler::{ChunkId, PendingAudioChunk, PlaybackScheduler};

/// Capture rate expected by the tutor endpoint.
pub const CAPTURE_SAMPLE_RATE: u32 = 16_000;

/// Rate of the audio the tutor endpoint streams back.
pub const PLAYBACK_SAMPLE_RATE: u32 = 24_000;

/// Samples per outbound frame (256 ms at 16 kHz).
pub const FRAME_SAMPLES: usize = 4096;

/// Source of exclusive microphone sessions.
#[allow(async_fn_in_trait)]
pub trait AudioInput {
    type Session: CaptureSession;

    /// Acquire the input device and return a running 16 kHz mono session.
    async fn acquire(&self) -> Result<Self::Session, VoiceError>;
}

/// One acquired microphone.
///
/// Frames are delivered through the sink registered with `on_frame`, one
/// `FRAME_SAMPLES` buffer at a time, in capture order.
#[allow(async_fn_in_trait)]
pub trait CaptureSession {
    /// Start the device if the platform created it suspended.
    async fn resume(&mut self) -> Result<(), VoiceError>;

    /// Route captured frames to `sink`. Replaces any earlier registration.
    fn on_frame(&mut self, sink: EventSink);

    /// Stop routing frames. The device keeps running until `release`.
    fn detach(&mut self);

    /// Stop the device and free it. Idempotent.
    fn release(&mut self);
}

/// Source of playback contexts.
#[allow(async_fn_in_trait)]
pub trait AudioOutput {
    type Context: PlaybackContext;

    /// Open the output device. Natural chunk completions are reported on
    /// `events` as `PlaybackEnded`.
    async fn open(&self, events: EventSink) -> Result<Self::Context, VoiceError>;
}

/// An open output device with a running clock.
#[allow(async_fn_in_trait)]
pub trait PlaybackContext {
    /// Seconds on the device clock. Monotonic.
    fn current_time(&self) -> f64;

    /// Start the device if the platform created it suspended.
    async fn resume(&mut self) -> Result<(), VoiceError> {
        Ok(())
    }

    /// Play `samples` (24 kHz mono) starting at `start_at` on the device clock.
    fn schedule(
        &mut self,
        chunk: ChunkId,
        samples: Arc<[f32]>,
        start_at: f64,
    ) -> Result<(), VoiceError>;

    /// Silence every scheduled chunk immediately and drop its resources.
    /// Chunks that already finished are unaffected.
    fn stop_all(&mut self);

    /// Stop everything and release the device. Idempotent.
    fn close(&mut self);
}

/// Wait for a device thread to finish releasing its stream.
///
/// Teardown runs on the control loop, so on a multi-threaded runtime the wait
/// is moved off the worker with `block_in_place`. A current-thread runtime
/// cannot hand its worker over and joins in place.
pub(crate) fn join_device_thread(thread: JoinHandle<()>, name: &str) {
    let join = move || thread.join().is_ok();
    let joined = match Handle::try_current().map(|h| h.runtime_flavor()) {
        Ok(RuntimeFlavor::MultiThread) => tokio::task::block_in_place(join),
        _ => join(),
    };
    if !joined {
        error!(thread = name, "Audio device thread panicked");
    }
}

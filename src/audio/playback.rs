//! Tutor audio output via rodio.
//!
//! Chunks of one tutor turn are appended to a single `Sink`, whose queue
//! plays them back to back with no gap between sources. Only the first chunk
//! of a run is delayed to its requested device-clock time. Each chunk is
//! followed by a callback source that reports its natural end to the
//! controller. The rodio `OutputStream` is `!Send`, so a dedicated thread
//! keeps it alive until the context is closed.

use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use cpal::traits::{DeviceTrait, HostTrait};
use rodio::buffer::SamplesBuffer;
use rodio::source::EmptyCallback;
use rodio::{OutputStream, OutputStreamHandle, Sink, Source};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use super::{join_device_thread, AudioOutput, ChunkId, PlaybackContext, PLAYBACK_SAMPLE_RATE};
use crate::controller::events::EventSink;
use crate::error::VoiceError;

/// Output device backed by rodio.
#[derive(Debug, Clone)]
pub struct RodioOutput {
    device_name: Option<String>,
    volume: f32,
}

impl RodioOutput {
    /// `device_name` of `None` uses the system default output.
    pub fn new(device_name: Option<String>) -> Self {
        Self {
            device_name,
            volume: 1.0,
        }
    }

    /// Playback volume (1.0 = normal, clamped to 0.0..=2.0).
    pub fn with_volume(mut self, volume: f32) -> Self {
        self.volume = volume.clamp(0.0, 2.0);
        self
    }
}

impl AudioOutput for RodioOutput {
    type Context = RodioContext;

    async fn open(&self, events: EventSink) -> Result<RodioContext, VoiceError> {
        let (ready_tx, ready_rx) = oneshot::channel();
        let (close_tx, close_rx) = std_mpsc::channel::<()>();
        let device_name = self.device_name.clone();

        let thread = std::thread::Builder::new()
            .name("tutor-playback".into())
            .spawn(move || match open_output_stream(device_name.as_deref()) {
                Ok((stream, handle)) => {
                    let _ = ready_tx.send(Ok(handle));
                    // Returns on explicit close or when the context is dropped.
                    let _ = close_rx.recv();
                    drop(stream);
                    info!("Audio output released");
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                }
            })
            .map_err(|e| VoiceError::DeviceError(format!("Failed to spawn playback thread: {e}")))?;

        let handle = ready_rx.await.map_err(|_| {
            VoiceError::DeviceError("Playback thread exited during setup".into())
        })??;

        info!(sample_rate = PLAYBACK_SAMPLE_RATE, "Audio output opened");

        Ok(RodioContext {
            handle,
            epoch: Instant::now(),
            volume: self.volume,
            sink: None,
            events,
            close: Some(close_tx),
            thread: Some(thread),
        })
    }
}

/// An open rodio output with a monotonic clock starting at zero.
pub struct RodioContext {
    handle: OutputStreamHandle,
    epoch: Instant,
    volume: f32,
    /// Queue of the current run of contiguous chunks.
    sink: Option<Sink>,
    events: EventSink,
    close: Option<std_mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl PlaybackContext for RodioContext {
    fn current_time(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64()
    }

    fn schedule(
        &mut self,
        chunk: ChunkId,
        samples: Arc<[f32]>,
        start_at: f64,
    ) -> Result<(), VoiceError> {
        if self.close.is_none() {
            return Err(VoiceError::DeviceError("Audio output closed".into()));
        }

        let playing = self.sink.take().filter(|sink| !sink.empty());
        let delay = start_delay(playing.is_some(), start_at, self.current_time());
        let sink = match playing {
            Some(sink) => sink,
            None => {
                let sink = Sink::try_new(&self.handle).map_err(|e| {
                    VoiceError::DeviceError(format!("Failed to create audio sink: {e}"))
                })?;
                sink.set_volume(self.volume);
                sink
            }
        };
        if delay > 0.0 {
            debug!(chunk, delay_secs = delay, "Starting new playback run");
        }

        let source = SamplesBuffer::new(1, PLAYBACK_SAMPLE_RATE, samples.to_vec())
            .delay(Duration::from_secs_f64(delay));
        sink.append(source);

        let events = self.events.clone();
        sink.append(EmptyCallback::<f32>::new(Box::new(move || {
            events.playback_ended(chunk);
        })));

        self.sink = Some(sink);
        Ok(())
    }

    fn stop_all(&mut self) {
        if let Some(sink) = self.sink.take() {
            sink.stop();
        }
    }

    fn close(&mut self) {
        self.stop_all();
        if let Some(close) = self.close.take() {
            let _ = close.send(());
        }
        if let Some(thread) = self.thread.take() {
            join_device_thread(thread, "tutor-playback");
        }
    }
}

impl Drop for RodioContext {
    fn drop(&mut self) {
        self.close();
    }
}

/// Silence to put before a chunk so it starts at `start_at`.
///
/// A chunk joining a queue that is still playing goes straight behind it:
/// the scheduler's cursor is the end of that queue, and the sink plays
/// sources back to back on the sample clock.
fn start_delay(queue_playing: bool, start_at: f64, now: f64) -> f64 {
    if queue_playing {
        0.0
    } else {
        (start_at - now).max(0.0)
    }
}

/// Open the audio output stream for a named or default device.
fn open_output_stream(
    output_device_name: Option<&str>,
) -> Result<(OutputStream, OutputStreamHandle), VoiceError> {
    if let Some(name) = output_device_name {
        let host = cpal::default_host();
        let device = host
            .output_devices()
            .map_err(|e| VoiceError::DeviceError(format!("Failed to enumerate output devices: {e}")))?
            .find(|d| d.name().map(|n| n == name).unwrap_or(false));

        match device {
            Some(dev) => {
                debug!(device = %name, "Using configured output device");
                return OutputStream::try_from_device(&dev).map_err(|e| {
                    VoiceError::DeviceError(format!("Failed to open output device '{name}': {e}"))
                });
            }
            None => {
                warn!(
                    device = %name,
                    "Configured output device not found, falling back to default"
                );
            }
        }
    }

    OutputStream::try_default()
        .map_err(|e| VoiceError::DeviceError(format!("No audio output device available: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_behind_playing_queue_has_no_delay() {
        // Wall-clock drift between enqueue and mixer pickup must not open a gap.
        assert_eq!(start_delay(true, 12.5, 12.1), 0.0);
        assert_eq!(start_delay(true, 12.5, 12.5), 0.0);
    }

    #[test]
    fn test_first_chunk_of_run_waits_for_start_time() {
        assert!((start_delay(false, 2.25, 2.0) - 0.25).abs() < 1e-9);
        assert_eq!(start_delay(false, 2.0, 3.0), 0.0);
    }

    #[test]
    fn test_volume_is_clamped() {
        assert_eq!(RodioOutput::new(None).with_volume(5.0).volume, 2.0);
        assert_eq!(RodioOutput::new(None).with_volume(-1.0).volume, 0.0);
    }
}

//! Gapless FIFO scheduling of tutor audio.
//!
//! Each buffer starts at `max(now, next_start_time)` and pushes the cursor
//! forward by its duration, so bursty network delivery still yields
//! back-to-back playback. The set of scheduled chunks is the single source of
//! truth for "the tutor is speaking".

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;

use super::PlaybackContext;
use crate::error::VoiceError;

/// Identifier of one scheduled chunk, unique per scheduler.
pub type ChunkId = u64;

/// One decoded tutor segment awaiting or in playback.
#[derive(Debug, Clone)]
pub struct PendingAudioChunk {
    pub id: ChunkId,
    /// Device-clock time the chunk starts.
    pub start_at: f64,
    /// Length in seconds.
    pub duration: f64,
    pub samples: Arc<[f32]>,
}

impl PendingAudioChunk {
    pub fn end_at(&self) -> f64 {
        self.start_at + self.duration
    }
}

pub struct PlaybackScheduler<C: PlaybackContext> {
    context: Option<C>,
    sample_rate: u32,
    next_start_time: f64,
    scheduled: BTreeMap<ChunkId, PendingAudioChunk>,
    next_id: ChunkId,
}

impl<C: PlaybackContext> PlaybackScheduler<C> {
    pub fn new(context: C, sample_rate: u32) -> Self {
        let next_start_time = context.current_time();
        Self {
            context: Some(context),
            sample_rate,
            next_start_time,
            scheduled: BTreeMap::new(),
            next_id: 0,
        }
    }

    /// Schedule one buffer after everything already queued.
    pub fn enqueue(&mut self, samples: Vec<f32>) -> Result<PendingAudioChunk, VoiceError> {
        let Some(context) = self.context.as_mut() else {
            return Err(VoiceError::DeviceError("playback context closed".into()));
        };

        let now = context.current_time();
        let start_at = self.next_start_time.max(now);
        let duration = samples.len() as f64 / self.sample_rate as f64;
        let id = self.next_id;
        let samples: Arc<[f32]> = samples.into();

        context.schedule(id, Arc::clone(&samples), start_at)?;

        let chunk = PendingAudioChunk {
            id,
            start_at,
            duration,
            samples,
        };
        self.next_id += 1;
        self.next_start_time = chunk.end_at();
        debug!(
            chunk = id,
            start_at,
            end_at = self.next_start_time,
            queued = self.scheduled.len() + 1,
            "Scheduled tutor audio"
        );
        self.scheduled.insert(id, chunk.clone());
        Ok(chunk)
    }

    /// Record that a chunk finished playing on its own. The device has
    /// nothing left to stop for it.
    /// Returns `false` for chunks that were already flushed.
    pub fn on_chunk_ended(&mut self, id: ChunkId) -> bool {
        self.scheduled.remove(&id).is_some()
    }

    /// Silence and discard every scheduled chunk; the cursor restarts at now.
    /// Returns the number of chunks discarded.
    pub fn flush(&mut self) -> usize {
        let discarded = self.scheduled.len();
        if let Some(context) = self.context.as_mut() {
            context.stop_all();
            self.next_start_time = context.current_time();
        }
        self.scheduled.clear();
        discarded
    }

    /// Stop everything and release the output device. Idempotent.
    pub fn teardown(&mut self) {
        self.flush();
        if let Some(mut context) = self.context.take() {
            context.close();
        } else {
            debug!("Playback already torn down");
        }
    }

    /// The tutor is speaking while anything is scheduled.
    pub fn is_speaking(&self) -> bool {
        !self.scheduled.is_empty()
    }

    pub fn next_start_time(&self) -> f64 {
        self.next_start_time
    }
}

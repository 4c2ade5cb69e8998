// Gapless playback scheduling for inbound speech chunks
//
// Chunks arrive at irregular intervals. Each one is placed at
// max(now, cursor) on the output device clock and the cursor advances by
// the chunk's duration, so arrival jitter never opens gaps or overlaps.
//
// The cursor and the live-handle registry share one lock. Scheduling reads
// the clock, starts the voice and advances the cursor inside that lock, so
// an interrupt running on another thread sees either the state before the
// decision or the state after it, never a half-updated cursor.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::codec::PlayableBuffer;
use super::device::{OnEnded, OutputDevice, VoiceId};
use crate::error::{LiveError, Result};

/// Speaking transitions emitted by the scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackEvent {
    /// The live set went from empty to non-empty
    SpeakingStarted,
    /// The live set became empty (natural end or interruption)
    SpeakingEnded,
}

/// Placement of one scheduled chunk on the device timeline
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledPlayback {
    pub id: VoiceId,
    pub start_time: f64,
    pub duration: f64,
}

/// One scheduled, possibly still playing chunk
#[derive(Debug)]
struct PlaybackHandle {
    buffer: Arc<PlayableBuffer>,
    start_time: f64,
}

impl PlaybackHandle {
    fn end_time(&self) -> f64 {
        self.start_time + self.buffer.duration()
    }
}

/// Owned set of in-flight playback handles
#[derive(Debug, Default)]
struct HandleRegistry {
    live: HashMap<VoiceId, PlaybackHandle>,
    next_id: VoiceId,
}

impl HandleRegistry {
    fn allocate(&mut self) -> VoiceId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Returns true when this is the first live handle
    fn add(&mut self, id: VoiceId, handle: PlaybackHandle) -> bool {
        let was_empty = self.live.is_empty();
        self.live.insert(id, handle);
        was_empty
    }

    /// Returns true when removing `id` emptied the set
    fn remove(&mut self, id: VoiceId) -> bool {
        self.live.remove(&id).is_some() && self.live.is_empty()
    }

    fn clear(&mut self) -> Vec<VoiceId> {
        self.live.drain().map(|(id, _)| id).collect()
    }

    fn len(&self) -> usize {
        self.live.len()
    }
}

#[derive(Debug, Default)]
struct SchedulerState {
    /// Earliest instant the next chunk may start
    next_start: f64,
    registry: HandleRegistry,
    /// Bumped by every interrupt, lets callers detect stale decode work
    epoch: u64,
    released: bool,
}

/// Places decoded chunks on the output device for gapless playback
pub struct PlaybackScheduler {
    output: Arc<dyn OutputDevice>,
    state: Arc<Mutex<SchedulerState>>,
    events: mpsc::UnboundedSender<PlaybackEvent>,
}

impl PlaybackScheduler {
    pub fn new(output: Arc<dyn OutputDevice>, events: mpsc::UnboundedSender<PlaybackEvent>) -> Self {
        info!(
            "Playback scheduler ready on {} ({}Hz)",
            output.name(),
            output.sample_rate()
        );

        Self {
            output,
            state: Arc::new(Mutex::new(SchedulerState::default())),
            events,
        }
    }

    /// Rate chunks must be decoded to
    pub fn sample_rate(&self) -> u32 {
        self.output.sample_rate()
    }

    /// Current interruption epoch
    pub fn epoch(&self) -> u64 {
        self.state.lock().epoch
    }

    /// Schedule `buffer` right after everything already queued
    pub fn schedule(&self, buffer: PlayableBuffer) -> Result<ScheduledPlayback> {
        let mut state = self.state.lock();
        self.schedule_locked(&mut state, buffer)
    }

    /// Schedule `buffer` only if no interrupt happened since `epoch` was read
    ///
    /// Returns `Ok(None)` when the chunk was superseded by an interruption.
    pub fn schedule_in_epoch(
        &self,
        buffer: PlayableBuffer,
        epoch: u64,
    ) -> Result<Option<ScheduledPlayback>> {
        let mut state = self.state.lock();
        if state.epoch != epoch {
            debug!(
                "Dropping chunk decoded in epoch {} (now {})",
                epoch, state.epoch
            );
            return Ok(None);
        }
        self.schedule_locked(&mut state, buffer).map(Some)
    }

    fn schedule_locked(
        &self,
        state: &mut SchedulerState,
        buffer: PlayableBuffer,
    ) -> Result<ScheduledPlayback> {
        if state.released {
            return Err(LiveError::device("playback scheduler has been torn down"));
        }

        let now = self.output.now();
        let start_time = now.max(state.next_start);
        let id = state.registry.allocate();
        let buffer = Arc::new(buffer);
        let duration = buffer.duration();

        self.output
            .start_voice(id, Arc::clone(&buffer), start_time, self.completion(id))?;

        state.next_start = start_time + duration;

        let handle = PlaybackHandle { buffer, start_time };
        debug!(
            "Scheduled voice {} at {:.3}s (now {:.3}s, ends {:.3}s)",
            id,
            start_time,
            now,
            handle.end_time()
        );

        if state.registry.add(id, handle) {
            let _ = self.events.send(PlaybackEvent::SpeakingStarted);
        }

        Ok(ScheduledPlayback {
            id,
            start_time,
            duration,
        })
    }

    fn completion(&self, id: VoiceId) -> OnEnded {
        let state: Weak<Mutex<SchedulerState>> = Arc::downgrade(&self.state);
        let events = self.events.clone();

        Box::new(move || {
            let Some(state) = state.upgrade() else {
                return;
            };
            let mut state = state.lock();
            if state.registry.remove(id) {
                let _ = events.send(PlaybackEvent::SpeakingEnded);
            }
        })
    }

    /// Hard-stop everything queued or playing and reset the cursor to now
    ///
    /// Returns the number of handles stopped.
    pub fn interrupt(&self) -> usize {
        let mut state = self.state.lock();
        if state.released {
            return 0;
        }
        let stopped = self.flush_locked(&mut state);
        info!("Playback interrupted: {} voices stopped", stopped);
        stopped
    }

    fn flush_locked(&self, state: &mut SchedulerState) -> usize {
        let ids = state.registry.clear();
        for id in &ids {
            self.output.stop_voice(*id);
        }
        state.next_start = self.output.now();
        state.epoch += 1;
        let _ = self.events.send(PlaybackEvent::SpeakingEnded);
        ids.len()
    }

    /// Interrupt and release the output device. Idempotent.
    pub fn teardown(&self) {
        {
            let mut state = self.state.lock();
            if state.released {
                return;
            }
            self.flush_locked(&mut state);
            state.released = true;
        }

        // Outside the lock: releasing may wait for the audio thread, which
        // may itself be waiting on the lock inside a completion callback.
        self.output.release();
        info!("Playback scheduler torn down");
    }

    /// Number of scheduled handles that have not finished
    pub fn live_handles(&self) -> usize {
        self.state.lock().registry.len()
    }

    pub fn is_speaking(&self) -> bool {
        self.live_handles() > 0
    }

    /// Earliest start time for the next chunk
    pub fn next_start(&self) -> f64 {
        self.state.lock().next_start
    }
}

impl Drop for PlaybackScheduler {
    fn drop(&mut self) {
        self.teardown();
    }
}

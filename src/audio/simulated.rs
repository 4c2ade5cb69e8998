//! In-memory audio devices driven by a manual clock.
//!
//! `SimulatedOutput` never renders sound: it records every voice it is asked
//! to play and fires completion callbacks when [`SimulatedOutput::advance`]
//! moves its clock past a voice's end. `SimulatedInput` delivers whatever
//! frames are pushed through its paired [`SimulatedMicrophone`].

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use super::codec::PlayableBuffer;
use super::device::{
    CaptureConfig, CapturedFrame, DeviceFactory, InputDevice, OnEnded, OutputConfig,
    OutputDevice, PlaybackClock, VoiceId,
};
use crate::error::{LiveError, Result};

/// A voice as the simulated speaker saw it
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VoiceRecord {
    pub id: VoiceId,
    pub start_at: f64,
    pub duration: f64,
}

struct SimVoice {
    id: VoiceId,
    end_at: f64,
    on_ended: OnEnded,
}

#[derive(Default)]
struct OutputState {
    now: f64,
    voices: Vec<SimVoice>,
    started: Vec<VoiceRecord>,
    stopped: Vec<VoiceId>,
    interactions: usize,
    release_count: usize,
    released: bool,
}

/// Speaker stand-in with a manually advanced clock
pub struct SimulatedOutput {
    sample_rate: u32,
    state: Mutex<OutputState>,
}

impl SimulatedOutput {
    pub fn new(sample_rate: u32) -> Arc<Self> {
        Arc::new(Self {
            sample_rate,
            state: Mutex::new(OutputState::default()),
        })
    }

    /// Move the clock forward, completing every voice that has played out
    pub fn advance(&self, secs: f64) {
        let finished = {
            let mut state = self.state.lock();
            state.now += secs;
            let now = state.now;
            let (done, pending): (Vec<SimVoice>, Vec<SimVoice>) = state
                .voices
                .drain(..)
                .partition(|voice| voice.end_at <= now + 1e-9);
            state.voices = pending;
            done
        };

        for voice in finished {
            debug!("Simulated voice {} finished", voice.id);
            (voice.on_ended)();
        }
    }

    /// Every voice started so far, in start order
    pub fn started(&self) -> Vec<VoiceRecord> {
        self.state.lock().started.clone()
    }

    /// Voices hard-stopped before finishing
    pub fn stopped(&self) -> Vec<VoiceId> {
        self.state.lock().stopped.clone()
    }

    /// Voices scheduled or playing right now
    pub fn active_voices(&self) -> usize {
        self.state.lock().voices.len()
    }

    /// Count of start/stop/release calls that reached the device
    pub fn interactions(&self) -> usize {
        self.state.lock().interactions
    }

    pub fn release_count(&self) -> usize {
        self.state.lock().release_count
    }

    pub fn is_released(&self) -> bool {
        self.state.lock().released
    }
}

impl PlaybackClock for SimulatedOutput {
    fn now(&self) -> f64 {
        self.state.lock().now
    }
}

impl OutputDevice for SimulatedOutput {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn start_voice(
        &self,
        id: VoiceId,
        buffer: Arc<PlayableBuffer>,
        start_at: f64,
        on_ended: OnEnded,
    ) -> Result<()> {
        let mut state = self.state.lock();
        state.interactions += 1;
        if state.released {
            return Err(LiveError::device("simulated output has been released"));
        }

        let duration = buffer.duration();
        state.started.push(VoiceRecord {
            id,
            start_at,
            duration,
        });
        state.voices.push(SimVoice {
            id,
            end_at: start_at + duration,
            on_ended,
        });
        Ok(())
    }

    fn stop_voice(&self, id: VoiceId) {
        let mut state = self.state.lock();
        state.interactions += 1;
        let before = state.voices.len();
        state.voices.retain(|voice| voice.id != id);
        if state.voices.len() != before {
            state.stopped.push(id);
        }
    }

    fn release(&self) {
        let mut state = self.state.lock();
        state.interactions += 1;
        if state.released {
            return;
        }
        state.released = true;
        state.release_count += 1;
        state.voices.clear();
    }

    fn name(&self) -> &str {
        "simulated-output"
    }
}

#[derive(Debug, Default)]
struct InputFlags {
    capturing: AtomicBool,
    stopped: AtomicBool,
}

/// Feeds audio into a [`SimulatedInput`]
#[derive(Clone)]
pub struct SimulatedMicrophone {
    tx: mpsc::Sender<Vec<f32>>,
    flags: Arc<InputFlags>,
}

impl SimulatedMicrophone {
    /// Push one block of samples; returns false if it was dropped
    pub fn push(&self, samples: Vec<f32>) -> bool {
        self.tx.try_send(samples).is_ok()
    }

    pub fn is_capturing(&self) -> bool {
        self.flags.capturing.load(Ordering::SeqCst)
    }

    /// Whether the paired input device has been stopped
    pub fn is_released(&self) -> bool {
        self.flags.stopped.load(Ordering::SeqCst)
    }
}

/// Microphone stand-in fed by a [`SimulatedMicrophone`]
pub struct SimulatedInput {
    sample_rate: u32,
    source: Option<mpsc::Receiver<Vec<f32>>>,
    flags: Arc<InputFlags>,
    task: Option<JoinHandle<()>>,
}

impl SimulatedInput {
    pub fn new(sample_rate: u32) -> (Self, SimulatedMicrophone) {
        let (tx, rx) = mpsc::channel(64);
        let flags = Arc::new(InputFlags::default());

        let input = Self {
            sample_rate,
            source: Some(rx),
            flags: Arc::clone(&flags),
            task: None,
        };
        (input, SimulatedMicrophone { tx, flags })
    }
}

#[async_trait::async_trait]
impl InputDevice for SimulatedInput {
    async fn start(&mut self) -> Result<mpsc::Receiver<CapturedFrame>> {
        let mut source = self
            .source
            .take()
            .ok_or_else(|| LiveError::device("simulated input already started"))?;

        let (frame_tx, frame_rx) = mpsc::channel(16);
        let flags = Arc::clone(&self.flags);
        let sample_rate = self.sample_rate;
        flags.capturing.store(true, Ordering::SeqCst);

        self.task = Some(tokio::spawn(async move {
            let mut sequence = 0;
            while let Some(samples) = source.recv().await {
                if !flags.capturing.load(Ordering::SeqCst) {
                    break;
                }
                let frame = CapturedFrame {
                    samples,
                    sample_rate,
                    sequence,
                };
                sequence += 1;
                if frame_tx.try_send(frame).is_err() {
                    debug!("Simulated capture queue full, dropping frame");
                }
            }
        }));

        Ok(frame_rx)
    }

    async fn stop(&mut self) -> Result<()> {
        self.flags.capturing.store(false, Ordering::SeqCst);
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.source = None;
        self.flags.stopped.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_capturing(&self) -> bool {
        self.flags.capturing.load(Ordering::SeqCst)
    }

    fn name(&self) -> &str {
        "simulated-input"
    }
}

/// Hands out simulated devices and keeps handles to them for inspection
pub struct SimulatedDeviceFactory {
    output_sample_rate: u32,
    fail_input: AtomicBool,
    fail_output: AtomicBool,
    microphones: Mutex<Vec<SimulatedMicrophone>>,
    outputs: Mutex<Vec<Arc<SimulatedOutput>>>,
}

impl SimulatedDeviceFactory {
    pub fn new(output_sample_rate: u32) -> Arc<Self> {
        Arc::new(Self {
            output_sample_rate,
            fail_input: AtomicBool::new(false),
            fail_output: AtomicBool::new(false),
            microphones: Mutex::new(Vec::new()),
            outputs: Mutex::new(Vec::new()),
        })
    }

    /// Make the next microphone open fail as if permission were denied
    pub fn fail_input(&self, fail: bool) {
        self.fail_input.store(fail, Ordering::SeqCst);
    }

    /// Make the next speaker open fail as if no device were present
    pub fn fail_output(&self, fail: bool) {
        self.fail_output.store(fail, Ordering::SeqCst);
    }

    pub fn last_microphone(&self) -> Option<SimulatedMicrophone> {
        self.microphones.lock().last().cloned()
    }

    pub fn last_output(&self) -> Option<Arc<SimulatedOutput>> {
        self.outputs.lock().last().cloned()
    }

    pub fn microphones(&self) -> Vec<SimulatedMicrophone> {
        self.microphones.lock().clone()
    }

    pub fn outputs(&self) -> Vec<Arc<SimulatedOutput>> {
        self.outputs.lock().clone()
    }
}

#[async_trait::async_trait]
impl DeviceFactory for SimulatedDeviceFactory {
    async fn open_input(&self, config: &CaptureConfig) -> Result<Box<dyn InputDevice>> {
        if self.fail_input.load(Ordering::SeqCst) {
            return Err(LiveError::device("microphone permission denied"));
        }
        let (input, microphone) = SimulatedInput::new(config.sample_rate);
        self.microphones.lock().push(microphone);
        Ok(Box::new(input))
    }

    async fn open_output(&self, _config: &OutputConfig) -> Result<Arc<dyn OutputDevice>> {
        if self.fail_output.load(Ordering::SeqCst) {
            return Err(LiveError::device("no output device available"));
        }
        let output = SimulatedOutput::new(self.output_sample_rate);
        self.outputs.lock().push(Arc::clone(&output));
        Ok(output)
    }
}

use crate::audio::codec::PlayableBuffer;
use crate::error::Result;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Input rate expected by the Live API
pub const INPUT_SAMPLE_RATE: u32 = 16000;

/// Output rate produced by the Live API
pub const OUTPUT_SAMPLE_RATE: u32 = 24000;

/// Samples per captured frame (256ms at 16kHz)
pub const FRAME_SIZE: usize = 4096;

/// One fixed-size block of captured mono audio
#[derive(Debug, Clone)]
pub struct CapturedFrame {
    /// Normalized samples in [-1.0, 1.0]
    pub samples: Vec<f32>,
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Capture order, starting at 0 for each device
    pub sequence: u64,
}

/// Configuration for opening the microphone
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Rate frames are delivered at (resampled if the device differs)
    pub sample_rate: u32,
    /// Samples per delivered frame
    pub frame_size: usize,
    /// Device name, or the system default when `None`
    pub device_name: Option<String>,
}

impl CaptureConfig {
    pub fn frame_duration_ms(&self) -> u64 {
        if self.sample_rate == 0 {
            return 0;
        }
        self.frame_size as u64 * 1000 / self.sample_rate as u64
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            sample_rate: INPUT_SAMPLE_RATE,
            frame_size: FRAME_SIZE,
            device_name: None,
        }
    }
}

/// Configuration for opening the speaker
#[derive(Debug, Clone, Default)]
pub struct OutputConfig {
    /// Device name, or the system default when `None`
    pub device_name: Option<String>,
}

/// Identifier of one scheduled voice on an output device
pub type VoiceId = u64;

/// Completion callback for a scheduled voice
pub type OnEnded = Box<dyn FnOnce() + Send + 'static>;

/// Microphone capture device
///
/// Implementations:
/// - cpal: system microphone (feature `cpal-audio`)
/// - simulated: frames pushed by a test or offline driver
#[async_trait::async_trait]
pub trait InputDevice: Send + Sync {
    /// Start capturing audio
    ///
    /// Returns a channel receiver that will receive fixed-size frames.
    /// Frames are dropped rather than queued when the receiver lags.
    async fn start(&mut self) -> Result<mpsc::Receiver<CapturedFrame>>;

    /// Stop capturing and release the device. Idempotent.
    async fn stop(&mut self) -> Result<()>;

    /// Check if the device is currently capturing
    fn is_capturing(&self) -> bool;

    /// Get device name for logging
    fn name(&self) -> &str;
}

/// Time source of the output device timeline, in seconds
pub trait PlaybackClock: Send + Sync {
    fn now(&self) -> f64;
}

/// Speaker device that plays buffers at absolute positions on its clock
///
/// Contract:
/// - `on_ended` fires once the voice has played out, never from inside
///   `start_voice` and never while the device holds its own lock
/// - `stop_voice` silences the voice immediately and drops its callback
/// - `release` closes the device; later `start_voice` calls fail
pub trait OutputDevice: PlaybackClock {
    /// Native rate buffers must be decoded to
    fn sample_rate(&self) -> u32;

    fn start_voice(
        &self,
        id: VoiceId,
        buffer: Arc<PlayableBuffer>,
        start_at: f64,
        on_ended: OnEnded,
    ) -> Result<()>;

    fn stop_voice(&self, id: VoiceId);

    fn release(&self);

    fn name(&self) -> &str;
}

/// Opens fresh devices for every live session
#[async_trait::async_trait]
pub trait DeviceFactory: Send + Sync {
    async fn open_input(&self, config: &CaptureConfig) -> Result<Box<dyn InputDevice>>;

    async fn open_output(&self, config: &OutputConfig) -> Result<Arc<dyn OutputDevice>>;
}

//! System microphone and speaker via cpal.
//!
//! cpal streams are not `Send` on every platform, so each stream lives on
//! its own thread for the lifetime of the device and is dropped there when
//! the device is released.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, SampleFormat, SizedSample, StreamConfig};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use super::capture::FrameAccumulator;
use super::codec::PlayableBuffer;
use super::device::{
    CaptureConfig, CapturedFrame, DeviceFactory, InputDevice, OnEnded, OutputConfig,
    OutputDevice, PlaybackClock, VoiceId,
};
use crate::error::{LiveError, Result};

/// Frames buffered between the audio thread and the capture pipeline
const CAPTURE_QUEUE: usize = 16;

/// Opens the system default devices, or the ones named in the config
#[derive(Debug, Default, Clone)]
pub struct CpalDeviceFactory;

impl CpalDeviceFactory {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait::async_trait]
impl DeviceFactory for CpalDeviceFactory {
    async fn open_input(&self, config: &CaptureConfig) -> Result<Box<dyn InputDevice>> {
        Ok(Box::new(CpalInput::open(config).await?))
    }

    async fn open_output(&self, config: &OutputConfig) -> Result<Arc<dyn OutputDevice>> {
        Ok(Arc::new(CpalOutput::open(config).await?))
    }
}

fn find_input(name: Option<&str>) -> Result<cpal::Device> {
    let host = cpal::default_host();
    match name {
        None => host
            .default_input_device()
            .ok_or_else(|| LiveError::device("No input device available")),
        Some(name) => host
            .input_devices()
            .map_err(|e| LiveError::device(format!("Failed to enumerate input devices: {}", e)))?
            .find(|d| d.name().map(|n| n == name).unwrap_or(false))
            .ok_or_else(|| LiveError::device(format!("Input device not found: {}", name))),
    }
}

fn find_output(name: Option<&str>) -> Result<cpal::Device> {
    let host = cpal::default_host();
    match name {
        None => host
            .default_output_device()
            .ok_or_else(|| LiveError::device("No output device available")),
        Some(name) => host
            .output_devices()
            .map_err(|e| LiveError::device(format!("Failed to enumerate output devices: {}", e)))?
            .find(|d| d.name().map(|n| n == name).unwrap_or(false))
            .ok_or_else(|| LiveError::device(format!("Output device not found: {}", name))),
    }
}

/// Owns a cpal stream on a dedicated thread until stopped
struct StreamThread {
    stop: Option<std::sync::mpsc::Sender<()>>,
}

impl StreamThread {
    /// Run `build` on a new thread and wait until the stream is playing
    async fn spawn<F>(label: &str, build: F) -> Result<Self>
    where
        F: FnOnce() -> Result<cpal::Stream> + Send + 'static,
    {
        let (ready_tx, ready_rx) = oneshot::channel::<Result<()>>();
        let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();
        let label = label.to_string();

        std::thread::Builder::new()
            .name(format!("loqa-{}", label))
            .spawn(move || {
                let stream = match build().and_then(|stream| {
                    stream
                        .play()
                        .map_err(|e| LiveError::device(format!("Failed to start stream: {}", e)))?;
                    Ok(stream)
                }) {
                    Ok(stream) => {
                        let _ = ready_tx.send(Ok(()));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                // Blocks until stop() or the owner is dropped
                let _ = stop_rx.recv();
                drop(stream);
                debug!("{} stream closed", label);
            })
            .map_err(|e| LiveError::device(format!("Failed to spawn audio thread: {}", e)))?;

        ready_rx
            .await
            .map_err(|_| LiveError::device("Audio thread exited before the stream started"))??;

        Ok(Self {
            stop: Some(stop_tx),
        })
    }

    fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}

impl Drop for StreamThread {
    fn drop(&mut self) {
        self.stop();
    }
}

type FrameSender = Arc<Mutex<Option<mpsc::Sender<CapturedFrame>>>>;

/// System microphone
///
/// The stream is opened with the device and runs for its whole lifetime;
/// frames only leave the audio thread between `start` and `stop`.
pub struct CpalInput {
    name: String,
    capturing: Arc<AtomicBool>,
    sender: FrameSender,
    stream: Option<StreamThread>,
}

impl CpalInput {
    pub async fn open(config: &CaptureConfig) -> Result<Self> {
        let device = find_input(config.device_name.as_deref())?;
        let name = device.name().unwrap_or_else(|_| "Unknown".to_string());

        let supported = device
            .default_input_config()
            .map_err(|e| LiveError::device(format!("Failed to get input config: {}", e)))?;
        let format = supported.sample_format();
        let stream_config: StreamConfig = supported.into();

        info!(
            "Using input device: {} ({}Hz, {} channels, {:?})",
            name, stream_config.sample_rate.0, stream_config.channels, format
        );

        let capturing = Arc::new(AtomicBool::new(false));
        let sender: FrameSender = Arc::new(Mutex::new(None));

        let accumulator = FrameAccumulator::new(
            stream_config.sample_rate.0,
            stream_config.channels,
            config.sample_rate,
            config.frame_size,
        )
        .map_err(|e| LiveError::device(format!("Unusable input format for {}: {}", name, e)))?;
        let sink = CaptureSink {
            accumulator,
            capturing: Arc::clone(&capturing),
            sender: Arc::clone(&sender),
            sample_rate: config.sample_rate,
            sequence: 0,
        };

        let stream = StreamThread::spawn("capture", move || match format {
            SampleFormat::F32 => build_input::<f32>(&device, &stream_config, sink),
            SampleFormat::I16 => build_input::<i16>(&device, &stream_config, sink),
            SampleFormat::U16 => build_input::<u16>(&device, &stream_config, sink),
            other => Err(LiveError::device(format!(
                "Unsupported input sample format: {:?}",
                other
            ))),
        })
        .await?;

        Ok(Self {
            name,
            capturing,
            sender,
            stream: Some(stream),
        })
    }
}

struct CaptureSink {
    accumulator: FrameAccumulator,
    capturing: Arc<AtomicBool>,
    sender: FrameSender,
    sample_rate: u32,
    sequence: u64,
}

impl CaptureSink {
    fn push(&mut self, samples: &[f32]) {
        if !self.capturing.load(Ordering::Relaxed) {
            self.accumulator.reset();
            return;
        }

        let frames = match self.accumulator.push(samples) {
            Ok(frames) if frames.is_empty() => return,
            Ok(frames) => frames,
            Err(e) => {
                warn!("Dropping captured audio: {}", e);
                self.accumulator.reset();
                return;
            }
        };

        let guard = self.sender.lock();
        let Some(sender) = guard.as_ref() else {
            return;
        };
        for samples in frames {
            let frame = CapturedFrame {
                samples,
                sample_rate: self.sample_rate,
                sequence: self.sequence,
            };
            self.sequence += 1;
            if sender.try_send(frame).is_err() {
                debug!("Capture queue full, dropping frame {}", self.sequence - 1);
            }
        }
    }
}

fn build_input<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    mut sink: CaptureSink,
) -> Result<cpal::Stream>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let mut scratch = Vec::new();
    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                scratch.clear();
                scratch.extend(data.iter().map(|s| f32::from_sample(*s)));
                sink.push(&scratch);
            },
            |err| error!("Audio input stream error: {}", err),
            None,
        )
        .map_err(|e| LiveError::device(format!("Failed to build input stream: {}", e)))
}

#[async_trait::async_trait]
impl InputDevice for CpalInput {
    async fn start(&mut self) -> Result<mpsc::Receiver<CapturedFrame>> {
        if self.stream.is_none() {
            return Err(LiveError::device("Input device has been released"));
        }
        let (tx, rx) = mpsc::channel(CAPTURE_QUEUE);
        *self.sender.lock() = Some(tx);
        self.capturing.store(true, Ordering::SeqCst);
        Ok(rx)
    }

    async fn stop(&mut self) -> Result<()> {
        self.capturing.store(false, Ordering::SeqCst);
        self.sender.lock().take();
        if let Some(mut stream) = self.stream.take() {
            stream.stop();
            info!("Released input device {}", self.name);
        }
        Ok(())
    }

    fn is_capturing(&self) -> bool {
        self.capturing.load(Ordering::SeqCst)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

struct Voice {
    id: VoiceId,
    buffer: Arc<PlayableBuffer>,
    start_frame: u64,
    on_ended: Option<OnEnded>,
}

impl Voice {
    fn end_frame(&self) -> u64 {
        self.start_frame + self.buffer.len() as u64
    }
}

#[derive(Default)]
struct Renderer {
    voices: Vec<Voice>,
    /// Frames the queued sequence was pushed back by late starts
    lag: u64,
    released: bool,
}

impl Renderer {
    /// Queue a voice requested at `start_frame` given the current clock
    ///
    /// A start already behind the clock would lose its first samples, so it
    /// begins at `clock` instead and every later voice of the same queued
    /// sequence moves back by the same amount, keeping playback gapless.
    fn add(
        &mut self,
        id: VoiceId,
        buffer: Arc<PlayableBuffer>,
        start_frame: u64,
        clock: u64,
        on_ended: OnEnded,
    ) {
        if self.voices.is_empty() {
            self.lag = 0;
        }
        let mut start = start_frame + self.lag;
        if start < clock {
            debug!("Voice {} is {} frames late, starting now", id, clock - start);
            self.lag += clock - start;
            start = clock;
        }
        self.voices.push(Voice {
            id,
            buffer,
            start_frame: start,
            on_ended: Some(on_ended),
        });
    }
}

/// System speaker that mixes scheduled voices against its own frame clock
pub struct CpalOutput {
    name: String,
    sample_rate: u32,
    frames_rendered: Arc<AtomicU64>,
    renderer: Arc<Mutex<Renderer>>,
    stream: Mutex<Option<StreamThread>>,
}

impl CpalOutput {
    pub async fn open(config: &OutputConfig) -> Result<Self> {
        let device = find_output(config.device_name.as_deref())?;
        let name = device.name().unwrap_or_else(|_| "Unknown".to_string());

        let supported = device
            .default_output_config()
            .map_err(|e| LiveError::device(format!("Failed to get output config: {}", e)))?;
        let format = supported.sample_format();
        let stream_config: StreamConfig = supported.into();
        let sample_rate = stream_config.sample_rate.0;

        info!(
            "Using output device: {} ({}Hz, {} channels, {:?})",
            name, sample_rate, stream_config.channels, format
        );

        let frames_rendered = Arc::new(AtomicU64::new(0));
        let renderer = Arc::new(Mutex::new(Renderer::default()));

        let mix = Mixer {
            renderer: Arc::clone(&renderer),
            frames_rendered: Arc::clone(&frames_rendered),
            channels: stream_config.channels.max(1) as usize,
        };

        let stream = StreamThread::spawn("playback", move || match format {
            SampleFormat::F32 => build_output::<f32>(&device, &stream_config, mix),
            SampleFormat::I16 => build_output::<i16>(&device, &stream_config, mix),
            SampleFormat::U16 => build_output::<u16>(&device, &stream_config, mix),
            other => Err(LiveError::device(format!(
                "Unsupported output sample format: {:?}",
                other
            ))),
        })
        .await?;

        Ok(Self {
            name,
            sample_rate,
            frames_rendered,
            renderer,
            stream: Mutex::new(Some(stream)),
        })
    }
}

struct Mixer {
    renderer: Arc<Mutex<Renderer>>,
    frames_rendered: Arc<AtomicU64>,
    channels: usize,
}

impl Mixer {
    /// Fill `out` (interleaved) and return callbacks of voices that ended
    ///
    /// The clock only moves while the renderer lock is held, so a voice
    /// queued under that lock can never land in an already rendered block.
    fn render(&mut self, out: &mut [f32]) -> Vec<OnEnded> {
        out.fill(0.0);
        let frames = (out.len() / self.channels) as u64;

        let mut finished = Vec::new();
        {
            let mut renderer = self.renderer.lock();
            let block_start = self.frames_rendered.load(Ordering::Acquire);
            let block_end = block_start + frames;

            for voice in renderer.voices.iter() {
                let from = voice.start_frame.max(block_start);
                let to = voice.end_frame().min(block_end);
                let samples = voice.buffer.samples();
                for frame in from..to {
                    let sample = samples[(frame - voice.start_frame) as usize];
                    let offset = (frame - block_start) as usize * self.channels;
                    for slot in &mut out[offset..offset + self.channels] {
                        *slot += sample;
                    }
                }
            }

            renderer.voices.retain_mut(|voice| {
                if voice.end_frame() <= block_end {
                    if let Some(on_ended) = voice.on_ended.take() {
                        finished.push(on_ended);
                    }
                    false
                } else {
                    true
                }
            });
            self.frames_rendered.store(block_end, Ordering::Release);
        }

        for slot in out.iter_mut() {
            *slot = slot.clamp(-1.0, 1.0);
        }
        finished
    }
}

fn build_output<T>(device: &cpal::Device, config: &StreamConfig, mut mixer: Mixer) -> Result<cpal::Stream>
where
    T: SizedSample + FromSample<f32>,
{
    let mut scratch = Vec::new();
    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                scratch.resize(data.len(), 0.0f32);
                let finished = mixer.render(&mut scratch);
                for (slot, sample) in data.iter_mut().zip(scratch.iter()) {
                    *slot = T::from_sample(*sample);
                }
                // Renderer lock is released by now
                for on_ended in finished {
                    on_ended();
                }
            },
            |err| error!("Audio output stream error: {}", err),
            None,
        )
        .map_err(|e| LiveError::device(format!("Failed to build output stream: {}", e)))
}

impl PlaybackClock for CpalOutput {
    fn now(&self) -> f64 {
        self.frames_rendered.load(Ordering::Acquire) as f64 / self.sample_rate as f64
    }
}

impl OutputDevice for CpalOutput {
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
        if buffer.sample_rate() != self.sample_rate {
            warn!(
                "Voice {} is {}Hz on a {}Hz device",
                id,
                buffer.sample_rate(),
                self.sample_rate
            );
        }

        let mut renderer = self.renderer.lock();
        if renderer.released {
            return Err(LiveError::device("Output device has been released"));
        }

        let start_frame = (start_at.max(0.0) * self.sample_rate as f64).round() as u64;
        let clock = self.frames_rendered.load(Ordering::Acquire);
        renderer.add(id, buffer, start_frame, clock, on_ended);
        Ok(())
    }

    fn stop_voice(&self, id: VoiceId) {
        let removed = {
            let mut renderer = self.renderer.lock();
            let before = renderer.voices.len();
            renderer.voices.retain(|voice| voice.id != id);
            before - renderer.voices.len()
        };
        if removed > 0 {
            debug!("Stopped voice {}", id);
        }
    }

    fn release(&self) {
        let voices = {
            let mut renderer = self.renderer.lock();
            renderer.released = true;
            std::mem::take(&mut renderer.voices)
        };
        // Callbacks of stopped voices are dropped without running
        drop(voices);

        if let Some(mut stream) = self.stream.lock().take() {
            stream.stop();
            info!("Released output device {}", self.name);
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for CpalOutput {
    fn drop(&mut self) {
        self.release();
    }
}

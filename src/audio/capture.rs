use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::codec::{self, downmix_to_mono};
use super::device::InputDevice;
use super::resample::{StreamResampler, CAPTURE_CHUNK};
use crate::error::{LiveError, Result};
use crate::session::SessionCounters;
use crate::transport::{LiveTransport, SendStatus};

/// Turns arbitrarily sized device callbacks into fixed-size mono frames
///
/// Devices that run at a different rate or channel count are downmixed and
/// fed through one continuous resampler, then re-blocked, so every emitted
/// frame holds exactly `frame_size` samples at `target_rate`.
pub struct FrameAccumulator {
    channels: usize,
    frame_size: usize,
    resampler: Option<StreamResampler>,
    /// Mono samples at the target rate not yet emitted
    pending: Vec<f32>,
}

impl FrameAccumulator {
    pub fn new(native_rate: u32, channels: u16, target_rate: u32, frame_size: usize) -> Result<Self> {
        if frame_size == 0 {
            return Err(LiveError::config("frame size must be greater than 0"));
        }
        let resampler = if native_rate == target_rate {
            None
        } else {
            Some(StreamResampler::new(native_rate, target_rate, CAPTURE_CHUNK)?)
        };

        Ok(Self {
            channels: channels.max(1) as usize,
            frame_size,
            resampler,
            pending: Vec::with_capacity(frame_size * 2),
        })
    }

    /// Add interleaved native samples; returns every frame that completed
    pub fn push(&mut self, interleaved: &[f32]) -> Result<Vec<Vec<f32>>> {
        let mono = downmix_to_mono(interleaved, self.channels);
        match self.resampler.as_mut() {
            Some(resampler) => self.pending.extend(resampler.process(&mono)?),
            None => self.pending.extend(mono),
        }

        let mut frames = Vec::new();
        while self.pending.len() >= self.frame_size {
            frames.push(self.pending.drain(..self.frame_size).collect());
        }
        Ok(frames)
    }

    /// Discard any partial frame and resampler state
    pub fn reset(&mut self) {
        self.pending.clear();
        if let Some(resampler) = self.resampler.as_mut() {
            resampler.reset();
        }
    }

    /// Samples not yet emitted; input still inside the resampler counts
    /// at the native rate
    pub fn pending_samples(&self) -> usize {
        self.pending.len()
            + self
                .resampler
                .as_ref()
                .map(|r| r.pending_input())
                .unwrap_or(0)
    }
}

/// Microphone → codec → transport
///
/// Frames captured while the transport is not open are dropped, never
/// queued: stale live audio has no value.
pub struct CapturePipeline {
    device: Box<dyn InputDevice>,
    forwarding: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
    stopped: bool,
}

impl CapturePipeline {
    pub fn new(device: Box<dyn InputDevice>) -> Self {
        Self {
            device,
            forwarding: Arc::new(AtomicBool::new(false)),
            task: None,
            stopped: false,
        }
    }

    /// Start the device and forward encoded frames to `transport`
    pub async fn start(
        &mut self,
        transport: Arc<dyn LiveTransport>,
        counters: Arc<SessionCounters>,
    ) -> Result<()> {
        if self.stopped {
            return Err(LiveError::InvalidState {
                message: "capture pipeline has been torn down".to_string(),
            });
        }
        if self.task.is_some() {
            warn!("Capture pipeline already started");
            return Ok(());
        }

        let mut frames = self.device.start().await?;
        info!("Capture started on {}", self.device.name());

        self.forwarding.store(true, Ordering::SeqCst);
        let forwarding = Arc::clone(&self.forwarding);

        self.task = Some(tokio::spawn(async move {
            while let Some(frame) = frames.recv().await {
                if !forwarding.load(Ordering::SeqCst) {
                    break;
                }

                if !transport.is_open() {
                    debug!("Dropping frame {}: transport not open", frame.sequence);
                    counters.frame_dropped();
                    continue;
                }

                let pcm = codec::encode_frame(&frame.samples);
                match transport.send(pcm) {
                    Ok(SendStatus::Sent) => counters.frame_sent(),
                    Ok(SendStatus::Dropped) => {
                        debug!("Dropping frame {}: outbound queue full", frame.sequence);
                        counters.frame_dropped();
                    }
                    Err(LiveError::NotConnected) => {
                        warn!("Frame {} not sent: transport not connected", frame.sequence);
                        counters.frame_dropped();
                    }
                    Err(e) => {
                        warn!("Frame {} not sent: {}", frame.sequence, e);
                        counters.frame_dropped();
                    }
                }
            }
            debug!("Capture forwarding task stopped");
        }));

        Ok(())
    }

    /// Stop forwarding, then release the input device. Idempotent.
    ///
    /// Once this returns no further frame reaches the transport.
    pub async fn stop(&mut self) -> Result<()> {
        if self.stopped {
            return Ok(());
        }
        self.stopped = true;

        self.forwarding.store(false, Ordering::SeqCst);
        if let Some(task) = self.task.take() {
            task.abort();
            // Cancellation is the expected outcome here
            let _ = task.await;
        }

        self.device.stop().await?;
        info!("Capture stopped on {}", self.device.name());
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.task.is_some() && self.forwarding.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::simulated::SimulatedInput;
    use parking_lot::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingTransport {
        open: AtomicBool,
        sent: Mutex<Vec<Vec<u8>>>,
    }

    #[async_trait::async_trait]
    impl LiveTransport for RecordingTransport {
        fn send(&self, frame: Vec<u8>) -> Result<SendStatus> {
            if !self.is_open() {
                return Err(LiveError::NotConnected);
            }
            self.sent.lock().push(frame);
            Ok(SendStatus::Sent)
        }

        fn is_open(&self) -> bool {
            self.open.load(Ordering::SeqCst)
        }

        async fn close(&self) {
            self.open.store(false, Ordering::SeqCst);
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[test]
    fn test_accumulator_passthrough_frames() {
        let mut acc = FrameAccumulator::new(16000, 1, 16000, 4).unwrap();

        assert!(acc.push(&[0.1, 0.2, 0.3]).unwrap().is_empty());
        let frames = acc.push(&[0.4, 0.5, 0.6, 0.7, 0.8, 0.9]).unwrap();

        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0], vec![0.1, 0.2, 0.3, 0.4]);
        assert_eq!(frames[1], vec![0.5, 0.6, 0.7, 0.8]);
        assert_eq!(acc.pending_samples(), 1);
    }

    #[test]
    fn test_accumulator_downmixes_and_resamples() {
        // 48kHz stereo device, 16kHz mono frames of 160 samples (10ms)
        let mut acc = FrameAccumulator::new(48000, 2, 16000, 160).unwrap();
        let mut frames = Vec::new();
        for _ in 0..10 {
            frames.extend(acc.push(&vec![0.5f32; 480 * 2]).unwrap());
        }

        assert!(frames.len() >= 7, "got {} frames", frames.len());
        assert!(frames.iter().all(|f| f.len() == 160));
        // First frame carries the filter's onset
        for frame in &frames[1..] {
            assert!(frame.iter().all(|s| (s - 0.5).abs() < 1e-2));
        }
    }

    #[test]
    fn test_accumulator_keeps_phase_across_frames() {
        // 44.1kHz device delivering 10ms callbacks of a 440Hz tone
        let native = 44100u32;
        let tone = 440.0f64;
        let mut acc = FrameAccumulator::new(native, 1, 16000, 4096).unwrap();

        let signal: Vec<f32> = (0..native as usize * 4)
            .map(|n| (0.5 * (2.0 * std::f64::consts::PI * tone * n as f64 / native as f64).sin()) as f32)
            .collect();
        let mut frames = Vec::new();
        for callback in signal.chunks(441) {
            frames.extend(acc.push(callback).unwrap());
        }
        assert_eq!(frames.len(), 15);

        let out: Vec<f32> = frames.concat();
        let crossings: Vec<f64> = (1..out.len())
            .filter(|&i| out[i - 1] < 0.0 && out[i] >= 0.0)
            .map(|i| {
                let (a, b) = (out[i - 1] as f64, out[i] as f64);
                (i - 1) as f64 + a / (a - b)
            })
            .filter(|&c| c > 2000.0)
            .collect();
        assert!(crossings.len() > 1000);

        // Every rising zero crossing sits on the ideal period grid
        let period = 16000.0 / tone;
        let first = crossings[0];
        let worst = crossings
            .iter()
            .map(|c| {
                let k = ((c - first) / period).round();
                (c - (first + k * period)).abs()
            })
            .fold(0.0f64, f64::max);
        assert!(worst < 0.1, "crossing drifted {:.3} samples", worst);

        let peak = out[2000..].iter().fold(0.0f32, |m, s| m.max(s.abs()));
        assert!((peak - 0.5).abs() < 0.01, "peak {}", peak);
    }

    #[test]
    fn test_accumulator_reset_discards_partial() {
        let mut acc = FrameAccumulator::new(16000, 1, 16000, 4096).unwrap();
        acc.push(&[0.0; 100]).unwrap();
        acc.reset();
        assert_eq!(acc.pending_samples(), 0);

        let mut resampling = FrameAccumulator::new(48000, 1, 16000, 4096).unwrap();
        resampling.push(&[0.0; 500]).unwrap();
        assert_eq!(resampling.pending_samples(), 500);
        resampling.reset();
        assert_eq!(resampling.pending_samples(), 0);
    }

    #[tokio::test]
    async fn test_frames_dropped_until_transport_opens() {
        let (input, mic) = SimulatedInput::new(16000);
        let transport = Arc::new(RecordingTransport::default());
        let counters = Arc::new(SessionCounters::default());

        let mut pipeline = CapturePipeline::new(Box::new(input));
        pipeline
            .start(transport.clone(), Arc::clone(&counters))
            .await
            .unwrap();

        mic.push(vec![0.25; 8]);
        settle().await;
        assert!(transport.sent.lock().is_empty());
        assert_eq!(counters.snapshot().frames_dropped, 1);

        transport.open.store(true, Ordering::SeqCst);
        mic.push(vec![0.25; 8]);
        settle().await;

        let sent = transport.sent.lock().clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0], codec::encode_frame(&[0.25; 8]));
        assert_eq!(counters.snapshot().frames_sent, 1);

        pipeline.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_silences_pipeline() {
        let (input, mic) = SimulatedInput::new(16000);
        let transport = Arc::new(RecordingTransport::default());
        transport.open.store(true, Ordering::SeqCst);

        let mut pipeline = CapturePipeline::new(Box::new(input));
        pipeline
            .start(transport.clone(), Arc::new(SessionCounters::default()))
            .await
            .unwrap();
        assert!(pipeline.is_running());

        pipeline.stop().await.unwrap();
        pipeline.stop().await.unwrap();
        assert!(!pipeline.is_running());
        assert!(mic.is_released());

        mic.push(vec![0.5; 8]);
        settle().await;
        assert!(transport.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn test_start_after_stop_is_rejected() {
        let (input, _mic) = SimulatedInput::new(16000);
        let mut pipeline = CapturePipeline::new(Box::new(input));
        pipeline.stop().await.unwrap();

        let result = pipeline
            .start(
                Arc::new(RecordingTransport::default()),
                Arc::new(SessionCounters::default()),
            )
            .await;
        assert!(matches!(result, Err(LiveError::InvalidState { .. })));
    }
}

//! Linear PCM packing and unpacking.
//!
//! Outbound frames are little-endian signed 16-bit mono at the input rate.
//! Inbound chunks use the same layout at the model's output rate and are
//! unpacked into [`PlayableBuffer`]s at the output device's native rate.

use tracing::debug;

use super::resample::{resample_once, StreamResampler, PLAYBACK_CHUNK};
use crate::error::{LiveError, Result};

/// Scale between normalized floats and signed 16-bit samples.
const I16_SCALE: f32 = 32768.0;

/// Decoded mono audio ready to be handed to an output device.
#[derive(Debug, Clone, PartialEq)]
pub struct PlayableBuffer {
    samples: Vec<f32>,
    sample_rate: u32,
}

impl PlayableBuffer {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    /// Build a buffer of silence lasting `duration_secs` (used by tests and
    /// the simulated devices).
    pub fn silence(duration_secs: f64, sample_rate: u32) -> Self {
        let len = (duration_secs * sample_rate as f64).round() as usize;
        Self::new(vec![0.0; len], sample_rate)
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Duration in seconds.
    pub fn duration(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }
}

/// Convert a normalized float sample to 16-bit PCM, clamping out-of-range
/// input. NaN maps to silence.
pub fn f32_to_i16(sample: f32) -> i16 {
    // `as` saturates, so 1.0 * 32768 lands on i16::MAX.
    (sample.clamp(-1.0, 1.0) * I16_SCALE).round() as i16
}

pub fn i16_to_f32(sample: i16) -> f32 {
    sample as f32 / I16_SCALE
}

/// Pack float samples into little-endian 16-bit PCM bytes.
///
/// Never fails; output is always `2 * samples.len()` bytes.
pub fn encode_frame(samples: &[f32]) -> Vec<u8> {
    samples
        .iter()
        .flat_map(|&s| f32_to_i16(s).to_le_bytes())
        .collect()
}

/// Unpack little-endian 16-bit PCM bytes recorded at `source_rate` into a
/// buffer at `target_rate`.
///
/// Treats `bytes` as a complete signal. Streams of consecutive chunks go
/// through a [`ChunkDecoder`] instead so the resampler stays continuous.
pub fn decode_chunk(bytes: &[u8], source_rate: u32, target_rate: u32) -> Result<PlayableBuffer> {
    check_rates(source_rate, target_rate)?;
    let samples = unpack_pcm(bytes)?;
    let samples = resample_once(&samples, source_rate, target_rate)?;
    Ok(PlayableBuffer::new(samples, target_rate))
}

fn check_rates(source_rate: u32, target_rate: u32) -> Result<()> {
    if source_rate == 0 || target_rate == 0 {
        return Err(LiveError::decode("sample rate must be non-zero"));
    }
    Ok(())
}

fn unpack_pcm(bytes: &[u8]) -> Result<Vec<f32>> {
    if bytes.len() % 2 != 0 {
        return Err(LiveError::decode(format!(
            "PCM payload length {} is not a multiple of 2",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|pair| i16_to_f32(i16::from_le_bytes([pair[0], pair[1]])))
        .collect())
}

/// Decodes the inbound chunks of one session as a single stream
///
/// When the model rate differs from the device rate all chunks share one
/// resampler, so a chunk's last few samples may be held back until the
/// next chunk arrives or the turn is finished.
pub struct ChunkDecoder {
    target_rate: u32,
    resampler: Option<StreamResampler>,
}

impl ChunkDecoder {
    pub fn new(target_rate: u32) -> Self {
        Self {
            target_rate,
            resampler: None,
        }
    }

    pub fn target_rate(&self) -> u32 {
        self.target_rate
    }

    /// Decode one chunk; may return an empty buffer while input is held back
    pub fn decode(&mut self, bytes: &[u8], source_rate: u32) -> Result<PlayableBuffer> {
        check_rates(source_rate, self.target_rate)?;
        let samples = unpack_pcm(bytes)?;

        if source_rate == self.target_rate {
            return Ok(PlayableBuffer::new(samples, self.target_rate));
        }

        let stale = self
            .resampler
            .as_ref()
            .map(|r| r.from_rate() != source_rate)
            .unwrap_or(true);
        if stale {
            debug!(
                "Resampling inbound audio {} Hz -> {} Hz",
                source_rate, self.target_rate
            );
            let resampler = StreamResampler::new(source_rate, self.target_rate, PLAYBACK_CHUNK)
                .map_err(|e| LiveError::decode(e.to_string()))?;
            self.resampler = Some(resampler);
        }

        let samples = match self.resampler.as_mut() {
            Some(resampler) => resampler.process(&samples)?,
            None => Vec::new(),
        };
        Ok(PlayableBuffer::new(samples, self.target_rate))
    }

    /// Release whatever the resampler still holds for the current turn
    pub fn finish_turn(&mut self) -> Result<PlayableBuffer> {
        let samples = match self.resampler.as_mut() {
            Some(resampler) => resampler.flush()?,
            None => Vec::new(),
        };
        Ok(PlayableBuffer::new(samples, self.target_rate))
    }

    /// Discard held-back audio (the turn was interrupted)
    pub fn reset(&mut self) {
        if let Some(resampler) = self.resampler.as_mut() {
            resampler.reset();
        }
    }
}

/// Average interleaved channels down to mono.
pub fn downmix_to_mono(interleaved: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return interleaved.to_vec();
    }
    interleaved
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

//! Streaming sample-rate conversion for mono audio.
//!
//! One [`StreamResampler`] follows one continuous stream. Input is buffered
//! until a full resampler chunk is available, so the filter state carries
//! across callback and chunk boundaries and output time never drifts from
//! input time.

use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};
use tracing::debug;

use crate::error::{LiveError, Result};

/// Input frames per resampler pass for microphone streams
pub const CAPTURE_CHUNK: usize = 1024;

/// Input frames per resampler pass for inbound speech
pub const PLAYBACK_CHUNK: usize = 256;

/// Upper bound on zero-fed passes while draining the filter
const MAX_FLUSH_PASSES: usize = 8;

/// Stateful sinc resampler over one continuous mono stream
pub struct StreamResampler {
    inner: SincFixedIn<f32>,
    from_rate: u32,
    to_rate: u32,
    /// Input not yet handed to the resampler
    pending: Vec<f32>,
    /// Leading output still to discard (filter delay)
    skip: usize,
    frames_in: u64,
    frames_out: u64,
}

impl StreamResampler {
    pub fn new(from_rate: u32, to_rate: u32, chunk_size: usize) -> Result<Self> {
        if from_rate == 0 || to_rate == 0 {
            return Err(LiveError::config("sample rates must be greater than 0"));
        }
        if chunk_size == 0 {
            return Err(LiveError::config("resampler chunk size must be greater than 0"));
        }

        let params = SincInterpolationParameters {
            sinc_len: 256,
            f_cutoff: 0.95,
            interpolation: SincInterpolationType::Linear,
            oversampling_factor: 256,
            window: WindowFunction::BlackmanHarris2,
        };

        let inner = SincFixedIn::<f32>::new(
            to_rate as f64 / from_rate as f64,
            2.0,
            params,
            chunk_size,
            1,
        )
        .map_err(|e| LiveError::config(format!("Failed to create resampler: {}", e)))?;
        let skip = inner.output_delay();

        debug!(
            "Created resampler: {} Hz -> {} Hz, chunk {}, delay {}",
            from_rate, to_rate, chunk_size, skip
        );

        Ok(Self {
            inner,
            from_rate,
            to_rate,
            pending: Vec::with_capacity(chunk_size * 2),
            skip,
            frames_in: 0,
            frames_out: 0,
        })
    }

    pub fn from_rate(&self) -> u32 {
        self.from_rate
    }

    /// Input samples waiting for a full chunk
    pub fn pending_input(&self) -> usize {
        self.pending.len()
    }

    /// Feed input; returns all output that complete chunks produced
    pub fn process(&mut self, input: &[f32]) -> Result<Vec<f32>> {
        self.pending.extend_from_slice(input);
        self.frames_in += input.len() as u64;

        let mut out = Vec::new();
        let mut consumed = 0;
        loop {
            let needed = self.inner.input_frames_next();
            if self.pending.len() - consumed < needed {
                break;
            }
            let wave = [&self.pending[consumed..consumed + needed]];
            let produced = self
                .inner
                .process(&wave[..], None)
                .map_err(|e| LiveError::decode(format!("Resampling failed: {}", e)))?;
            consumed += needed;
            emit(&mut self.skip, &mut self.frames_out, produced, &mut out);
        }
        self.pending.drain(..consumed);
        Ok(out)
    }

    /// End the stream: drain buffered input and the filter tail
    ///
    /// Total output over the stream's life equals the input length scaled
    /// by the rate ratio. The resampler starts a fresh stream afterwards.
    pub fn flush(&mut self) -> Result<Vec<f32>> {
        let expected =
            (self.frames_in as f64 * self.to_rate as f64 / self.from_rate as f64).round() as u64;
        let mut out = Vec::new();

        if !self.pending.is_empty() {
            let rest = std::mem::take(&mut self.pending);
            let wave = [rest.as_slice()];
            let produced = self
                .inner
                .process_partial(Some(&wave[..]), None)
                .map_err(|e| LiveError::decode(format!("Resampling failed: {}", e)))?;
            emit(&mut self.skip, &mut self.frames_out, produced, &mut out);
        }

        let mut passes = 0;
        while self.frames_out < expected && passes < MAX_FLUSH_PASSES {
            let produced = self
                .inner
                .process_partial(None::<&[&[f32]]>, None)
                .map_err(|e| LiveError::decode(format!("Resampling failed: {}", e)))?;
            emit(&mut self.skip, &mut self.frames_out, produced, &mut out);
            passes += 1;
        }

        if self.frames_out > expected {
            let excess = (self.frames_out - expected) as usize;
            out.truncate(out.len().saturating_sub(excess));
        }

        self.reset();
        Ok(out)
    }

    /// Drop buffered input and filter state
    pub fn reset(&mut self) {
        self.inner.reset();
        self.pending.clear();
        self.skip = self.inner.output_delay();
        self.frames_in = 0;
        self.frames_out = 0;
    }
}

fn emit(skip: &mut usize, frames_out: &mut u64, produced: Vec<Vec<f32>>, out: &mut Vec<f32>) {
    let Some(channel) = produced.into_iter().next() else {
        return;
    };
    let skipped = (*skip).min(channel.len());
    *skip -= skipped;
    *frames_out += (channel.len() - skipped) as u64;
    out.extend_from_slice(&channel[skipped..]);
}

/// Resample a complete, self-contained signal
pub fn resample_once(samples: &[f32], from_rate: u32, to_rate: u32) -> Result<Vec<f32>> {
    if from_rate == to_rate || samples.is_empty() {
        return Ok(samples.to_vec());
    }
    let mut resampler = StreamResampler::new(from_rate, to_rate, PLAYBACK_CHUNK)?;
    let mut out = resampler.process(samples)?;
    out.extend(resampler.flush()?);
    Ok(out)
}

//! Microphone framing.
//!
//! Buffers captured samples into fixed-size PCM16 frames at the model's
//! sample rate. Each full frame is returned as soon as it is complete; the
//! partial tail is only emitted by [`MicFramer::flush`].

use bytes::Bytes;
use rubato::{FftFixedIn, Resampler};
use std::time::Duration;

use super::AudioError;
use super::codec::encode_pcm16;

/// Input frames fed to the resampler per call.
const RESAMPLER_CHUNK: usize = 1024;

/// Accepted capture sample rates.
pub const MIN_SAMPLE_RATE: u32 = 8000;
pub const MAX_SAMPLE_RATE: u32 = 96000;

/// Streaming wrapper around a fixed-input FFT resampler.
struct StreamResampler {
    inner: FftFixedIn<f32>,
    staged: Vec<f32>,
    ratio: f64,
}

impl StreamResampler {
    fn new(input_rate: u32, output_rate: u32) -> Result<Self, AudioError> {
        let inner = FftFixedIn::<f32>::new(
            input_rate as usize,
            output_rate as usize,
            RESAMPLER_CHUNK,
            1,
            1,
        )
        .map_err(|e| AudioError::Resampler(e.to_string()))?;

        tracing::debug!(input_rate, output_rate, "Created microphone resampler");

        Ok(Self {
            inner,
            staged: Vec::with_capacity(RESAMPLER_CHUNK * 2),
            ratio: output_rate as f64 / input_rate as f64,
        })
    }

    fn push(&mut self, samples: &[f32]) -> Result<Vec<f32>, AudioError> {
        self.staged.extend_from_slice(samples);

        let mut output = Vec::new();
        loop {
            let needed = self.inner.input_frames_next();
            if self.staged.len() < needed {
                break;
            }
            let chunk: Vec<f32> = self.staged.drain(..needed).collect();
            let resampled = self
                .inner
                .process(&[chunk], None)
                .map_err(|e| AudioError::Resampler(e.to_string()))?;
            if let Some(channel) = resampled.first() {
                output.extend_from_slice(channel);
            }
        }
        Ok(output)
    }

    /// Zero-pad and process whatever is staged.
    fn flush(&mut self) -> Result<Vec<f32>, AudioError> {
        if self.staged.is_empty() {
            return Ok(Vec::new());
        }

        let staged = self.staged.len();
        let mut chunk = std::mem::take(&mut self.staged);
        chunk.resize(self.inner.input_frames_next(), 0.0);

        let resampled = self
            .inner
            .process(&[chunk], None)
            .map_err(|e| AudioError::Resampler(e.to_string()))?;

        let expected = (staged as f64 * self.ratio).round() as usize;
        let mut output = resampled.into_iter().next().unwrap_or_default();
        output.truncate(expected);
        Ok(output)
    }

    fn reset(&mut self) {
        self.inner.reset();
        self.staged.clear();
    }
}

/// Fixed-size outbound framer.
pub struct MicFramer {
    input_rate: u32,
    frame_samples: usize,
    resampler: Option<StreamResampler>,
    pending: Vec<f32>,
}

impl MicFramer {
    /// Frame `input_rate` audio into `frame_duration` frames at `output_rate`.
    pub fn new(
        input_rate: u32,
        output_rate: u32,
        frame_duration: Duration,
    ) -> Result<Self, AudioError> {
        for rate in [input_rate, output_rate] {
            if !(MIN_SAMPLE_RATE..=MAX_SAMPLE_RATE).contains(&rate) {
                return Err(AudioError::UnsupportedSampleRate(rate));
            }
        }

        let frame_samples = (output_rate as u128 * frame_duration.as_millis() / 1000) as usize;
        if frame_samples == 0 {
            return Err(AudioError::InvalidFrameDuration(frame_duration));
        }

        let resampler = if input_rate != output_rate {
            Some(StreamResampler::new(input_rate, output_rate)?)
        } else {
            None
        };

        Ok(Self {
            input_rate,
            frame_samples,
            resampler,
            pending: Vec::with_capacity(frame_samples * 2),
        })
    }

    pub fn input_rate(&self) -> u32 {
        self.input_rate
    }

    /// Samples per emitted frame, at the output rate.
    pub fn frame_samples(&self) -> usize {
        self.frame_samples
    }

    /// Output-rate samples waiting for a full frame.
    pub fn buffered(&self) -> usize {
        self.pending.len()
    }

    /// Add captured samples; returns every frame completed by them.
    pub fn push(&mut self, samples: &[f32]) -> Result<Vec<Bytes>, AudioError> {
        match self.resampler.as_mut() {
            Some(resampler) => {
                let resampled = resampler.push(samples)?;
                self.pending.extend_from_slice(&resampled);
            }
            None => self.pending.extend_from_slice(samples),
        }
        Ok(self.drain_frames())
    }

    /// Emit all buffered audio, including a final partial frame.
    pub fn flush(&mut self) -> Result<Vec<Bytes>, AudioError> {
        if let Some(resampler) = self.resampler.as_mut() {
            let tail = resampler.flush()?;
            self.pending.extend_from_slice(&tail);
        }

        let mut frames = self.drain_frames();
        if !self.pending.is_empty() {
            frames.push(encode_pcm16(&self.pending));
            self.pending.clear();
        }
        Ok(frames)
    }

    /// Drop buffered audio without emitting it.
    pub fn clear(&mut self) {
        self.pending.clear();
        if let Some(resampler) = self.resampler.as_mut() {
            resampler.reset();
        }
    }

    fn drain_frames(&mut self) -> Vec<Bytes> {
        let complete = self.pending.len() / self.frame_samples;
        let mut frames = Vec::with_capacity(complete);
        for frame in self.pending.chunks_exact(self.frame_samples) {
            frames.push(encode_pcm16(frame));
        }
        self.pending.drain(..complete * self.frame_samples);
        frames
    }
}

impl std::fmt::Debug for MicFramer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MicFramer")
            .field("input_rate", &self.input_rate)
            .field("frame_samples", &self.frame_samples)
            .field("resampling", &self.resampler.is_some())
            .field("buffered", &self.pending.len())
            .finish()
    }
}

//! Browser/model audio plumbing.

pub mod bridge;
pub mod codec;
pub mod framer;
pub mod playback;

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

pub use bridge::{AudioBridge, AudioBridgeConfig, DEFAULT_FRAME_DURATION, PlaybackAudio};
pub use codec::{decode_f32_le, decode_pcm16, encode_f32_le, encode_pcm16, samples_to_duration};
pub use framer::{MAX_SAMPLE_RATE, MIN_SAMPLE_RATE, MicFramer};
pub use playback::{Interruption, PlaybackQueue, ScheduledChunk};

#[derive(Debug, Error)]
pub enum AudioError {
    #[error("buffer of {len} bytes is not a multiple of the {width}-byte sample width")]
    MisalignedBuffer { len: usize, width: usize },

    #[error("unsupported sample rate: {0} Hz")]
    UnsupportedSampleRate(u32),

    #[error("invalid frame duration: {0:?}")]
    InvalidFrameDuration(Duration),

    #[error("resampler error: {0}")]
    Resampler(String),
}

/// Wire encoding of mono audio exchanged with the browser.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleEncoding {
    /// Raw little-endian Float32, as produced by Web Audio.
    #[default]
    #[serde(alias = "float32")]
    F32,
    /// PCM 16-bit little-endian.
    #[serde(alias = "pcm_s16le")]
    Pcm16,
}

impl SampleEncoding {
    pub fn bytes_per_sample(&self) -> usize {
        match self {
            Self::F32 => 4,
            Self::Pcm16 => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::F32 => "f32",
            Self::Pcm16 => "pcm16",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "f32" | "float32" => Some(Self::F32),
            "pcm16" | "pcm_s16le" => Some(Self::Pcm16),
            _ => None,
        }
    }
}

/// Decoded mono samples.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioChunk {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl AudioChunk {
    pub fn decode(
        data: &[u8],
        encoding: SampleEncoding,
        sample_rate: u32,
    ) -> Result<Self, AudioError> {
        let samples = match encoding {
            SampleEncoding::F32 => decode_f32_le(data)?,
            SampleEncoding::Pcm16 => decode_pcm16(data)?,
        };
        Ok(Self {
            samples,
            sample_rate,
        })
    }

    pub fn duration(&self) -> Duration {
        samples_to_duration(self.samples.len(), self.sample_rate)
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

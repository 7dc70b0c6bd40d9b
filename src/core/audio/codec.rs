//! Sample format conversion.
//!
//! The model speaks PCM 16-bit little-endian; browsers capture and play
//! Float32. Encoding clamps to [-1.0, 1.0] before scaling, decoding divides
//! by 32768.

use bytes::{BufMut, Bytes, BytesMut};
use std::time::Duration;

use super::AudioError;

/// Scale between Float32 samples and PCM16 integers.
pub const PCM16_SCALE: f32 = 32768.0;

/// Encode Float32 samples as PCM16 little-endian.
pub fn encode_pcm16(samples: &[f32]) -> Bytes {
    let mut out = BytesMut::with_capacity(samples.len() * 2);
    for &sample in samples {
        // `as` saturates, so +1.0 maps to i16::MAX and NaN to 0.
        out.put_i16_le((sample.clamp(-1.0, 1.0) * PCM16_SCALE) as i16);
    }
    out.freeze()
}

/// Decode PCM16 little-endian bytes to Float32 samples.
pub fn decode_pcm16(data: &[u8]) -> Result<Vec<f32>, AudioError> {
    check_alignment(data, 2)?;
    Ok(data
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / PCM16_SCALE)
        .collect())
}

/// Decode raw little-endian Float32 bytes. Non-finite samples become silence.
pub fn decode_f32_le(data: &[u8]) -> Result<Vec<f32>, AudioError> {
    check_alignment(data, 4)?;
    Ok(data
        .chunks_exact(4)
        .map(|quad| {
            let sample = f32::from_le_bytes([quad[0], quad[1], quad[2], quad[3]]);
            if sample.is_finite() { sample } else { 0.0 }
        })
        .collect())
}

/// Encode Float32 samples as raw little-endian bytes.
pub fn encode_f32_le(samples: &[f32]) -> Bytes {
    let mut out = BytesMut::with_capacity(samples.len() * 4);
    for &sample in samples {
        out.put_f32_le(sample);
    }
    out.freeze()
}

/// Playback duration of `samples` mono samples at `sample_rate`.
pub fn samples_to_duration(samples: usize, sample_rate: u32) -> Duration {
    if sample_rate == 0 {
        return Duration::ZERO;
    }
    Duration::from_nanos((samples as u64).saturating_mul(1_000_000_000) / sample_rate as u64)
}

fn check_alignment(data: &[u8], width: usize) -> Result<(), AudioError> {
    if data.len() % width == 0 {
        Ok(())
    } else {
        Err(AudioError::MisalignedBuffer {
            len: data.len(),
            width,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_pcm16_scaling_and_clamping() {
        let bytes = encode_pcm16(&[0.0, 0.5, -0.5, 1.0, -1.0, 2.0, -3.0]);
        let values: Vec<i16> = bytes
            .chunks_exact(2)
            .map(|p| i16::from_le_bytes([p[0], p[1]]))
            .collect();
        assert_eq!(values, vec![0, 16384, -16384, 32767, -32768, 32767, -32768]);
    }

    #[test]
    fn test_encode_pcm16_nan_is_silence() {
        let bytes = encode_pcm16(&[f32::NAN]);
        assert_eq!(bytes.as_ref(), &[0, 0]);
    }

    #[test]
    fn test_decode_pcm16_divides_by_scale() {
        let mut data = Vec::new();
        for v in [0i16, 16384, -32768, 32767] {
            data.extend_from_slice(&v.to_le_bytes());
        }
        let samples = decode_pcm16(&data).unwrap();
        assert_eq!(samples[0], 0.0);
        assert_eq!(samples[1], 0.5);
        assert_eq!(samples[2], -1.0);
        assert!((samples[3] - 0.99997).abs() < 1e-4);
    }

    #[test]
    fn test_decode_pcm16_rejects_odd_length() {
        match decode_pcm16(&[0, 1, 2]) {
            Err(AudioError::MisalignedBuffer { len: 3, width: 2 }) => {}
            other => panic!("Expected MisalignedBuffer, got {other:?}"),
        }
    }

    #[test]
    fn test_f32_le_decoding() {
        let bytes = encode_f32_le(&[0.25, -0.75]);
        assert_eq!(decode_f32_le(&bytes).unwrap(), vec![0.25, -0.75]);

        let mut data = f32::INFINITY.to_le_bytes().to_vec();
        data.extend_from_slice(&0.1f32.to_le_bytes());
        assert_eq!(decode_f32_le(&data).unwrap(), vec![0.0, 0.1]);

        assert!(decode_f32_le(&[0, 0, 0]).is_err());
    }

    #[test]
    fn test_samples_to_duration() {
        assert_eq!(samples_to_duration(24000, 24000), Duration::from_secs(1));
        assert_eq!(samples_to_duration(2400, 24000), Duration::from_millis(100));
        assert_eq!(samples_to_duration(100, 0), Duration::ZERO);
    }
}

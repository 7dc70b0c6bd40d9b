use bytes::Bytes;
use std::time::{Duration, Instant};

use super::codec::{decode_pcm16, encode_f32_le};
use super::framer::MicFramer;
use super::playback::{Interruption, PlaybackQueue, ScheduledChunk};
use super::{AudioChunk, AudioError, SampleEncoding};
use crate::core::realtime::{OPENAI_REALTIME_SAMPLE_RATE, RealtimeAudioData};

/// Default outbound frame length.
pub const DEFAULT_FRAME_DURATION: Duration = Duration::from_millis(100);

/// Per-session audio settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioBridgeConfig {
    /// Rate of audio captured by the browser.
    pub input_sample_rate: u32,
    pub input_encoding: SampleEncoding,
    /// Format of audio played back to the browser.
    pub output_encoding: SampleEncoding,
    /// Rate the model consumes and produces.
    pub model_sample_rate: u32,
    pub frame_duration: Duration,
}

impl Default for AudioBridgeConfig {
    fn default() -> Self {
        Self {
            input_sample_rate: OPENAI_REALTIME_SAMPLE_RATE,
            input_encoding: SampleEncoding::F32,
            output_encoding: SampleEncoding::Pcm16,
            model_sample_rate: OPENAI_REALTIME_SAMPLE_RATE,
            frame_duration: DEFAULT_FRAME_DURATION,
        }
    }
}

/// Audio returned to the client for playback.
#[derive(Debug, Clone)]
pub struct PlaybackAudio {
    pub data: Bytes,
    pub scheduled: ScheduledChunk,
}

/// Moves audio between the browser and the model.
///
/// Outbound, captured audio is converted to PCM16 at the model rate and cut
/// into fixed frames. Inbound, model audio is placed on a gapless timeline
/// so a barge-in can report how much of the reply the user heard.
#[derive(Debug)]
pub struct AudioBridge {
    config: AudioBridgeConfig,
    framer: MicFramer,
    playback: PlaybackQueue,
    origin: Instant,
}

impl AudioBridge {
    pub fn new(config: AudioBridgeConfig) -> Result<Self, AudioError> {
        let framer = MicFramer::new(
            config.input_sample_rate,
            config.model_sample_rate,
            config.frame_duration,
        )?;

        Ok(Self {
            config,
            framer,
            playback: PlaybackQueue::new(),
            origin: Instant::now(),
        })
    }

    /// Time since the bridge was created; the playback clock.
    pub fn elapsed(&self) -> Duration {
        self.origin.elapsed()
    }

    /// Accept captured bytes from the client; returns frames ready for the model.
    pub fn capture(&mut self, data: &[u8]) -> Result<Vec<Bytes>, AudioError> {
        let chunk = AudioChunk::decode(
            data,
            self.config.input_encoding,
            self.config.input_sample_rate,
        )?;
        self.framer.push(&chunk.samples)
    }

    /// Flush the partial frame left at the end of capture.
    pub fn finish_capture(&mut self) -> Result<Vec<Bytes>, AudioError> {
        self.framer.flush()
    }

    /// Drop captured audio that has not been framed yet.
    pub fn discard_capture(&mut self) {
        self.framer.clear();
    }

    /// Schedule model audio and convert it for the client.
    pub fn play(&mut self, audio: &RealtimeAudioData) -> Result<PlaybackAudio, AudioError> {
        let now = self.elapsed();
        self.play_at(audio, now)
    }

    pub fn play_at(
        &mut self,
        audio: &RealtimeAudioData,
        now: Duration,
    ) -> Result<PlaybackAudio, AudioError> {
        let samples = decode_pcm16(&audio.data)?;
        let scheduled = self.playback.schedule(
            audio.item_id.as_deref(),
            samples.len(),
            audio.sample_rate,
            now,
        );

        let data = match self.config.output_encoding {
            SampleEncoding::Pcm16 => audio.data.clone(),
            SampleEncoding::F32 => encode_f32_le(&samples),
        };

        Ok(PlaybackAudio { data, scheduled })
    }

    pub fn is_playing(&self) -> bool {
        self.playback.is_playing(self.elapsed())
    }

    /// Stop playback; `None` when nothing was audible.
    pub fn interrupt(&mut self) -> Option<Interruption> {
        let now = self.elapsed();
        self.interrupt_at(now)
    }

    pub fn interrupt_at(&mut self, now: Duration) -> Option<Interruption> {
        self.playback.interrupt(now)
    }

    /// Forget all scheduled playback without reporting it.
    pub fn reset_playback(&mut self) {
        self.playback.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::audio::codec::encode_pcm16;

    fn model_audio(item: &str, samples: usize) -> RealtimeAudioData {
        RealtimeAudioData {
            data: encode_pcm16(&vec![0.25; samples]),
            sample_rate: OPENAI_REALTIME_SAMPLE_RATE,
            item_id: Some(item.to_string()),
            response_id: Some("resp_1".to_string()),
        }
    }

    #[test]
    fn test_capture_float32_to_frames() {
        let mut bridge = AudioBridge::new(AudioBridgeConfig::default()).unwrap();

        let input: Vec<u8> = std::iter::repeat_n(0.5f32.to_le_bytes(), 3000)
            .flatten()
            .collect();
        let frames = bridge.capture(&input).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].len(), 4800);

        let tail = bridge.finish_capture().unwrap();
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].len(), 1200);
    }

    #[test]
    fn test_capture_pcm16_input() {
        let mut bridge = AudioBridge::new(AudioBridgeConfig {
            input_encoding: SampleEncoding::Pcm16,
            ..Default::default()
        })
        .unwrap();

        let frames = bridge.capture(&encode_pcm16(&vec![0.1; 2400])).unwrap();
        assert_eq!(frames.len(), 1);
    }

    #[test]
    fn test_capture_rejects_misaligned_bytes() {
        let mut bridge = AudioBridge::new(AudioBridgeConfig::default()).unwrap();
        assert!(matches!(
            bridge.capture(&[0, 0, 0, 0, 0]),
            Err(AudioError::MisalignedBuffer { width: 4, .. })
        ));
    }

    #[test]
    fn test_play_schedules_and_passes_pcm16_through() {
        let mut bridge = AudioBridge::new(AudioBridgeConfig::default()).unwrap();
        let audio = model_audio("item_1", 2400);

        let first = bridge.play_at(&audio, Duration::ZERO).unwrap();
        assert_eq!(first.data, audio.data);
        let second = bridge.play_at(&audio, Duration::from_millis(5)).unwrap();
        assert_eq!(second.scheduled.start, first.scheduled.end);
    }

    #[test]
    fn test_play_as_float32() {
        let mut bridge = AudioBridge::new(AudioBridgeConfig {
            output_encoding: SampleEncoding::F32,
            ..Default::default()
        })
        .unwrap();

        let out = bridge.play_at(&model_audio("item_1", 10), Duration::ZERO).unwrap();
        assert_eq!(out.data.len(), 40);
        assert_eq!(&out.data[..4], &0.25f32.to_le_bytes());
    }

    #[test]
    fn test_interrupt_reports_item() {
        let mut bridge = AudioBridge::new(AudioBridgeConfig::default()).unwrap();
        bridge
            .play_at(&model_audio("item_9", 24000), Duration::ZERO)
            .unwrap();

        let cut = bridge.interrupt_at(Duration::from_millis(400)).unwrap();
        assert_eq!(cut.item_id.as_deref(), Some("item_9"));
        assert_eq!(cut.played_ms(), 400);
        assert!(bridge.interrupt_at(Duration::from_millis(401)).is_none());
    }

    #[test]
    fn test_invalid_input_rate() {
        assert!(
            AudioBridge::new(AudioBridgeConfig {
                input_sample_rate: 1000,
                ..Default::default()
            })
            .is_err()
        );
    }
}

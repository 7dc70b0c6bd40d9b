//! Booking WebSocket message types

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::core::audio::SampleEncoding;
use crate::core::booking::{BookingRecord, BookingSnapshot, BookingState};
use crate::core::realtime::{SpeechEvent, TranscriptResult, TranscriptRole};

/// Maximum allowed size for typed text messages (4 KB)
pub const MAX_TEXT_SIZE: usize = 4 * 1024;

/// Maximum allowed size for client-reported error messages (1 KB)
pub const MAX_ERROR_MESSAGE_SIZE: usize = 1024;

// =============================================================================
// Incoming Messages (Client -> Server)
// =============================================================================

/// Incoming WebSocket messages from the booking UI
#[derive(Debug, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BookingIncomingMessage {
    /// Connect to the model and begin a booking
    Start(StartOptions),

    /// Typed input, used instead of speech
    Text { text: String },

    /// Stop assistant playback (barge-in from the UI)
    Interrupt,

    /// Begin a new booking on the same session
    StartOver,

    /// End the session and return to idle
    Stop,

    /// The browser could not open or keep the microphone
    MicrophoneError { message: String },
}

/// Options for `start`. All optional; defaults come from server config.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct StartOptions {
    /// Assistant voice, e.g. "alloy" or "verse"
    #[serde(default)]
    pub voice: Option<String>,

    /// Sample rate of the binary microphone frames
    #[serde(default)]
    pub input_sample_rate: Option<u32>,

    /// Encoding of the binary microphone frames ("f32" or "pcm16")
    #[serde(default)]
    pub input_encoding: Option<SampleEncoding>,

    /// Encoding of binary audio sent back for playback
    #[serde(default)]
    pub output_encoding: Option<SampleEncoding>,
}

// =============================================================================
// Outgoing Messages (Server -> Client)
// =============================================================================

/// Outgoing WebSocket messages to the booking UI
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BookingOutgoingMessage {
    /// Model session is live
    SessionStarted {
        session_id: String,
        model: String,
        voice: String,
        output_sample_rate: u32,
        output_encoding: SampleEncoding,
    },

    /// Current booking state; sent on every transition
    State {
        state: BookingState,
        record: BookingRecord,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        prompt: &'static str,
    },

    /// Transcript of either party
    Transcript {
        role: TranscriptRole,
        text: String,
        is_final: bool,
    },

    /// Voice activity on the caller's side
    SpeechEvent { event: &'static str, audio_ms: u64 },

    /// Assistant playback was cut short
    Interrupted {
        #[serde(skip_serializing_if = "Option::is_none")]
        item_id: Option<String>,
        played_ms: u32,
    },

    /// Booking finished with a populated record
    BookingComplete { record: BookingRecord },

    /// The model finished a response
    ResponseDone { response_id: String },

    /// The model connection dropped and was restored
    Reconnected { attempt: u32 },

    Error { code: String, message: String },

    Closing { reason: String },
}

impl BookingOutgoingMessage {
    pub fn state(snapshot: BookingSnapshot) -> Self {
        Self::State {
            prompt: snapshot.state.prompt(),
            state: snapshot.state,
            record: snapshot.record,
            message: snapshot.message,
        }
    }

    pub fn transcript(result: TranscriptResult) -> Self {
        Self::Transcript {
            role: result.role,
            text: result.text,
            is_final: result.is_final,
        }
    }

    pub fn speech(event: &SpeechEvent) -> Self {
        match event {
            SpeechEvent::Started { audio_start_ms, .. } => Self::SpeechEvent {
                event: "started",
                audio_ms: *audio_start_ms,
            },
            SpeechEvent::Stopped { audio_end_ms, .. } => Self::SpeechEvent {
                event: "stopped",
                audio_ms: *audio_end_ms,
            },
        }
    }

    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Error {
            code: code.into(),
            message: message.into(),
        }
    }
}

// =============================================================================
// Message Routing
// =============================================================================

/// What the socket writer should send next
#[derive(Debug)]
pub enum BookingMessageRoute {
    /// JSON text message
    Outgoing(BookingOutgoingMessage),
    /// Binary playback audio
    Audio(Bytes),
    /// Close connection
    Close,
}

// =============================================================================
// Validation
// =============================================================================

/// Error type for message validation failures
#[derive(Debug, Clone, thiserror::Error)]
pub enum BookingValidationError {
    #[error("Text too large: {size} bytes (max: {max} bytes)")]
    TextTooLarge { size: usize, max: usize },

    #[error("Error message too large: {size} bytes (max: {max} bytes)")]
    ErrorMessageTooLarge { size: usize, max: usize },

    #[error("Unknown voice: {0}")]
    UnknownVoice(String),
}

impl BookingIncomingMessage {
    /// Validates user-provided fields to prevent resource exhaustion.
    pub fn validate_size(&self) -> Result<(), BookingValidationError> {
        match self {
            BookingIncomingMessage::Text { text } => {
                let size = text.len();
                if size > MAX_TEXT_SIZE {
                    return Err(BookingValidationError::TextTooLarge {
                        size,
                        max: MAX_TEXT_SIZE,
                    });
                }
            }
            BookingIncomingMessage::MicrophoneError { message } => {
                let size = message.len();
                if size > MAX_ERROR_MESSAGE_SIZE {
                    return Err(BookingValidationError::ErrorMessageTooLarge {
                        size,
                        max: MAX_ERROR_MESSAGE_SIZE,
                    });
                }
            }
            BookingIncomingMessage::Start(options) => {
                if let Some(voice) = &options.voice
                    && crate::core::realtime::openai::OpenAIRealtimeVoice::parse(voice).is_none()
                {
                    return Err(BookingValidationError::UnknownVoice(voice.clone()));
                }
            }
            BookingIncomingMessage::Interrupt
            | BookingIncomingMessage::StartOver
            | BookingIncomingMessage::Stop => {}
        }
        Ok(())
    }
}

//! OpenAI Realtime API provider.
//!
//! Full-duplex speech with the hosted model over a single WebSocket:
//! PCM16 24kHz audio in and out, server-side turn detection, input
//! transcription and function calling.

mod client;
mod config;
mod messages;

pub use client::OpenAIRealtime;
pub use config::{
    DEFAULT_REALTIME_MODEL, KNOWN_REALTIME_MODELS, OPENAI_REALTIME_SAMPLE_RATE,
    OPENAI_REALTIME_URL, OpenAIRealtimeVoice,
};
pub use messages::{ClientEvent, ConversationItem, ServerEvent, SessionConfig};

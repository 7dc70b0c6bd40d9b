//! Voice booking WebSocket
//!
//! # Protocol
//!
//! Client sends:
//! - `{"type":"start"}` with optional `voice`, `input_sample_rate`,
//!   `input_encoding` and `output_encoding`
//! - binary microphone frames (Float32 LE by default)
//! - `text`, `interrupt`, `start_over`, `stop`, `microphone_error`
//!
//! Server sends:
//! - `state` on every booking transition
//! - `session_started`, `transcript`, `speech_event`, `interrupted`,
//!   `booking_complete`, `response_done`, `reconnected`, `error`, `closing`
//! - binary assistant audio (PCM16 LE 24kHz by default)

pub mod handler;
pub mod messages;
pub mod session;

pub use handler::booking_handler;
pub use messages::{
    BookingIncomingMessage, BookingMessageRoute, BookingOutgoingMessage, BookingValidationError,
    StartOptions,
};
pub use session::{BookingSession, SessionSignal, build_realtime_config};

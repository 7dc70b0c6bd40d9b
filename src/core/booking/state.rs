//! Booking state machine.
//!
//! Tracks a booking through a fixed linear sequence of steps. Structured
//! events extracted by the realtime model (function calls) drive the
//! transitions; lifecycle operations (connect, complete, fail, reset) are
//! called by the session that owns the machine.
//!
//! # Flow
//!
//! ```text
//! Idle -> Connecting -> ListeningRef <-> ConfirmingRef -> ListeningToken <-> ConfirmingToken
//!      -> ConfirmingBooking -> Processing -> Success
//! ```
//!
//! A denial rolls back exactly one step and clears the denied field. A denied
//! final confirmation returns to `ListeningRef` with both identifiers cleared.
//! Events that do not fit the current state, or whose payload has the wrong
//! number of digits, are ignored without a transition.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use super::fulfillment::Fulfillment;

/// Number of digits in a booking reference number.
pub const REFERENCE_DIGITS: usize = 7;

/// Number of digits in a booking token number.
pub const TOKEN_DIGITS: usize = 6;

// =============================================================================
// States
// =============================================================================

/// Step of the booking flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingState {
    /// No voice session
    #[default]
    Idle,
    /// Voice session is being established
    Connecting,
    /// Waiting for the caller to say the reference number
    ListeningRef,
    /// Reference number captured, awaiting confirmation
    ConfirmingRef,
    /// Waiting for the caller to say the token number
    ListeningToken,
    /// Token number captured, awaiting confirmation
    ConfirmingToken,
    /// Both identifiers confirmed, awaiting the go-ahead
    ConfirmingBooking,
    /// Booking request in flight
    Processing,
    /// Booking completed
    Success,
    /// Terminal failure (connection or microphone)
    Error,
}

impl BookingState {
    /// Every state, in flow order.
    pub const ALL: [BookingState; 10] = [
        BookingState::Idle,
        BookingState::Connecting,
        BookingState::ListeningRef,
        BookingState::ConfirmingRef,
        BookingState::ListeningToken,
        BookingState::ConfirmingToken,
        BookingState::ConfirmingBooking,
        BookingState::Processing,
        BookingState::Success,
        BookingState::Error,
    ];

    /// Wire name of the state.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::ListeningRef => "listening_ref",
            Self::ConfirmingRef => "confirming_ref",
            Self::ListeningToken => "listening_token",
            Self::ConfirmingToken => "confirming_token",
            Self::ConfirmingBooking => "confirming_booking",
            Self::Processing => "processing",
            Self::Success => "success",
            Self::Error => "error",
        }
    }

    /// Whether a live voice session backs this state.
    pub fn is_connected(&self) -> bool {
        !matches!(self, Self::Idle | Self::Connecting | Self::Error)
    }

    /// Short instruction for the caller (and the model) at this step.
    pub fn prompt(&self) -> &'static str {
        match self {
            Self::Idle => "Start a session to book a container.",
            Self::Connecting => "Connecting to the booking assistant.",
            Self::ListeningRef => "Ask the caller for their 7-digit reference number.",
            Self::ConfirmingRef => {
                "Read the reference number back digit by digit and ask the caller to confirm it."
            }
            Self::ListeningToken => "Ask the caller for their 6-digit token number.",
            Self::ConfirmingToken => {
                "Read the token number back digit by digit and ask the caller to confirm it."
            }
            Self::ConfirmingBooking => {
                "Summarize the reference and token numbers and ask whether to proceed with the booking."
            }
            Self::Processing => "Tell the caller the booking is being processed.",
            Self::Success => {
                "Read out the container number, yard location and gate time to the caller."
            }
            Self::Error => "Apologize and tell the caller the booking could not be completed.",
        }
    }
}

impl fmt::Display for BookingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Record
// =============================================================================

/// Fields captured during a booking. All optional until set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gate_time: Option<String>,
}

impl BookingRecord {
    /// True when every field, including the fulfillment, is populated.
    pub fn is_complete(&self) -> bool {
        self.reference_number.is_some()
            && self.token_number.is_some()
            && self.container_number.is_some()
            && self.location.is_some()
            && self.gate_time.is_some()
    }

    fn clear(&mut self) {
        *self = Self::default();
    }
}

// =============================================================================
// Events and outcomes
// =============================================================================

/// Structured input extracted from the conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BookingEvent {
    SubmitReference(String),
    ConfirmReference(bool),
    SubmitToken(String),
    ConfirmToken(bool),
    ConfirmBooking(bool),
}

impl BookingEvent {
    /// Short name used in logs and ignore reasons.
    pub fn name(&self) -> &'static str {
        match self {
            Self::SubmitReference(_) => "submit_reference",
            Self::ConfirmReference(_) => "confirm_reference",
            Self::SubmitToken(_) => "submit_token",
            Self::ConfirmToken(_) => "confirm_token",
            Self::ConfirmBooking(_) => "confirm_booking",
        }
    }
}

/// Why an event produced no transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IgnoreReason {
    /// Identifier did not normalize to the expected number of digits
    MalformedPayload {
        expected_digits: usize,
        received: String,
    },
    /// Event has no transition from the current state
    UnexpectedEvent {
        state: BookingState,
        event: &'static str,
    },
}

impl fmt::Display for IgnoreReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MalformedPayload {
                expected_digits,
                received,
            } => write!(
                f,
                "expected exactly {expected_digits} digits, received '{received}'"
            ),
            Self::UnexpectedEvent { state, event } => {
                write!(f, "{event} is not accepted while {state}")
            }
        }
    }
}

/// Result of applying an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Advanced {
        from: BookingState,
        to: BookingState,
    },
    Ignored(IgnoreReason),
}

impl Transition {
    pub fn is_advanced(&self) -> bool {
        matches!(self, Self::Advanced { .. })
    }

    /// State entered by this transition, if any.
    pub fn target(&self) -> Option<BookingState> {
        match self {
            Self::Advanced { to, .. } => Some(*to),
            Self::Ignored(_) => None,
        }
    }
}

/// Lifecycle misuse. Structured events never error; they are ignored instead.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BookingError {
    #[error("cannot {operation} while {state}")]
    InvalidLifecycle {
        operation: &'static str,
        state: BookingState,
    },

    #[error("booking record is missing the {0}")]
    IncompleteRecord(&'static str),
}

// =============================================================================
// Identifier normalization
// =============================================================================

/// Normalize a spoken identifier to exactly `expected` ASCII digits.
///
/// Whitespace, hyphens and dots between digits are dropped. Anything else, or
/// a digit count other than `expected`, yields `None`.
pub fn normalize_digits(raw: &str, expected: usize) -> Option<String> {
    let mut digits = String::with_capacity(expected);
    for c in raw.chars() {
        match c {
            '0'..='9' => digits.push(c),
            ' ' | '\t' | '-' | '.' => {}
            _ => return None,
        }
    }
    (digits.len() == expected).then_some(digits)
}

// =============================================================================
// Machine
// =============================================================================

/// Snapshot of the machine suitable for sending to the UI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BookingSnapshot {
    pub state: BookingState,
    pub record: BookingRecord,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Guarded finite state machine for one booking conversation.
#[derive(Debug, Default)]
pub struct BookingStateMachine {
    state: BookingState,
    record: BookingRecord,
    error_message: Option<String>,
}

impl BookingStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> BookingState {
        self.state
    }

    pub fn record(&self) -> &BookingRecord {
        &self.record
    }

    /// User-facing message of the last failure, set only in `Error`.
    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    pub fn snapshot(&self) -> BookingSnapshot {
        BookingSnapshot {
            state: self.state,
            record: self.record.clone(),
            message: self.error_message.clone(),
        }
    }

    /// Apply a structured event from the conversation.
    pub fn apply(&mut self, event: BookingEvent) -> Transition {
        let from = self.state;
        let name = event.name();

        let to = match (from, event) {
            (BookingState::ListeningRef, BookingEvent::SubmitReference(raw)) => {
                match normalize_digits(&raw, REFERENCE_DIGITS) {
                    Some(reference) => {
                        self.record.reference_number = Some(reference);
                        BookingState::ConfirmingRef
                    }
                    None => return Self::malformed(REFERENCE_DIGITS, raw),
                }
            }
            (BookingState::ConfirmingRef, BookingEvent::ConfirmReference(true)) => {
                BookingState::ListeningToken
            }
            (BookingState::ConfirmingRef, BookingEvent::ConfirmReference(false)) => {
                self.record.reference_number = None;
                BookingState::ListeningRef
            }
            (BookingState::ListeningToken, BookingEvent::SubmitToken(raw)) => {
                match normalize_digits(&raw, TOKEN_DIGITS) {
                    Some(token) => {
                        self.record.token_number = Some(token);
                        BookingState::ConfirmingToken
                    }
                    None => return Self::malformed(TOKEN_DIGITS, raw),
                }
            }
            (BookingState::ConfirmingToken, BookingEvent::ConfirmToken(true)) => {
                BookingState::ConfirmingBooking
            }
            (BookingState::ConfirmingToken, BookingEvent::ConfirmToken(false)) => {
                self.record.token_number = None;
                BookingState::ListeningToken
            }
            (BookingState::ConfirmingBooking, BookingEvent::ConfirmBooking(true)) => {
                BookingState::Processing
            }
            (BookingState::ConfirmingBooking, BookingEvent::ConfirmBooking(false)) => {
                self.record.clear();
                BookingState::ListeningRef
            }
            (state, _) => {
                return Transition::Ignored(IgnoreReason::UnexpectedEvent { state, event: name });
            }
        };

        self.state = to;
        tracing::debug!(event = name, %from, %to, "Booking transition");
        Transition::Advanced { from, to }
    }

    fn malformed(expected_digits: usize, received: String) -> Transition {
        tracing::debug!(expected_digits, %received, "Ignoring malformed identifier");
        Transition::Ignored(IgnoreReason::MalformedPayload {
            expected_digits,
            received,
        })
    }

    /// Idle or Error -> Connecting. Clears any previous booking.
    pub fn begin_connect(&mut self) -> Result<(), BookingError> {
        self.require(&[BookingState::Idle, BookingState::Error], "connect")?;
        self.record.clear();
        self.error_message = None;
        self.state = BookingState::Connecting;
        Ok(())
    }

    /// Connecting -> ListeningRef.
    pub fn connected(&mut self) -> Result<(), BookingError> {
        self.require(&[BookingState::Connecting], "mark connected")?;
        self.state = BookingState::ListeningRef;
        Ok(())
    }

    /// Processing -> Success, storing the synthesized booking.
    pub fn complete(&mut self, fulfillment: Fulfillment) -> Result<(), BookingError> {
        self.require(&[BookingState::Processing], "complete")?;
        if self.record.reference_number.is_none() {
            return Err(BookingError::IncompleteRecord("reference number"));
        }
        if self.record.token_number.is_none() {
            return Err(BookingError::IncompleteRecord("token number"));
        }

        self.record.container_number = Some(fulfillment.container_number);
        self.record.location = Some(fulfillment.location);
        self.record.gate_time = Some(fulfillment.gate_time);
        self.state = BookingState::Success;
        Ok(())
    }

    /// Any state -> Error with a user-facing message.
    pub fn fail(&mut self, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!(from = %self.state, %message, "Booking failed");
        self.error_message = Some(message);
        self.state = BookingState::Error;
    }

    /// Connected state -> ListeningRef with a fresh record.
    pub fn start_over(&mut self) -> Result<(), BookingError> {
        if !self.state.is_connected() || self.state == BookingState::Processing {
            return Err(BookingError::InvalidLifecycle {
                operation: "start over",
                state: self.state,
            });
        }
        self.record.clear();
        self.state = BookingState::ListeningRef;
        Ok(())
    }

    /// Any state -> Idle with everything cleared.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    fn require(
        &self,
        allowed: &[BookingState],
        operation: &'static str,
    ) -> Result<(), BookingError> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(BookingError::InvalidLifecycle {
                operation,
                state: self.state,
            })
        }
    }

    #[cfg(test)]
    pub(crate) fn at(state: BookingState, record: BookingRecord) -> Self {
        Self {
            state,
            record,
            error_message: None,
        }
    }
}

//! Container booking domain: state machine, tool contract and mock backend.

pub mod fulfillment;
pub mod state;
pub mod tools;

pub use fulfillment::{DEFAULT_PROCESSING_DELAY, Fulfillment, MockFulfillment, iso6346_check_digit};
pub use state::{
    BookingError, BookingEvent, BookingRecord, BookingSnapshot, BookingState,
    BookingStateMachine, IgnoreReason, REFERENCE_DIGITS, TOKEN_DIGITS, Transition,
    normalize_digits,
};
pub use tools::{
    BOOKING_INSTRUCTIONS, ToolCallError, ToolResponse, ToolStatus, booking_tools,
    parse_function_call,
};

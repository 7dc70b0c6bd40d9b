//! Function-call contract between the model and the booking flow.
//!
//! The model never changes booking state directly. It calls one of the tools
//! below; the session turns the call into a [`BookingEvent`], applies it to
//! the state machine and returns a [`ToolResponse`] as the function output so
//! the model knows what to say next.

use serde::Serialize;
use serde_json::{Value, json};
use thiserror::Error;

use super::state::{
    BookingRecord, BookingState, BookingEvent, REFERENCE_DIGITS, TOKEN_DIGITS, Transition,
};
use crate::core::realtime::{FunctionCallRequest, ToolDefinition};

pub const SUBMIT_REFERENCE_NUMBER: &str = "submit_reference_number";
pub const CONFIRM_REFERENCE_NUMBER: &str = "confirm_reference_number";
pub const SUBMIT_TOKEN_NUMBER: &str = "submit_token_number";
pub const CONFIRM_TOKEN_NUMBER: &str = "confirm_token_number";
pub const CONFIRM_BOOKING: &str = "confirm_booking";

/// System instructions for the booking assistant.
pub const BOOKING_INSTRUCTIONS: &str = "\
You are a container terminal booking assistant speaking with a truck driver. \
Keep every reply short and friendly.

Collect two identifiers, one at a time:
1. The 7-digit booking reference number. When you hear it, call submit_reference_number. \
Then read it back digit by digit and ask the caller to confirm. Call confirm_reference_number \
with confirmed=true or confirmed=false depending on the answer.
2. The 6-digit token number. When you hear it, call submit_token_number, read it back digit by \
digit and call confirm_token_number with the caller's answer.

Then summarize both numbers and ask whether to go ahead with the booking. Call confirm_booking \
with proceed=true or proceed=false.

Every tool returns the current step in `state` and what to do next in `next`. Always follow \
`next`. If a tool returns status `ignored`, the input was not accepted: explain briefly and ask \
again. Never invent container numbers, locations or gate times; read them only from a tool \
result.";

/// Tool definitions advertised to the model.
pub fn booking_tools() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition {
            name: SUBMIT_REFERENCE_NUMBER.to_string(),
            description: format!(
                "Record the caller's {REFERENCE_DIGITS}-digit booking reference number."
            ),
            parameters: digits_schema("reference_number", REFERENCE_DIGITS),
        },
        ToolDefinition {
            name: CONFIRM_REFERENCE_NUMBER.to_string(),
            description: "Record whether the caller confirmed the reference number read back to them."
                .to_string(),
            parameters: flag_schema("confirmed", "True if the caller confirmed the number."),
        },
        ToolDefinition {
            name: SUBMIT_TOKEN_NUMBER.to_string(),
            description: format!("Record the caller's {TOKEN_DIGITS}-digit token number."),
            parameters: digits_schema("token_number", TOKEN_DIGITS),
        },
        ToolDefinition {
            name: CONFIRM_TOKEN_NUMBER.to_string(),
            description: "Record whether the caller confirmed the token number read back to them."
                .to_string(),
            parameters: flag_schema("confirmed", "True if the caller confirmed the number."),
        },
        ToolDefinition {
            name: CONFIRM_BOOKING.to_string(),
            description: "Record whether the caller wants to proceed with the booking.".to_string(),
            parameters: flag_schema("proceed", "True to place the booking, false to start over."),
        },
    ]
}

fn digits_schema(field: &str, digits: usize) -> Value {
    json!({
        "type": "object",
        "properties": {
            field: {
                "type": "string",
                "description": format!("Exactly {digits} digits, no spaces."),
            }
        },
        "required": [field],
    })
}

fn flag_schema(field: &str, description: &str) -> Value {
    json!({
        "type": "object",
        "properties": {
            field: { "type": "boolean", "description": description }
        },
        "required": [field],
    })
}

// =============================================================================
// Parsing
// =============================================================================

/// A function call that could not become a booking event.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ToolCallError {
    #[error("unknown function '{0}'")]
    UnknownFunction(String),

    #[error("invalid arguments for {name}: {reason}")]
    InvalidArguments { name: String, reason: String },
}

/// Convert a model function call into a booking event.
///
/// Identifier arguments may arrive as strings or bare numbers; both are
/// accepted and validated later by the state machine. Booleans may also
/// arrive as `"yes"`/`"no"`/`"true"`/`"false"` strings.
pub fn parse_function_call(call: &FunctionCallRequest) -> Result<BookingEvent, ToolCallError> {
    let arguments: Value = if call.arguments.trim().is_empty() {
        Value::Object(Default::default())
    } else {
        serde_json::from_str(&call.arguments).map_err(|e| ToolCallError::InvalidArguments {
            name: call.name.clone(),
            reason: e.to_string(),
        })?
    };

    match call.name.as_str() {
        SUBMIT_REFERENCE_NUMBER => {
            identifier(&call.name, &arguments, "reference_number").map(BookingEvent::SubmitReference)
        }
        CONFIRM_REFERENCE_NUMBER => {
            flag(&call.name, &arguments, "confirmed").map(BookingEvent::ConfirmReference)
        }
        SUBMIT_TOKEN_NUMBER => {
            identifier(&call.name, &arguments, "token_number").map(BookingEvent::SubmitToken)
        }
        CONFIRM_TOKEN_NUMBER => {
            flag(&call.name, &arguments, "confirmed").map(BookingEvent::ConfirmToken)
        }
        CONFIRM_BOOKING => flag(&call.name, &arguments, "proceed").map(BookingEvent::ConfirmBooking),
        other => Err(ToolCallError::UnknownFunction(other.to_string())),
    }
}

fn identifier(name: &str, arguments: &Value, field: &str) -> Result<String, ToolCallError> {
    match arguments.get(field) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(Value::Number(n)) => Ok(n.to_string()),
        Some(other) => Err(invalid(name, format!("{field} must be a string, got {other}"))),
        None => Err(invalid(name, format!("missing {field}"))),
    }
}

fn flag(name: &str, arguments: &Value, field: &str) -> Result<bool, ToolCallError> {
    match arguments.get(field) {
        Some(Value::Bool(b)) => Ok(*b),
        Some(Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" => Ok(true),
            "false" | "no" => Ok(false),
            _ => Err(invalid(name, format!("{field} must be a boolean, got '{s}'"))),
        },
        Some(other) => Err(invalid(name, format!("{field} must be a boolean, got {other}"))),
        None => Err(invalid(name, format!("missing {field}"))),
    }
}

fn invalid(name: &str, reason: String) -> ToolCallError {
    ToolCallError::InvalidArguments {
        name: name.to_string(),
        reason,
    }
}

// =============================================================================
// Function results
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    /// The call advanced the booking
    Ok,
    /// The call was valid JSON but did not fit the current step
    Ignored,
    /// The call could not be parsed
    Error,
}

/// JSON body returned to the model as the function output.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolResponse {
    pub status: ToolStatus,
    pub state: BookingState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub record: BookingRecord,
    pub next: &'static str,
}

impl ToolResponse {
    /// Response for an applied event.
    pub fn from_transition(
        transition: &Transition,
        state: BookingState,
        record: &BookingRecord,
    ) -> Self {
        let (status, reason) = match transition {
            Transition::Advanced { .. } => (ToolStatus::Ok, None),
            Transition::Ignored(reason) => (ToolStatus::Ignored, Some(reason.to_string())),
        };
        Self {
            status,
            state,
            reason,
            record: record.clone(),
            next: state.prompt(),
        }
    }

    /// Response for a call that never reached the state machine.
    pub fn rejected(error: &ToolCallError, state: BookingState, record: &BookingRecord) -> Self {
        Self {
            status: ToolStatus::Error,
            state,
            reason: Some(error.to_string()),
            record: record.clone(),
            next: state.prompt(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| r#"{"status":"error"}"#.to_string())
    }
}

use axum::{Json, extract::State};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

use crate::core::booking::{BOOKING_INSTRUCTIONS, booking_tools};
use crate::core::realtime::ToolDefinition;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub active_sessions: usize,
    pub realtime_configured: bool,
}

/// Liveness probe. Reports whether a realtime API key is configured.
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "OK",
        version: env!("CARGO_PKG_VERSION"),
        active_sessions: state.ws_connection_count(),
        realtime_configured: state.config.openai_api_key.is_some(),
    })
}

#[derive(Debug, Serialize)]
pub struct ToolsResponse {
    pub model: String,
    pub instructions: &'static str,
    pub tools: Vec<ToolDefinition>,
}

/// Tool contract and instructions sent to the model for every booking session.
pub async fn list_tools(State(state): State<Arc<AppState>>) -> Json<ToolsResponse> {
    Json(ToolsResponse {
        model: state.config.realtime_model.clone(),
        instructions: BOOKING_INSTRUCTIONS,
        tools: booking_tools(),
    })
}

/// Booking states with the prompt the assistant follows in each.
pub async fn list_states() -> Json<Value> {
    let states: Vec<Value> = crate::core::booking::BookingState::ALL
        .iter()
        .map(|state| {
            serde_json::json!({
                "state": state,
                "prompt": state.prompt(),
            })
        })
        .collect();
    Json(Value::Array(states))
}

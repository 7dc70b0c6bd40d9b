//! Booking WebSocket route configuration

use axum::{Router, middleware, routing::get};
use tower_http::trace::TraceLayer;

use crate::handlers::booking::booking_handler;
use crate::middleware::connection_limit_middleware;
use crate::state::AppState;
use std::sync::Arc;

/// Create the booking WebSocket router
///
/// # Endpoint
///
/// `GET /booking` - WebSocket upgrade for a voice booking session
///
/// # Example
///
/// ```json
/// // Client starts a booking
/// {"type": "start", "voice": "verse", "input_sample_rate": 48000}
///
/// // Server responds
/// {"type": "state", "state": "connecting", "record": {}, "prompt": "..."}
/// {"type": "session_started", "session_id": "...", "model": "...", "voice": "verse", ...}
/// {"type": "state", "state": "listening_ref", "record": {}, "prompt": "..."}
///
/// // Client streams microphone audio as binary frames
/// // Server streams assistant audio back as binary frames
/// ```
pub fn create_booking_router(state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .route("/booking", get(booking_handler))
        .layer(middleware::from_fn_with_state(
            state,
            connection_limit_middleware,
        ))
        .layer(TraceLayer::new_for_http())
}

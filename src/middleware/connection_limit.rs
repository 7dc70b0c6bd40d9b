//! Connection limit middleware for the booking WebSocket
//!
//! Enforces the global WebSocket limit and the per-IP limit before the
//! upgrade is accepted.
//!
//! # Example
//!
//! ```ignore
//! use axum::Router;
//! use booking_voice_gateway::middleware::connection_limit_middleware;
//!
//! let app = Router::new()
//!     .route("/booking", get(booking_handler))
//!     .layer(axum::middleware::from_fn_with_state(
//!         state.clone(),
//!         connection_limit_middleware,
//!     ));
//! ```

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::Request,
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use crate::errors::AppError;
use crate::state::AppState;

/// Extension type to carry the client IP through to the handler
/// so the handler can release the connection when done.
#[derive(Clone, Copy, Debug)]
pub struct ClientIp(pub IpAddr);

/// Middleware that enforces connection limits for WebSocket connections.
///
/// Returns 503 when the global limit is exceeded and 429 when the per-IP
/// limit is exceeded. On success the `ClientIp` extension is injected and the
/// handler owns releasing the slot.
///
/// Non-upgrade requests pass through without limit checks.
pub async fn connection_limit_middleware(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let is_ws_upgrade = request
        .headers()
        .get("upgrade")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);

    if !is_ws_upgrade {
        return next.run(request).await;
    }

    let client_ip = addr.ip();

    match state.try_acquire_connection(client_ip) {
        Ok(()) => {
            request.extensions_mut().insert(ClientIp(client_ip));
            let response = next.run(request).await;
            // A failed upgrade never reaches the socket task, so give the slot back.
            if !response.status().is_informational() {
                state.release_connection(client_ip);
            }
            response
        }
        Err(e) => {
            tracing::warn!(ip = %client_ip, reason = %e, "Rejecting booking connection");
            AppError::from(e).into_response()
        }
    }
}

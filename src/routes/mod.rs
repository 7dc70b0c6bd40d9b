pub mod api;
pub mod booking;

use axum::{Router, http::Uri, routing::get};
use std::sync::Arc;

use crate::errors::AppError;
use crate::handlers::api::health_check;
use crate::state::AppState;

/// Assemble every route with its per-route middleware.
///
/// Connections must be served with
/// `into_make_service_with_connect_info::<SocketAddr>()`; the connection
/// limit needs the peer address.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(health_check))
        .merge(api::create_api_router())
        .merge(booking::create_booking_router(state.clone()))
        .fallback(not_found)
        .with_state(state)
}

async fn not_found(uri: Uri) -> AppError {
    AppError::NotFound(uri.path().to_string())
}

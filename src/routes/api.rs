use axum::{Router, routing::get};
use tower_http::trace::TraceLayer;

use crate::handlers::api;
use crate::state::AppState;
use std::sync::Arc;

/// Create the REST router
///
/// - `GET /api/tools` - tool definitions and instructions given to the model
/// - `GET /api/states` - booking states and their prompts
pub fn create_api_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/tools", get(api::list_tools))
        .route("/api/states", get(api::list_states))
        .layer(TraceLayer::new_for_http())
}

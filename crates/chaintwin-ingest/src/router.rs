//! Axum router construction for the read API.

use std::sync::Arc;

use axum::Router;
use axum::routing::get;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::handlers;
use crate::state::AppState;

/// Build the read API router.
///
/// - `GET /health` -- liveness and cache connection state
/// - `GET /api/nodes/{id}` -- a single node
/// - `GET /api/simulations/{scenario}/{hash}` -- a cached simulation result
/// - `GET /api/twin/latest` -- the newest live twin snapshot
/// - `GET /api/alerts` -- recent alerts (in-memory alert channel only)
pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handlers::health))
        .route("/api/nodes/{id}", get(handlers::get_node))
        .route(
            "/api/simulations/{scenario}/{hash}",
            get(handlers::get_simulation),
        )
        .route("/api/twin/latest", get(handlers::get_latest_twin))
        .route("/api/alerts", get(handlers::list_alerts))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

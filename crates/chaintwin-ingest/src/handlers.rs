//! Read API handlers.
//!
//! All endpoints are read-only. Writes enter the twin exclusively through
//! the NATS intake.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use chaintwin_types::NodeId;

use crate::error::ApiError;
use crate::state::AppState;

// ---------------------------------------------------------------------------
// GET /health
// ---------------------------------------------------------------------------

/// Liveness probe with cache connection state.
pub async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "cacheConnected": state.cache.is_connected(),
    }))
}

// ---------------------------------------------------------------------------
// GET /api/nodes/{id}
// ---------------------------------------------------------------------------

/// A single node, read through the cache.
pub async fn get_node(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let node_id = NodeId::new(id).map_err(|e| ApiError::BadRequest(e.to_string()))?;
    let node = state
        .repository
        .get_node(&node_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("node {node_id}")))?;
    Ok(Json(node))
}

// ---------------------------------------------------------------------------
// GET /api/simulations/{scenario}/{hash}
// ---------------------------------------------------------------------------

/// A cached simulation result.
pub async fn get_simulation(
    State(state): State<Arc<AppState>>,
    Path((scenario_id, result_hash)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let entry = state
        .cache
        .get_simulation_entry(&scenario_id, &result_hash)
        .await?
        .ok_or_else(|| {
            ApiError::NotFound(format!("simulation {scenario_id}/{result_hash}"))
        })?;
    Ok(Json(entry))
}

// ---------------------------------------------------------------------------
// GET /api/twin/latest
// ---------------------------------------------------------------------------

/// The newest live twin snapshot.
pub async fn get_latest_twin(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, ApiError> {
    let snapshot = state
        .cache
        .get_latest_digital_twin_state()
        .await?
        .ok_or_else(|| ApiError::NotFound(String::from("no live twin snapshot")))?;
    Ok(Json(snapshot))
}

// ---------------------------------------------------------------------------
// GET /api/alerts
// ---------------------------------------------------------------------------

/// Recent alerts, newest first.
pub async fn list_alerts(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, ApiError> {
    let store = state.alerts.as_ref().ok_or_else(|| {
        ApiError::NotFound(String::from("alerts are not retained by this service"))
    })?;
    let store = store.lock().await;
    Ok(Json(serde_json::json!({
        "count": store.len(),
        "alerts": store.all(),
    })))
}

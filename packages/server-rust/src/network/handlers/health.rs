//! Health, liveness, and readiness endpoint handlers.
//!
//! These handlers expose server health information for orchestrators
//! (Kubernetes, load balancers) and operational monitoring.

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde_json::json;

use super::AppState;

/// Returns detailed health information as JSON.
///
/// Always returns 200 -- the `state` field in the response body indicates
/// whether the server is actually healthy, and the `cache` object shows
/// which snapshot generation requests are being served from.
pub async fn health_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    let health = state.lifecycle.health();
    let in_flight = state.lifecycle.in_flight();
    let uptime_secs = state.start_time.elapsed().as_secs();

    let view = state.cache.current_snapshots();
    let pair = view.pair();

    Json(json!({
        "state": health.as_str(),
        "in_flight": in_flight,
        "uptime_secs": uptime_secs,
        "cache": {
            "generation": pair.generation,
            "refreshed_at": pair.refreshed_at,
            "refresh_state": state.cache.refresh_state().as_str(),
            "flush_pending": state.cache.flush_pending(),
            "eligible": pair.eligible.len(),
            "operator": pair.operator.len(),
        },
    }))
}

/// Kubernetes liveness probe -- always returns 200 OK.
///
/// The liveness probe only checks whether the process is running and
/// responsive. It intentionally does not check the cache or health state,
/// because a failed liveness probe triggers a pod restart.
pub async fn liveness_handler() -> StatusCode {
    StatusCode::OK
}

/// Kubernetes readiness probe -- returns 200 when ready, 503 otherwise.
///
/// Returns 503 during startup, while warming (no snapshot installed yet),
/// during graceful shutdown, and after stop.
pub async fn readiness_handler(State(state): State<AppState>) -> StatusCode {
    if state.lifecycle.is_ready() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

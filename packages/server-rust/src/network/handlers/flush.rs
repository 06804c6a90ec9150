//! Operator-triggered refresh.

use axum::extract::State;
use axum::Json;
use serde_json::json;
use tracing::{info, warn};

use super::AppState;

/// `POST /flush`: refreshes the cache and waits for the new snapshot.
///
/// Always 200. The body reports the generation now being served, which is
/// unchanged when the refresh failed.
pub async fn flush_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    match state.cache.refresh_now().await {
        Ok(summary) => info!(
            generation = summary.generation,
            eligible = summary.eligible,
            operator = summary.operator,
            "flush installed new snapshots"
        ),
        Err(e) => warn!(error = %e, "flush did not install new snapshots"),
    }

    let generation = state.cache.current_snapshots().pair().generation;
    Json(json!({ "generation": generation }))
}

//! Server statistics endpoint

use axum::extract::State;
use axum::Json;

use crate::state::AppState;
use crate::stats::StatsSnapshot;

pub async fn get_stats(State(state): State<AppState>) -> Json<StatsSnapshot> {
    tracing::debug!("serving stats snapshot");
    Json(state.stats().snapshot())
}

use std::sync::Arc;

use axum::{Json, extract::State};
use serde_json::json;

use crate::router::AppState;

pub async fn health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "activeJobs": state.scheduler.active_count(),
        "waitingJobs": state.scheduler.waiting_count().await,
    }))
}

use std::sync::Arc;

use archivist_common::error::ArchivistError;
use archivist_lifecycle::DeadLetter;
use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use tracing::info;

use crate::{error::ApiError, router::AppState};

pub async fn list_dead_letters(State(state): State<Arc<AppState>>) -> Json<Vec<DeadLetter>> {
    Json(state.sweeper.dead_letters().await)
}

/// Returns a dead-lettered dataset to the expiration sweep.
pub async fn clear_dead_letter(
    State(state): State<Arc<AppState>>,
    Path(dataset_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    if !state.sweeper.clear_dead_letter(&dataset_id).await {
        return Err(ApiError(ArchivistError::RecordNotFound(format!(
            "{dataset_id} is not dead-lettered"
        ))));
    }
    info!(dataset_id = %dataset_id, "dead letter cleared");
    Ok(StatusCode::NO_CONTENT)
}

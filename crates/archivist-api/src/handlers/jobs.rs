use std::sync::Arc;

use archivist_common::types::JobId;
use archivist_jobs::Job;
use axum::{
    Json,
    extract::{Path, State},
};

use crate::{error::ApiError, router::AppState};

pub async fn list_jobs(State(state): State<Arc<AppState>>) -> Result<Json<Vec<Job>>, ApiError> {
    Ok(Json(state.scheduler.list_jobs().await?))
}

pub async fn get_job(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<u64>,
) -> Result<Json<Job>, ApiError> {
    Ok(Json(state.scheduler.get_job(JobId(job_id)).await?))
}

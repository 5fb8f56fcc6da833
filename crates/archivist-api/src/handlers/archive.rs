use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use serde_json::json;

use crate::{error::ApiError, gateway::Retrieval, router::AppState};

pub async fn get_archive(
    State(state): State<Arc<AppState>>,
    Path(dataset_id): Path<String>,
) -> Result<Response, ApiError> {
    let create = format!("/archive/{dataset_id}");
    let response = match state.gateway.get(&dataset_id).await? {
        Retrieval::Available { url, .. } => {
            (StatusCode::FOUND, [(header::LOCATION, url)]).into_response()
        }
        Retrieval::Processing { job_id } => (
            StatusCode::ACCEPTED,
            Json(json!({
                "status": "processing",
                "message": "Archive is being created",
                "jobId": job_id,
                "poll": job_id.map(|id| format!("/jobs/{id}")),
            })),
        )
            .into_response(),
        Retrieval::NotAvailable => (
            StatusCode::NOT_FOUND,
            Json(json!({
                "status": "not_available",
                "message": "No archive exists for this dataset",
                "create": create,
            })),
        )
            .into_response(),
        Retrieval::Expired => (
            StatusCode::GONE,
            Json(json!({
                "status": "expired",
                "message": "Archive has expired",
                "create": create,
            })),
        )
            .into_response(),
        Retrieval::Failed { error } => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({
                "status": "failed",
                "error": error,
                "retry": create,
            })),
        )
            .into_response(),
    };
    Ok(response)
}

pub async fn create_archive(
    State(state): State<Arc<AppState>>,
    Path(dataset_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let outcome = state.gateway.create(&dataset_id).await?;
    Ok(Json(json!({
        "jobId": outcome.job_id,
        "status": outcome.status,
        "existing": outcome.existing,
    })))
}

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::Deserialize;

use crate::{error::ApiError, router::AppState};

#[derive(Debug, Deserialize)]
pub struct LinkQuery {
    pub expires: i64,
    pub signature: String,
}

/// Serves a stored archive behind a signed link.
pub async fn download_object(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
    Query(link): Query<LinkQuery>,
) -> Result<Response, ApiError> {
    state.signer.verify(&key, link.expires, &link.signature)?;
    let (info, body) = state.object_layer.get_object(&state.bucket, &key).await?;
    let file_name = key.rsplit('/').next().unwrap_or(key.as_str());

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, info.content_type),
            (header::CONTENT_LENGTH, info.size.to_string()),
            (header::ETAG, format!("\"{}\"", info.etag)),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{file_name}\""),
            ),
        ],
        body,
    )
        .into_response())
}

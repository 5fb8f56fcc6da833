use archivist_common::error::ArchivistError;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};

pub struct ApiError(pub ArchivistError);

impl From<ArchivistError> for ApiError {
    fn from(value: ArchivistError) -> Self {
        Self(value)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0 {
            ArchivistError::RecordNotFound(_)
            | ArchivistError::JobNotFound(_)
            | ArchivistError::BucketNotFound(_)
            | ArchivistError::ObjectNotFound { .. } => StatusCode::NOT_FOUND,
            ArchivistError::AccessDenied(_) => StatusCode::FORBIDDEN,
            ArchivistError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            ArchivistError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            ArchivistError::Network(_) | ArchivistError::StorageProvider(_) => {
                StatusCode::BAD_GATEWAY
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        (
            status,
            Json(serde_json::json!({
                "code": self.0.code(),
                "message": self.0.to_string(),
            })),
        )
            .into_response()
    }
}

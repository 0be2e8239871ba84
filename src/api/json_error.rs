use axum::{
    extract::rejection::BytesRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use validator::ValidationErrors;

/// Rejection of a [`ValidatedJson`](crate::api::validated_json::ValidatedJson) body.
#[derive(Debug, thiserror::Error)]
pub enum JsonError {
    #[error("Failed to read request body")]
    Body(#[from] BytesRejection),
    #[error("Invalid JSON: {0}")]
    InvalidJson(serde_json::Error),
    #[error("Validation error")]
    ValidationError(ValidationErrors),
}

impl IntoResponse for JsonError {
    fn into_response(self) -> Response {
        match self {
            Self::Body(rejection) => rejection.into_response(),
            Self::InvalidJson(e) => (
                StatusCode::BAD_REQUEST,
                Json(json!({
                    "error": "invalid_json",
                    "message": e.to_string(),
                })),
            )
                .into_response(),
            Self::ValidationError(errors) => (
                StatusCode::BAD_REQUEST,
                Json(json!({
                    "error": "validation_failed",
                    "fields": errors,
                })),
            )
                .into_response(),
        }
    }
}

//! `ApiError`: maps `vt_core::Error` (plus this crate's own request-validation errors)
//! to the HTTP status codes spec.md §7's error table specifies, and a JSON
//! `{"error": "...", "details"?: "..."}` body (spec §7 "user-visible failure behavior").

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Core(#[from] vt_core::Error),

    #[error("{0}")]
    BadRequest(String),
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Core(error) => match error {
                vt_core::Error::InvalidArgument(_) => StatusCode::BAD_REQUEST,
                vt_core::Error::SessionNotFound(_) => StatusCode::NOT_FOUND,
                vt_core::Error::RemoteNotFound(_) => StatusCode::NOT_FOUND,
                vt_core::Error::SessionNotRunning(_) => StatusCode::BAD_REQUEST,
                vt_core::Error::SessionBusy(_) => StatusCode::CONFLICT,
                vt_core::Error::SpawnFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
                vt_core::Error::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
                vt_core::Error::RemoteUnreachable(_) => StatusCode::SERVICE_UNAVAILABLE,
                vt_core::Error::UpstreamStatus { status, .. } => {
                    StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
                }
                // Client disconnect; only reachable if a handler propagates it instead
                // of closing silently (spec §7 "Cancelled: silent close").
                vt_core::Error::Cancelled => StatusCode::from_u16(499).unwrap(),
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match &self {
            ApiError::Core(vt_core::Error::UpstreamStatus { body, .. }) if !body.is_empty() => {
                ErrorBody { error: self.to_string(), details: Some(body.clone()) }
            }
            _ => ErrorBody { error: self.to_string(), details: None },
        };
        (status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

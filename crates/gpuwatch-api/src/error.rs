use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::http::StatusCode as HttpStatus;
use axum::response::{IntoResponse, Response};
use axum::Json;
use gpuwatch_common::GpuWatchError;

use crate::types::ErrorBody;

/// A daemon error rendered as `{status, message}`.
#[derive(Debug)]
pub struct ApiError(pub GpuWatchError);

impl From<GpuWatchError> for ApiError {
    fn from(e: GpuWatchError) -> Self {
        ApiError(e)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(e: JsonRejection) -> Self {
        ApiError(GpuWatchError::BadParameter(e.body_text()))
    }
}

impl From<QueryRejection> for ApiError {
    fn from(e: QueryRejection) -> Self {
        ApiError(GpuWatchError::BadParameter(e.body_text()))
    }
}

pub fn http_status(e: &GpuWatchError) -> HttpStatus {
    match e {
        GpuWatchError::InvalidHandle => HttpStatus::UNAUTHORIZED,
        GpuWatchError::BadParameter(_) => HttpStatus::BAD_REQUEST,
        GpuWatchError::NotFound(_) => HttpStatus::NOT_FOUND,
        GpuWatchError::Conflict(_) | GpuWatchError::AlreadyExists(_) => HttpStatus::CONFLICT,
        GpuWatchError::ResourceExhausted(_) => HttpStatus::TOO_MANY_REQUESTS,
        GpuWatchError::NotSupported(_) => HttpStatus::NOT_IMPLEMENTED,
        GpuWatchError::PermissionDenied(_) => HttpStatus::FORBIDDEN,
        GpuWatchError::Telemetry(_) => HttpStatus::BAD_GATEWAY,
        GpuWatchError::Timeout(_) => HttpStatus::GATEWAY_TIMEOUT,
        GpuWatchError::Transport { .. } | GpuWatchError::Remote { .. } => HttpStatus::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = http_status(&self.0);
        tracing::warn!(target: "api", code = self.0.code().0, error = %self.0, "request rejected");
        let body = ErrorBody { status: self.0.code(), message: self.0.to_string() };
        (status, Json(body)).into_response()
    }
}

//! Maps `CoreError` onto HTTP status codes and JSON error bodies.
//!
//! One variant per row of the core error taxonomy; gRPC statuses (`grpc.rs`)
//! use the same mapping via `grpc_code` below.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use codecortex_core::error::CoreError;
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
}

pub struct ApiError(pub CoreError);

impl From<CoreError> for ApiError {
    fn from(e: CoreError) -> Self {
        Self(e)
    }
}

fn status_for(e: &CoreError) -> StatusCode {
    match e {
        CoreError::Validation(_) => StatusCode::BAD_REQUEST,
        CoreError::NotFound(_) => StatusCode::NOT_FOUND,
        CoreError::Conflict(_) => StatusCode::CONFLICT,
        CoreError::CapacityExceeded(_) => StatusCode::TOO_MANY_REQUESTS,
        CoreError::Throttled(_) => StatusCode::TOO_MANY_REQUESTS,
        CoreError::TransientExternal(_) => StatusCode::SERVICE_UNAVAILABLE,
        CoreError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn kind_for(e: &CoreError) -> &'static str {
    match e {
        CoreError::Validation(_) => "validation",
        CoreError::NotFound(_) => "not_found",
        CoreError::Conflict(_) => "conflict",
        CoreError::CapacityExceeded(_) => "capacity_exceeded",
        CoreError::Throttled(_) => "throttled",
        CoreError::TransientExternal(_) => "transient_external",
        CoreError::Internal(_) => "internal",
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self.0, "internal error");
        }
        let body = ErrorBody { error: kind_for(&self.0).to_string(), message: self.0.to_string() };
        let mut response = (status, Json(body)).into_response();
        if matches!(self.0, CoreError::Throttled(_)) {
            response.headers_mut().insert("Retry-After", axum::http::HeaderValue::from_static("1"));
        }
        response
    }
}

/// gRPC status code for each error variant (spec §7 table).
pub fn grpc_code(e: &CoreError) -> tonic::Code {
    match e {
        CoreError::Validation(_) => tonic::Code::InvalidArgument,
        CoreError::NotFound(_) => tonic::Code::NotFound,
        CoreError::Conflict(_) => tonic::Code::AlreadyExists,
        CoreError::CapacityExceeded(_) => tonic::Code::ResourceExhausted,
        CoreError::Throttled(_) => tonic::Code::ResourceExhausted,
        CoreError::TransientExternal(_) => tonic::Code::Unavailable,
        CoreError::Internal(_) => tonic::Code::Internal,
    }
}

pub fn to_status(e: CoreError) -> tonic::Status {
    let code = grpc_code(&e);
    tonic::Status::new(code, e.to_string())
}

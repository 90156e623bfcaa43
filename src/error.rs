use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::sequence::SequenceError;

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: ErrorObject,
}

#[derive(Debug, Serialize)]
pub struct ErrorObject {
    pub code: String,
    pub message: String,
}

#[derive(Debug)]
pub enum ApiError {
    Unauthorized(&'static str, String),
    BadRequest(&'static str, String),
    NotFound(&'static str, String),
    Conflict(&'static str, String),
    Unavailable(&'static str, String),
    Internal(&'static str, String),
}

impl ApiError {
    pub fn session_expired() -> Self {
        ApiError::Unauthorized("SESSION_EXPIRED", "Session expired".into())
    }

    pub fn validation(message: impl Into<String>) -> Self {
        ApiError::BadRequest("VALIDATION_ERROR", message.into())
    }

    pub fn code(&self) -> &'static str {
        match self {
            ApiError::Unauthorized(code, _)
            | ApiError::BadRequest(code, _)
            | ApiError::NotFound(code, _)
            | ApiError::Conflict(code, _)
            | ApiError::Unavailable(code, _)
            | ApiError::Internal(code, _) => code,
        }
    }

    fn to_error_response(code: &str, message: &str) -> Json<ErrorResponse> {
        Json(ErrorResponse {
            error: ErrorObject {
                code: code.to_string(),
                message: message.to_string(),
            },
        })
    }
}

impl From<SequenceError> for ApiError {
    fn from(err: SequenceError) -> Self {
        match err {
            SequenceError::OutOfRange { .. } => {
                ApiError::BadRequest("SEQUENCE_OUT_OF_RANGE", err.to_string())
            }
            SequenceError::InvalidRequest(msg) => ApiError::BadRequest("VALIDATION_ERROR", msg),
            SequenceError::NotFound(_) => ApiError::NotFound("NOT_FOUND", "case not found".into()),
            SequenceError::Concurrent(msg) => ApiError::Conflict("CONCURRENT_CHANGE", msg),
            SequenceError::StoreUnavailable(_) => ApiError::Unavailable(
                "STORE_UNAVAILABLE",
                "The case store could not be reached; nothing was changed".into(),
            ),
            SequenceError::PartialFailure { applied, .. } => ApiError::Internal(
                "SEQUENCE_PARTIAL_FAILURE",
                format!(
                    "An error occurred after {applied} writes; recompact the date to restore numbering"
                ),
            ),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, msg) = match self {
            ApiError::Unauthorized(code, msg) => (StatusCode::UNAUTHORIZED, code, msg),
            ApiError::BadRequest(code, msg) => (StatusCode::BAD_REQUEST, code, msg),
            ApiError::NotFound(code, msg) => (StatusCode::NOT_FOUND, code, msg),
            ApiError::Conflict(code, msg) => (StatusCode::CONFLICT, code, msg),
            ApiError::Unavailable(code, msg) => (StatusCode::SERVICE_UNAVAILABLE, code, msg),
            ApiError::Internal(code, msg) => (StatusCode::INTERNAL_SERVER_ERROR, code, msg),
        };
        (status, ApiError::to_error_response(code, &msg)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreError;

    #[test]
    fn maps_sequence_errors_to_codes() {
        let cases = [
            (
                SequenceError::OutOfRange { requested: 9, max: 3 },
                "SEQUENCE_OUT_OF_RANGE",
                StatusCode::BAD_REQUEST,
            ),
            (
                SequenceError::NotFound(uuid::Uuid::nil()),
                "NOT_FOUND",
                StatusCode::NOT_FOUND,
            ),
            (
                SequenceError::StoreUnavailable(StoreError::Unavailable("down".into())),
                "STORE_UNAVAILABLE",
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                SequenceError::PartialFailure {
                    applied: 2,
                    source: StoreError::Unavailable("down".into()),
                },
                "SEQUENCE_PARTIAL_FAILURE",
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];

        for (err, code, status) in cases {
            let api: ApiError = err.into();
            assert_eq!(api.code(), code);
            assert_eq!(api.into_response().status(), status);
        }
    }
}

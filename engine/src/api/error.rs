//! HTTP error responses
//!
//! Every non-2xx response carries an [`ErrorBody`]. Client errors echo the
//! error text, which only ever describes the request. Server errors only
//! carry the status reason and the scrubbed hint; the full text (container
//! runtime output, worker response bodies) goes to the log.

use axum::{
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use sdk::errors::{EngineError, SlapeErrorExt};
use sdk::types::ErrorBody;

/// Result type for handlers
pub type ApiResult<T> = Result<T, ApiError>;

/// An error on its way to becoming a response
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub body: ErrorBody,
}

impl ApiError {
    pub fn new(status: StatusCode, error: impl Into<String>, hint: impl Into<String>) -> Self {
        Self {
            status,
            body: ErrorBody {
                error: error.into(),
                hint: hint.into(),
            },
        }
    }

    /// 422 for a body that is not valid JSON for the route
    pub fn malformed(rejection: JsonRejection) -> Self {
        Self::new(
            StatusCode::UNPROCESSABLE_ENTITY,
            rejection.body_text(),
            "Error unexpected request format",
        )
    }
}

/// HTTP status for an engine error
pub fn status_for(err: &EngineError) -> StatusCode {
    match err {
        EngineError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        EngineError::SessionBusy
        | EngineError::NotSetUp
        | EngineError::AlreadySetUp
        | EngineError::InvalidTransition { .. } => StatusCode::CONFLICT,
        EngineError::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
        EngineError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        let status = status_for(&err);
        let error = if status.is_client_error() {
            err.to_string()
        } else {
            status
                .canonical_reason()
                .unwrap_or("Internal Server Error")
                .to_string()
        };

        Self::new(status, error, err.user_hint())
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::malformed(rejection)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            status_for(&EngineError::InvalidRequest("x".to_string())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(status_for(&EngineError::SessionBusy), StatusCode::CONFLICT);
        assert_eq!(status_for(&EngineError::NotSetUp), StatusCode::CONFLICT);
        assert_eq!(status_for(&EngineError::AlreadySetUp), StatusCode::CONFLICT);
        assert_eq!(
            status_for(&EngineError::DeadlineExceeded),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            status_for(&EngineError::Generation("boom".to_string())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_server_errors_hide_driver_text() {
        let err = EngineError::WorkerStart {
            index: 0,
            reason: "driver failed programming external connectivity on 0.0.0.0:8000".to_string(),
        };

        let api: ApiError = err.into();

        assert_eq!(api.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!api.body.error.contains("0.0.0.0"));
        assert!(!api.body.hint.contains("0.0.0.0"));
    }

    #[test]
    fn test_client_errors_echo_the_problem() {
        let api: ApiError =
            EngineError::InvalidRequest("'maybe' is not a valid boolean for 'thinking'".to_string())
                .into();

        assert!(api.body.error.contains("thinking"));
        assert_eq!(api.body.hint, "Error unexpected request format");
    }
}

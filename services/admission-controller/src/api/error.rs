//! RFC 7807 problem responses.

use axum::{
    extract::rejection::JsonRejection,
    http::{header::CONTENT_TYPE, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use tracing::error;

use crate::error::ControllerError;
use crate::store::StoreError;

#[derive(Debug, Serialize)]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub r#type: String,
    pub title: String,
    pub status: u16,
    pub detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    pub code: String,
    pub request_id: String,
    pub retryable: bool,
    pub retry_after_seconds: u32,
}

impl ProblemDetails {
    fn new(status: StatusCode, code: impl Into<String>, detail: impl Into<String>) -> Self {
        let code = code.into();
        let title = status
            .canonical_reason()
            .unwrap_or("Unknown Error")
            .to_string();
        Self {
            r#type: format!("urn:admitq:problem:{code}"),
            title,
            status: status.as_u16(),
            detail: detail.into(),
            instance: None,
            code,
            request_id: "unknown".to_string(),
            retryable: false,
            retry_after_seconds: 0,
        }
    }

    fn set_request_id(&mut self, request_id: impl Into<String>) {
        let request_id = request_id.into();
        self.request_id = request_id.clone();
        if self.instance.is_none() {
            self.instance = Some(request_id);
        }
    }

    fn set_retry_after_seconds(&mut self, seconds: u32) {
        self.retry_after_seconds = seconds;
        if seconds > 0 {
            self.retryable = true;
        }
    }
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub problem: Box<ProblemDetails>,
}

impl ApiError {
    fn with_status(
        status: StatusCode,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        let problem = Box::new(ProblemDetails::new(status, code, message));
        Self { status, problem }
    }

    pub fn bad_request(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::BAD_REQUEST, code, message)
    }

    pub fn not_found(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::NOT_FOUND, code, message)
    }

    pub fn conflict(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::CONFLICT, code, message)
    }

    pub fn internal(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::INTERNAL_SERVER_ERROR, code, message)
    }

    pub fn service_unavailable(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::SERVICE_UNAVAILABLE, code, message)
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.problem.set_request_id(request_id);
        self
    }

    pub fn with_retry_after_seconds(mut self, seconds: u32) -> Self {
        self.problem.set_retry_after_seconds(seconds);
        self
    }

    /// Map a body that failed to parse.
    pub fn from_json_rejection(rejection: JsonRejection, request_id: &str) -> Self {
        Self::bad_request("invalid_body", rejection.body_text()).with_request_id(request_id)
    }

    /// Map a controller error onto the HTTP surface.
    pub fn from_controller(e: ControllerError, request_id: &str) -> Self {
        let err = match &e {
            ControllerError::WorkloadNotFound(_) => {
                Self::not_found("workload_not_found", e.to_string())
            }
            ControllerError::WorkloadExists(_) => Self::conflict("workload_exists", e.to_string()),
            ControllerError::CheckNotFound { .. } => {
                Self::not_found("check_not_found", e.to_string())
            }
            ControllerError::QueueNotFound(_) => Self::not_found("queue_not_found", e.to_string()),
            ControllerError::InvalidVerdict(_) => {
                Self::bad_request("invalid_verdict", e.to_string())
            }
            ControllerError::InvalidWorkload(_) => {
                Self::bad_request("invalid_workload", e.to_string())
            }
            ControllerError::Store(store) => Self::from_store(store),
        };
        err.with_request_id(request_id)
    }

    fn from_store(e: &StoreError) -> Self {
        match e {
            StoreError::Conflict { .. } => {
                Self::conflict("write_conflict", e.to_string()).with_retry_after_seconds(1)
            }
            StoreError::Unavailable(_) => {
                Self::service_unavailable("store_unavailable", "The object store is unavailable")
                    .with_retry_after_seconds(1)
            }
            _ => {
                error!(error = %e, "Store operation failed");
                Self::internal("internal_error", "Internal store error")
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut response = (self.status, Json(self.problem)).into_response();
        response.headers_mut().insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/problem+json"),
        );
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checks::VerdictError;
    use admitq_id::WorkloadId;

    #[test]
    fn test_controller_errors_map_to_status() {
        let cases = [
            (
                ControllerError::WorkloadNotFound(WorkloadId::new()),
                StatusCode::NOT_FOUND,
            ),
            (
                ControllerError::InvalidVerdict(VerdictError::UnknownState("Maybe".into())),
                StatusCode::BAD_REQUEST,
            ),
            (
                ControllerError::QueueNotFound("missing".into()),
                StatusCode::NOT_FOUND,
            ),
            (
                ControllerError::Store(StoreError::Unavailable("down".into())),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
        ];
        for (err, status) in cases {
            let api = ApiError::from_controller(err, "req_test");
            assert_eq!(api.status, status);
            assert_eq!(api.problem.request_id, "req_test");
        }
    }

    #[test]
    fn test_unavailable_is_retryable() {
        let api = ApiError::from_controller(
            ControllerError::Store(StoreError::Unavailable("down".into())),
            "req_test",
        );
        assert!(api.problem.retryable);
        assert_eq!(api.problem.code, "store_unavailable");
    }
}

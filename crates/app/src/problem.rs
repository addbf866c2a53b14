use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use tracing::error;

use crate::service::ServiceError;

pub const NOT_FOUND: &str = "/problems/not-found";
pub const UNAUTHORIZED: &str = "/problems/unauthorized";
pub const INVALID_HOSTNAME: &str = "/problems/invalid-hostname";
pub const CONFLICT: &str = "/problems/conflict";
pub const SCHEDULER_UNAVAILABLE: &str = "/problems/scheduler-unavailable";
pub const INTERNAL: &str = "/problems/internal";

#[derive(Debug, Serialize)]
struct ProblemDetails {
    #[serde(rename = "type")]
    problem_type: &'static str,
    title: &'static str,
    detail: String,
}

/// `application/problem+json` error body.
pub struct ProblemResponse {
    status: StatusCode,
    body: ProblemDetails,
}

impl ProblemResponse {
    pub fn new<S: Into<String>>(status: StatusCode, problem_type: &'static str, detail: S) -> Self {
        Self {
            status,
            body: ProblemDetails {
                problem_type,
                title: status.canonical_reason().unwrap_or("error"),
                detail: detail.into(),
            },
        }
    }

    pub fn unauthorized() -> Self {
        Self::new(
            StatusCode::UNAUTHORIZED,
            UNAUTHORIZED,
            "a valid admin bearer token is required",
        )
    }
}

impl From<ServiceError> for ProblemResponse {
    fn from(err: ServiceError) -> Self {
        match &err {
            ServiceError::NotFound(_) => Self::new(StatusCode::NOT_FOUND, NOT_FOUND, err.to_string()),
            ServiceError::InvalidHostname(_) => Self::new(
                StatusCode::UNPROCESSABLE_ENTITY,
                INVALID_HOSTNAME,
                err.to_string(),
            ),
            ServiceError::Duplicate
            | ServiceError::NoCustomDomain(_)
            | ServiceError::Transition(_)
            | ServiceError::Monitor(_) => Self::new(StatusCode::CONFLICT, CONFLICT, err.to_string()),
            ServiceError::Scheduler(_) => Self::new(
                StatusCode::SERVICE_UNAVAILABLE,
                SCHEDULER_UNAVAILABLE,
                err.to_string(),
            ),
            ServiceError::Storage(_) => {
                error!(stage = "app", error = %err, "storage failure while handling request");
                Self::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    INTERNAL,
                    "failed to access domain storage",
                )
            }
        }
    }
}

impl IntoResponse for ProblemResponse {
    fn into_response(self) -> Response {
        let mut response = Json(self.body).into_response();
        *response.status_mut() = self.status;
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/problem+json"),
        );
        response
    }
}

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

/// Seconds a facility should wait before retrying a capacity rejection
const CAPACITY_RETRY_AFTER_SECS: u64 = 5;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Invalid request: {0}")]
    BadRequest(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Unavailable: {0}")]
    Unavailable(String, u64),
    #[error("Internal server error: {0}")]
    Internal(String),
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

impl AppError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }
}

impl From<wardsync_core::Error> for AppError {
    fn from(error: wardsync_core::Error) -> Self {
        use wardsync_core::Error;

        match error {
            Error::NotFound(message) => Self::NotFound(message),
            Error::InvalidInput(_) | Error::InvalidTransition { .. } | Error::Serialization(_) => {
                Self::BadRequest(error.to_string())
            }
            Error::RaceCondition { .. } => Self::Conflict(error.to_string()),
            Error::CapacityTimeout { .. } | Error::AdmissionDenied { .. } => {
                Self::Unavailable(error.to_string(), CAPACITY_RETRY_AFTER_SECS)
            }
            other => {
                tracing::error!(error = %other, "Sync request failed");
                Self::Internal(other.to_string())
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Unavailable(_, _) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let retry_after = match self {
            Self::Unavailable(_, secs) => Some(secs),
            _ => None,
        };
        let body = ErrorBody {
            error: self.to_string(),
        };
        let mut response = (status, Json(body)).into_response();
        if let Some(secs) = retry_after {
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

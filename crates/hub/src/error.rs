//! HTTP-facing error type.
//!
//! Handlers return `Result<_, ApiError>`; every variant maps to a status code
//! and a `{"status":"error","message":...}` body, the same envelope the
//! success responses use.

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::Serialize;

use crate::pump::{ActionError, TimeOfDayError};

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Control action rejected at the update boundary; state untouched.
    #[error(transparent)]
    InvalidAction(#[from] ActionError),

    #[error("{0}")]
    InvalidRequest(String),

    /// The store could not be read or written in time.
    #[error("service unavailable: {0}")]
    Unavailable(String),

    #[error("internal error: {0}")]
    Internal(String),
}

#[derive(Serialize)]
struct ErrorBody {
    status: &'static str,
    message: String,
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidAction(_) | Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Store failures surface as 503: the hub itself is fine, its state is not
    /// reachable right now.
    pub fn store(err: anyhow::Error) -> Self {
        Self::Unavailable(format!("{err:#}"))
    }
}

impl From<TimeOfDayError> for ApiError {
    fn from(err: TimeOfDayError) -> Self {
        Self::InvalidRequest(err.to_string())
    }
}

/// Bodies that do not deserialize are a client error like any other, and
/// get the same envelope.
impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::InvalidRequest(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self::InvalidRequest(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(%status, "request failed: {self}");
        }
        let body = ErrorBody {
            status: "error",
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes() {
        assert_eq!(
            ApiError::from(ActionError::Unknown("X".into())).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::from(TimeOfDayError("x".into())).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::store(anyhow::anyhow!("db gone")).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ApiError::Internal("boom".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn invalid_action_message_is_passed_through() {
        let err = ApiError::from(ActionError::Unknown("TOGGLE".into()));
        assert!(err.to_string().contains("unknown control action 'TOGGLE'"));
    }

    #[test]
    fn store_error_keeps_context_chain() {
        use anyhow::Context;
        let inner: anyhow::Result<()> = Err(anyhow::anyhow!("disk I/O error"));
        let err = ApiError::store(inner.context("load control failed").unwrap_err());
        let msg = err.to_string();
        assert!(msg.contains("load control failed"), "{msg}");
        assert!(msg.contains("disk I/O error"), "{msg}");
    }
}

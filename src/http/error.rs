//! Error responses of the HTTP query endpoint.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use crate::protocol::message::SHUTTING_DOWN_MESSAGE;
use crate::session::CacheError;

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("This HTTP connection is not open.")]
    NotOpen,

    #[error("Incorrect authorization key.")]
    BadAuthKey,

    #[error("{0}")]
    Malformed(String),

    #[error("Too many open HTTP connections.")]
    TooManySessions,

    #[error("{}", SHUTTING_DOWN_MESSAGE)]
    ShuttingDown,

    #[error("Failed to encode response: {0}")]
    Encode(#[from] serde_json::Error),
}

impl HttpError {
    pub fn status(&self) -> StatusCode {
        match self {
            HttpError::NotOpen | HttpError::Malformed(_) => StatusCode::BAD_REQUEST,
            HttpError::BadAuthKey => StatusCode::UNAUTHORIZED,
            HttpError::TooManySessions | HttpError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            HttpError::Encode(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<CacheError> for HttpError {
    fn from(err: CacheError) -> Self {
        match err {
            CacheError::ShutDown => HttpError::ShuttingDown,
            CacheError::Exhausted => HttpError::TooManySessions,
        }
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::warn!(status = %status, error = %self, "HTTP query request failed");
        } else {
            tracing::debug!(status = %status, error = %self, "HTTP query request rejected");
        }
        (status, self.to_string()).into_response()
    }
}

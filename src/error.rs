use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use crate::codec::CodecError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Request line, path, method or body framing we cannot serve.
    #[error("malformed request: {0}")]
    MalformedRequest(String),

    #[error("write body has no \"id\" field")]
    MissingIdentifier,

    #[error("\"id\" must be a non-empty string")]
    InvalidIdentifier,

    #[error("\"lamportTime\" must be an integer between 0 and 2^63 - 1")]
    InvalidLogicalStamp,

    #[error("station {0} not found")]
    NotFound(String),

    #[error("timed out reading request body")]
    ReadTimeout,

    #[error(transparent)]
    Decode(#[from] CodecError),

    #[error("snapshot persistence failed: {0}")]
    Persistence(#[from] std::io::Error),

    #[error(transparent)]
    Config(#[from] config::ConfigError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn status(&self) -> StatusCode {
        match self {
            Error::MalformedRequest(_)
            | Error::MissingIdentifier
            | Error::InvalidIdentifier
            | Error::InvalidLogicalStamp => StatusCode::BAD_REQUEST,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::ReadTimeout => StatusCode::REQUEST_TIMEOUT,
            Error::Decode(_) | Error::Persistence(_) | Error::Config(_) | Error::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        } else {
            tracing::warn!(error = %self, "request rejected");
        }
        let body = match self {
            Error::NotFound(_) => "Station data not found.".to_string(),
            other => other.to_string(),
        };
        (status, body).into_response()
    }
}

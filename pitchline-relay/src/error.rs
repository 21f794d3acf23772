//! Relay error type and its HTTP mapping.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use pitchline_realtime::RealtimeError;
use thiserror::Error;

/// Result type for relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;

/// Errors raised by the relay server.
#[derive(Error, Debug)]
pub enum RelayError {
    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Upstream connection could not be opened.
    #[error("Upstream error: {0}")]
    Upstream(String),

    /// The credential endpoint is not enabled on this server.
    #[error("Credential endpoint disabled")]
    BrokerDisabled,

    /// Minting a credential failed.
    #[error(transparent)]
    Credential(#[from] RealtimeError),

    /// Socket or listener failure.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RelayError {
    /// Create a new configuration error.
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new upstream error.
    pub fn upstream<S: Into<String>>(msg: S) -> Self {
        Self::Upstream(msg.into())
    }

    /// Status code answered for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Credential(e) => e
                .upstream_status()
                .and_then(|s| StatusCode::from_u16(s).ok())
                .filter(|s| !s.is_success())
                .unwrap_or(StatusCode::BAD_GATEWAY),
            Self::Upstream(_) => StatusCode::BAD_GATEWAY,
            Self::BrokerDisabled => StatusCode::NOT_FOUND,
            Self::Config(_) | Self::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            Self::Credential(RealtimeError::BrokerRejected { message, .. }) => message.clone(),
            other => other.to_string(),
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

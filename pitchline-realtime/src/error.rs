//! Error types for the realtime bridge.

use thiserror::Error;

/// Result type for bridge operations.
pub type Result<T> = std::result::Result<T, RealtimeError>;

/// Coarse classification of a [`RealtimeError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Connect, timeout and socket failures.
    Transport,
    /// Malformed or unexpected inbound message.
    Protocol,
    /// Capture, playback or codec failure.
    Media,
    /// Credential broker unavailable or rejected.
    Credential,
    /// Operation attempted in an invalid state.
    State,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Transport => "transport",
            Self::Protocol => "protocol",
            Self::Media => "media",
            Self::Credential => "credential",
            Self::State => "state",
        };
        f.write_str(s)
    }
}

/// Errors that can occur while bridging a realtime session.
#[derive(Error, Debug)]
pub enum RealtimeError {
    /// Channel could not be opened or was lost.
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// Timeout waiting for the channel to become ready.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Malformed or unexpected inbound message.
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// Capture, playback or codec failure.
    #[error("Media error: {0}")]
    MediaError(String),

    /// Credential broker unavailable or rejected the request.
    #[error("Credential error: {0}")]
    CredentialError(String),

    /// Credential endpoint answered with a non-success status.
    #[error("Credential error: broker returned {status}: {message}")]
    BrokerRejected {
        /// HTTP status from the broker.
        status: u16,
        /// Response body.
        message: String,
    },

    /// Operation attempted in an invalid state.
    #[error("Invalid state: {0}")]
    StateError(String),

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    ConfigError(String),

    /// Remote service reported an error event.
    #[error("Server error: {code} - {message}")]
    ServerError {
        /// Error code from the server.
        code: String,
        /// Error message from the server.
        message: String,
    },

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Generic IO error.
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// WebRTC negotiation or peer connection error.
    #[cfg(feature = "webrtc")]
    #[error("WebRTC error: {0}")]
    WebRTCError(String),

    /// Opus encode/decode failure.
    #[cfg(feature = "webrtc")]
    #[error("Opus codec error: {0}")]
    OpusCodecError(String),
}

impl RealtimeError {
    /// Create a new connection error.
    pub fn connection<S: Into<String>>(msg: S) -> Self {
        Self::ConnectionError(msg.into())
    }

    /// Create a new timeout error.
    pub fn timeout<S: Into<String>>(msg: S) -> Self {
        Self::Timeout(msg.into())
    }

    /// Create a new protocol error.
    pub fn protocol<S: Into<String>>(msg: S) -> Self {
        Self::ProtocolError(msg.into())
    }

    /// Create a new media error.
    pub fn media<S: Into<String>>(msg: S) -> Self {
        Self::MediaError(msg.into())
    }

    /// Create a new credential error.
    pub fn credential<S: Into<String>>(msg: S) -> Self {
        Self::CredentialError(msg.into())
    }

    /// Create an error for a non-success broker response.
    pub fn broker_rejected(status: u16, message: impl Into<String>) -> Self {
        Self::BrokerRejected { status, message: message.into() }
    }

    /// Create a new state error.
    pub fn state<S: Into<String>>(msg: S) -> Self {
        Self::StateError(msg.into())
    }

    /// Create a new configuration error.
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::ConfigError(msg.into())
    }

    /// Create a new server error.
    pub fn server<S: Into<String>>(code: S, message: S) -> Self {
        Self::ServerError { code: code.into(), message: message.into() }
    }

    /// Create a new WebRTC error.
    #[cfg(feature = "webrtc")]
    pub fn webrtc<S: Into<String>>(msg: S) -> Self {
        Self::WebRTCError(msg.into())
    }

    /// Create a new Opus codec error.
    #[cfg(feature = "webrtc")]
    pub fn opus<S: Into<String>>(msg: S) -> Self {
        Self::OpusCodecError(msg.into())
    }

    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ConnectionError(_) | Self::Timeout(_) | Self::IoError(_) => ErrorKind::Transport,
            #[cfg(feature = "webrtc")]
            Self::WebRTCError(_) => ErrorKind::Transport,
            Self::ProtocolError(_) | Self::SerializationError(_) | Self::ServerError { .. } => {
                ErrorKind::Protocol
            }
            Self::MediaError(_) => ErrorKind::Media,
            #[cfg(feature = "webrtc")]
            Self::OpusCodecError(_) => ErrorKind::Media,
            Self::CredentialError(_) | Self::BrokerRejected { .. } => ErrorKind::Credential,
            Self::StateError(_) | Self::ConfigError(_) => ErrorKind::State,
        }
    }

    /// HTTP status reported by a credential endpoint, if any.
    pub fn upstream_status(&self) -> Option<u16> {
        match self {
            Self::BrokerRejected { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// True for errors that end an active call.
    pub fn is_fatal(&self) -> bool {
        matches!(self.kind(), ErrorKind::Transport | ErrorKind::Credential)
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for RealtimeError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::ConnectionError(err.to_string())
    }
}

impl From<hound::Error> for RealtimeError {
    fn from(err: hound::Error) -> Self {
        Self::MediaError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_classification() {
        assert_eq!(RealtimeError::timeout("10s").kind(), ErrorKind::Transport);
        assert_eq!(RealtimeError::connection("refused").kind(), ErrorKind::Transport);
        assert_eq!(RealtimeError::protocol("bad").kind(), ErrorKind::Protocol);
        assert_eq!(RealtimeError::media("mic").kind(), ErrorKind::Media);
        assert_eq!(RealtimeError::credential("401").kind(), ErrorKind::Credential);
        assert_eq!(RealtimeError::state("not idle").kind(), ErrorKind::State);
        assert_eq!(RealtimeError::broker_rejected(503, "down").kind(), ErrorKind::Credential);
    }

    #[test]
    fn test_serde_error_is_protocol() {
        let err: RealtimeError = serde_json::from_str::<serde_json::Value>("{").unwrap_err().into();
        assert_eq!(err.kind(), ErrorKind::Protocol);
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_display_includes_message() {
        let err = RealtimeError::server("rate_limit", "slow down");
        assert_eq!(err.to_string(), "Server error: rate_limit - slow down");
    }
}

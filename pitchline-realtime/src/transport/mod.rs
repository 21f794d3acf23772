//! Transport adapters.
//!
//! A transport opens the duplex channel to the remote service and carries
//! control messages and audio in both directions. Two backends implement
//! [`Transport`]: [`WebSocketTransport`] (JSON control with base64 audio on one
//! socket) and, with the `webrtc` feature, `WebRtcTransport` (control on a
//! data channel, Opus audio on a media track). The controller picks one
//! through a [`TransportFactory`].

use std::sync::{Arc, Once};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::audio::AudioFrame;
use crate::config::{BridgeConfig, TransportKind};
use crate::credential::Credential;
use crate::error::Result;
use crate::events::ClientEvent;
use crate::subscribers::SubscriptionId;

#[cfg(feature = "webrtc")]
pub mod opus;
pub mod websocket;
#[cfg(feature = "webrtc")]
pub mod webrtc;

pub use websocket::WebSocketTransport;
#[cfg(feature = "webrtc")]
pub use webrtc::WebRtcTransport;

/// State of the underlying channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkState {
    /// Not connected yet.
    Idle,
    /// Connect in progress.
    Connecting,
    /// Ready to carry messages.
    Open,
    /// Closed by either side.
    Closed,
    /// Lost to an error.
    Failed,
}

impl LinkState {
    /// True for `Closed` and `Failed`.
    pub fn is_down(self) -> bool {
        matches!(self, Self::Closed | Self::Failed)
    }
}

impl std::fmt::Display for LinkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closed => "closed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Receives inbound traffic and link changes from a transport.
///
/// Callbacks run on the transport's receive task in arrival order and must
/// not block.
pub trait TransportObserver: Send + Sync {
    /// A raw inbound control message.
    fn on_message(&self, _raw: &str) {}

    /// A decoded inbound audio frame.
    fn on_audio_frame(&self, _frame: &AudioFrame) {}

    /// The link changed state.
    fn on_state_change(&self, _state: LinkState) {}
}

/// A duplex channel to the remote service.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Which variant this is.
    fn kind(&self) -> TransportKind;

    /// Current link state.
    fn link_state(&self) -> LinkState;

    /// Register an observer.
    fn subscribe(&self, observer: Arc<dyn TransportObserver>) -> SubscriptionId;

    /// Remove an observer.
    fn unsubscribe(&self, id: SubscriptionId) -> bool;

    /// Open the channel. Returns once it can carry messages.
    async fn connect(&self, credential: Option<&Credential>) -> Result<()>;

    /// Queue a control message. Logs and drops it if the channel is not open.
    fn send_control(&self, event: &ClientEvent);

    /// Queue an audio frame. Dropped if the channel cannot take it.
    fn send_audio(&self, frame: &AudioFrame);

    /// Offer the capture stream to the transport.
    ///
    /// Transports that carry audio natively consume the stream and return
    /// `None`; the others hand it back for the caller to frame and
    /// [`Transport::send_audio`]. Blocks sent before the call is live are
    /// the caller's to gate.
    fn attach_capture(&self, capture: mpsc::Receiver<Vec<f32>>)
    -> Option<mpsc::Receiver<Vec<f32>>> {
        Some(capture)
    }

    /// Close every owned resource. Idempotent and infallible.
    async fn disconnect(&self);

    /// True once `disconnect` has released everything.
    fn is_released(&self) -> bool;
}

/// Builds a transport for a call.
pub trait TransportFactory: Send + Sync {
    /// Create an unconnected transport.
    fn create(&self, config: &BridgeConfig) -> Result<Arc<dyn Transport>>;
}

/// Picks the backend named by the configuration.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultTransports;

impl TransportFactory for DefaultTransports {
    fn create(&self, config: &BridgeConfig) -> Result<Arc<dyn Transport>> {
        match config.transport {
            TransportKind::WebSocket => Ok(Arc::new(WebSocketTransport::new(config))),
            #[cfg(feature = "webrtc")]
            TransportKind::WebRtc => Ok(Arc::new(WebRtcTransport::new(config))),
            #[cfg(not(feature = "webrtc"))]
            TransportKind::WebRtc => Err(crate::error::RealtimeError::config(
                "webrtc transport requested but this build lacks the `webrtc` feature",
            )),
        }
    }
}

/// Install the aws-lc-rs TLS provider once per process.
///
/// Both the WebSocket client and the HTTP client pull in rustls; with more
/// than one provider compiled in, rustls refuses to pick one implicitly.
pub fn ensure_crypto_provider() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        if rustls::crypto::aws_lc_rs::default_provider().install_default().is_err() {
            tracing::debug!("rustls crypto provider already installed");
        }
    });
}

//! # pitchline-realtime
//!
//! Realtime session bridge for practice sales calls.
//!
//! The bridge opens a duplex audio + control channel to a conversational
//! voice service, turns captured samples into the wire format, plays back
//! the service's audio, and runs the call lifecycle.
//!
//! ## Architecture
//!
//! ```text
//!   capture ──► FrameAssembler ──► Transport ──► remote service
//!                                     │
//!   playback ◄── CallObserver ◄───────┘
//!                     │
//!                     ▼
//!             EventDispatcher ──► EventHandler subscribers
//! ```
//!
//! The [`SessionController`] owns the [`Session`] and its
//! [`ConnectionState`], picks a [`Transport`] through a
//! [`TransportFactory`], and tears everything down on `end_call`.
//!
//! ## Features
//!
//! - **Socket transport**: JSON control plus base64 PCM16 audio over one WebSocket,
//!   direct or through the relay
//! - **Negotiated-media transport** (`webrtc` feature): offer/answer with an
//!   ephemeral credential, Opus on a media track, control on a data channel
//! - **Typed events**: closed client/server vocabularies, multi-subscriber dispatch
//! - **Scenarios**: seven built-in prospect personas, overridable from TOML
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use pitchline_realtime::{BridgeConfig, FixedDevices, Scenario, SessionController};
//! use pitchline_realtime::media::{MemoryPlayback, WavCapture};
//!
//! let config = BridgeConfig::default().with_api_key(api_key);
//! let devices = FixedDevices::new(
//!     Arc::new(WavCapture::new("pitch.wav")),
//!     Arc::new(MemoryPlayback::new()),
//! );
//! let controller = SessionController::builder(config).devices(Arc::new(devices)).build()?;
//!
//! controller.start_call(Scenario::Price).await?;
//! tokio::time::sleep(std::time::Duration::from_secs(30)).await;
//! let summary = controller.end_call().await;
//! ```

pub mod audio;
pub mod config;
pub mod controller;
pub mod credential;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod media;
pub mod scenario;
pub mod session;
pub mod subscribers;
pub mod transport;

// Re-exports
pub use audio::{AudioEncoding, AudioFormat, AudioFrame, FrameAssembler, SAMPLE_RATE};
pub use config::{BridgeConfig, SessionSettings, TransportKind, VadConfig};
pub use controller::{SessionController, SessionControllerBuilder};
pub use credential::{
    BrokerResponse, Credential, CredentialBroker, HttpCredentialBroker, OpenAiSessionBroker,
};
pub use dispatcher::{
    BridgeEvent, Completeness, EventDispatcher, EventHandler, NoOpEventHandler, Speaker,
    TranscriptEvent, TranscriptLog,
};
pub use error::{ErrorKind, RealtimeError, Result};
pub use events::{ClientEvent, ServerEvent};
pub use media::{CaptureSource, FixedDevices, MediaDevices, PlaybackSink};
pub use scenario::{Scenario, ScenarioTable};
pub use session::{CallSummary, ConnectionState, Session};
pub use subscribers::SubscriptionId;
pub use transport::{
    DefaultTransports, LinkState, Transport, TransportFactory, TransportObserver,
    WebSocketTransport,
};
#[cfg(feature = "webrtc")]
pub use transport::WebRtcTransport;

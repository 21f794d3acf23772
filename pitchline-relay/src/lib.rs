//! # pitchline-relay
//!
//! Keeps the long-lived realtime API key on the server.
//!
//! - `GET /realtime-proxy` upgrades to a WebSocket and relays every frame to
//!   the upstream realtime endpoint, authenticating with the server's key
//! - `POST /api/realtime/secret` mints a short-lived client secret for the
//!   negotiated-media transport
//! - `GET /health` answers `ok`
//!
//! ## Example
//!
//! ```rust,ignore
//! use pitchline_relay::{RelayConfig, RelayServer};
//! use tokio_util::sync::CancellationToken;
//!
//! let relay = RelayServer::new(RelayConfig::default().with_api_key(key)).bind().await?;
//! relay.serve(CancellationToken::new()).await?;
//! ```

pub mod broker;
pub mod config;
pub mod error;
pub mod proxy;
pub mod server;

pub use config::RelayConfig;
pub use error::{RelayError, Result};
pub use proxy::{PairEnd, Upstream, relay_pair, wire_close_code};
pub use server::{BoundRelay, RelayServer};

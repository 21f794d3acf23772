//! HTTP/WebSocket server hosting the relay and the credential endpoint.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::Router;
use axum::extract::{State, WebSocketUpgrade};
use axum::response::Response;
use axum::routing::{get, post};
use pitchline_realtime::{CredentialBroker, OpenAiSessionBroker};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::Instrument;

use crate::broker::mint_secret;
use crate::config::{RelayConfig, SECRET_PATH};
use crate::error::Result;
use crate::proxy::{Upstream, relay_pair};

/// Shared handler state. Pairs share nothing beyond the immutable target
/// and the id counter.
#[derive(Clone)]
pub(crate) struct RelayState {
    pub(crate) upstream: Arc<Upstream>,
    pub(crate) broker: Option<Arc<dyn CredentialBroker>>,
    pairs: Arc<AtomicU64>,
}

/// Relay and credential server.
pub struct RelayServer {
    config: RelayConfig,
    broker: Option<Arc<dyn CredentialBroker>>,
}

impl RelayServer {
    /// Create a server. With `broker_enabled` and an API key the credential
    /// endpoint mints from the sessions API.
    pub fn new(config: RelayConfig) -> Self {
        let broker = match (&config.api_key, config.broker_enabled) {
            (Some(key), true) => Some(Arc::new(OpenAiSessionBroker::new(
                key.clone(),
                config.model.clone(),
                config.voice.clone(),
            )) as Arc<dyn CredentialBroker>),
            _ => None,
        };
        Self { config, broker }
    }

    /// Serve credentials from `broker` instead.
    pub fn with_broker(mut self, broker: Arc<dyn CredentialBroker>) -> Self {
        self.broker = Some(broker);
        self
    }

    /// Build the router.
    pub fn router(&self) -> Router {
        if self.config.api_key.is_none() {
            tracing::warn!("no API key configured, upstream connections are unauthenticated");
        }
        let state = RelayState {
            upstream: Arc::new(Upstream::new(
                self.config.upstream_target(),
                self.config.api_key.clone(),
                self.config.connect_timeout(),
            )),
            broker: self.broker.clone(),
            pairs: Arc::new(AtomicU64::new(0)),
        };

        Router::new()
            .route("/health", get(health))
            .route(&self.config.proxy_path, get(realtime_proxy))
            .route(SECRET_PATH, post(mint_secret))
            .with_state(state)
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
    }

    /// Validate the configuration and bind the listener.
    pub async fn bind(self) -> Result<BoundRelay> {
        self.config.validate()?;
        let listener = TcpListener::bind(self.config.listen).await?;
        let router = self.router();
        Ok(BoundRelay { listener, router, proxy_path: self.config.proxy_path })
    }
}

/// A bound, not yet serving, relay.
pub struct BoundRelay {
    listener: TcpListener,
    router: Router,
    proxy_path: String,
}

impl BoundRelay {
    /// Address actually bound.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve until `shutdown` fires.
    pub async fn serve(self, shutdown: CancellationToken) -> Result<()> {
        let addr = self.local_addr()?;
        tracing::info!(%addr, proxy_path = %self.proxy_path, "relay listening");
        axum::serve(self.listener, self.router)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;
        tracing::info!("relay stopped");
        Ok(())
    }
}

async fn health() -> &'static str {
    "ok"
}

async fn realtime_proxy(ws: WebSocketUpgrade, State(state): State<RelayState>) -> Response {
    let pair_id = state.pairs.fetch_add(1, Ordering::Relaxed) + 1;
    let upstream = Arc::clone(&state.upstream);
    ws.on_upgrade(move |client| {
        async move {
            relay_pair(client, &upstream).await;
        }
        .instrument(pitchline_telemetry::relay_pair_span(pair_id))
    })
}

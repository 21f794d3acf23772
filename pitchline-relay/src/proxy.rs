//! Byte-for-byte frame relay between a client socket and the upstream
//! service.
//!
//! Each accepted client gets exactly one upstream connection, opened before
//! any frame is read. Text and binary frames cross unmodified in both
//! directions; ping/pong stay on their own hop. When either side goes away
//! the other is closed:
//!
//! | event | action on the other side |
//! |---|---|
//! | client close | upstream gets the same code and reason |
//! | client error, drop or failed client write | upstream closed with 1000 |
//! | upstream close | client gets the same code and reason |
//! | upstream read or write error | client closed with 1011 "upstream connection error" |
//! | upstream connect failure | client closed with 1011 before relaying |
//!
//! Reserved local-only codes are rewritten with [`wire_close_code`].

use std::time::Duration;

use axum::extract::ws::{self, WebSocket};
use futures::{SinkExt, Stream, StreamExt};
use pitchline_realtime::transport::ensure_crypto_provider;
use secrecy::{ExposeSecret, SecretString};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::CloseFrame as UpstreamCloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{self as tungstenite, Message as UpstreamMessage};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use crate::error::{RelayError, Result};

/// Close reason sent to the client when the upstream fails.
pub const UPSTREAM_ERROR_REASON: &str = "upstream connection error";

type UpstreamSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Where relayed clients are connected to.
#[derive(Debug, Clone)]
pub struct Upstream {
    url: String,
    api_key: Option<SecretString>,
    connect_timeout: Duration,
}

impl Upstream {
    /// Target `url`, authenticating with `api_key` when given.
    pub fn new(
        url: impl Into<String>,
        api_key: Option<SecretString>,
        connect_timeout: Duration,
    ) -> Self {
        Self { url: url.into(), api_key, connect_timeout }
    }

    fn request(&self) -> Result<Request> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| RelayError::upstream(format!("invalid upstream URL {}: {e}", self.url)))?;

        if let Some(key) = &self.api_key {
            let bearer = HeaderValue::from_str(&format!("Bearer {}", key.expose_secret()))
                .map_err(|e| RelayError::config(format!("invalid API key header: {e}")))?;
            let headers = request.headers_mut();
            headers.insert("Authorization", bearer);
            headers.insert("OpenAI-Beta", HeaderValue::from_static("realtime=v1"));
        }
        Ok(request)
    }

    /// Open the upstream connection.
    pub async fn connect(&self) -> Result<UpstreamSocket> {
        ensure_crypto_provider();
        let request = self.request()?;
        match tokio::time::timeout(self.connect_timeout, connect_async(request)).await {
            Ok(Ok((socket, response))) => {
                tracing::debug!(status = %response.status(), "upstream connected");
                Ok(socket)
            }
            Ok(Err(e)) => Err(RelayError::upstream(e.to_string())),
            Err(_) => Err(RelayError::upstream(format!(
                "no upstream handshake after {}s",
                self.connect_timeout.as_secs()
            ))),
        }
    }
}

/// Map a close code onto one that may be sent on the wire.
///
/// 1005, 1006 and 1015 only describe local conditions and are replaced by
/// 1000.
pub fn wire_close_code(code: u16) -> u16 {
    match code {
        1005 | 1006 | 1015 => ws::close_code::NORMAL,
        other => other,
    }
}

fn client_close(code: u16, reason: &str) -> ws::Message {
    ws::Message::Close(Some(ws::CloseFrame { code: wire_close_code(code), reason: reason.into() }))
}

fn upstream_close(code: u16, reason: &str) -> UpstreamMessage {
    UpstreamMessage::Close(Some(UpstreamCloseFrame {
        code: CloseCode::from(wire_close_code(code)),
        reason: reason.into(),
    }))
}

/// Which side went away first, and how.
#[derive(Debug)]
enum Hangup {
    /// The client sent a close frame, or vanished when `None`.
    Client(Option<(u16, String)>),
    /// The upstream sent a close frame, or ended its stream when `None`.
    Upstream(Option<(u16, String)>),
    /// Reading from or writing to the upstream failed.
    UpstreamBroken,
}

/// How a relay pair ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairEnd {
    /// Upstream could not be reached.
    UpstreamUnavailable,
    /// The client closed or dropped.
    ClientClosed,
    /// The upstream closed with this code.
    UpstreamClosed(u16),
    /// The upstream connection failed mid-relay.
    UpstreamFailed,
}

/// Relay one client until either side goes away.
pub async fn relay_pair(mut client: WebSocket, upstream: &Upstream) -> PairEnd {
    let upstream_socket = match upstream.connect().await {
        Ok(socket) => socket,
        Err(e) => {
            tracing::warn!(error = %e, "upstream connect failed, closing client");
            let _ = client.send(client_close(ws::close_code::ERROR, UPSTREAM_ERROR_REASON)).await;
            return PairEnd::UpstreamUnavailable;
        }
    };
    tracing::info!("relay pair open");

    let (mut client_tx, mut client_rx) = client.split();
    let (mut upstream_tx, mut upstream_rx) = upstream_socket.split();

    let hangup = tokio::select! {
        hangup = client_to_upstream(&mut client_rx, &mut upstream_tx) => hangup,
        hangup = upstream_to_client(&mut upstream_rx, &mut client_tx) => hangup,
    };
    tracing::debug!(?hangup, "relay direction finished");

    let end = match hangup {
        Hangup::Client(frame) => {
            let (code, reason) = frame.unwrap_or((ws::close_code::NORMAL, String::new()));
            let _ = upstream_tx.send(upstream_close(code, &reason)).await;
            let _ = upstream_tx.close().await;
            PairEnd::ClientClosed
        }
        Hangup::Upstream(frame) => {
            let (code, reason) = frame.unwrap_or((ws::close_code::NORMAL, String::new()));
            let _ = client_tx.send(client_close(code, &reason)).await;
            let _ = client_tx.close().await;
            // completes the closing handshake the upstream started
            let _ = upstream_tx.close().await;
            PairEnd::UpstreamClosed(wire_close_code(code))
        }
        Hangup::UpstreamBroken => {
            let close = client_close(ws::close_code::ERROR, UPSTREAM_ERROR_REASON);
            let _ = client_tx.send(close).await;
            let _ = client_tx.close().await;
            PairEnd::UpstreamFailed
        }
    };
    tracing::info!(end = ?end, "relay pair closed");
    end
}

async fn client_to_upstream<S, K>(client_rx: &mut S, upstream_tx: &mut K) -> Hangup
where
    S: Stream<Item = std::result::Result<ws::Message, axum::Error>> + Unpin,
    K: futures::Sink<UpstreamMessage, Error = tungstenite::Error> + Unpin,
{
    while let Some(frame) = client_rx.next().await {
        let forward = match frame {
            Ok(ws::Message::Text(text)) => UpstreamMessage::Text(text.as_str().into()),
            Ok(ws::Message::Binary(data)) => UpstreamMessage::Binary(data),
            Ok(ws::Message::Ping(_)) | Ok(ws::Message::Pong(_)) => continue,
            Ok(ws::Message::Close(frame)) => {
                let frame = frame.map(|f| (f.code, f.reason.as_str().to_string()));
                tracing::debug!(?frame, "client closed");
                return Hangup::Client(frame);
            }
            Err(e) => {
                tracing::debug!(error = %e, "client socket error");
                return Hangup::Client(None);
            }
        };
        if let Err(e) = upstream_tx.send(forward).await {
            tracing::warn!(error = %e, "upstream write failed");
            return Hangup::UpstreamBroken;
        }
    }
    Hangup::Client(None)
}

async fn upstream_to_client<S, K>(upstream_rx: &mut S, client_tx: &mut K) -> Hangup
where
    S: Stream<Item = std::result::Result<UpstreamMessage, tungstenite::Error>> + Unpin,
    K: futures::Sink<ws::Message, Error = axum::Error> + Unpin,
{
    while let Some(frame) = upstream_rx.next().await {
        let forward = match frame {
            Ok(UpstreamMessage::Text(text)) => ws::Message::Text(text.as_str().into()),
            Ok(UpstreamMessage::Binary(data)) => ws::Message::Binary(data),
            Ok(UpstreamMessage::Ping(_))
            | Ok(UpstreamMessage::Pong(_))
            | Ok(UpstreamMessage::Frame(_)) => continue,
            Ok(UpstreamMessage::Close(frame)) => {
                let frame = frame.map(|f| (u16::from(f.code), f.reason.as_str().to_string()));
                tracing::debug!(?frame, "upstream closed");
                return Hangup::Upstream(frame);
            }
            Err(e) => {
                tracing::warn!(error = %e, "upstream socket error");
                return Hangup::UpstreamBroken;
            }
        };
        if let Err(e) = client_tx.send(forward).await {
            tracing::debug!(error = %e, "client write failed");
            return Hangup::Client(None);
        }
    }
    Hangup::Upstream(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserved_close_codes_are_mapped() {
        assert_eq!(wire_close_code(1005), 1000);
        assert_eq!(wire_close_code(1006), 1000);
        assert_eq!(wire_close_code(1015), 1000);
        assert_eq!(wire_close_code(1011), 1011);
        assert_eq!(wire_close_code(4000), 4000);
    }

    #[test]
    fn test_upstream_close_keeps_code_and_reason() {
        let UpstreamMessage::Close(Some(frame)) = upstream_close(4001, "trainee hung up") else {
            panic!("expected a close frame");
        };
        assert_eq!(u16::from(frame.code), 4001);
        assert_eq!(frame.reason.as_str(), "trainee hung up");

        let UpstreamMessage::Close(Some(frame)) = upstream_close(1005, "") else {
            panic!("expected a close frame");
        };
        assert_eq!(frame.code, CloseCode::Normal);
    }

    #[test]
    fn test_request_carries_bearer_only_with_key() {
        let bare = Upstream::new("ws://127.0.0.1:1/realtime", None, Duration::from_secs(1));
        assert!(bare.request().unwrap().headers().get("Authorization").is_none());

        let keyed = Upstream::new(
            "wss://api.openai.com/v1/realtime?model=m",
            Some(SecretString::from("sk-test".to_string())),
            Duration::from_secs(1),
        );
        let request = keyed.request().unwrap();
        assert_eq!(request.headers()["Authorization"], "Bearer sk-test");
        assert_eq!(request.headers()["OpenAI-Beta"], "realtime=v1");
    }

    #[test]
    fn test_invalid_upstream_url() {
        let upstream = Upstream::new("not a url", None, Duration::from_secs(1));
        assert!(matches!(upstream.request(), Err(RelayError::Upstream(_))));
    }
}

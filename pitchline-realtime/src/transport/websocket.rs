//! Socket transport: JSON control messages and base64 audio on one WebSocket.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::connect_async;

use super::{LinkState, Transport, TransportObserver, ensure_crypto_provider};
use crate::audio::AudioFrame;
use crate::config::{BridgeConfig, TransportKind};
use crate::credential::Credential;
use crate::error::{RealtimeError, Result};
use crate::events::{ClientEvent, ServerEvent};
use crate::subscribers::{SubscriptionId, Subscribers};

/// How long `disconnect` waits for queued messages to flush.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

struct Shared {
    state: Mutex<LinkState>,
    observers: Subscribers<dyn TransportObserver>,
    closing: AtomicBool,
}

impl Shared {
    fn set_state(&self, next: LinkState) {
        {
            let mut state = self.state.lock();
            if *state == next {
                return;
            }
            *state = next;
        }
        tracing::debug!(state = %next, "socket link state changed");
        self.observers.for_each(|o| o.on_state_change(next));
    }

    fn deliver(&self, raw: &str) {
        // only audio deltas need decoding here; the dispatcher parses the rest
        if raw.contains("response.audio.delta") {
            match serde_json::from_str::<ServerEvent>(raw) {
                Ok(ServerEvent::AudioDelta { delta, .. }) => match AudioFrame::from_le_bytes(&delta) {
                    Ok(frame) => self.observers.for_each(|o| o.on_audio_frame(&frame)),
                    Err(e) => tracing::warn!(error = %e, "dropping undecodable audio delta"),
                },
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "dropping malformed audio delta"),
            }
        }
        self.observers.for_each(|o| o.on_message(raw));
    }
}

/// WebSocket transport to the realtime endpoint or a relay.
pub struct WebSocketTransport {
    url: String,
    api_key: Option<SecretString>,
    connect_timeout: Duration,
    queue: usize,
    shared: Arc<Shared>,
    outbound: Mutex<Option<mpsc::Sender<Message>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    released: AtomicBool,
}

impl WebSocketTransport {
    /// Create a transport from the bridge configuration.
    ///
    /// A configured relay URL takes precedence and is dialed without
    /// credentials.
    pub fn new(config: &BridgeConfig) -> Self {
        let api_key = if config.uses_relay() { None } else { config.api_key.clone() };
        Self {
            url: config.socket_url(),
            api_key,
            connect_timeout: config.connect_timeout(),
            queue: config.send_queue.max(1),
            shared: Arc::new(Shared {
                state: Mutex::new(LinkState::Idle),
                observers: Subscribers::new(),
                closing: AtomicBool::new(false),
            }),
            outbound: Mutex::new(None),
            writer: Mutex::new(None),
            reader: Mutex::new(None),
            released: AtomicBool::new(false),
        }
    }

    /// URL this transport dials.
    pub fn url(&self) -> &str {
        &self.url
    }

    fn request(&self) -> Result<tokio_tungstenite::tungstenite::handshake::client::Request> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| RealtimeError::connection(format!("invalid URL {}: {e}", self.url)))?;

        if let Some(key) = &self.api_key {
            let bearer = HeaderValue::from_str(&format!("Bearer {}", key.expose_secret()))
                .map_err(|e| RealtimeError::config(format!("invalid API key header: {e}")))?;
            let headers = request.headers_mut();
            headers.insert("Authorization", bearer);
            headers.insert("OpenAI-Beta", HeaderValue::from_static("realtime=v1"));
        }
        Ok(request)
    }

    fn enqueue(&self, message: Message, event_type: &'static str) {
        if *self.shared.state.lock() != LinkState::Open {
            tracing::warn!(event_type, "socket not open, dropping outbound message");
            return;
        }
        let guard = self.outbound.lock();
        let Some(tx) = guard.as_ref() else {
            tracing::warn!(event_type, "socket not open, dropping outbound message");
            return;
        };
        match tx.try_send(message) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(event_type, "outbound queue full, dropping message");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::warn!(event_type, "socket writer gone, dropping message");
            }
        }
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::WebSocket
    }

    fn link_state(&self) -> LinkState {
        *self.shared.state.lock()
    }

    fn subscribe(&self, observer: Arc<dyn TransportObserver>) -> SubscriptionId {
        self.shared.observers.add(observer)
    }

    fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.shared.observers.remove(id)
    }

    async fn connect(&self, _credential: Option<&Credential>) -> Result<()> {
        if self.link_state() != LinkState::Idle || self.released.load(Ordering::SeqCst) {
            return Err(RealtimeError::state("socket transport already used"));
        }
        ensure_crypto_provider();
        let request = self.request()?;
        self.shared.set_state(LinkState::Connecting);
        tracing::info!(url = %self.url, relay = self.api_key.is_none(), "connecting socket transport");

        let connected = tokio::time::timeout(self.connect_timeout, connect_async(request)).await;
        let ws = match connected {
            Ok(Ok((ws, _response))) => ws,
            Ok(Err(e)) => {
                self.shared.set_state(LinkState::Failed);
                return Err(RealtimeError::connection(format!("socket connect failed: {e}")));
            }
            Err(_) => {
                self.shared.set_state(LinkState::Failed);
                return Err(RealtimeError::timeout(format!(
                    "socket not ready after {}s",
                    self.connect_timeout.as_secs()
                )));
            }
        };
        if self.released.load(Ordering::SeqCst) {
            return Err(RealtimeError::state("socket transport released while connecting"));
        }

        // open before either task can report a close or failure
        self.shared.set_state(LinkState::Open);
        let (mut sink, mut source) = ws.split();
        let (tx, mut rx) = mpsc::channel::<Message>(self.queue);

        let writer_shared = Arc::clone(&self.shared);
        let writer = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if let Err(e) = sink.send(message).await {
                    tracing::warn!(error = %e, "socket write failed");
                    if !writer_shared.closing.load(Ordering::SeqCst) {
                        writer_shared.set_state(LinkState::Failed);
                    }
                    return;
                }
            }
            let _ = sink.close().await;
        });

        let reader_shared = Arc::clone(&self.shared);
        let reader = tokio::spawn(async move {
            let mut outcome = LinkState::Closed;
            while let Some(message) = source.next().await {
                match message {
                    Ok(Message::Text(text)) => reader_shared.deliver(text.as_str()),
                    Ok(Message::Binary(data)) => match std::str::from_utf8(&data) {
                        Ok(text) => reader_shared.deliver(text),
                        Err(_) => tracing::debug!(len = data.len(), "ignoring non-UTF-8 binary frame"),
                    },
                    Ok(Message::Close(frame)) => {
                        tracing::info!(?frame, "socket closed by peer");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(error = %e, "socket read failed");
                        outcome = LinkState::Failed;
                        break;
                    }
                }
            }
            if !reader_shared.closing.load(Ordering::SeqCst) {
                reader_shared.set_state(outcome);
            }
        });

        *self.outbound.lock() = Some(tx);
        *self.writer.lock() = Some(writer);
        *self.reader.lock() = Some(reader);
        tracing::info!("socket transport open");
        Ok(())
    }

    fn send_control(&self, event: &ClientEvent) {
        let event_type = event.event_type();
        match serde_json::to_string(event) {
            Ok(json) => self.enqueue(Message::Text(json.into()), event_type),
            Err(e) => tracing::warn!(event_type, error = %e, "failed to encode control message"),
        }
    }

    fn send_audio(&self, frame: &AudioFrame) {
        self.send_control(&ClientEvent::InputAudioBufferAppend { audio: frame.to_le_bytes() });
    }

    async fn disconnect(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.closing.store(true, Ordering::SeqCst);

        // dropping the sender lets the writer flush the queue, then close
        drop(self.outbound.lock().take());
        let writer = self.writer.lock().take();
        if let Some(mut writer) = writer {
            if tokio::time::timeout(FLUSH_TIMEOUT, &mut writer).await.is_err() {
                tracing::warn!("socket writer did not flush in time");
                writer.abort();
            }
        }

        let reader = self.reader.lock().take();
        if let Some(reader) = reader {
            reader.abort();
            let _ = reader.await;
        }

        let was_up = *self.shared.state.lock() != LinkState::Idle;
        if was_up {
            self.shared.set_state(LinkState::Closed);
        } else {
            *self.shared.state.lock() = LinkState::Closed;
        }
        tracing::debug!("socket transport released");
    }

    fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
            && self.outbound.lock().is_none()
            && self.writer.lock().is_none()
            && self.reader.lock().is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::net::TcpListener;

    #[derive(Default)]
    struct Collect {
        messages: Mutex<Vec<String>>,
        frames: Mutex<Vec<AudioFrame>>,
        states: Mutex<Vec<LinkState>>,
        count: AtomicUsize,
    }

    impl TransportObserver for Collect {
        fn on_message(&self, raw: &str) {
            self.messages.lock().push(raw.to_string());
            self.count.fetch_add(1, Ordering::SeqCst);
        }
        fn on_audio_frame(&self, frame: &AudioFrame) {
            self.frames.lock().push(frame.clone());
        }
        fn on_state_change(&self, state: LinkState) {
            self.states.lock().push(state);
        }
    }

    fn config_for(addr: std::net::SocketAddr) -> BridgeConfig {
        BridgeConfig::default().with_relay_url(format!("ws://{addr}/realtime-proxy"))
    }

    #[tokio::test]
    async fn test_send_before_connect_is_dropped() {
        let transport = WebSocketTransport::new(&BridgeConfig::default().with_api_key("sk"));
        transport.send_control(&ClientEvent::InputAudioBufferCommit);
        transport.send_audio(&AudioFrame::silence(4));
        assert_eq!(transport.link_state(), LinkState::Idle);
    }

    #[tokio::test]
    async fn test_connect_refused_fails() {
        let addr = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };
        let transport = WebSocketTransport::new(&config_for(addr));
        let err = transport.connect(None).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Transport);
        assert_eq!(transport.link_state(), LinkState::Failed);
        transport.disconnect().await;
        assert!(transport.is_released());
    }

    #[tokio::test]
    async fn test_connect_times_out_without_handshake() {
        // accepts TCP but never answers the upgrade
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _hold = tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
        });

        let config = config_for(addr).with_connect_timeout(Duration::from_secs(1));
        let transport = WebSocketTransport::new(&config);
        let err = transport.connect(None).await.unwrap_err();
        assert!(matches!(err, RealtimeError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_round_trip_with_local_peer() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(socket).await.unwrap();
            let delta = AudioFrame::new(vec![7, -7]).to_base64();
            ws.send(Message::Text(
                format!(r#"{{"type":"response.audio.delta","delta":"{delta}"}}"#).into(),
            ))
            .await
            .unwrap();
            ws.send(Message::Text(r#"{"type":"session.created"}"#.into())).await.unwrap();

            let mut received = Vec::new();
            while let Some(Ok(message)) = ws.next().await {
                match message {
                    Message::Text(text) => received.push(text.as_str().to_string()),
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            received
        });

        let transport = WebSocketTransport::new(&config_for(addr));
        let observer = Arc::new(Collect::default());
        transport.subscribe(observer.clone());
        transport.connect(None).await.unwrap();
        assert_eq!(transport.link_state(), LinkState::Open);

        transport.send_control(&ClientEvent::InputAudioBufferCommit);
        transport.send_audio(&AudioFrame::silence(2));

        for _ in 0..100 {
            if observer.count.load(Ordering::SeqCst) >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        transport.disconnect().await;
        transport.disconnect().await;
        assert!(transport.is_released());

        let received = server.await.unwrap();
        assert_eq!(received.len(), 2);
        assert_eq!(received[0], r#"{"type":"input_audio_buffer.commit"}"#);
        assert!(received[1].contains("input_audio_buffer.append"));

        assert_eq!(observer.frames.lock()[0].samples, vec![7, -7]);
        assert_eq!(observer.messages.lock().len(), 2);
        let states = observer.states.lock().clone();
        assert_eq!(states, vec![LinkState::Connecting, LinkState::Open, LinkState::Closed]);
    }

    #[tokio::test]
    async fn test_peer_closing_right_after_handshake_ends_closed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(socket).await.unwrap();
            let _ = ws.close(None).await;
            while let Some(Ok(_)) = ws.next().await {}
        });

        let transport = WebSocketTransport::new(&config_for(addr));
        let observer = Arc::new(Collect::default());
        transport.subscribe(observer.clone());
        transport.connect(None).await.unwrap();

        for _ in 0..200 {
            if transport.link_state() == LinkState::Closed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(transport.link_state(), LinkState::Closed);
        let states = observer.states.lock().clone();
        assert_eq!(states, vec![LinkState::Connecting, LinkState::Open, LinkState::Closed]);

        transport.disconnect().await;
        assert!(transport.is_released());
    }
}

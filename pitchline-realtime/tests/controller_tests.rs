//! Call lifecycle tests against an in-process WebSocket peer.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use pitchline_realtime::audio::decode_base64;
use pitchline_realtime::media::{ChannelCapture, MemoryPlayback};
use pitchline_realtime::{
    AudioFrame, BridgeConfig, CaptureSource, ConnectionState, Credential, CredentialBroker,
    DefaultTransports, ErrorKind, EventHandler, MediaDevices, PlaybackSink, RealtimeError, Result,
    Scenario, ScenarioTable, SessionController, Speaker, Transport, TransportFactory,
    TransportKind,
};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

/// Accepts one socket, forwards every text frame it receives, and answers
/// `response.create` with `replies`. Closes after replying when
/// `close_after_reply` is set.
async fn spawn_peer(
    replies: Vec<String>,
    close_after_reply: bool,
) -> (SocketAddr, mpsc::UnboundedReceiver<Value>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(socket).await.unwrap();
        while let Some(Ok(message)) = ws.next().await {
            match message {
                Message::Text(text) => {
                    let value: Value = serde_json::from_str(text.as_str()).unwrap();
                    let is_response_create = value["type"] == "response.create";
                    let _ = tx.send(value);
                    if is_response_create {
                        for reply in &replies {
                            ws.send(Message::Text(reply.clone().into())).await.unwrap();
                        }
                        if close_after_reply {
                            let _ = ws.close(None).await;
                            break;
                        }
                    }
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    (addr, rx)
}

#[derive(Default)]
struct RecordingTransports {
    created: Mutex<Vec<Arc<dyn Transport>>>,
}

impl TransportFactory for RecordingTransports {
    fn create(&self, config: &BridgeConfig) -> Result<Arc<dyn Transport>> {
        let transport = DefaultTransports.create(config)?;
        self.created.lock().push(Arc::clone(&transport));
        Ok(transport)
    }
}

#[derive(Default)]
struct StateLog {
    states: Mutex<Vec<ConnectionState>>,
    audio_frames: Mutex<usize>,
}

impl EventHandler for StateLog {
    fn on_connection_state(&self, state: ConnectionState) {
        self.states.lock().push(state);
    }

    fn on_audio_playable(&self, _frame: &AudioFrame) {
        *self.audio_frames.lock() += 1;
    }
}

/// Hands out fixed devices and remembers which ones a call acquired.
struct TrackingDevices {
    capture: Arc<dyn CaptureSource>,
    playback: Arc<MemoryPlayback>,
    capture_opened: AtomicBool,
    playback_opened: AtomicBool,
}

#[async_trait]
impl MediaDevices for TrackingDevices {
    async fn open_capture(&self) -> Result<Arc<dyn CaptureSource>> {
        self.capture_opened.store(true, Ordering::SeqCst);
        Ok(Arc::clone(&self.capture))
    }

    async fn open_playback(&self) -> Result<Arc<dyn PlaybackSink>> {
        self.playback_opened.store(true, Ordering::SeqCst);
        Ok(self.playback.clone())
    }
}

/// Capture that takes a while to come up, like a device asking for
/// permission.
struct SlowCapture {
    inner: ChannelCapture,
    delay: Duration,
}

#[async_trait]
impl CaptureSource for SlowCapture {
    async fn start(&self) -> Result<mpsc::Receiver<Vec<f32>>> {
        tokio::time::sleep(self.delay).await;
        self.inner.start().await
    }

    fn stop(&self) {
        self.inner.stop();
    }

    fn is_released(&self) -> bool {
        self.inner.is_released()
    }
}

struct Harness {
    controller: SessionController,
    capture: Arc<dyn CaptureSource>,
    feeder: pitchline_realtime::media::CaptureFeeder,
    playback: Arc<MemoryPlayback>,
    devices: Arc<TrackingDevices>,
    transports: Arc<RecordingTransports>,
    log: Arc<StateLog>,
}

fn harness(config: BridgeConfig) -> Harness {
    let (capture, feeder) = ChannelCapture::new(8);
    build_harness(config, Arc::new(capture), feeder, None)
}

fn build_harness(
    config: BridgeConfig,
    capture: Arc<dyn CaptureSource>,
    feeder: pitchline_realtime::media::CaptureFeeder,
    broker: Option<Arc<dyn CredentialBroker>>,
) -> Harness {
    let playback = Arc::new(MemoryPlayback::new());
    let transports = Arc::new(RecordingTransports::default());
    let devices = Arc::new(TrackingDevices {
        capture: Arc::clone(&capture),
        playback: playback.clone(),
        capture_opened: AtomicBool::new(false),
        playback_opened: AtomicBool::new(false),
    });
    let mut builder =
        SessionController::builder(config).devices(devices.clone()).transports(transports.clone());
    if let Some(broker) = broker {
        builder = builder.broker(broker);
    }
    let controller = builder.build().unwrap();
    let log = Arc::new(StateLog::default());
    controller.dispatcher().subscribe(log.clone());
    Harness { controller, capture, feeder, playback, devices, transports, log }
}

fn relay_config(addr: SocketAddr) -> BridgeConfig {
    BridgeConfig::default().with_relay_url(format!("ws://{addr}/realtime-proxy"))
}

async fn next_message(rx: &mut mpsc::UnboundedReceiver<Value>) -> Value {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("peer message")
        .expect("peer still running")
}

async fn drain(rx: &mut mpsc::UnboundedReceiver<Value>) -> Vec<Value> {
    let mut rest = Vec::new();
    while let Ok(Some(value)) = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await {
        rest.push(value);
    }
    rest
}

async fn wait_for_state(controller: &SessionController, state: ConnectionState) {
    for _ in 0..200 {
        if controller.state() == state {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("never reached {state}, stuck in {}", controller.state());
}

fn assert_released(h: &Harness) {
    assert!(h.capture.is_released(), "capture still held");
    if h.devices.playback_opened.load(Ordering::SeqCst) {
        assert!(h.playback.is_released(), "playback still open");
    }
    for transport in h.transports.created.lock().iter() {
        assert!(transport.is_released(), "transport still holds resources");
    }
}

#[tokio::test]
async fn test_price_call_sends_one_zero_frame_then_closes() {
    let (addr, mut rx) = spawn_peer(Vec::new(), false).await;
    let h = harness(relay_config(addr));

    let session = h.controller.start_call(Scenario::Price).await.unwrap();
    assert_eq!(session.state, ConnectionState::InCall);
    assert_eq!(session.transport, TransportKind::WebSocket);

    let setup: Vec<Value> = vec![
        next_message(&mut rx).await,
        next_message(&mut rx).await,
        next_message(&mut rx).await,
        next_message(&mut rx).await,
    ];
    let types: Vec<&str> = setup.iter().map(|m| m["type"].as_str().unwrap()).collect();
    assert_eq!(
        types,
        vec!["session.update", "session.update", "conversation.item.create", "response.create"]
    );
    let persona = ScenarioTable::builtin().persona(Scenario::Price).to_string();
    assert!(setup[1]["session"]["instructions"].as_str().unwrap().contains(&persona));
    assert_eq!(setup[3]["response"]["modalities"], serde_json::json!(["audio", "text"]));

    assert!(h.feeder.feed(vec![0.0; 4096]));
    let append = next_message(&mut rx).await;
    assert_eq!(append["type"], "input_audio_buffer.append");

    let summary = h.controller.end_call().await.unwrap();
    assert_eq!(summary.final_state, ConnectionState::Closed);
    assert_eq!(summary.scenario, Scenario::Price);
    assert_eq!(h.controller.state(), ConnectionState::Closed);

    let rest = drain(&mut rx).await;
    let appends = std::iter::once(&append)
        .chain(rest.iter())
        .filter(|m| m["type"] == "input_audio_buffer.append")
        .collect::<Vec<_>>();
    assert_eq!(appends.len(), 1);

    let bytes = decode_base64(appends[0]["audio"].as_str().unwrap()).unwrap();
    let frame = AudioFrame::from_le_bytes(&bytes).unwrap();
    assert_eq!(frame.samples, vec![0i16; 4096]);

    assert_released(&h);
    assert_eq!(
        *h.log.states.lock(),
        vec![
            ConnectionState::Negotiating,
            ConnectionState::Connected,
            ConnectionState::InCall,
            ConnectionState::Closing,
            ConnectionState::Closed,
        ]
    );
    assert_eq!(h.controller.last_summary(), Some(summary));
}

#[tokio::test]
async fn test_scenario_switch_emits_exactly_one_session_update() {
    let (addr, mut rx) = spawn_peer(Vec::new(), false).await;
    let h = harness(relay_config(addr));
    h.controller.start_call(Scenario::Price).await.unwrap();
    for _ in 0..4 {
        next_message(&mut rx).await;
    }

    h.controller.set_scenario(Scenario::Spouse).unwrap();
    let update = next_message(&mut rx).await;
    h.controller.end_call().await.unwrap();
    let rest = drain(&mut rx).await;

    assert_eq!(update["type"], "session.update");
    let persona = ScenarioTable::builtin().persona(Scenario::Spouse).to_string();
    assert!(update["session"]["instructions"].as_str().unwrap().contains(&persona));
    assert!(rest.iter().all(|m| m["type"] != "session.update"));
    assert_eq!(h.controller.session().unwrap().scenario, Scenario::Spouse);
}

#[tokio::test]
async fn test_transcripts_and_audio_reach_summary_and_playback() {
    let delta = AudioFrame::new(vec![1, 2, 3]).to_base64();
    let replies = vec![
        format!(r#"{{"type":"response.audio.delta","delta":"{delta}"}}"#),
        r#"{"type":"response.audio_transcript.delta","delta":"Hel"}"#.to_string(),
        r#"{"type":"response.audio_transcript.done","transcript":"Hello"}"#.to_string(),
        r#"{"type":"conversation.item.input_audio_transcription.completed","item_id":"i1","content_index":0,"transcript":"Hi, is this a good time?"}"#.to_string(),
        r#"{"type":"something.new"}"#.to_string(),
    ];
    let (addr, mut rx) = spawn_peer(replies, false).await;
    let h = harness(relay_config(addr));
    let (_, mut events) = h.controller.dispatcher().channel(16);

    h.controller.start_call(Scenario::Time).await.unwrap();
    for _ in 0..4 {
        next_message(&mut rx).await;
    }
    // audio delta, transcript delta, two finals; the unknown type is dropped
    for _ in 0..4 {
        tokio::time::timeout(Duration::from_secs(5), events.recv()).await.unwrap().unwrap();
    }

    let summary = h.controller.end_call().await.unwrap();
    assert_eq!(summary.transcripts.len(), 2);
    assert_eq!(summary.transcripts[0].speaker, Speaker::Assistant);
    assert_eq!(summary.transcripts[0].text, "Hello");
    assert_eq!(summary.transcripts[1].speaker, Speaker::User);

    assert_eq!(h.playback.samples(), vec![1, 2, 3]);
    assert_eq!(*h.log.audio_frames.lock(), 1);
}

#[tokio::test]
async fn test_peer_close_mid_call_tears_down() {
    let (addr, _rx) = spawn_peer(Vec::new(), true).await;
    let h = harness(relay_config(addr));
    h.controller.start_call(Scenario::Coverage).await.unwrap();

    wait_for_state(&h.controller, ConnectionState::Closed).await;
    let summary = h.controller.last_summary().unwrap();
    assert_eq!(summary.final_state, ConnectionState::Closed);
    assert_released(&h);
    assert!(h.controller.end_call().await.is_none());
}

#[tokio::test]
async fn test_second_start_is_rejected_while_live() {
    let (addr, _rx) = spawn_peer(Vec::new(), false).await;
    let h = harness(relay_config(addr));
    h.controller.start_call(Scenario::Think).await.unwrap();

    let err = h.controller.start_call(Scenario::Young).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::State);
    assert_eq!(h.controller.state(), ConnectionState::InCall);
    assert_eq!(h.controller.session().unwrap().scenario, Scenario::Think);

    h.controller.end_call().await.unwrap();
}

#[tokio::test]
async fn test_refused_connect_fails_and_releases() {
    let addr = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    };
    let h = harness(relay_config(addr));

    let err = h.controller.start_call(Scenario::Research).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Transport);
    assert_eq!(h.controller.state(), ConnectionState::Failed);
    assert!(h.capture.is_released());
    assert_eq!(h.transports.created.lock().len(), 1);
    assert!(h.transports.created.lock()[0].is_released());
    assert_eq!(
        *h.log.states.lock(),
        vec![ConnectionState::Negotiating, ConnectionState::Failed]
    );
    // failed is terminal: ending again is a no-op
    assert!(h.controller.end_call().await.is_none());
}

#[tokio::test]
async fn test_end_call_from_idle_is_noop() {
    let h = harness(relay_config("127.0.0.1:9".parse().unwrap()));
    assert!(h.controller.end_call().await.is_none());
    assert_eq!(h.controller.state(), ConnectionState::Idle);
    assert!(h.log.states.lock().is_empty());
}

struct FailingBroker;

#[async_trait]
impl CredentialBroker for FailingBroker {
    async fn acquire(&self) -> Result<Credential> {
        Err(RealtimeError::credential("broker returned 503"))
    }
}

struct ExpiredBroker;

#[async_trait]
impl CredentialBroker for ExpiredBroker {
    async fn acquire(&self) -> Result<Credential> {
        Ok(Credential::new("ek_test", chrono::Utc::now() - chrono::Duration::seconds(1)))
    }
}

fn negotiated_harness(broker: Arc<dyn CredentialBroker>) -> (SessionController, Arc<StateLog>) {
    let (capture, feeder) = ChannelCapture::new(1);
    let config = BridgeConfig::default().with_transport(TransportKind::WebRtc);
    let h = build_harness(config, Arc::new(capture), feeder, Some(broker));
    (h.controller, h.log)
}

#[tokio::test]
async fn test_broker_failure_moves_to_failed() {
    let (controller, log) = negotiated_harness(Arc::new(FailingBroker));
    let err = controller.start_call(Scenario::Price).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Credential);
    assert_eq!(controller.state(), ConnectionState::Failed);
    assert_eq!(
        *log.states.lock(),
        vec![ConnectionState::AcquiringCredential, ConnectionState::Failed]
    );
}

#[tokio::test]
async fn test_expired_credential_is_rejected() {
    let (controller, _log) = negotiated_harness(Arc::new(ExpiredBroker));
    let err = controller.start_call(Scenario::Price).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Credential);
    assert_eq!(controller.state(), ConnectionState::Failed);
}

/// Broker whose exchange never completes.
struct StalledBroker;

#[async_trait]
impl CredentialBroker for StalledBroker {
    async fn acquire(&self) -> Result<Credential> {
        std::future::pending().await
    }
}

#[tokio::test]
async fn test_end_call_while_acquiring_credential() {
    let (capture, feeder) = ChannelCapture::new(1);
    let config = BridgeConfig::default().with_transport(TransportKind::WebRtc);
    let h = build_harness(config, Arc::new(capture), feeder, Some(Arc::new(StalledBroker)));

    let controller = h.controller.clone();
    let starting = tokio::spawn(async move { controller.start_call(Scenario::Price).await });
    wait_for_state(&h.controller, ConnectionState::AcquiringCredential).await;

    let summary = h.controller.end_call().await.unwrap();
    assert_eq!(summary.final_state, ConnectionState::Closed);
    let err = starting.await.unwrap().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::State);

    assert_eq!(h.controller.state(), ConnectionState::Closed);
    assert!(h.transports.created.lock().is_empty());
    assert!(!h.devices.capture_opened.load(Ordering::SeqCst));
    assert!(!h.devices.playback_opened.load(Ordering::SeqCst));
    assert_released(&h);
    assert_eq!(
        *h.log.states.lock(),
        vec![
            ConnectionState::AcquiringCredential,
            ConnectionState::Closing,
            ConnectionState::Closed,
        ]
    );
}

#[tokio::test]
async fn test_end_call_while_negotiating() {
    // accepts TCP but never answers the upgrade
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (_socket, _) = listener.accept().await.unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;
    });
    let h = harness(relay_config(addr));

    let controller = h.controller.clone();
    let starting = tokio::spawn(async move { controller.start_call(Scenario::Spouse).await });
    wait_for_state(&h.controller, ConnectionState::Negotiating).await;

    let summary = h.controller.end_call().await.unwrap();
    assert_eq!(summary.final_state, ConnectionState::Closed);
    let err = starting.await.unwrap().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::State);

    assert_eq!(h.controller.state(), ConnectionState::Closed);
    assert_eq!(h.transports.created.lock().len(), 1);
    assert!(!h.devices.capture_opened.load(Ordering::SeqCst));
    assert_released(&h);
    assert_eq!(
        *h.log.states.lock(),
        vec![ConnectionState::Negotiating, ConnectionState::Closing, ConnectionState::Closed]
    );
}

#[tokio::test]
async fn test_end_call_while_capture_is_starting() {
    let (addr, _rx) = spawn_peer(Vec::new(), false).await;
    let (inner, feeder) = ChannelCapture::new(8);
    let capture = Arc::new(SlowCapture { inner, delay: Duration::from_millis(300) });
    let h = build_harness(relay_config(addr), capture, feeder, None);

    let controller = h.controller.clone();
    let starting = tokio::spawn(async move { controller.start_call(Scenario::Time).await });
    wait_for_state(&h.controller, ConnectionState::Connected).await;

    let summary = h.controller.end_call().await.unwrap();
    assert_eq!(summary.final_state, ConnectionState::Closed);
    let err = starting.await.unwrap().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::State);

    // the capture came up after the call ended and must not stay running
    assert!(h.devices.capture_opened.load(Ordering::SeqCst));
    assert!(h.devices.playback_opened.load(Ordering::SeqCst));
    assert!(!h.feeder.is_active());
    assert_eq!(h.controller.state(), ConnectionState::Closed);
    assert_eq!(h.transports.created.lock().len(), 1);
    assert_released(&h);
    assert_eq!(
        *h.log.states.lock(),
        vec![
            ConnectionState::Negotiating,
            ConnectionState::Connected,
            ConnectionState::Closing,
            ConnectionState::Closed,
        ]
    );
}


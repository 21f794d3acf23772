//! Negotiated-media transport over a Sans-IO peer connection (`str0m`).
//!
//! Control messages travel as text on the `oai-events` data channel. Audio
//! travels as Opus on a send/receive media track: captured blocks are framed
//! into 20ms packets here, inbound packets are decoded back to 24kHz PCM16
//! and handed to observers as [`AudioFrame`]s.
//!
//! Connection flow:
//! 1. bind a UDP socket and register it as a host candidate
//! 2. build the local offer (audio track + data channel)
//! 3. POST the offer to the exchange endpoint with the ephemeral credential
//! 4. apply the answer and drive the peer connection until both ICE and the
//!    data channel are up, bounded by the connect timeout

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use secrecy::ExposeSecret;
use str0m::change::{SdpAnswer, SdpPendingOffer};
use str0m::channel::ChannelId;
use str0m::media::{Direction, Frequency, MediaKind, MediaTime, Mid, Pt};
use str0m::net::{Protocol, Receive};
use str0m::{Candidate, Event, IceConnectionState, Input, Output, Rtc};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::opus::{OPUS_FRAME_SAMPLES, OpusCodec};
use super::{LinkState, Transport, TransportObserver, ensure_crypto_provider};
use crate::audio::{AudioFrame, FrameAssembler, SAMPLE_RATE, encode_samples};
use crate::config::{BridgeConfig, TransportKind};
use crate::credential::Credential;
use crate::error::{RealtimeError, Result};
use crate::events::ClientEvent;
use crate::subscribers::{SubscriptionId, Subscribers};

/// Name of the data channel used for JSON event exchange.
pub const DATA_CHANNEL_LABEL: &str = "oai-events";

/// Control messages held while the data channel opens.
const MAX_PENDING_DC_MESSAGES: usize = 50;

/// How long `disconnect` waits for the driver to stop.
const STOP_TIMEOUT: Duration = Duration::from_secs(2);

/// Body of a JSON-wrapped answer.
#[derive(Debug, serde::Deserialize)]
struct SdpExchangeResponse {
    sdp: String,
}

enum Command {
    Control(String),
    Capture(mpsc::Receiver<Vec<f32>>),
    Close,
}

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
        tracing::debug!(state = %next, "rtc link state changed");
        self.observers.for_each(|o| o.on_state_change(next));
    }
}

/// Peer-connection transport with an Opus media track.
pub struct WebRtcTransport {
    sdp_url: String,
    model: String,
    voice: String,
    connect_timeout: Duration,
    http: reqwest::Client,
    shared: Arc<Shared>,
    commands: Mutex<Option<mpsc::Sender<Command>>>,
    driver: Mutex<Option<JoinHandle<()>>>,
    released: AtomicBool,
}

/// Local offer and the state needed to accept its answer.
pub struct LocalOffer {
    /// Peer connection with the audio track and data channel staged.
    pub rtc: Rtc,
    /// SDP text of the offer.
    pub sdp: String,
    /// Pending offer to pair with the answer.
    pub pending: SdpPendingOffer,
    /// Audio track id.
    pub audio_mid: Mid,
    /// Data channel id.
    pub channel_id: ChannelId,
}

/// Build a local offer with one send/receive audio track and the events
/// data channel. `candidate` is added as a host candidate when given.
pub fn build_offer(candidate: Option<SocketAddr>) -> Result<LocalOffer> {
    let mut rtc = Rtc::new(Instant::now());

    if let Some(addr) = candidate {
        let host = Candidate::host(addr, "udp")
            .map_err(|e| RealtimeError::webrtc(format!("invalid host candidate {addr}: {e}")))?;
        rtc.add_local_candidate(host);
    }

    let mut changes = rtc.sdp_api();
    let audio_mid = changes.add_media(MediaKind::Audio, Direction::SendRecv, None, None, None);
    let channel_id = changes.add_channel(DATA_CHANNEL_LABEL.to_string());
    let (offer, pending) = changes
        .apply()
        .ok_or_else(|| RealtimeError::webrtc("Failed to generate SDP offer: no changes to apply"))?;

    let sdp = offer.to_sdp_string();
    Ok(LocalOffer { rtc, sdp, pending, audio_mid, channel_id })
}

/// Pull the answer SDP out of an exchange response body.
///
/// The endpoint answers with raw `application/sdp`, or with JSON carrying an
/// `sdp` field.
pub fn parse_answer_body(content_type: &str, body: &str) -> Result<String> {
    if content_type.contains("application/sdp") || body.trim_start().starts_with("v=") {
        return Ok(body.to_string());
    }
    let parsed: SdpExchangeResponse = serde_json::from_str(body).map_err(|e| {
        RealtimeError::connection(format!("Failed to parse SDP exchange response as JSON: {e}"))
    })?;
    Ok(parsed.sdp)
}

/// Address other hosts can reach this machine on, found by routing a probe
/// socket. Falls back to loopback.
async fn local_ip() -> IpAddr {
    let probe = async {
        let socket = UdpSocket::bind("0.0.0.0:0").await.ok()?;
        socket.connect("8.8.8.8:80").await.ok()?;
        socket.local_addr().ok().map(|a| a.ip())
    };
    probe.await.unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}

impl WebRtcTransport {
    /// Create a transport from the bridge configuration.
    pub fn new(config: &BridgeConfig) -> Self {
        Self {
            sdp_url: config.sdp_url.clone(),
            model: config.model.clone(),
            voice: config.session.voice.clone(),
            connect_timeout: config.connect_timeout(),
            http: reqwest::Client::new(),
            shared: Arc::new(Shared {
                state: Mutex::new(LinkState::Idle),
                observers: Subscribers::new(),
                closing: AtomicBool::new(false),
            }),
            commands: Mutex::new(None),
            driver: Mutex::new(None),
            released: AtomicBool::new(false),
        }
    }

    /// POST carrying the offer, with the session's model and voice in the query.
    fn answer_request(&self, credential: &Credential, offer_sdp: &str) -> reqwest::RequestBuilder {
        self.http
            .post(&self.sdp_url)
            .query(&[("model", self.model.as_str()), ("voice", self.voice.as_str())])
            .header("Authorization", format!("Bearer {}", credential.client_secret.expose_secret()))
            .header("Content-Type", "application/sdp")
            .body(offer_sdp.to_string())
    }

    async fn exchange_sdp(&self, credential: &Credential, offer_sdp: &str) -> Result<String> {
        let response = self
            .answer_request(credential, offer_sdp)
            .send()
            .await
            .map_err(|e| RealtimeError::connection(format!("SDP exchange request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RealtimeError::connection(format!(
                "SDP exchange failed with status {status}: {body}"
            )));
        }

        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let body = response.text().await.map_err(|e| {
            RealtimeError::connection(format!("Failed to read SDP answer body: {e}"))
        })?;
        parse_answer_body(&content_type, &body)
    }

    fn fail(&self, err: RealtimeError) -> RealtimeError {
        self.shared.closing.store(true, Ordering::SeqCst);
        self.commands.lock().take();
        if let Some(driver) = self.driver.lock().take() {
            driver.abort();
        }
        self.shared.set_state(LinkState::Failed);
        err
    }

    async fn negotiate(&self, credential: &Credential) -> Result<watch::Receiver<bool>> {
        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .map_err(|e| RealtimeError::connection(format!("UDP bind failed: {e}")))?;
        let port = socket.local_addr()?.port();
        let candidate = SocketAddr::new(local_ip().await, port);

        let LocalOffer { mut rtc, sdp, pending, audio_mid, channel_id } =
            build_offer(Some(candidate))?;
        tracing::debug!(audio_mid = %audio_mid, channel_id = ?channel_id, %candidate, "generated local offer");

        let answer_sdp = self.exchange_sdp(credential, &sdp).await?;
        let answer = SdpAnswer::from_sdp_string(&answer_sdp)
            .map_err(|e| RealtimeError::webrtc(format!("Failed to parse SDP answer: {e}")))?;
        rtc.sdp_api()
            .accept_answer(pending, answer)
            .map_err(|e| RealtimeError::webrtc(format!("Failed to apply SDP answer: {e}")))?;

        let (pt, clock_rate) = {
            let writer = rtc.writer(audio_mid).ok_or_else(|| {
                RealtimeError::webrtc("Audio track writer not available after SDP answer")
            })?;
            let params = writer.payload_params().next().ok_or_else(|| {
                RealtimeError::webrtc("No payload type negotiated for audio track")
            })?;
            (params.pt(), params.spec().clock_rate)
        };
        tracing::info!(audio_mid = %audio_mid, "offer/answer exchange complete");

        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        let (ready_tx, ready_rx) = watch::channel(false);
        let driver = Driver {
            rtc,
            socket,
            local: candidate,
            audio_mid,
            channel_id,
            pt,
            clock_rate,
            codec: OpusCodec::new(SAMPLE_RATE)?,
            assembler: FrameAssembler::new(OPUS_FRAME_SAMPLES),
            rtp_offset: 0,
            ice_connected: false,
            channel_open: false,
            pending: Vec::new(),
            capture: None,
            shared: Arc::clone(&self.shared),
            ready: ready_tx,
        };

        *self.commands.lock() = Some(cmd_tx);
        *self.driver.lock() = Some(tokio::spawn(driver.run(cmd_rx)));
        Ok(ready_rx)
    }

    fn command(&self, command: Command, what: &str) {
        let guard = self.commands.lock();
        let Some(tx) = guard.as_ref() else {
            tracing::warn!(what, "rtc transport not open, dropping");
            return;
        };
        if let Err(e) = tx.try_send(command) {
            tracing::warn!(what, error = %e, "rtc command queue unavailable, dropping");
        }
    }
}

#[async_trait]
impl Transport for WebRtcTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::WebRtc
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

    async fn connect(&self, credential: Option<&Credential>) -> Result<()> {
        if self.link_state() != LinkState::Idle || self.released.load(Ordering::SeqCst) {
            return Err(RealtimeError::state("rtc transport already used"));
        }
        let credential = credential
            .ok_or_else(|| RealtimeError::credential("negotiated-media transport needs a credential"))?;
        if credential.is_expired() {
            return Err(RealtimeError::credential("client secret already expired"));
        }

        ensure_crypto_provider();
        self.shared.set_state(LinkState::Connecting);

        let deadline = self.connect_timeout;
        let setup = async {
            let mut ready = self.negotiate(credential).await?;
            while !*ready.borrow_and_update() {
                ready
                    .changed()
                    .await
                    .map_err(|_| RealtimeError::connection("peer connection closed during setup"))?;
            }
            Ok::<(), RealtimeError>(())
        };

        match tokio::time::timeout(deadline, setup).await {
            Ok(Ok(())) => {
                self.shared.set_state(LinkState::Open);
                tracing::info!("rtc transport open");
                Ok(())
            }
            Ok(Err(e)) => Err(self.fail(e)),
            Err(_) => Err(self.fail(RealtimeError::timeout(format!(
                "peer connection not ready after {}s",
                deadline.as_secs()
            )))),
        }
    }

    fn send_control(&self, event: &ClientEvent) {
        let event_type = event.event_type();
        if self.link_state() != LinkState::Open {
            tracing::warn!(event_type, "rtc transport not open, dropping outbound message");
            return;
        }
        match serde_json::to_string(event) {
            Ok(json) => self.command(Command::Control(json), event_type),
            Err(e) => tracing::warn!(event_type, error = %e, "failed to encode control message"),
        }
    }

    fn send_audio(&self, _frame: &AudioFrame) {
        // audio rides the media track via attach_capture
    }

    fn attach_capture(
        &self,
        capture: mpsc::Receiver<Vec<f32>>,
    ) -> Option<mpsc::Receiver<Vec<f32>>> {
        self.command(Command::Capture(capture), "capture");
        None
    }

    async fn disconnect(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.closing.store(true, Ordering::SeqCst);

        if let Some(tx) = self.commands.lock().take() {
            let _ = tx.try_send(Command::Close);
        }
        let driver = self.driver.lock().take();
        if let Some(mut driver) = driver {
            if tokio::time::timeout(STOP_TIMEOUT, &mut driver).await.is_err() {
                tracing::warn!("rtc driver did not stop in time");
                driver.abort();
            }
        }

        if self.link_state() != LinkState::Failed {
            self.shared.set_state(LinkState::Closed);
        }
        tracing::debug!("rtc transport released");
    }

    fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
            && self.commands.lock().is_none()
            && self.driver.lock().is_none()
    }
}

/// Owns the peer connection and its socket; runs until closed.
struct Driver {
    rtc: Rtc,
    socket: UdpSocket,
    local: SocketAddr,
    audio_mid: Mid,
    channel_id: ChannelId,
    pt: Pt,
    clock_rate: Frequency,
    codec: OpusCodec,
    assembler: FrameAssembler,
    rtp_offset: u64,
    ice_connected: bool,
    channel_open: bool,
    pending: Vec<String>,
    capture: Option<mpsc::Receiver<Vec<f32>>>,
    shared: Arc<Shared>,
    ready: watch::Sender<bool>,
}

impl Driver {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        let mut buf = vec![0u8; 2000];
        let outcome = loop {
            let deadline = match self.drain_output().await {
                Ok(Some(deadline)) => deadline,
                Ok(None) => break LinkState::Closed,
                Err(e) => {
                    tracing::warn!(error = %e, "peer connection failed");
                    break LinkState::Failed;
                }
            };

            let sleep = tokio::time::sleep_until(tokio::time::Instant::from_std(deadline));
            let input = tokio::select! {
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok((n, source)) => match Receive::new(Protocol::Udp, source, self.local, &buf[..n]) {
                        Ok(receive) => Some(Input::Receive(Instant::now(), receive)),
                        Err(e) => {
                            tracing::trace!(error = %e, "ignoring unparseable datagram");
                            None
                        }
                    },
                    Err(e) => {
                        tracing::warn!(error = %e, "UDP receive failed");
                        break LinkState::Failed;
                    }
                },
                command = commands.recv() => match command {
                    Some(Command::Control(json)) => {
                        self.write_control(json);
                        None
                    }
                    Some(Command::Capture(rx)) => {
                        self.capture = Some(rx);
                        None
                    }
                    Some(Command::Close) | None => {
                        self.rtc.disconnect();
                        break LinkState::Closed;
                    }
                },
                block = next_block(&mut self.capture) => {
                    match block {
                        Some(samples) => self.write_capture(&samples),
                        None => self.capture = None,
                    }
                    None
                },
                _ = sleep => Some(Input::Timeout(Instant::now())),
            };

            if let Some(input) = input {
                if let Err(e) = self.rtc.handle_input(input) {
                    tracing::warn!(error = %e, "peer connection rejected input");
                    break LinkState::Failed;
                }
            }
        };

        self.capture = None;
        if !self.shared.closing.load(Ordering::SeqCst) {
            self.shared.set_state(outcome);
        }
    }

    /// Flush transmits and events. Returns the next timeout, or `None` once
    /// the connection is gone.
    async fn drain_output(&mut self) -> Result<Option<Instant>> {
        loop {
            if !self.rtc.is_alive() {
                return Ok(None);
            }
            let output = self
                .rtc
                .poll_output()
                .map_err(|e| RealtimeError::webrtc(format!("poll failed: {e}")))?;
            match output {
                Output::Timeout(deadline) => return Ok(Some(deadline)),
                Output::Transmit(transmit) => {
                    if let Err(e) = self.socket.send_to(&transmit.contents, transmit.destination).await
                    {
                        tracing::debug!(error = %e, "UDP send failed");
                    }
                }
                Output::Event(event) => {
                    if !self.handle_event(event) {
                        return Ok(None);
                    }
                }
            }
        }
    }

    /// Returns false when the connection should stop.
    fn handle_event(&mut self, event: Event) -> bool {
        match event {
            Event::Connected => {
                self.ice_connected = true;
                self.update_ready();
            }
            Event::IceConnectionStateChange(state) => {
                tracing::debug!(?state, "ICE state changed");
                if state == IceConnectionState::Disconnected {
                    return false;
                }
            }
            Event::ChannelOpen(id, label) if id == self.channel_id => {
                tracing::debug!(%label, "data channel open");
                self.channel_open = true;
                for json in std::mem::take(&mut self.pending) {
                    self.write_control(json);
                }
                self.update_ready();
            }
            Event::ChannelData(data) if data.id == self.channel_id => {
                match std::str::from_utf8(&data.data) {
                    Ok(text) => self.shared.observers.for_each(|o| o.on_message(text)),
                    Err(_) => tracing::debug!(len = data.data.len(), "ignoring non-UTF-8 channel data"),
                }
            }
            Event::ChannelClose(id) if id == self.channel_id => {
                tracing::info!("data channel closed by peer");
                return false;
            }
            Event::MediaData(media) if media.mid == self.audio_mid => {
                match self.codec.decode(&media.data) {
                    Ok(samples) => {
                        let frame = AudioFrame::new(samples);
                        self.shared.observers.for_each(|o| o.on_audio_frame(&frame));
                    }
                    Err(e) => tracing::debug!(error = %e, "dropping undecodable audio packet"),
                }
            }
            _ => {}
        }
        true
    }

    fn update_ready(&self) {
        if self.ice_connected && self.channel_open {
            let _ = self.ready.send(true);
        }
    }

    fn write_control(&mut self, json: String) {
        if !self.channel_open {
            if self.pending.len() >= MAX_PENDING_DC_MESSAGES {
                tracing::warn!("data channel queue full, dropping control message");
            } else {
                self.pending.push(json);
            }
            return;
        }
        let Some(mut channel) = self.rtc.channel(self.channel_id) else {
            tracing::warn!("data channel not available, dropping control message");
            return;
        };
        if let Err(e) = channel.write(false, json.as_bytes()) {
            tracing::warn!(error = %e, "data channel write failed");
        }
    }

    fn write_capture(&mut self, samples: &[f32]) {
        self.assembler.push(&encode_samples(samples));
        while let Some(frame) = self.assembler.next_frame() {
            if let Err(e) = self.write_frame(&frame.samples) {
                tracing::debug!(error = %e, "dropping capture frame");
            }
        }
    }

    fn write_frame(&mut self, pcm: &[i16]) -> Result<()> {
        let opus = self.codec.encode(pcm)?;

        // the RTP clock for Opus runs at the negotiated rate, not 24kHz
        let clock_hz = self.clock_rate.get() as u64;
        let advance = pcm.len() as u64 * clock_hz / SAMPLE_RATE as u64;
        let offset = self.rtp_offset;
        self.rtp_offset += advance;

        let writer = self
            .rtc
            .writer(self.audio_mid)
            .ok_or_else(|| RealtimeError::webrtc("Audio track writer not available"))?;
        writer
            .write(self.pt, Instant::now(), MediaTime::new(offset, self.clock_rate), opus)
            .map_err(|e| RealtimeError::webrtc(format!("Audio track write failed: {e}")))?;
        Ok(())
    }
}

async fn next_block(capture: &mut Option<mpsc::Receiver<Vec<f32>>>) -> Option<Vec<f32>> {
    match capture.as_mut() {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

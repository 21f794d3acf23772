//! Session controller: the call state machine.
//!
//! The controller owns the one live [`Session`], walks it through
//! [`ConnectionState`], and coordinates the transport, the media devices and
//! the dispatcher. Teardown is shared by user-initiated `end_call`, setup
//! failures and link loss, and releases every resource it can even when one
//! step fails.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::audio::{AudioFrame, FrameAssembler};
use crate::config::BridgeConfig;
use crate::credential::{Credential, CredentialBroker, HttpCredentialBroker};
use crate::dispatcher::{EventDispatcher, TranscriptLog};
use crate::error::{RealtimeError, Result};
use crate::events::ClientEvent;
use crate::media::{CaptureSource, MediaDevices, PlaybackSink};
use crate::scenario::{Scenario, ScenarioTable};
use crate::session::{CallSummary, ConnectionState, Session};
use crate::subscribers::SubscriptionId;
use crate::transport::{
    DefaultTransports, LinkState, Transport, TransportFactory, TransportObserver,
};

/// Modalities requested for the opening utterance.
const OPENING_MODALITIES: [&str; 2] = ["audio", "text"];

/// Builder for [`SessionController`].
pub struct SessionControllerBuilder {
    config: BridgeConfig,
    scenarios: ScenarioTable,
    transports: Arc<dyn TransportFactory>,
    broker: Option<Arc<dyn CredentialBroker>>,
    devices: Option<Arc<dyn MediaDevices>>,
    dispatcher: Option<Arc<EventDispatcher>>,
}

impl SessionControllerBuilder {
    /// Start from a bridge configuration.
    pub fn new(config: BridgeConfig) -> Self {
        Self {
            config,
            scenarios: ScenarioTable::builtin(),
            transports: Arc::new(DefaultTransports),
            broker: None,
            devices: None,
            dispatcher: None,
        }
    }

    /// Use a custom scenario table.
    pub fn scenarios(mut self, scenarios: ScenarioTable) -> Self {
        self.scenarios = scenarios;
        self
    }

    /// Use a custom transport factory.
    pub fn transports(mut self, transports: Arc<dyn TransportFactory>) -> Self {
        self.transports = transports;
        self
    }

    /// Use a custom credential broker. Defaults to the HTTP broker at the
    /// configured URL.
    pub fn broker(mut self, broker: Arc<dyn CredentialBroker>) -> Self {
        self.broker = Some(broker);
        self
    }

    /// Set the capture and playback devices.
    pub fn devices(mut self, devices: Arc<dyn MediaDevices>) -> Self {
        self.devices = Some(devices);
        self
    }

    /// Share an existing dispatcher.
    pub fn dispatcher(mut self, dispatcher: Arc<EventDispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    /// Build the controller (does not start a call).
    pub fn build(self) -> Result<SessionController> {
        let devices =
            self.devices.ok_or_else(|| RealtimeError::config("Media devices are required"))?;
        let broker = self
            .broker
            .unwrap_or_else(|| Arc::new(HttpCredentialBroker::new(self.config.broker_url.clone())));
        let dispatcher = self.dispatcher.unwrap_or_default();

        let transcripts = Arc::new(TranscriptLog::new());
        dispatcher.subscribe(transcripts.clone());

        Ok(SessionController {
            inner: Arc::new(Inner {
                config: self.config,
                scenarios: self.scenarios,
                transports: self.transports,
                broker,
                devices,
                dispatcher,
                transcripts,
                session: Mutex::new(None),
                call: Mutex::new(None),
                last_summary: Mutex::new(None),
            }),
        })
    }
}

/// Drives practice calls.
///
/// # Example
///
/// ```rust,ignore
/// use std::sync::Arc;
/// use pitchline_realtime::{BridgeConfig, FixedDevices, Scenario, SessionController};
///
/// let controller = SessionController::builder(BridgeConfig::default())
///     .devices(Arc::new(FixedDevices::new(capture, playback)))
///     .build()?;
///
/// controller.start_call(Scenario::Price).await?;
/// // ... talk ...
/// let summary = controller.end_call().await;
/// ```
#[derive(Clone)]
pub struct SessionController {
    inner: Arc<Inner>,
}

struct Inner {
    config: BridgeConfig,
    scenarios: ScenarioTable,
    transports: Arc<dyn TransportFactory>,
    broker: Arc<dyn CredentialBroker>,
    devices: Arc<dyn MediaDevices>,
    dispatcher: Arc<EventDispatcher>,
    transcripts: Arc<TranscriptLog>,
    session: Mutex<Option<Session>>,
    call: Mutex<Option<ActiveCall>>,
    last_summary: Mutex<Option<CallSummary>>,
}

/// Resources held by the live call. Filled in as setup acquires them.
struct ActiveCall {
    cancel: CancellationToken,
    in_call: Arc<AtomicBool>,
    elapsed: Arc<AtomicU64>,
    transport: Option<Arc<dyn Transport>>,
    observer: Option<(SubscriptionId, Arc<CallObserver>)>,
    capture: Option<Arc<dyn CaptureSource>>,
    playback: Option<Arc<dyn PlaybackSink>>,
    tasks: Vec<JoinHandle<()>>,
}

impl ActiveCall {
    fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
            in_call: Arc::new(AtomicBool::new(false)),
            elapsed: Arc::new(AtomicU64::new(0)),
            transport: None,
            observer: None,
            capture: None,
            playback: None,
            tasks: Vec::new(),
        }
    }
}

/// Why a call is being torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ending {
    User,
    LinkClosed,
    LinkFailed,
}

impl SessionController {
    /// Create a builder.
    pub fn builder(config: BridgeConfig) -> SessionControllerBuilder {
        SessionControllerBuilder::new(config)
    }

    /// The dispatcher inbound events are routed through.
    pub fn dispatcher(&self) -> &Arc<EventDispatcher> {
        &self.inner.dispatcher
    }

    /// The bridge configuration.
    pub fn config(&self) -> &BridgeConfig {
        &self.inner.config
    }

    /// Snapshot of the current (or most recent) session.
    pub fn session(&self) -> Option<Session> {
        self.inner.session.lock().clone()
    }

    /// Current state; `Idle` before the first call.
    pub fn state(&self) -> ConnectionState {
        self.inner.session.lock().as_ref().map(|s| s.state).unwrap_or_default()
    }

    /// Seconds counted by the duration timer for the live call.
    pub fn elapsed_secs(&self) -> u64 {
        self.inner.call.lock().as_ref().map(|c| c.elapsed.load(Ordering::SeqCst)).unwrap_or(0)
    }

    /// Summary of the last call that ended.
    pub fn last_summary(&self) -> Option<CallSummary> {
        self.inner.last_summary.lock().clone()
    }

    /// Start a call with `scenario`. Returns once the call is `InCall`.
    ///
    /// Fails with a state error if a call is already live. Any setup error
    /// releases what was acquired and leaves the session `Failed`.
    pub async fn start_call(&self, scenario: Scenario) -> Result<Session> {
        self.inner.config.validate()?;

        let session = Session::new(scenario, self.inner.config.transport);
        {
            let mut slot = self.inner.session.lock();
            if let Some(current) = slot.as_ref() {
                if current.state.is_live() {
                    return Err(RealtimeError::state(format!(
                        "a call is already {} (session {})",
                        current.state, current.id
                    )));
                }
            }
            *slot = Some(session.clone());
            *self.inner.call.lock() = Some(ActiveCall::new());
        }
        self.inner.transcripts.take();

        let span = tracing::info_span!("call", session_id = %session.id, scenario = %scenario);
        let inner = Arc::clone(&self.inner);
        match inner.setup(scenario).instrument(span).await {
            Ok(()) => Ok(self.session().unwrap_or(session)),
            Err(e) => {
                self.inner.abort_setup(&e).await;
                Err(e)
            }
        }
    }

    /// Switch the persona mid-call. Sends exactly one `session.update`.
    pub fn set_scenario(&self, scenario: Scenario) -> Result<()> {
        let transport = self.inner.live_transport("set scenario")?;
        let instructions = self.inner.scenarios.instructions(scenario);
        transport.send_control(&ClientEvent::SessionUpdate {
            session: self.inner.config.session.scenario_payload(&instructions),
        });
        if let Some(session) = self.inner.session.lock().as_mut() {
            session.scenario = scenario;
        }
        tracing::info!(scenario = %scenario, "scenario updated");
        Ok(())
    }

    /// Commit buffered input audio.
    pub fn commit_audio(&self) -> Result<()> {
        let transport = self.inner.live_transport("commit audio")?;
        transport.send_control(&ClientEvent::InputAudioBufferCommit);
        Ok(())
    }

    /// Ask the service for a reply with the given modalities.
    pub fn request_response(&self, modalities: &[&str]) -> Result<()> {
        let transport = self.inner.live_transport("request response")?;
        transport.send_control(&ClientEvent::response_with_modalities(modalities));
        Ok(())
    }

    /// End the call and release everything it holds.
    ///
    /// A no-op returning `None` when no call is live.
    pub async fn end_call(&self) -> Option<CallSummary> {
        Arc::clone(&self.inner).finish(Ending::User).await
    }
}

impl Inner {
    /// Move the session to `next`, refusing transitions the state machine
    /// does not allow.
    fn advance(&self, next: ConnectionState) -> Result<()> {
        let (id, prev) = {
            let mut guard = self.session.lock();
            let Some(session) = guard.as_mut() else {
                return Err(RealtimeError::state("no session"));
            };
            let prev = session.state;
            if !prev.can_transition_to(next) {
                return Err(RealtimeError::state(format!("cannot move from {prev} to {next}")));
            }
            session.state = next;
            if next.is_terminal() {
                session.ended_at = Some(Utc::now());
            }
            (session.id, prev)
        };
        if prev != next {
            tracing::info!(session_id = %id, from = %prev, state = %next, "session state changed");
            self.dispatcher.notify_state(next);
        }
        Ok(())
    }

    /// Store a resource in the live call, or hand it back if the call was
    /// ended meanwhile.
    fn hold<T>(
        &self,
        value: T,
        put: impl FnOnce(&mut ActiveCall, T),
    ) -> std::result::Result<(), T> {
        match self.call.lock().as_mut() {
            Some(call) => {
                put(call, value);
                Ok(())
            }
            None => Err(value),
        }
    }

    fn cancelled() -> RealtimeError {
        RealtimeError::state("call ended during setup")
    }

    fn live_transport(&self, what: &str) -> Result<Arc<dyn Transport>> {
        if self.session.lock().as_ref().map(|s| s.state) != Some(ConnectionState::InCall) {
            return Err(RealtimeError::state(format!("cannot {what} outside a live call")));
        }
        self.call
            .lock()
            .as_ref()
            .and_then(|c| c.transport.clone())
            .ok_or_else(|| RealtimeError::state(format!("cannot {what}: no transport")))
    }

    async fn setup(self: Arc<Self>, scenario: Scenario) -> Result<()> {
        let (cancel, in_call, elapsed) = {
            let guard = self.call.lock();
            let call = guard.as_ref().ok_or_else(Self::cancelled)?;
            (call.cancel.clone(), Arc::clone(&call.in_call), Arc::clone(&call.elapsed))
        };

        let credential = if self.config.transport.needs_credential() {
            self.advance(ConnectionState::AcquiringCredential)?;
            let credential = tokio::select! {
                acquired = self.broker.acquire() => acquired?,
                _ = cancel.cancelled() => return Err(Self::cancelled()),
            };
            if credential.is_expired() {
                return Err(RealtimeError::credential("broker returned an expired client secret"));
            }
            tracing::debug!(expires_at = %credential.expires_at, "credential acquired");
            if let Some(session) = self.session.lock().as_mut() {
                session.credential = Some(credential.clone());
            }
            Some(credential)
        } else {
            None
        };

        self.advance(ConnectionState::Negotiating)?;
        let transport = self.attach_transport(&in_call)?;
        self.connect(&transport, credential.as_ref(), &cancel).await?;
        self.advance(ConnectionState::Connected)?;

        let playback = self.devices.open_playback().await?;
        if let Err(playback) = self.hold(Arc::clone(&playback), |c, p| c.playback = Some(p)) {
            let _ = playback.close();
            return Err(Self::cancelled());
        }
        self.with_observer(|o| *o.playback.lock() = Some(Arc::clone(&playback)));

        let capture = self.devices.open_capture().await?;
        if let Err(capture) = self.hold(Arc::clone(&capture), |c, s| c.capture = Some(s)) {
            capture.stop();
            return Err(Self::cancelled());
        }
        let blocks = capture.start().await?;
        // end_call may have released the capture while it was starting
        if cancel.is_cancelled() || self.call.lock().is_none() {
            capture.stop();
            return Err(Self::cancelled());
        }

        transport.send_control(&ClientEvent::SessionUpdate {
            session: self.config.session.initial_payload(),
        });

        in_call.store(true, Ordering::SeqCst);
        if let Some(blocks) = transport.attach_capture(blocks) {
            let pump = tokio::spawn(
                pump_capture(
                    blocks,
                    Arc::clone(&transport),
                    self.config.frame_samples,
                    Arc::clone(&in_call),
                    cancel.clone(),
                )
                .in_current_span(),
            );
            if let Err(pump) = self.hold(pump, |c, t| c.tasks.push(t)) {
                pump.abort();
                return Err(Self::cancelled());
            }
        }
        self.advance(ConnectionState::InCall)?;

        let ticker = tokio::spawn(count_duration(elapsed, cancel.clone()));
        if let Err(ticker) = self.hold(ticker, |c, t| c.tasks.push(t)) {
            ticker.abort();
            return Err(Self::cancelled());
        }

        // not held in the call: it may itself run the teardown
        if let Some(link_lost) = self.with_observer(|o| o.link_lost.clone()) {
            let inner = Arc::clone(&self);
            let watched = Arc::clone(&transport);
            let cancel = cancel.clone();
            tokio::spawn(
                async move {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {}
                        _ = link_lost.cancelled() => {
                            let ending = link_lost_ending(&watched);
                            tracing::warn!(?ending, "transport lost mid-call");
                            inner.finish(ending).await;
                        }
                    }
                }
                .in_current_span(),
            );
        }

        let instructions = self.scenarios.instructions(scenario);
        transport.send_control(&ClientEvent::SessionUpdate {
            session: self.config.session.scenario_payload(&instructions),
        });
        transport.send_control(&ClientEvent::user_text(self.config.opening_line.clone()));
        transport.send_control(&ClientEvent::response_with_modalities(&OPENING_MODALITIES));

        tracing::info!("call live");
        Ok(())
    }

    fn attach_transport(&self, in_call: &Arc<AtomicBool>) -> Result<Arc<dyn Transport>> {
        let transport = self.transports.create(&self.config)?;
        let observer = Arc::new(CallObserver {
            dispatcher: Arc::clone(&self.dispatcher),
            playback: Mutex::new(None),
            in_call: Arc::clone(in_call),
            link_lost: CancellationToken::new(),
        });
        let id = transport.subscribe(observer.clone());

        let held = self.hold((Arc::clone(&transport), id, observer), |c, (t, id, o)| {
            c.transport = Some(t);
            c.observer = Some((id, o));
        });
        if held.is_err() {
            transport.unsubscribe(id);
            return Err(Self::cancelled());
        }
        Ok(transport)
    }

    async fn connect(
        &self,
        transport: &Arc<dyn Transport>,
        credential: Option<&Credential>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        tokio::select! {
            connected = transport.connect(credential) => connected,
            _ = cancel.cancelled() => Err(Self::cancelled()),
        }
    }

    fn with_observer<R>(&self, f: impl FnOnce(&CallObserver) -> R) -> Option<R> {
        let observer = self
            .call
            .lock()
            .as_ref()
            .and_then(|c| c.observer.as_ref().map(|(_, o)| Arc::clone(o)))?;
        Some(f(&observer))
    }

    /// Release whatever a failed setup acquired and mark the session failed.
    async fn abort_setup(&self, error: &RealtimeError) {
        let call = self.call.lock().take();
        let Some(call) = call else {
            // end_call took over the teardown
            return;
        };
        tracing::warn!(error = %error, kind = %error.kind(), "call setup failed");
        release(call).await;
        if self.advance(ConnectionState::Failed).is_err() {
            tracing::debug!("session already terminal after setup failure");
        }
        self.dispatcher.notify_error(error);
    }

    /// Shared teardown for every way a live call ends.
    async fn finish(self: Arc<Self>, ending: Ending) -> Option<CallSummary> {
        let live = self.session.lock().as_ref().is_some_and(|s| s.state.is_live());
        if !live {
            return None;
        }
        let call = self.call.lock().take()?;

        if self.advance(ConnectionState::Closing).is_err() {
            tracing::debug!("session not in a closable state");
        }
        let duration_secs = release(call).await;

        let final_state = match ending {
            Ending::User | Ending::LinkClosed => ConnectionState::Closed,
            Ending::LinkFailed => ConnectionState::Failed,
        };
        if let Err(e) = self.advance(final_state) {
            tracing::debug!(error = %e, "final transition refused");
        }
        if ending == Ending::LinkFailed {
            self.dispatcher
                .notify_error(&RealtimeError::connection("transport failed during the call"));
        }

        let session = self.session.lock().clone()?;
        let summary = CallSummary {
            session_id: session.id,
            scenario: session.scenario,
            transport: session.transport,
            started_at: session.started_at,
            ended_at: session.ended_at.unwrap_or_else(Utc::now),
            duration_secs,
            final_state: session.state,
            transcripts: self.transcripts.take(),
        };
        tracing::info!(
            session_id = %summary.session_id,
            duration_secs,
            state = %summary.final_state,
            transcripts = summary.transcripts.len(),
            "call ended"
        );
        *self.last_summary.lock() = Some(summary.clone());
        Some(summary)
    }
}

/// Release every resource of `call`. Each step runs regardless of the
/// others. Returns the counted duration.
async fn release(call: ActiveCall) -> u64 {
    call.cancel.cancel();
    call.in_call.store(false, Ordering::SeqCst);

    if let Some(capture) = &call.capture {
        capture.stop();
    }

    for task in call.tasks {
        task.abort();
        let _ = task.await;
    }

    if let Some(transport) = &call.transport {
        if let Some((id, _)) = &call.observer {
            transport.unsubscribe(*id);
        }
        transport.disconnect().await;
    }

    if let Some(playback) = &call.playback {
        if let Err(e) = playback.close() {
            tracing::warn!(error = %e, "failed to close playback");
        }
    }

    call.elapsed.load(Ordering::SeqCst)
}

fn link_lost_ending(transport: &Arc<dyn Transport>) -> Ending {
    match transport.link_state() {
        LinkState::Failed => Ending::LinkFailed,
        _ => Ending::LinkClosed,
    }
}

/// Frame captured blocks and hand them to the transport while the call is
/// live. Frames that arrive outside the call are dropped.
async fn pump_capture(
    mut blocks: mpsc::Receiver<Vec<f32>>,
    transport: Arc<dyn Transport>,
    frame_samples: usize,
    in_call: Arc<AtomicBool>,
    cancel: CancellationToken,
) {
    let mut assembler = FrameAssembler::new(frame_samples);
    loop {
        let block = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            block = blocks.recv() => block,
        };
        let Some(block) = block else {
            if let Some(frame) = assembler.flush_remaining() {
                send_frame(&*transport, &in_call, &frame);
            }
            tracing::debug!("capture ended");
            break;
        };
        assembler.push_f32(&block);
        while let Some(frame) = assembler.next_frame() {
            send_frame(&*transport, &in_call, &frame);
        }
    }
}

fn send_frame(transport: &dyn Transport, in_call: &AtomicBool, frame: &AudioFrame) {
    if in_call.load(Ordering::SeqCst) {
        transport.send_audio(frame);
    } else {
        tracing::debug!(samples = frame.len(), "dropping frame outside the call");
    }
}

async fn count_duration(elapsed: Arc<AtomicU64>, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(Duration::from_secs(1));
    interval.tick().await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                elapsed.fetch_add(1, Ordering::SeqCst);
            }
        }
    }
}

/// Routes transport traffic into the dispatcher and playback.
struct CallObserver {
    dispatcher: Arc<EventDispatcher>,
    playback: Mutex<Option<Arc<dyn PlaybackSink>>>,
    in_call: Arc<AtomicBool>,
    link_lost: CancellationToken,
}

impl TransportObserver for CallObserver {
    fn on_message(&self, raw: &str) {
        // protocol errors are logged by the dispatcher and go no further
        let _ = self.dispatcher.dispatch_raw(raw);
    }

    fn on_audio_frame(&self, frame: &AudioFrame) {
        if !self.in_call.load(Ordering::SeqCst) {
            tracing::debug!(samples = frame.len(), "dropping inbound audio outside the call");
            return;
        }
        let playback = self.playback.lock().clone();
        if let Some(playback) = playback {
            if let Err(e) = playback.play(frame) {
                tracing::warn!(error = %e, "playback failed");
                self.dispatcher.notify_error(&e);
                return;
            }
        }
        self.dispatcher.notify_audio(frame);
    }

    fn on_state_change(&self, state: LinkState) {
        if state.is_down() {
            self.link_lost.cancel();
        }
    }
}

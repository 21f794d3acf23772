//! Inbound control-message dispatch.
//!
//! Each raw message from the transport is parsed into a [`ServerEvent`],
//! mapped onto the closed [`BridgeEvent`] set and handed to every subscribed
//! [`EventHandler`] in registration order. Unknown message types are dropped
//! at `debug`; malformed messages are dropped at `warn`. Neither ends the call.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::audio::AudioFrame;
use crate::error::{RealtimeError, Result};
use crate::events::{ErrorInfo, ServerEvent};
use crate::session::ConnectionState;
use crate::subscribers::{SubscriptionId, Subscribers};

/// Who produced a transcript.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    /// The trainee.
    User,
    /// The remote prospect.
    Assistant,
}

/// Whether a transcript fragment is final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Completeness {
    /// More text will follow.
    Partial,
    /// Complete utterance.
    Final,
}

/// A transcript fragment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptEvent {
    /// Speaker of the fragment.
    pub speaker: Speaker,
    /// Text of the fragment.
    pub text: String,
    /// Partial or final.
    pub completeness: Completeness,
}

impl TranscriptEvent {
    /// A partial fragment.
    pub fn partial(speaker: Speaker, text: impl Into<String>) -> Self {
        Self { speaker, text: text.into(), completeness: Completeness::Partial }
    }

    /// A final utterance.
    pub fn final_text(speaker: Speaker, text: impl Into<String>) -> Self {
        Self { speaker, text: text.into(), completeness: Completeness::Final }
    }

    /// True for a final utterance.
    pub fn is_final(&self) -> bool {
        self.completeness == Completeness::Final
    }
}

/// Internal events produced from inbound control messages.
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeEvent {
    /// `session.created`
    SessionCreated { session: Value },
    /// `session.updated`
    SessionUpdated { session: Value },
    /// `input_audio_buffer.speech_started`
    SpeechStarted { audio_start_ms: u64 },
    /// `input_audio_buffer.speech_stopped`
    SpeechStopped { audio_end_ms: u64 },
    /// `input_audio_buffer.committed`
    AudioCommitted { item_id: String },
    /// `response.created`
    ResponseCreated { response: Value },
    /// `response.output_item.added`
    OutputItemAdded { item: Value },
    /// `response.audio.delta`; the samples themselves are delivered to
    /// playback by the transport.
    AudioDelta { item_id: String, samples: usize },
    /// `response.audio_transcript.delta`
    TranscriptPartial(TranscriptEvent),
    /// `response.audio_transcript.done` or
    /// `conversation.item.input_audio_transcription.completed`
    TranscriptFinal(TranscriptEvent),
    /// `response.text.delta`
    TextDelta { delta: String },
    /// `response.text.done`
    TextDone { text: String },
    /// `response.done`
    ResponseDone { response: Value },
    /// `error`
    Error(ErrorInfo),
}

impl BridgeEvent {
    /// Map a parsed wire event. Returns `None` for unknown types.
    pub fn from_server_event(event: ServerEvent) -> Option<Self> {
        let mapped = match event {
            ServerEvent::SessionCreated { session, .. } => Self::SessionCreated { session },
            ServerEvent::SessionUpdated { session, .. } => Self::SessionUpdated { session },
            ServerEvent::SpeechStarted { audio_start_ms, .. } => {
                Self::SpeechStarted { audio_start_ms }
            }
            ServerEvent::SpeechStopped { audio_end_ms, .. } => Self::SpeechStopped { audio_end_ms },
            ServerEvent::AudioCommitted { item_id, .. } => Self::AudioCommitted { item_id },
            ServerEvent::ResponseCreated { response, .. } => Self::ResponseCreated { response },
            ServerEvent::OutputItemAdded { item, .. } => Self::OutputItemAdded { item },
            ServerEvent::AudioDelta { item_id, delta, .. } => {
                Self::AudioDelta { item_id, samples: delta.len() / 2 }
            }
            ServerEvent::TranscriptDelta { delta, .. } => {
                Self::TranscriptPartial(TranscriptEvent::partial(Speaker::Assistant, delta))
            }
            ServerEvent::TranscriptDone { transcript, .. } => {
                Self::TranscriptFinal(TranscriptEvent::final_text(Speaker::Assistant, transcript))
            }
            ServerEvent::InputTranscriptionCompleted { transcript, .. } => {
                Self::TranscriptFinal(TranscriptEvent::final_text(Speaker::User, transcript))
            }
            ServerEvent::TextDelta { delta, .. } => Self::TextDelta { delta },
            ServerEvent::TextDone { text, .. } => Self::TextDone { text },
            ServerEvent::ResponseDone { response, .. } => Self::ResponseDone { response },
            ServerEvent::Error { error, .. } => Self::Error(error),
            ServerEvent::Unknown => return None,
        };
        Some(mapped)
    }

    /// The transcript carried by this event, if any.
    pub fn transcript(&self) -> Option<&TranscriptEvent> {
        match self {
            Self::TranscriptPartial(t) | Self::TranscriptFinal(t) => Some(t),
            _ => None,
        }
    }
}

/// Receives dispatched events. Every hook defaults to a no-op.
///
/// Hooks run on the transport's receive path and must not block.
pub trait EventHandler: Send + Sync {
    /// Called for every mapped event.
    fn on_event(&self, _event: &BridgeEvent) {}

    /// Called for transcript fragments of either speaker.
    fn on_transcript(&self, _transcript: &TranscriptEvent) {}

    /// Called when a decoded inbound frame has been handed to playback.
    fn on_audio_playable(&self, _frame: &AudioFrame) {}

    /// Called on every session state change.
    fn on_connection_state(&self, _state: ConnectionState) {}

    /// Called for service-reported and transport errors.
    fn on_error(&self, _error: &RealtimeError) {}
}

/// Default no-op event handler.
#[derive(Debug, Clone, Default)]
pub struct NoOpEventHandler;

impl EventHandler for NoOpEventHandler {}

/// Routes inbound messages and session notifications to subscribers.
#[derive(Default)]
pub struct EventDispatcher {
    handlers: Subscribers<dyn EventHandler>,
}

impl EventDispatcher {
    /// Create a dispatcher with no subscribers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler.
    pub fn subscribe(&self, handler: Arc<dyn EventHandler>) -> SubscriptionId {
        self.handlers.add(handler)
    }

    /// Remove a handler.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.handlers.remove(id)
    }

    /// Number of registered handlers.
    pub fn subscriber_count(&self) -> usize {
        self.handlers.len()
    }

    /// Subscribe a bounded channel. Events are dropped while it is full.
    pub fn channel(&self, capacity: usize) -> (SubscriptionId, mpsc::Receiver<BridgeEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let id = self.subscribe(Arc::new(ChannelHandler { tx }));
        (id, rx)
    }

    /// Parse and dispatch one raw inbound message.
    ///
    /// Returns `Ok(None)` when the message type is unknown. Malformed
    /// messages yield a protocol error after being logged; nothing is
    /// dispatched for them.
    pub fn dispatch_raw(&self, raw: &str) -> Result<Option<BridgeEvent>> {
        let value: Value = serde_json::from_str(raw).map_err(|e| {
            tracing::warn!(error = %e, "dropping malformed control message");
            RealtimeError::protocol(format!("malformed control message: {e}"))
        })?;

        let Some(event_type) = value.get("type").and_then(Value::as_str).map(str::to_owned) else {
            tracing::warn!("dropping control message without a type");
            return Err(RealtimeError::protocol("control message has no type"));
        };

        let event: ServerEvent = serde_json::from_value(value).map_err(|e| {
            tracing::warn!(event_type = %event_type, error = %e, "dropping malformed control message");
            RealtimeError::protocol(format!("malformed {event_type}: {e}"))
        })?;

        if matches!(event, ServerEvent::Unknown) {
            tracing::debug!(event_type = %event_type, "ignoring unrecognized control message");
            return Ok(None);
        }

        Ok(self.dispatch(event))
    }

    /// Dispatch an already-parsed event.
    pub fn dispatch(&self, event: ServerEvent) -> Option<BridgeEvent> {
        let mapped = BridgeEvent::from_server_event(event)?;

        let server_error = match &mapped {
            BridgeEvent::Error(info) => Some(RealtimeError::server(
                info.code.clone().unwrap_or_else(|| info.error_type.clone()),
                info.message.clone(),
            )),
            _ => None,
        };
        if let Some(err) = &server_error {
            tracing::warn!(error = %err, "remote service reported an error");
        }

        for handler in self.handlers.snapshot() {
            handler.on_event(&mapped);
            if let Some(transcript) = mapped.transcript() {
                handler.on_transcript(transcript);
            }
            if let Some(err) = &server_error {
                handler.on_error(err);
            }
        }
        Some(mapped)
    }

    /// Notify subscribers that a frame was handed to playback.
    pub fn notify_audio(&self, frame: &AudioFrame) {
        self.handlers.for_each(|h| h.on_audio_playable(frame));
    }

    /// Notify subscribers of a state change.
    pub fn notify_state(&self, state: ConnectionState) {
        self.handlers.for_each(|h| h.on_connection_state(state));
    }

    /// Notify subscribers of an error.
    pub fn notify_error(&self, error: &RealtimeError) {
        self.handlers.for_each(|h| h.on_error(error));
    }
}

struct ChannelHandler {
    tx: mpsc::Sender<BridgeEvent>,
}

impl EventHandler for ChannelHandler {
    fn on_event(&self, event: &BridgeEvent) {
        if let Err(mpsc::error::TrySendError::Full(_)) = self.tx.try_send(event.clone()) {
            tracing::debug!("event channel full, dropping event");
        }
    }
}

/// Collects final transcripts in arrival order.
#[derive(Debug, Default)]
pub struct TranscriptLog {
    entries: Mutex<Vec<TranscriptEvent>>,
}

impl TranscriptLog {
    /// Create an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Final transcripts recorded so far.
    pub fn entries(&self) -> Vec<TranscriptEvent> {
        self.entries.lock().clone()
    }

    /// Take and clear the recorded transcripts.
    pub fn take(&self) -> Vec<TranscriptEvent> {
        std::mem::take(&mut *self.entries.lock())
    }
}

impl EventHandler for TranscriptLog {
    fn on_transcript(&self, transcript: &TranscriptEvent) {
        if transcript.is_final() {
            self.entries.lock().push(transcript.clone());
        }
    }
}

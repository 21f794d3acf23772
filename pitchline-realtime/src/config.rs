//! Configuration types for the bridge.

use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::audio::{AudioEncoding, DEFAULT_FRAME_SAMPLES};
use crate::error::{RealtimeError, Result};

/// Default realtime model.
pub const DEFAULT_MODEL: &str = "gpt-4o-realtime-preview-2024-10-01";

/// Default realtime WebSocket endpoint.
pub const DEFAULT_REALTIME_URL: &str = "wss://api.openai.com/v1/realtime";

/// Default offer/answer exchange endpoint.
pub const DEFAULT_SDP_URL: &str = "https://api.openai.com/v1/realtime";

/// Default credential broker endpoint.
pub const DEFAULT_BROKER_URL: &str = "http://localhost:3001/api/realtime/secret";

/// First user message seeded into the conversation.
pub const DEFAULT_OPENING_LINE: &str =
    "Hello! I'm calling to talk to you about life insurance options. Do you currently have life insurance?";

/// Instructions applied before a scenario is selected.
pub const BASE_INSTRUCTIONS: &str = "You are an AI prospect for life insurance sales training. \
Your role is to help train insurance salespeople by presenting realistic objections during practice calls. \
When the call begins, start by saying \"Hello?\" in a neutral tone, listen to the salesperson's opening, \
present the assigned objection naturally in conversation and respond realistically to their handling of it. \
Don't make it too easy. Keep responses conversational and natural. \
Stay in character as a potential life insurance customer. Be polite but skeptical.";

/// Which transport variant carries the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// JSON control and base64 audio over one WebSocket.
    #[default]
    WebSocket,
    /// Offer/answer negotiated peer connection with a media track.
    WebRtc,
}

impl TransportKind {
    /// Whether this transport needs an ephemeral credential before connecting.
    pub fn needs_credential(self) -> bool {
        matches!(self, Self::WebRtc)
    }
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::WebSocket => write!(f, "websocket"),
            Self::WebRtc => write!(f, "webrtc"),
        }
    }
}

impl FromStr for TransportKind {
    type Err = RealtimeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "websocket" | "ws" | "socket" => Ok(Self::WebSocket),
            "webrtc" | "rtc" => Ok(Self::WebRtc),
            other => Err(RealtimeError::config(format!("unknown transport: {other}"))),
        }
    }
}

/// Server-side turn detection settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VadConfig {
    /// Detection mode, "server_vad".
    #[serde(rename = "type")]
    pub mode: String,
    /// Detection threshold (0.0 - 1.0).
    pub threshold: f64,
    /// Audio kept before detected speech, in ms.
    pub prefix_padding_ms: u32,
    /// Silence before speech is considered ended, in ms.
    pub silence_duration_ms: u32,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            mode: "server_vad".to_string(),
            threshold: 0.5,
            prefix_padding_ms: 300,
            silence_duration_ms: 500,
        }
    }
}

/// Input transcription settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptionConfig {
    /// Transcription model.
    pub model: String,
}

impl TranscriptionConfig {
    /// Whisper transcription.
    pub fn whisper() -> Self {
        Self { model: "whisper-1".to_string() }
    }
}

impl Default for TranscriptionConfig {
    fn default() -> Self {
        Self::whisper()
    }
}

/// Contents of the initial and scenario `session.update` payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// Output modalities.
    pub modalities: Vec<String>,
    /// Voice of the prospect.
    pub voice: String,
    /// Input audio format.
    pub input_audio_format: AudioEncoding,
    /// Output audio format.
    pub output_audio_format: AudioEncoding,
    /// User speech transcription.
    pub input_audio_transcription: TranscriptionConfig,
    /// Turn detection.
    pub turn_detection: VadConfig,
    /// Sampling temperature.
    pub temperature: f64,
    /// Token cap per response.
    pub max_response_output_tokens: u32,
    /// Base instructions before a scenario is applied.
    pub instructions: String,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            modalities: vec!["text".to_string(), "audio".to_string()],
            voice: "alloy".to_string(),
            input_audio_format: AudioEncoding::Pcm16,
            output_audio_format: AudioEncoding::Pcm16,
            input_audio_transcription: TranscriptionConfig::whisper(),
            turn_detection: VadConfig::default(),
            temperature: 0.8,
            max_response_output_tokens: 4096,
            instructions: BASE_INSTRUCTIONS.to_string(),
        }
    }
}

impl SessionSettings {
    /// Payload of the `session.update` sent once the transport is ready.
    pub fn initial_payload(&self) -> Value {
        json!({
            "modalities": self.modalities,
            "instructions": self.instructions,
            "voice": self.voice,
            "input_audio_format": self.input_audio_format,
            "output_audio_format": self.output_audio_format,
            "input_audio_transcription": self.input_audio_transcription,
            "turn_detection": self.turn_detection,
            "temperature": self.temperature,
            "max_response_output_tokens": self.max_response_output_tokens,
        })
    }

    /// Payload of a scenario `session.update` carrying `instructions`.
    pub fn scenario_payload(&self, instructions: &str) -> Value {
        json!({
            "modalities": self.modalities,
            "voice": self.voice,
            "input_audio_transcription": self.input_audio_transcription,
            "turn_detection": self.turn_detection,
            "instructions": instructions,
        })
    }
}

/// Everything the controller and transports need to run a call.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Transport variant.
    pub transport: TransportKind,
    /// Realtime model.
    pub model: String,
    /// Direct WebSocket endpoint.
    pub realtime_url: String,
    /// Relay endpoint. When set, the socket transport connects here without
    /// credentials.
    pub relay_url: Option<String>,
    /// Offer/answer exchange endpoint.
    pub sdp_url: String,
    /// Long-lived API key for a direct socket connection.
    pub api_key: Option<SecretString>,
    /// Credential broker endpoint.
    pub broker_url: String,
    /// Bound on transport readiness, in seconds.
    pub connect_timeout_secs: u64,
    /// Samples per outbound socket frame.
    pub frame_samples: usize,
    /// Outbound control queue depth.
    pub send_queue: usize,
    /// First user message of the conversation.
    pub opening_line: String,
    /// Session payload settings.
    pub session: SessionSettings,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            transport: TransportKind::default(),
            model: DEFAULT_MODEL.to_string(),
            realtime_url: DEFAULT_REALTIME_URL.to_string(),
            relay_url: None,
            sdp_url: DEFAULT_SDP_URL.to_string(),
            api_key: None,
            broker_url: DEFAULT_BROKER_URL.to_string(),
            connect_timeout_secs: 10,
            frame_samples: DEFAULT_FRAME_SAMPLES,
            send_queue: 256,
            opening_line: DEFAULT_OPENING_LINE.to_string(),
            session: SessionSettings::default(),
        }
    }
}

impl BridgeConfig {
    /// Set the transport.
    pub fn with_transport(mut self, transport: TransportKind) -> Self {
        self.transport = transport;
        self
    }

    /// Route the socket transport through a relay.
    pub fn with_relay_url(mut self, url: impl Into<String>) -> Self {
        self.relay_url = Some(url.into());
        self
    }

    /// Set the API key.
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(SecretString::from(key.into()));
        self
    }

    /// Set the credential broker endpoint.
    pub fn with_broker_url(mut self, url: impl Into<String>) -> Self {
        self.broker_url = url.into();
        self
    }

    /// Set the readiness timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_secs = timeout.as_secs().max(1);
        self
    }

    /// Set the outbound socket frame size.
    pub fn with_frame_samples(mut self, samples: usize) -> Self {
        self.frame_samples = samples;
        self
    }

    /// Readiness timeout.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// URL the socket transport dials, with the model query parameter.
    pub fn socket_url(&self) -> String {
        let base = self.relay_url.as_deref().unwrap_or(&self.realtime_url);
        let sep = if base.contains('?') { '&' } else { '?' };
        format!("{base}{sep}model={}", self.model)
    }

    /// Whether the socket transport talks to a relay.
    pub fn uses_relay(&self) -> bool {
        self.relay_url.is_some()
    }

    /// Check the configuration before a call starts.
    pub fn validate(&self) -> Result<()> {
        if self.frame_samples == 0 {
            return Err(RealtimeError::config("frame_samples must be positive"));
        }
        if self.model.trim().is_empty() {
            return Err(RealtimeError::config("model must not be empty"));
        }
        if self.transport == TransportKind::WebSocket
            && self.relay_url.is_none()
            && self.api_key.is_none()
        {
            return Err(RealtimeError::config(
                "a direct socket connection needs an API key; set one or use a relay",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_payload_defaults() {
        let payload = SessionSettings::default().initial_payload();
        assert_eq!(payload["modalities"], json!(["text", "audio"]));
        assert_eq!(payload["voice"], "alloy");
        assert_eq!(payload["input_audio_format"], "pcm16");
        assert_eq!(payload["output_audio_format"], "pcm16");
        assert_eq!(payload["input_audio_transcription"]["model"], "whisper-1");
        assert_eq!(payload["turn_detection"]["type"], "server_vad");
        assert_eq!(payload["turn_detection"]["prefix_padding_ms"], 300);
        assert_eq!(payload["turn_detection"]["silence_duration_ms"], 500);
        assert_eq!(payload["max_response_output_tokens"], 4096);
    }

    #[test]
    fn test_scenario_payload_carries_instructions() {
        let payload = SessionSettings::default().scenario_payload("be grumpy");
        assert_eq!(payload["instructions"], "be grumpy");
        assert!(payload.get("temperature").is_none());
    }

    #[test]
    fn test_socket_url() {
        let config = BridgeConfig::default();
        assert_eq!(
            config.socket_url(),
            "wss://api.openai.com/v1/realtime?model=gpt-4o-realtime-preview-2024-10-01"
        );
        let relayed = BridgeConfig::default().with_relay_url("ws://127.0.0.1:3002/realtime-proxy");
        assert!(relayed.socket_url().starts_with("ws://127.0.0.1:3002/realtime-proxy?model="));
        assert!(relayed.uses_relay());
    }

    #[test]
    fn test_transport_kind_parse() {
        assert_eq!("websocket".parse::<TransportKind>().unwrap(), TransportKind::WebSocket);
        assert_eq!("WebRTC".parse::<TransportKind>().unwrap(), TransportKind::WebRtc);
        assert!("carrier-pigeon".parse::<TransportKind>().is_err());
        assert!(TransportKind::WebRtc.needs_credential());
        assert!(!TransportKind::WebSocket.needs_credential());
    }

    #[test]
    fn test_validate() {
        assert!(BridgeConfig::default().validate().is_err());
        assert!(BridgeConfig::default().with_api_key("sk-test").validate().is_ok());
        assert!(BridgeConfig::default().with_relay_url("ws://localhost:3002").validate().is_ok());
        let rtc = BridgeConfig::default().with_transport(TransportKind::WebRtc);
        assert!(rtc.validate().is_ok());
    }

    #[test]
    fn test_deserialize_partial_toml() {
        let config: BridgeConfig = toml::from_str(
            r#"
            transport = "webrtc"
            connect_timeout_secs = 3
            [session]
            voice = "verse"
            "#,
        )
        .unwrap();
        assert_eq!(config.transport, TransportKind::WebRtc);
        assert_eq!(config.connect_timeout(), Duration::from_secs(3));
        assert_eq!(config.session.voice, "verse");
        assert_eq!(config.session.temperature, 0.8);
        assert_eq!(config.frame_samples, 4096);
    }
}

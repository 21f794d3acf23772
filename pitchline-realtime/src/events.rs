//! Wire vocabulary of the realtime control channel.
//!
//! Every control message is one JSON object tagged by its `type` field.
//! Audio data is held as raw bytes (`Vec<u8>`) in memory and serialized as
//! base64 on the wire.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// `#[serde(with)]` adapter: raw bytes in memory, base64 text on the wire.
mod wire_audio {
    use serde::{Deserialize, Deserializer, Serializer};

    use crate::audio::{decode_base64, encode_base64};

    pub(super) fn serialize<S: Serializer>(audio: &[u8], out: S) -> Result<S::Ok, S::Error> {
        out.serialize_str(&encode_base64(audio))
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(input: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(input)?;
        decode_base64(&text).map_err(serde::de::Error::custom)
    }
}

// ── Client Events ───────────────────────────────────────────────────────

/// Control messages sent from the bridge to the remote service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    /// Update session configuration or scenario instructions.
    #[serde(rename = "session.update")]
    SessionUpdate {
        /// Session configuration payload.
        session: Value,
    },

    /// Append audio to the input buffer.
    #[serde(rename = "input_audio_buffer.append")]
    InputAudioBufferAppend {
        /// PCM16 audio (raw bytes, base64 on the wire).
        #[serde(with = "wire_audio")]
        audio: Vec<u8>,
    },

    /// Commit the current audio buffer.
    #[serde(rename = "input_audio_buffer.commit")]
    InputAudioBufferCommit,

    /// Ask the service to produce a reply.
    #[serde(rename = "response.create")]
    ResponseCreate {
        /// Requested response options, e.g. modalities.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        response: Option<Value>,
    },

    /// Seed a conversation item.
    #[serde(rename = "conversation.item.create")]
    ConversationItemCreate {
        /// The conversation item.
        item: ConversationItem,
    },
}

impl ClientEvent {
    /// Wire discriminant of this message.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::SessionUpdate { .. } => "session.update",
            Self::InputAudioBufferAppend { .. } => "input_audio_buffer.append",
            Self::InputAudioBufferCommit => "input_audio_buffer.commit",
            Self::ResponseCreate { .. } => "response.create",
            Self::ConversationItemCreate { .. } => "conversation.item.create",
        }
    }

    /// `response.create` requesting the given output modalities.
    pub fn response_with_modalities(modalities: &[&str]) -> Self {
        Self::ResponseCreate { response: Some(serde_json::json!({ "modalities": modalities })) }
    }

    /// `conversation.item.create` carrying a user text message.
    pub fn user_text(text: impl Into<String>) -> Self {
        Self::ConversationItemCreate { item: ConversationItem::user_text(text) }
    }
}

/// A conversation item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationItem {
    /// Item type, usually "message".
    #[serde(rename = "type")]
    pub item_type: String,
    /// Role: "user", "assistant", or "system".
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    /// Content parts.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub content: Vec<ContentPart>,
}

/// A content part within a conversation item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentPart {
    /// Content type: "input_text", "text", "audio".
    #[serde(rename = "type")]
    pub content_type: String,
    /// Text content.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Transcript of audio content.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transcript: Option<String>,
}

impl ConversationItem {
    /// Create a user text message item.
    pub fn user_text(text: impl Into<String>) -> Self {
        Self {
            item_type: "message".to_string(),
            role: Some("user".to_string()),
            content: vec![ContentPart {
                content_type: "input_text".to_string(),
                text: Some(text.into()),
                transcript: None,
            }],
        }
    }
}

// ── Server Events ───────────────────────────────────────────────────────

/// Control messages received from the remote service.
///
/// Fields the bridge does not act on are defaulted so a partial payload
/// still parses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    /// Session created.
    #[serde(rename = "session.created")]
    SessionCreated {
        /// Unique event ID.
        #[serde(default)]
        event_id: String,
        /// Session details.
        #[serde(default)]
        session: Value,
    },

    /// Session configuration applied.
    #[serde(rename = "session.updated")]
    SessionUpdated {
        /// Unique event ID.
        #[serde(default)]
        event_id: String,
        /// Effective session configuration.
        #[serde(default)]
        session: Value,
    },

    /// Error reported by the service.
    #[serde(rename = "error")]
    Error {
        /// Unique event ID.
        #[serde(default)]
        event_id: String,
        /// Error details.
        error: ErrorInfo,
    },

    /// Voice activity detected on the input buffer.
    #[serde(rename = "input_audio_buffer.speech_started")]
    SpeechStarted {
        /// Unique event ID.
        #[serde(default)]
        event_id: String,
        /// Audio position in milliseconds.
        #[serde(default)]
        audio_start_ms: u64,
        /// Item that will hold the speech.
        #[serde(default)]
        item_id: String,
    },

    /// Voice activity ended.
    #[serde(rename = "input_audio_buffer.speech_stopped")]
    SpeechStopped {
        /// Unique event ID.
        #[serde(default)]
        event_id: String,
        /// Audio position in milliseconds.
        #[serde(default)]
        audio_end_ms: u64,
        /// Item holding the speech.
        #[serde(default)]
        item_id: String,
    },

    /// Input buffer committed.
    #[serde(rename = "input_audio_buffer.committed")]
    AudioCommitted {
        /// Unique event ID.
        #[serde(default)]
        event_id: String,
        /// Item created from the buffer.
        #[serde(default)]
        item_id: String,
    },

    /// Response generation started.
    #[serde(rename = "response.created")]
    ResponseCreated {
        /// Unique event ID.
        #[serde(default)]
        event_id: String,
        /// Response details.
        #[serde(default)]
        response: Value,
    },

    /// Output item added to a response.
    #[serde(rename = "response.output_item.added")]
    OutputItemAdded {
        /// Unique event ID.
        #[serde(default)]
        event_id: String,
        /// Response ID.
        #[serde(default)]
        response_id: String,
        /// Output index.
        #[serde(default)]
        output_index: u32,
        /// Added item.
        #[serde(default)]
        item: Value,
    },

    /// Audio output chunk.
    #[serde(rename = "response.audio.delta")]
    AudioDelta {
        /// Unique event ID.
        #[serde(default)]
        event_id: String,
        /// Response ID.
        #[serde(default)]
        response_id: String,
        /// Item ID.
        #[serde(default)]
        item_id: String,
        /// PCM16 audio (raw bytes, base64 on the wire).
        #[serde(with = "wire_audio")]
        delta: Vec<u8>,
    },

    /// Transcript fragment of the assistant's audio.
    #[serde(rename = "response.audio_transcript.delta")]
    TranscriptDelta {
        /// Unique event ID.
        #[serde(default)]
        event_id: String,
        /// Response ID.
        #[serde(default)]
        response_id: String,
        /// Item ID.
        #[serde(default)]
        item_id: String,
        /// Transcript fragment.
        delta: String,
    },

    /// Complete transcript of the assistant's audio.
    #[serde(rename = "response.audio_transcript.done")]
    TranscriptDone {
        /// Unique event ID.
        #[serde(default)]
        event_id: String,
        /// Response ID.
        #[serde(default)]
        response_id: String,
        /// Item ID.
        #[serde(default)]
        item_id: String,
        /// Complete transcript.
        transcript: String,
    },

    /// Transcript of the user's committed audio.
    #[serde(rename = "conversation.item.input_audio_transcription.completed")]
    InputTranscriptionCompleted {
        /// Unique event ID.
        #[serde(default)]
        event_id: String,
        /// Item ID.
        #[serde(default)]
        item_id: String,
        /// Content index.
        #[serde(default)]
        content_index: u32,
        /// Complete transcript.
        transcript: String,
    },

    /// Text output chunk.
    #[serde(rename = "response.text.delta")]
    TextDelta {
        /// Unique event ID.
        #[serde(default)]
        event_id: String,
        /// Response ID.
        #[serde(default)]
        response_id: String,
        /// Item ID.
        #[serde(default)]
        item_id: String,
        /// Text fragment.
        delta: String,
    },

    /// Text output completed.
    #[serde(rename = "response.text.done")]
    TextDone {
        /// Unique event ID.
        #[serde(default)]
        event_id: String,
        /// Response ID.
        #[serde(default)]
        response_id: String,
        /// Item ID.
        #[serde(default)]
        item_id: String,
        /// Complete text.
        text: String,
    },

    /// Response completed.
    #[serde(rename = "response.done")]
    ResponseDone {
        /// Unique event ID.
        #[serde(default)]
        event_id: String,
        /// Final response details.
        #[serde(default)]
        response: Value,
    },

    /// Unknown event type (for forward compatibility).
    #[serde(other)]
    Unknown,
}

impl ServerEvent {
    /// Wire discriminant, or `None` for [`ServerEvent::Unknown`].
    pub fn event_type(&self) -> Option<&'static str> {
        let name = match self {
            Self::SessionCreated { .. } => "session.created",
            Self::SessionUpdated { .. } => "session.updated",
            Self::Error { .. } => "error",
            Self::SpeechStarted { .. } => "input_audio_buffer.speech_started",
            Self::SpeechStopped { .. } => "input_audio_buffer.speech_stopped",
            Self::AudioCommitted { .. } => "input_audio_buffer.committed",
            Self::ResponseCreated { .. } => "response.created",
            Self::OutputItemAdded { .. } => "response.output_item.added",
            Self::AudioDelta { .. } => "response.audio.delta",
            Self::TranscriptDelta { .. } => "response.audio_transcript.delta",
            Self::TranscriptDone { .. } => "response.audio_transcript.done",
            Self::InputTranscriptionCompleted { .. } => {
                "conversation.item.input_audio_transcription.completed"
            }
            Self::TextDelta { .. } => "response.text.delta",
            Self::TextDone { .. } => "response.text.done",
            Self::ResponseDone { .. } => "response.done",
            Self::Unknown => return None,
        };
        Some(name)
    }
}

/// Error information from the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Error type.
    #[serde(rename = "type", default)]
    pub error_type: String,
    /// Error code.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    /// Human-readable error message.
    #[serde(default)]
    pub message: String,
    /// Offending parameter, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub param: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_serializes_base64() {
        let event = ClientEvent::InputAudioBufferAppend { audio: vec![0, 0, 1, 0] };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "input_audio_buffer.append");
        assert_eq!(json["audio"], "AAABAA==");
    }

    #[test]
    fn test_unit_variants_carry_only_type() {
        let json = serde_json::to_string(&ClientEvent::InputAudioBufferCommit).unwrap();
        assert_eq!(json, r#"{"type":"input_audio_buffer.commit"}"#);
    }

    #[test]
    fn test_response_with_modalities() {
        let json = serde_json::to_value(ClientEvent::response_with_modalities(&["audio", "text"]))
            .unwrap();
        assert_eq!(json["type"], "response.create");
        assert_eq!(json["response"]["modalities"], serde_json::json!(["audio", "text"]));
    }

    #[test]
    fn test_user_text_item() {
        let json = serde_json::to_value(ClientEvent::user_text("Hello!")).unwrap();
        assert_eq!(json["item"]["type"], "message");
        assert_eq!(json["item"]["role"], "user");
        assert_eq!(json["item"]["content"][0]["type"], "input_text");
        assert_eq!(json["item"]["content"][0]["text"], "Hello!");
    }

    #[test]
    fn test_unknown_server_event() {
        let event: ServerEvent =
            serde_json::from_str(r#"{"type":"rate_limits.updated","rate_limits":[]}"#).unwrap();
        assert_eq!(event, ServerEvent::Unknown);
        assert_eq!(event.event_type(), None);
    }

    #[test]
    fn test_minimal_transcript_done() {
        let event: ServerEvent =
            serde_json::from_str(r#"{"type":"response.audio_transcript.done","transcript":"Hi"}"#)
                .unwrap();
        match event {
            ServerEvent::TranscriptDone { transcript, item_id, .. } => {
                assert_eq!(transcript, "Hi");
                assert!(item_id.is_empty());
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_audio_delta_decodes_base64() {
        let event: ServerEvent =
            serde_json::from_str(r#"{"type":"response.audio.delta","delta":"AQACAA=="}"#).unwrap();
        match event {
            ServerEvent::AudioDelta { delta, .. } => assert_eq!(delta, vec![1, 0, 2, 0]),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_error_event() {
        let raw = r#"{"type":"error","event_id":"e1","error":{"type":"invalid_request_error","code":"bad","message":"nope"}}"#;
        let event: ServerEvent = serde_json::from_str(raw).unwrap();
        match event {
            ServerEvent::Error { error, .. } => {
                assert_eq!(error.error_type, "invalid_request_error");
                assert_eq!(error.code.as_deref(), Some("bad"));
                assert_eq!(error.message, "nope");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
}

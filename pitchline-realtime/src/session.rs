//! Session lifecycle state and the per-call session record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::TransportKind;
use crate::credential::Credential;
use crate::dispatcher::TranscriptEvent;
use crate::scenario::Scenario;

/// Lifecycle state of a practice call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// No call in progress.
    #[default]
    Idle,
    /// Requesting a short-lived credential from the broker.
    AcquiringCredential,
    /// Opening the transport.
    Negotiating,
    /// Transport ready, media not started yet.
    Connected,
    /// Capture running and session configured.
    InCall,
    /// Tearing down.
    Closing,
    /// All resources released.
    Closed,
    /// Unrecoverable error. A new session is required to retry.
    Failed,
}

impl ConnectionState {
    /// True for `Closed` and `Failed`.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Failed)
    }

    /// True while a call holds resources.
    pub fn is_live(self) -> bool {
        !matches!(self, Self::Idle | Self::Closed | Self::Failed)
    }

    /// Whether the lifecycle permits moving from `self` to `next`.
    pub fn can_transition_to(self, next: Self) -> bool {
        use ConnectionState::*;
        if self.is_terminal() {
            return false;
        }
        match (self, next) {
            (_, Failed) => true,
            (Idle, AcquiringCredential) | (Idle, Negotiating) => true,
            (AcquiringCredential, Negotiating) => true,
            (Negotiating, Connected) => true,
            (Connected, InCall) => true,
            (InCall, InCall) => true,
            (AcquiringCredential | Negotiating | Connected | InCall, Closing) => true,
            (Closing, Closed) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::AcquiringCredential => "acquiring_credential",
            Self::Negotiating => "negotiating",
            Self::Connected => "connected",
            Self::InCall => "in_call",
            Self::Closing => "closing",
            Self::Closed => "closed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// One practice call, owned by the session controller.
#[derive(Debug, Clone)]
pub struct Session {
    /// Session identifier.
    pub id: Uuid,
    /// Current lifecycle state.
    pub state: ConnectionState,
    /// Selected scenario.
    pub scenario: Scenario,
    /// Transport variant in use.
    pub transport: TransportKind,
    /// Ephemeral credential (negotiated-media transport only).
    pub credential: Option<Credential>,
    /// When the call started.
    pub started_at: DateTime<Utc>,
    /// When the call ended.
    pub ended_at: Option<DateTime<Utc>>,
}

impl Session {
    /// Create a session in `Idle`.
    pub fn new(scenario: Scenario, transport: TransportKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            state: ConnectionState::Idle,
            scenario,
            transport,
            credential: None,
            started_at: Utc::now(),
            ended_at: None,
        }
    }

    /// Expiry of the ephemeral credential, if one was acquired.
    pub fn credential_expires_at(&self) -> Option<DateTime<Utc>> {
        self.credential.as_ref().map(|c| c.expires_at)
    }
}

/// What the persistence layer receives once a call ends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallSummary {
    /// Session identifier.
    pub session_id: Uuid,
    /// Scenario the call ran.
    pub scenario: Scenario,
    /// Transport variant used.
    pub transport: TransportKind,
    /// Call start.
    pub started_at: DateTime<Utc>,
    /// Call end.
    pub ended_at: DateTime<Utc>,
    /// Seconds spent in the call, as counted by the duration timer.
    pub duration_secs: u64,
    /// State the session ended in.
    pub final_state: ConnectionState,
    /// Final transcripts in arrival order.
    pub transcripts: Vec<TranscriptEvent>,
}

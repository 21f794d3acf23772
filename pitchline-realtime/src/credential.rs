//! Short-lived credentials for the negotiated-media transport.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::error::{RealtimeError, Result};

/// OpenAI REST API base.
pub const OPENAI_API_BASE: &str = "https://api.openai.com/v1";

/// An ephemeral client secret and its expiry.
#[derive(Debug, Clone)]
pub struct Credential {
    /// Bearer secret for the offer/answer exchange.
    pub client_secret: SecretString,
    /// When the secret stops being accepted.
    pub expires_at: DateTime<Utc>,
}

impl Credential {
    /// Create a credential.
    pub fn new(client_secret: impl Into<String>, expires_at: DateTime<Utc>) -> Self {
        Self { client_secret: SecretString::from(client_secret.into()), expires_at }
    }

    /// Build from the broker's wire shape.
    pub fn from_response(response: BrokerResponse) -> Result<Self> {
        if response.client_secret.is_empty() {
            return Err(RealtimeError::credential("broker returned an empty client secret"));
        }
        let expires_at = Utc
            .timestamp_millis_opt(response.expires_at)
            .single()
            .ok_or_else(|| {
                RealtimeError::credential(format!("invalid expires_at: {}", response.expires_at))
            })?;
        Ok(Self::new(response.client_secret, expires_at))
    }

    /// Broker wire shape of this credential.
    pub fn to_response(&self) -> BrokerResponse {
        BrokerResponse {
            client_secret: self.client_secret.expose_secret().to_string(),
            expires_at: self.expires_at.timestamp_millis(),
        }
    }

    /// True once `expires_at` has passed.
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// True if the credential is expired at `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Credential broker response body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerResponse {
    /// Ephemeral secret.
    pub client_secret: String,
    /// Expiry in epoch milliseconds.
    pub expires_at: i64,
}

/// Source of short-lived credentials.
#[async_trait]
pub trait CredentialBroker: Send + Sync {
    /// Mint a fresh credential.
    async fn acquire(&self) -> Result<Credential>;
}

/// Fetches credentials from a broker endpoint with an empty POST.
#[derive(Debug, Clone)]
pub struct HttpCredentialBroker {
    client: reqwest::Client,
    url: String,
}

impl HttpCredentialBroker {
    /// Create a broker client for `url`.
    pub fn new(url: impl Into<String>) -> Self {
        Self { client: reqwest::Client::new(), url: url.into() }
    }

    /// Use an existing HTTP client.
    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }
}

#[async_trait]
impl CredentialBroker for HttpCredentialBroker {
    async fn acquire(&self) -> Result<Credential> {
        tracing::debug!(url = %self.url, "requesting client secret");
        let response = self
            .client
            .post(&self.url)
            .header("Content-Type", "application/json")
            .send()
            .await
            .map_err(|e| RealtimeError::credential(format!("broker unavailable: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RealtimeError::broker_rejected(status.as_u16(), body));
        }

        let body: BrokerResponse = response
            .json()
            .await
            .map_err(|e| RealtimeError::credential(format!("invalid broker response: {e}")))?;
        let credential = Credential::from_response(body)?;
        tracing::info!(expires_at = %credential.expires_at, "client secret obtained");
        Ok(credential)
    }
}

/// Mints credentials directly from the realtime sessions endpoint using a
/// long-lived API key. Runs server side only.
#[derive(Debug, Clone)]
pub struct OpenAiSessionBroker {
    client: reqwest::Client,
    api_key: SecretString,
    api_base: String,
    model: String,
    voice: String,
}

#[derive(Debug, Deserialize)]
struct SessionsResponse {
    client_secret: SessionsSecret,
}

#[derive(Debug, Deserialize)]
struct SessionsSecret {
    value: String,
    /// Epoch seconds.
    expires_at: i64,
}

impl OpenAiSessionBroker {
    /// Create a broker for `model` speaking with `voice`.
    pub fn new(api_key: SecretString, model: impl Into<String>, voice: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            api_base: OPENAI_API_BASE.to_string(),
            model: model.into(),
            voice: voice.into(),
        }
    }

    /// Override the API base, e.g. for a test server.
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }
}

#[async_trait]
impl CredentialBroker for OpenAiSessionBroker {
    async fn acquire(&self) -> Result<Credential> {
        let url = format!("{}/realtime/sessions", self.api_base.trim_end_matches('/'));
        let body = serde_json::json!({ "model": self.model, "voice": self.voice });

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key.expose_secret()))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| RealtimeError::credential(format!("session request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            tracing::error!(%status, body = %text, "failed to create realtime session");
            return Err(RealtimeError::broker_rejected(status.as_u16(), text));
        }

        let parsed: SessionsResponse = response
            .json()
            .await
            .map_err(|e| RealtimeError::credential(format!("invalid session response: {e}")))?;

        Credential::from_response(BrokerResponse {
            client_secret: parsed.client_secret.value,
            expires_at: parsed.client_secret.expires_at.saturating_mul(1000),
        })
    }
}

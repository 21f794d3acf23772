//! Relay server configuration.

use std::net::SocketAddr;
use std::time::Duration;

use pitchline_realtime::config::{DEFAULT_MODEL, DEFAULT_REALTIME_URL};
use secrecy::SecretString;
use serde::Deserialize;

use crate::error::{RelayError, Result};

/// Default listen address.
pub const DEFAULT_LISTEN: SocketAddr =
    SocketAddr::new(std::net::IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED), 3002);

/// Default WebSocket path clients connect to.
pub const DEFAULT_PROXY_PATH: &str = "/realtime-proxy";

/// Path of the credential endpoint.
pub const SECRET_PATH: &str = "/api/realtime/secret";

/// Configuration for [`crate::RelayServer`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Address to listen on.
    pub listen: SocketAddr,
    /// WebSocket path for relayed clients.
    pub proxy_path: String,
    /// Upstream realtime endpoint.
    pub upstream_url: String,
    /// Model appended to the upstream URL.
    pub model: String,
    /// Voice requested when minting credentials.
    pub voice: String,
    /// Long-lived API key. Never leaves this process.
    pub api_key: Option<SecretString>,
    /// Serve the credential endpoint.
    pub broker_enabled: bool,
    /// Upstream connect timeout in seconds.
    pub connect_timeout_secs: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen: DEFAULT_LISTEN,
            proxy_path: DEFAULT_PROXY_PATH.to_string(),
            upstream_url: DEFAULT_REALTIME_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            voice: "alloy".to_string(),
            api_key: None,
            broker_enabled: true,
            connect_timeout_secs: 10,
        }
    }
}

impl RelayConfig {
    /// Set the listen address.
    pub fn with_listen(mut self, listen: SocketAddr) -> Self {
        self.listen = listen;
        self
    }

    /// Set the upstream endpoint.
    pub fn with_upstream_url(mut self, url: impl Into<String>) -> Self {
        self.upstream_url = url.into();
        self
    }

    /// Set the API key.
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(SecretString::from(key.into()));
        self
    }

    /// Upstream URL including the model query.
    pub fn upstream_target(&self) -> String {
        format!("{}?model={}", self.upstream_url, self.model)
    }

    /// Upstream connect timeout.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.max(1))
    }

    /// Check the configuration before binding.
    pub fn validate(&self) -> Result<()> {
        if !self.proxy_path.starts_with('/') {
            return Err(RelayError::config(format!(
                "proxy_path must start with '/': {}",
                self.proxy_path
            )));
        }
        if self.proxy_path == SECRET_PATH || self.proxy_path == "/health" {
            return Err(RelayError::config(format!("proxy_path {} is reserved", self.proxy_path)));
        }
        if self.upstream_url.trim().is_empty() {
            return Err(RelayError::config("upstream_url must not be empty"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RelayConfig::default();
        assert_eq!(config.listen.port(), 3002);
        assert_eq!(config.proxy_path, "/realtime-proxy");
        assert!(config.upstream_target().ends_with(&format!("?model={DEFAULT_MODEL}")));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_config() {
        let config: RelayConfig =
            serde_json::from_str(r#"{"listen":"127.0.0.1:4000","broker_enabled":false}"#).unwrap();
        assert_eq!(config.listen.port(), 4000);
        assert!(!config.broker_enabled);
        assert_eq!(config.proxy_path, DEFAULT_PROXY_PATH);
    }

    #[test]
    fn test_rejects_reserved_path() {
        let config = RelayConfig { proxy_path: SECRET_PATH.to_string(), ..Default::default() };
        assert!(config.validate().is_err());
        let config = RelayConfig { proxy_path: "relay".to_string(), ..Default::default() };
        assert!(config.validate().is_err());
    }
}

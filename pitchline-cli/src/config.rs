use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use pitchline_realtime::{BridgeConfig, ScenarioTable};
use pitchline_relay::RelayConfig;
use serde::Deserialize;

/// Environment variable holding the long-lived API key.
pub const API_KEY_ENV: &str = "OPENAI_API_KEY";

/// Layered application configuration: file, then environment, then flags.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub bridge: BridgeConfig,
    pub relay: RelayConfig,
    /// Persona overrides keyed by scenario id.
    pub scenarios: BTreeMap<String, String>,
}

impl AppConfig {
    /// Load from `path` if given, then apply the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => {
                let source = std::fs::read_to_string(path)
                    .with_context(|| format!("reading {}", path.display()))?;
                Self::from_toml_str(&source)
                    .with_context(|| format!("parsing {}", path.display()))?
            }
            None => Self::default(),
        };
        Ok(config.with_api_key(std::env::var(API_KEY_ENV).ok()))
    }

    pub fn from_toml_str(source: &str) -> Result<Self> {
        Ok(toml::from_str(source)?)
    }

    /// Use `key` for both the bridge and the relay. Empty keys are ignored.
    pub fn with_api_key(mut self, key: Option<String>) -> Self {
        if let Some(key) = key.filter(|k| !k.trim().is_empty()) {
            self.bridge = self.bridge.with_api_key(key.clone());
            self.relay = self.relay.with_api_key(key);
        }
        self
    }

    pub fn scenario_table(&self) -> Result<ScenarioTable> {
        Ok(ScenarioTable::with_overrides(&self.scenarios)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pitchline_realtime::{Scenario, TransportKind};

    #[test]
    fn test_empty_file_is_defaults() {
        let config = AppConfig::from_toml_str("").unwrap();
        assert_eq!(config.bridge.transport, TransportKind::WebSocket);
        assert_eq!(config.relay.listen.port(), 3002);
        assert!(config.scenarios.is_empty());
    }

    #[test]
    fn test_tables() {
        let config = AppConfig::from_toml_str(
            r#"
            [bridge]
            transport = "webrtc"
            broker_url = "http://relay.local:3002/api/realtime/secret"

            [relay]
            listen = "127.0.0.1:9000"
            broker_enabled = false

            [scenarios]
            price = "You think every policy is overpriced."
            "#,
        )
        .unwrap();
        assert_eq!(config.bridge.transport, TransportKind::WebRtc);
        assert_eq!(config.bridge.broker_url, "http://relay.local:3002/api/realtime/secret");
        assert_eq!(config.relay.listen.port(), 9000);
        assert!(!config.relay.broker_enabled);

        let table = config.scenario_table().unwrap();
        assert_eq!(table.persona(Scenario::Price), "You think every policy is overpriced.");
    }

    #[test]
    fn test_unknown_scenario_override_rejected() {
        let config = AppConfig::from_toml_str("[scenarios]\nweather = \"sunny\"").unwrap();
        assert!(config.scenario_table().is_err());
    }

    #[test]
    fn test_api_key_applies_to_both() {
        let config = AppConfig::default().with_api_key(Some("sk-test".to_string()));
        assert!(config.bridge.api_key.is_some());
        assert!(config.relay.api_key.is_some());

        let blank = AppConfig::default().with_api_key(Some("  ".to_string()));
        assert!(blank.bridge.api_key.is_none());
    }
}

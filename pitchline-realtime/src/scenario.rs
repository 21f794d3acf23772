//! Objection scenarios and their persona instructions.

use std::collections::BTreeMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{RealtimeError, Result};

/// Prefix placed before every persona sentence.
pub const PERSONA_PREFIX: &str = "You are a potential life insurance customer.";

/// Guidance appended after the persona sentence.
pub const CONVERSATION_GUIDANCE: &str = "Be conversational and realistic in your objections. \
You can be convinced with good arguments, but don't give in too easily. \n\
Respond naturally as if you're on a phone call. Keep your responses brief and to the point.";

/// A named objection the prospect raises during the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scenario {
    /// Too expensive.
    Price,
    /// No time right now.
    Time,
    /// Already covered through work.
    Coverage,
    /// Needs to think about it.
    Think,
    /// Needs to talk to their spouse.
    Spouse,
    /// Too young to need it.
    Young,
    /// Wants to shop around.
    Research,
}

impl Scenario {
    /// Every scenario, in display order.
    pub const ALL: [Scenario; 7] = [
        Self::Price,
        Self::Time,
        Self::Coverage,
        Self::Think,
        Self::Spouse,
        Self::Young,
        Self::Research,
    ];

    /// Identifier used on the command line and in configuration.
    pub fn id(self) -> &'static str {
        match self {
            Self::Price => "price",
            Self::Time => "time",
            Self::Coverage => "coverage",
            Self::Think => "think",
            Self::Spouse => "spouse",
            Self::Young => "young",
            Self::Research => "research",
        }
    }

    /// Built-in persona sentence.
    pub fn default_persona(self) -> &'static str {
        match self {
            Self::Price => "You think life insurance is too expensive and not worth the cost.",
            Self::Time => "You're very busy and don't have time to discuss this right now.",
            Self::Coverage => {
                "You already have life insurance through work and think that's enough."
            }
            Self::Think => "You want to think about it and aren't ready to make any decisions.",
            Self::Spouse => {
                "You need to discuss this with your spouse before making any decisions."
            }
            Self::Young => "You're young and healthy and don't think you need life insurance yet.",
            Self::Research => "You want to shop around and compare different options first.",
        }
    }
}

impl std::fmt::Display for Scenario {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.id())
    }
}

impl FromStr for Scenario {
    type Err = RealtimeError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|scenario| scenario.id().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| RealtimeError::config(format!("unknown scenario: {s}")))
    }
}

/// Persona text per scenario. Read-only once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScenarioTable {
    personas: BTreeMap<Scenario, String>,
}

impl Default for ScenarioTable {
    fn default() -> Self {
        let personas =
            Scenario::ALL.into_iter().map(|s| (s, s.default_persona().to_string())).collect();
        Self { personas }
    }
}

impl ScenarioTable {
    /// The built-in table.
    pub fn builtin() -> Self {
        Self::default()
    }

    /// Built-in table with persona overrides applied.
    ///
    /// Keys must be scenario identifiers; an unknown key is rejected.
    pub fn with_overrides<I, K, V>(overrides: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let mut table = Self::default();
        for (key, persona) in overrides {
            let scenario: Scenario = key.as_ref().parse()?;
            table.personas.insert(scenario, persona.into());
        }
        Ok(table)
    }

    /// Parse overrides from a TOML document of `id = "persona"` pairs.
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let overrides: BTreeMap<String, String> = toml::from_str(source)
            .map_err(|e| RealtimeError::config(format!("invalid scenario table: {e}")))?;
        Self::with_overrides(overrides)
    }

    /// Persona sentence for `scenario`.
    pub fn persona(&self, scenario: Scenario) -> &str {
        self.personas.get(&scenario).map(String::as_str).unwrap_or(scenario.default_persona())
    }

    /// Full instructions sent in the scenario `session.update`.
    pub fn instructions(&self, scenario: Scenario) -> String {
        format!("{PERSONA_PREFIX} {}\n{CONVERSATION_GUIDANCE}", self.persona(scenario))
    }
}

//! Broker records - the typed form of one catalog entry

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Trading platform a broker server runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Platform {
    #[serde(rename = "MT4")]
    Mt4,
    #[serde(rename = "MT5")]
    Mt5,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Mt4 => "MT4",
            Platform::Mt5 => "MT5",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "MT4" => Ok(Platform::Mt4),
            "MT5" => Ok(Platform::Mt5),
            _ => Err(format!("unknown platform '{s}' (expected MT4 or MT5)")),
        }
    }
}

/// A validated broker configuration record
///
/// Only [`crate::catalog::schema::parse`] and the embedded fallback produce
/// these, so every instance has passed the field rules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerRecord {
    /// Display name
    pub name: String,

    /// Trading server name; unique within a catalog
    pub server: String,

    /// MT4 or MT5
    pub platform: Platform,

    /// HTTPS URL of the broker's web terminal
    pub web_terminal_url: String,

    /// Logo image URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logo: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Demo (paper trading) server
    #[serde(default)]
    pub demo: bool,
}

impl BrokerRecord {
    /// Description truncated to its first line
    pub fn short_description(&self) -> &str {
        self.description
            .as_deref()
            .and_then(|d| d.lines().next())
            .unwrap_or("")
            .trim()
    }
}

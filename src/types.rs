// =============================================================================
// Shared types used across the Meridian signal engine
// =============================================================================

use serde::{Deserialize, Serialize};

/// Canonical instrument identifier (e.g. "AAPL", "BTC-USD").
///
/// Symbols flow through the engine unchanged. Broker-specific conversion
/// (e.g. `BTC-USD -> BTCUSD`) happens at the broker edge only, and the
/// canonical form is retained alongside for logs and downstream logic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Symbol(pub String);

impl Symbol {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Crypto instruments carry a `-USD` suffix or are a 7-character spot
    /// pair ending in `USD` (e.g. "BTC1USD").
    pub fn is_crypto(&self) -> bool {
        self.0.ends_with("-USD") || (self.0.len() == 7 && self.0.ends_with("USD"))
    }

    /// The broker wire form: canonical minus the dash (`BTC-USD -> BTCUSD`).
    /// Equity symbols pass through unchanged.
    pub fn broker_form(&self) -> String {
        self.0.replace('-', "")
    }
}

impl std::fmt::Display for Symbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Symbol {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Trade direction of an emitted signal. NEUTRAL never reaches a Signal; it
/// exists only at the source-verdict level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Action {
    #[serde(rename = "LONG")]
    Long,
    #[serde(rename = "SHORT")]
    Short,
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "LONG"),
            Self::Short => write!(f, "SHORT"),
        }
    }
}

impl std::str::FromStr for Action {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "LONG" | "BUY" => Ok(Self::Long),
            "SHORT" | "SELL" => Ok(Self::Short),
            other => Err(format!("unknown action: {other}")),
        }
    }
}

/// A single data source's directional opinion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Verdict {
    #[serde(rename = "LONG")]
    Long,
    #[serde(rename = "SHORT")]
    Short,
    #[serde(rename = "NEUTRAL")]
    Neutral,
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "LONG"),
            Self::Short => write!(f, "SHORT"),
            Self::Neutral => write!(f, "NEUTRAL"),
        }
    }
}

/// Coarse market-state classification influencing consensus thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Regime {
    #[serde(rename = "TRENDING")]
    Trending,
    #[serde(rename = "CONSOLIDATION")]
    Consolidation,
    #[serde(rename = "VOLATILE")]
    Volatile,
    #[serde(rename = "UNKNOWN")]
    Unknown,
}

impl Default for Regime {
    fn default() -> Self {
        Self::Unknown
    }
}

impl std::fmt::Display for Regime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Trending => write!(f, "TRENDING"),
            Self::Consolidation => write!(f, "CONSOLIDATION"),
            Self::Volatile => write!(f, "VOLATILE"),
            Self::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

impl std::str::FromStr for Regime {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "TRENDING" => Ok(Self::Trending),
            "CONSOLIDATION" => Ok(Self::Consolidation),
            "VOLATILE" => Ok(Self::Volatile),
            "UNKNOWN" => Ok(Self::Unknown),
            other => Err(format!("unknown regime: {other}")),
        }
    }
}

/// Terminal outcome of a signal, filled in later by the position monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    #[serde(rename = "WIN")]
    Win,
    #[serde(rename = "LOSS")]
    Loss,
    #[serde(rename = "EXPIRED")]
    Expired,
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Win => write!(f, "WIN"),
            Self::Loss => write!(f, "LOSS"),
            Self::Expired => write!(f, "EXPIRED"),
        }
    }
}

impl std::str::FromStr for Outcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "WIN" => Ok(Self::Win),
            "LOSS" => Ok(Self::Loss),
            "EXPIRED" => Ok(Self::Expired),
            other => Err(format!("unknown outcome: {other}")),
        }
    }
}

/// Deployment environment. Production tightens secrets validation and
/// forbids generator pause transitions when 24/7 mode is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Environment {
    #[serde(rename = "development")]
    Development,
    #[serde(rename = "production")]
    Production,
}

impl Default for Environment {
    fn default() -> Self {
        Self::Development
    }
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Development => write!(f, "development"),
            Self::Production => write!(f, "production"),
        }
    }
}

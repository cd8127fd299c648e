// =============================================================================
// Signal model — source verdicts, the immutable Signal, and its hash
// =============================================================================
//
// A Signal's sha256 covers every immutable field (everything except the hash
// itself, prev_sha256, and the outcome/order fields filled in later). The
// canonical serialization fixes field order and uses serde_json's number
// formatting, so recomputing the digest from a stored row always reproduces
// the original bytes.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::EngineError;
use crate::types::{Action, Regime, Symbol, Verdict};

// =============================================================================
// Features
// =============================================================================

/// Dynamic per-source feature value. Sources declare their feature schema in
/// `capabilities()`; the map itself stays flat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Feature {
    Number(f64),
    Text(String),
    Flag(bool),
}

impl Feature {
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }
}

// =============================================================================
// SourceVerdict
// =============================================================================

/// One data source's opinion for a symbol at a point in time.
///
/// Confidence is clamped to [0, 100] at construction. A NEUTRAL verdict with
/// confidence below 65 contributes no directional vote downstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceVerdict {
    pub source_id: String,
    pub verdict: Verdict,
    pub confidence: f64,
    /// BTreeMap keeps canonical serialization order-stable.
    pub features: BTreeMap<String, Feature>,
    /// Epoch milliseconds.
    pub generated_at: i64,
}

impl SourceVerdict {
    pub fn new(
        source_id: impl Into<String>,
        verdict: Verdict,
        confidence: f64,
        generated_at: i64,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            verdict,
            confidence: confidence.clamp(0.0, 100.0),
            features: BTreeMap::new(),
            generated_at,
        }
    }

    pub fn with_feature(mut self, key: impl Into<String>, value: Feature) -> Self {
        self.features.insert(key.into(), value);
        self
    }
}

// =============================================================================
// Signal
// =============================================================================

/// The immutable output of one generation cycle for one symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub signal_id: String,
    /// Epoch milliseconds, UTC.
    pub created_at: i64,
    pub symbol: Symbol,
    pub action: Action,
    pub entry_price: f64,
    pub stop_price: f64,
    pub target_price: f64,
    pub confidence: f64,
    pub regime: Regime,
    /// Sorted for canonical stability.
    pub sources_used: Vec<String>,
    /// Verbatim snapshot of the verdicts consensus consumed.
    pub per_source_verdicts: Vec<SourceVerdict>,
    pub rationale: String,
    pub service_type: String,
    pub sha256: String,
    /// Hash of the previous signal in insertion order; empty for the first.
    pub prev_sha256: String,
}

impl Signal {
    /// Canonical JSON over the immutable fields, in fixed order. This is the
    /// exact byte string the sha256 digest covers.
    pub fn canonical_json(&self) -> String {
        #[derive(Serialize)]
        struct Canonical<'a> {
            signal_id: &'a str,
            created_at: i64,
            symbol: &'a Symbol,
            action: Action,
            entry_price: f64,
            stop_price: f64,
            target_price: f64,
            confidence: f64,
            regime: Regime,
            sources_used: &'a [String],
            per_source_verdicts: &'a [SourceVerdict],
            rationale: &'a str,
            service_type: &'a str,
        }

        let canonical = Canonical {
            signal_id: &self.signal_id,
            created_at: self.created_at,
            symbol: &self.symbol,
            action: self.action,
            entry_price: self.entry_price,
            stop_price: self.stop_price,
            target_price: self.target_price,
            confidence: self.confidence,
            regime: self.regime,
            sources_used: &self.sources_used,
            per_source_verdicts: &self.per_source_verdicts,
            rationale: &self.rationale,
            service_type: &self.service_type,
        };

        serde_json::to_string(&canonical).expect("canonical signal serialises")
    }

    /// Recompute the digest from the immutable fields.
    pub fn compute_sha256(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.canonical_json().as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Seal the signal: sort `sources_used` and stamp `sha256`.
    pub fn seal(mut self) -> Self {
        self.sources_used.sort();
        self.sha256 = self.compute_sha256();
        self
    }

    /// Side invariants: LONG requires stop < entry < target, SHORT the
    /// inverse, and a positive entry price. A failing signal is rejected
    /// before insertion.
    pub fn validate_levels(&self) -> Result<(), EngineError> {
        if self.entry_price <= 0.0 {
            return Err(EngineError::Validation(format!(
                "{}: entry price {} is not positive",
                self.symbol, self.entry_price
            )));
        }
        let ok = match self.action {
            Action::Long => {
                self.stop_price < self.entry_price && self.entry_price < self.target_price
            }
            Action::Short => {
                self.stop_price > self.entry_price && self.entry_price > self.target_price
            }
        };
        if !ok {
            return Err(EngineError::Validation(format!(
                "{}: {} levels out of order (stop={}, entry={}, target={})",
                self.symbol, self.action, self.stop_price, self.entry_price, self.target_price
            )));
        }
        if self.sources_used.is_empty() {
            return Err(EngineError::Validation(format!(
                "{}: no sources behind signal",
                self.symbol
            )));
        }
        Ok(())
    }

    /// Build the executor wire envelope (canonical field order).
    pub fn envelope(&self) -> ExecutionEnvelope {
        ExecutionEnvelope {
            signal_id: self.signal_id.clone(),
            created_at: self.created_at,
            symbol: self.symbol.clone(),
            action: self.action,
            entry_price: self.entry_price,
            stop_price: self.stop_price,
            target_price: self.target_price,
            confidence: self.confidence,
            regime: self.regime,
            sources_used: self.sources_used.clone(),
            sha256: self.sha256.clone(),
            service_type: self.service_type.clone(),
        }
    }
}

// =============================================================================
// Executor envelope
// =============================================================================

/// The JSON body POSTed to executors. Field order here is the canonical wire
/// order; serde_json preserves struct declaration order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionEnvelope {
    pub signal_id: String,
    pub created_at: i64,
    pub symbol: Symbol,
    pub action: Action,
    pub entry_price: f64,
    pub stop_price: f64,
    pub target_price: f64,
    pub confidence: f64,
    pub regime: Regime,
    pub sources_used: Vec<String>,
    pub sha256: String,
    pub service_type: String,
}

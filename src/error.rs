// =============================================================================
// Error taxonomy for the Meridian signal engine
// =============================================================================
//
// Propagation policy: only startup-phase errors (config, secrets, store open,
// startup integrity) bubble to main. Everything else is contained to its
// symbol/source/executor, recorded in the audit log and metrics, and the
// cycle moves on.

use thiserror::Error;

/// Why a data source call failed. Sources return this instead of panicking;
/// the generator treats errored sources as absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SourceError {
    #[error("source timed out")]
    Timeout,
    #[error("source rate limited")]
    RateLimited,
    #[error("source authentication failed")]
    AuthFailed,
    #[error("upstream returned 5xx")]
    Upstream5xx,
    #[error("malformed upstream response")]
    MalformedResponse,
    #[error("source disabled")]
    Disabled,
}

impl SourceError {
    /// Permanent errors disable the source for the rest of the cycle.
    pub fn is_permanent(self) -> bool {
        matches!(self, Self::AuthFailed | Self::Disabled)
    }

    /// Stable label for metrics.
    pub fn label(self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::RateLimited => "rate_limited",
            Self::AuthFailed => "auth_failed",
            Self::Upstream5xx => "upstream_5xx",
            Self::MalformedResponse => "malformed_response",
            Self::Disabled => "disabled",
        }
    }
}

/// Top-level engine error. Startup variants are fatal; the rest are recorded
/// and contained.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("secrets resolution failed: {0}")]
    Secrets(String),

    #[error("data source error: {0}")]
    Source(#[from] SourceError),

    #[error("signal validation failed: {0}")]
    Validation(String),

    #[error("store I/O failed: {0}")]
    StoreTransient(String),

    #[error("store integrity violation: {0}")]
    StoreIntegrity(String),

    #[error("executor declined: {0}")]
    ExecutorBusiness(String),

    #[error("executor transport failed: {0}")]
    ExecutorTransient(String),

    #[error("broker submission failed: {0}")]
    BrokerSubmission(String),

    #[error("risk limit tripped: {0}")]
    RiskLimitTripped(String),
}

/// Process exit codes for the long-running binary.
pub mod exit_codes {
    pub const CLEAN: i32 = 0;
    pub const UNHANDLED: i32 = 1;
    pub const INVALID_CONFIG: i32 = 2;
    pub const INTEGRITY_FAILURE: i32 = 3;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permanent_classification() {
        assert!(SourceError::AuthFailed.is_permanent());
        assert!(SourceError::Disabled.is_permanent());
        assert!(!SourceError::Timeout.is_permanent());
        assert!(!SourceError::RateLimited.is_permanent());
        assert!(!SourceError::Upstream5xx.is_permanent());
    }

    #[test]
    fn labels_are_stable() {
        assert_eq!(SourceError::Timeout.label(), "timeout");
        assert_eq!(SourceError::MalformedResponse.label(), "malformed_response");
    }
}

// =============================================================================
// Data sources — uniform contract over heterogeneous signal providers
// =============================================================================

pub mod cache;
pub mod market_data;
pub mod rate_limit;
pub mod registry;
pub mod sim;

use async_trait::async_trait;

use crate::error::SourceError;
use crate::signal::SourceVerdict;
use crate::sources::market_data::MarketSnapshot;
use crate::types::Symbol;

pub use registry::{RegisteredSource, SourceRegistry};

/// What a source can serve and how hard it may be driven.
#[derive(Debug, Clone)]
pub struct SourceCapabilities {
    pub supports_equities: bool,
    pub supports_crypto: bool,
    pub rate_limit_per_sec: f64,
    /// Feature keys this source emits in its verdict feature map.
    pub feature_schema: Vec<String>,
}

/// Uniform contract exposed by every data source. Sources differ only in
/// their internals; the registry stores them behind this interface keyed by
/// source id. Implementations return errors, never panic — the generator
/// treats errored sources as absent.
#[async_trait]
pub trait DataSource: Send + Sync {
    fn id(&self) -> &str;

    fn capabilities(&self) -> SourceCapabilities;

    async fn fetch_verdict(
        &self,
        symbol: &Symbol,
        now_ms: i64,
        snapshot: &MarketSnapshot,
    ) -> Result<SourceVerdict, SourceError>;
}

// =============================================================================
// Simulated data source — deterministic verdicts for development
// =============================================================================
//
// Reads the direction straight off the snapshot's regression slope, so the
// same window always yields the same verdict. Useful as the development
// stand-in for real provider plugins and as a fixture in integration tests.

use async_trait::async_trait;

use crate::error::SourceError;
use crate::indicators::regression_slope;
use crate::signal::{Feature, SourceVerdict};
use crate::sources::market_data::MarketSnapshot;
use crate::sources::{DataSource, SourceCapabilities};
use crate::types::{Symbol, Verdict};

pub struct SimSource {
    id: String,
    /// Slope magnitude (percent per bar) above which the source goes
    /// directional.
    slope_threshold: f64,
}

impl SimSource {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            slope_threshold: 0.02,
        }
    }
}

#[async_trait]
impl DataSource for SimSource {
    fn id(&self) -> &str {
        &self.id
    }

    fn capabilities(&self) -> SourceCapabilities {
        SourceCapabilities {
            supports_equities: true,
            supports_crypto: true,
            rate_limit_per_sec: 50.0,
            feature_schema: vec!["trend_strength".into(), "slope_pct".into()],
        }
    }

    async fn fetch_verdict(
        &self,
        _symbol: &Symbol,
        now_ms: i64,
        snapshot: &MarketSnapshot,
    ) -> Result<SourceVerdict, SourceError> {
        let slope = regression_slope(&snapshot.candles).ok_or(SourceError::MalformedResponse)?;

        let (verdict, confidence) = if slope > self.slope_threshold {
            (Verdict::Long, (65.0 + slope * 300.0).min(95.0))
        } else if slope < -self.slope_threshold {
            (Verdict::Short, (65.0 + slope.abs() * 300.0).min(95.0))
        } else {
            (Verdict::Neutral, 50.0)
        };

        let trend_strength = (slope / self.slope_threshold).clamp(-1.0, 1.0);

        Ok(SourceVerdict::new(&self.id, verdict, confidence, now_ms)
            .with_feature("trend_strength", Feature::Number(trend_strength))
            .with_feature("slope_pct", Feature::Number(slope)))
    }
}

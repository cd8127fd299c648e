// =============================================================================
// Market data — OHLCV snapshots with primary/secondary fallback
// =============================================================================
//
// The generator pulls one snapshot per symbol per cycle. Snapshots come from
// a pluggable feed; the fallback wrapper tries the secondary feed when the
// primary fails and surfaces an error only when both do.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::SourceError;
use crate::types::Symbol;

/// One OHLCV bar. Timestamps are epoch milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub open_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub close_time: i64,
}

/// Rolling window of candles plus the latest trade price for one symbol.
#[derive(Debug, Clone, PartialEq)]
pub struct MarketSnapshot {
    pub symbol: Symbol,
    /// Oldest first.
    pub candles: Vec<Candle>,
    pub last_price: f64,
    /// Epoch milliseconds at capture.
    pub as_of: i64,
}

impl MarketSnapshot {
    /// Stable hash of the candle window, used as part of the regime cache
    /// key: identical windows hit the cache, a new bar misses it.
    pub fn window_hash(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.candles.len().hash(&mut hasher);
        if let Some(first) = self.candles.first() {
            first.open_time.hash(&mut hasher);
        }
        if let Some(last) = self.candles.last() {
            last.open_time.hash(&mut hasher);
            last.close.to_bits().hash(&mut hasher);
        }
        hasher.finish()
    }
}

/// A provider of market-data snapshots.
#[async_trait]
pub trait MarketDataFeed: Send + Sync {
    fn id(&self) -> &str;

    async fn fetch(&self, symbol: &Symbol, bars: usize) -> Result<MarketSnapshot, SourceError>;
}

/// Primary feed with an optional secondary fallback.
pub struct FallbackFeed {
    primary: Arc<dyn MarketDataFeed>,
    secondary: Option<Arc<dyn MarketDataFeed>>,
}

impl FallbackFeed {
    pub fn new(primary: Arc<dyn MarketDataFeed>, secondary: Option<Arc<dyn MarketDataFeed>>) -> Self {
        Self { primary, secondary }
    }

    /// Fetch from the primary, falling back to the secondary on failure.
    /// Both failing returns the *primary's* error so the caller records the
    /// original cause.
    pub async fn fetch(&self, symbol: &Symbol, bars: usize) -> Result<MarketSnapshot, SourceError> {
        match self.primary.fetch(symbol, bars).await {
            Ok(snapshot) => Ok(snapshot),
            Err(primary_err) => {
                warn!(
                    symbol = %symbol,
                    feed = self.primary.id(),
                    error = %primary_err,
                    "primary market-data feed failed"
                );
                match &self.secondary {
                    Some(secondary) => match secondary.fetch(symbol, bars).await {
                        Ok(snapshot) => Ok(snapshot),
                        Err(secondary_err) => {
                            warn!(
                                symbol = %symbol,
                                feed = secondary.id(),
                                error = %secondary_err,
                                "secondary market-data feed failed"
                            );
                            Err(primary_err)
                        }
                    },
                    None => Err(primary_err),
                }
            }
        }
    }
}

/// Deterministic synthetic feed for development and tests. Produces a gentle
/// sine-wave walk seeded by the symbol name, so repeated fetches at the same
/// timestamp return identical windows.
pub struct SimMarketFeed {
    id: String,
    /// Bar interval in milliseconds.
    bar_ms: i64,
}

impl SimMarketFeed {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            bar_ms: 60_000,
        }
    }

    fn seed(symbol: &Symbol) -> f64 {
        let mut hasher = DefaultHasher::new();
        symbol.as_str().hash(&mut hasher);
        // Map the hash into a base price between 20 and 520.
        20.0 + (hasher.finish() % 500) as f64
    }
}

#[async_trait]
impl MarketDataFeed for SimMarketFeed {
    fn id(&self) -> &str {
        &self.id
    }

    async fn fetch(&self, symbol: &Symbol, bars: usize) -> Result<MarketSnapshot, SourceError> {
        let now = chrono::Utc::now().timestamp_millis();
        let aligned = now - now % self.bar_ms;
        let base = Self::seed(symbol);

        let mut candles = Vec::with_capacity(bars);
        for i in 0..bars {
            let open_time = aligned - self.bar_ms * (bars as i64 - i as i64);
            let t = open_time as f64 / self.bar_ms as f64;
            let drift = (t * 0.05).sin() * base * 0.02;
            let open = base + drift;
            let close = base + ((t + 1.0) * 0.05).sin() * base * 0.02;
            let high = open.max(close) + base * 0.002;
            let low = open.min(close) - base * 0.002;
            candles.push(Candle {
                open_time,
                open,
                high,
                low,
                close,
                volume: 1_000.0 + (t % 7.0) * 100.0,
                close_time: open_time + self.bar_ms - 1,
            });
        }

        let last_price = candles.last().map(|c| c.close).unwrap_or(base);
        Ok(MarketSnapshot {
            symbol: symbol.clone(),
            candles,
            last_price,
            as_of: now,
        })
    }
}

// =============================================================================
// Market Regime Detector
// =============================================================================
//
// Classifies the current market into one of four regimes from a rolling
// OHLCV window. Detection hierarchy (first match wins):
//
//   1. VOLATILE      — ATR% above the volatility ceiling
//   2. TRENDING      — ADX above the trend floor AND a clear regression slope
//   3. CONSOLIDATION — ADX below the quiet ceiling AND subdued ATR%
//   4. UNKNOWN       — anything ambiguous, or not enough data
//
// All cut-offs come from configuration. Readings are cached for five minutes
// keyed `(symbol, window-hash)` so identical windows never recompute.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;

use crate::config::RegimeThresholds;
use crate::indicators::{calculate_adx, calculate_atr_pct, regression_slope};
use crate::sources::market_data::MarketSnapshot;
use crate::types::{Regime, Symbol};

/// A regime classification plus the indicator values behind it.
#[derive(Debug, Clone, Serialize)]
pub struct RegimeReading {
    pub regime: Regime,
    /// ATR as a percentage of the last close.
    pub volatility: f64,
    /// ADX.
    pub trend_strength: f64,
    /// Normalised regression slope, percent per bar.
    pub momentum: f64,
}

impl RegimeReading {
    fn unknown() -> Self {
        Self {
            regime: Regime::Unknown,
            volatility: 0.0,
            trend_strength: 0.0,
            momentum: 0.0,
        }
    }
}

struct CacheEntry {
    reading: RegimeReading,
    window_hash: u64,
    computed_at: Instant,
}

/// Thread-safe detector with a per-symbol reading cache.
pub struct RegimeDetector {
    thresholds: RegimeThresholds,
    cache_ttl: Duration,
    cache: Mutex<HashMap<Symbol, CacheEntry>>,
}

impl RegimeDetector {
    pub fn new(thresholds: RegimeThresholds) -> Self {
        let cache_ttl = Duration::from_secs(thresholds.cache_secs);
        Self {
            thresholds,
            cache_ttl,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Classify the snapshot's window, reusing a cached reading when the
    /// window is unchanged and the entry is younger than the TTL.
    pub fn detect(&self, snapshot: &MarketSnapshot) -> RegimeReading {
        let window_hash = snapshot.window_hash();

        {
            let cache = self.cache.lock();
            if let Some(entry) = cache.get(&snapshot.symbol) {
                if entry.window_hash == window_hash && entry.computed_at.elapsed() < self.cache_ttl
                {
                    return entry.reading.clone();
                }
            }
        }

        let reading = self.classify(snapshot);

        debug!(
            symbol = %snapshot.symbol,
            regime = %reading.regime,
            volatility = format!("{:.2}", reading.volatility),
            trend_strength = format!("{:.2}", reading.trend_strength),
            momentum = format!("{:.4}", reading.momentum),
            "regime detected"
        );

        self.cache.lock().insert(
            snapshot.symbol.clone(),
            CacheEntry {
                reading: reading.clone(),
                window_hash,
                computed_at: Instant::now(),
            },
        );

        reading
    }

    fn classify(&self, snapshot: &MarketSnapshot) -> RegimeReading {
        let candles = &snapshot.candles;

        let atr_pct = calculate_atr_pct(candles, 14);
        let adx = calculate_adx(candles, 14);
        let slope = regression_slope(candles);

        let (Some(atr_pct), Some(adx), Some(slope)) = (atr_pct, adx, slope) else {
            return RegimeReading::unknown();
        };

        let t = &self.thresholds;
        let regime = if atr_pct > t.atr_volatile_pct {
            Regime::Volatile
        } else if adx > t.adx_trending_min && slope.abs() > t.slope_trending_min {
            Regime::Trending
        } else if adx < t.adx_quiet_max && atr_pct < t.atr_quiet_pct {
            Regime::Consolidation
        } else {
            Regime::Unknown
        };

        RegimeReading {
            regime,
            volatility: atr_pct,
            trend_strength: adx,
            momentum: slope,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::market_data::Candle;

    fn snapshot(candles: Vec<Candle>) -> MarketSnapshot {
        let last_price = candles.last().map(|c| c.close).unwrap_or(0.0);
        MarketSnapshot {
            symbol: Symbol::from("AAPL"),
            candles,
            last_price,
            as_of: 0,
        }
    }

    fn candle(i: i64, open: f64, high: f64, low: f64, close: f64) -> Candle {
        Candle {
            open_time: i * 60_000,
            open,
            high,
            low,
            close,
            volume: 1.0,
            close_time: i * 60_000 + 59_999,
        }
    }

    fn trending_candles(n: usize) -> Vec<Candle> {
        (0..n)
            .map(|i| {
                let base = 100.0 + i as f64 * 2.0;
                candle(i as i64, base, base + 1.5, base - 0.5, base + 1.0)
            })
            .collect()
    }

    fn quiet_candles(n: usize) -> Vec<Candle> {
        (0..n)
            .map(|i| candle(i as i64, 100.0, 100.3, 99.7, 100.0 + (i % 2) as f64 * 0.05))
            .collect()
    }

    fn volatile_candles(n: usize) -> Vec<Candle> {
        (0..n)
            .map(|i| {
                let base = 100.0 + if i % 2 == 0 { 8.0 } else { -8.0 };
                candle(i as i64, base, base + 6.0, base - 6.0, base + 3.0)
            })
            .collect()
    }

    #[test]
    fn insufficient_data_is_unknown() {
        let detector = RegimeDetector::new(RegimeThresholds::default());
        let reading = detector.detect(&snapshot(trending_candles(5)));
        assert_eq!(reading.regime, Regime::Unknown);
    }

    #[test]
    fn steady_climb_is_trending() {
        let detector = RegimeDetector::new(RegimeThresholds::default());
        let reading = detector.detect(&snapshot(trending_candles(60)));
        assert_eq!(reading.regime, Regime::Trending);
        assert!(reading.trend_strength > 25.0);
        assert!(reading.momentum > 0.0);
    }

    #[test]
    fn tight_range_is_consolidation() {
        let detector = RegimeDetector::new(RegimeThresholds::default());
        let reading = detector.detect(&snapshot(quiet_candles(60)));
        assert_eq!(reading.regime, Regime::Consolidation);
    }

    #[test]
    fn wide_swings_are_volatile() {
        let detector = RegimeDetector::new(RegimeThresholds::default());
        let reading = detector.detect(&snapshot(volatile_candles(60)));
        assert_eq!(reading.regime, Regime::Volatile);
        assert!(reading.volatility > 3.0);
    }

    #[test]
    fn identical_window_hits_cache() {
        let detector = RegimeDetector::new(RegimeThresholds::default());
        let snap = snapshot(trending_candles(60));
        let first = detector.detect(&snap);
        let second = detector.detect(&snap);
        assert_eq!(first.regime, second.regime);
        assert_eq!(detector.cache.lock().len(), 1);
    }

    #[test]
    fn new_bar_invalidates_cache() {
        let detector = RegimeDetector::new(RegimeThresholds::default());
        let mut candles = trending_candles(60);
        detector.detect(&snapshot(candles.clone()));

        candles.push(candle(60, 220.0, 222.0, 219.0, 221.0));
        let reading = detector.detect(&snapshot(candles));
        // Recomputed, not served stale: still trending with fresh metrics.
        assert_eq!(reading.regime, Regime::Trending);
    }

    #[test]
    fn thresholds_are_honoured() {
        let mut thresholds = RegimeThresholds::default();
        thresholds.atr_volatile_pct = 0.1; // everything is volatile now
        let detector = RegimeDetector::new(thresholds);
        let reading = detector.detect(&snapshot(trending_candles(60)));
        assert_eq!(reading.regime, Regime::Volatile);
    }
}

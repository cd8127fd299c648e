// =============================================================================
// Source registry — rate limiting, caching, timeouts, session gating
// =============================================================================
//
// Every call to a source passes through this wrapper:
//
//   disabled? -> session gate -> cache -> token bucket -> hard timeout -> fetch
//
// The configured timeout is never extended. Failures come back as
// `SourceError`; a permanent error (auth, disabled) parks the source for the
// rest of the cycle. NEUTRAL verdicts exposing a clear trend feature are
// promoted to a directional verdict capped at confidence 70.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Datelike, Timelike, Utc};
use tracing::{debug, warn};

use crate::config::SourceConfig;
use crate::error::SourceError;
use crate::signal::SourceVerdict;
use crate::sources::cache::VerdictCache;
use crate::sources::market_data::MarketSnapshot;
use crate::sources::rate_limit::TokenBucket;
use crate::sources::DataSource;
use crate::types::{Symbol, Verdict};

/// Base confidence floor for any directional verdict.
pub const DIRECTIONAL_FLOOR: f64 = 65.0;
/// Promotion cap: a NEUTRAL promoted to a direction never exceeds this.
pub const PROMOTION_CAP: f64 = 70.0;
/// Minimum |trend_strength| feature for a NEUTRAL verdict to be promoted.
const PROMOTION_TREND_MIN: f64 = 0.5;

/// One source plus its protective wrappers.
pub struct RegisteredSource {
    pub config: SourceConfig,
    source: Arc<dyn DataSource>,
    bucket: TokenBucket,
    cache: VerdictCache,
    disabled_for_cycle: AtomicBool,
}

impl RegisteredSource {
    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn weight(&self) -> f64 {
        self.config.weight
    }
}

/// Registry of all configured sources, keyed by source id.
pub struct SourceRegistry {
    sources: Vec<Arc<RegisteredSource>>,
}

impl SourceRegistry {
    /// Pair configured sources with their implementations. Configured
    /// sources without an implementation are skipped with a warning.
    pub fn new(configs: &[SourceConfig], implementations: Vec<Arc<dyn DataSource>>) -> Self {
        let mut sources = Vec::new();
        for config in configs {
            let implementation = implementations.iter().find(|s| s.id() == config.id);
            match implementation {
                Some(implementation) => {
                    sources.push(Arc::new(RegisteredSource {
                        bucket: TokenBucket::new(config.rate_limit_per_sec),
                        cache: VerdictCache::new(config.cache_ttl_secs),
                        config: config.clone(),
                        source: implementation.clone(),
                        disabled_for_cycle: AtomicBool::new(false),
                    }));
                }
                None => {
                    warn!(source = %config.id, "configured source has no implementation, skipping");
                }
            }
        }
        Self { sources }
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Clear per-cycle disable flags. Called at the top of every cycle.
    pub fn begin_cycle(&self) {
        for source in &self.sources {
            source.disabled_for_cycle.store(false, Ordering::Relaxed);
        }
    }

    /// Sources applicable to `symbol` right now: enabled, supporting the
    /// symbol class, and — for equities — inside the regular session when the
    /// source declares `regular_session_only`. Crypto symbols are always
    /// served regardless of session gating.
    pub fn applicable(&self, symbol: &Symbol, now: DateTime<Utc>) -> Vec<Arc<RegisteredSource>> {
        let crypto = symbol.is_crypto();
        self.sources
            .iter()
            .filter(|s| s.config.enabled)
            .filter(|s| {
                let caps = s.source.capabilities();
                if crypto {
                    caps.supports_crypto
                } else {
                    caps.supports_equities
                }
            })
            .filter(|s| crypto || !s.config.regular_session_only || regular_session(now))
            .cloned()
            .collect()
    }

    /// Run the full protective pipeline for one source call.
    pub async fn fetch(
        &self,
        registered: &RegisteredSource,
        symbol: &Symbol,
        snapshot: &MarketSnapshot,
        now_ms: i64,
    ) -> Result<SourceVerdict, SourceError> {
        if registered.disabled_for_cycle.load(Ordering::Relaxed) {
            return Err(SourceError::Disabled);
        }

        if let Some(cached) = registered.cache.get(symbol, now_ms) {
            debug!(source = registered.id(), symbol = %symbol, "verdict cache hit");
            return Ok(cached);
        }

        if !registered.bucket.try_acquire() {
            return Err(SourceError::RateLimited);
        }

        let timeout = Duration::from_secs(registered.config.timeout_secs.min(10));
        let result = tokio::time::timeout(
            timeout,
            registered.source.fetch_verdict(symbol, now_ms, snapshot),
        )
        .await;

        let verdict = match result {
            Err(_) => return Err(SourceError::Timeout),
            Ok(Err(e)) => {
                if e.is_permanent() {
                    registered.disabled_for_cycle.store(true, Ordering::Relaxed);
                    warn!(source = registered.id(), error = %e, "source disabled for this cycle");
                }
                return Err(e);
            }
            Ok(Ok(v)) => v,
        };

        let verdict = normalise(verdict);
        registered.cache.put(symbol, now_ms, verdict.clone());
        Ok(verdict)
    }
}

/// Clamp confidence and apply the NEUTRAL promotion rule.
fn normalise(mut verdict: SourceVerdict) -> SourceVerdict {
    verdict.confidence = verdict.confidence.clamp(0.0, 100.0);

    if verdict.verdict == Verdict::Neutral {
        let trend = verdict
            .features
            .get("trend_strength")
            .and_then(|f| f.as_number());
        if let Some(trend) = trend {
            if trend.abs() >= PROMOTION_TREND_MIN {
                verdict.verdict = if trend > 0.0 {
                    Verdict::Long
                } else {
                    Verdict::Short
                };
                verdict.confidence = verdict.confidence.clamp(DIRECTIONAL_FLOOR, PROMOTION_CAP);
            }
        }
    }

    verdict
}

/// Regular US equity session, UTC: weekdays 13:30-20:00.
pub fn regular_session(now: DateTime<Utc>) -> bool {
    let weekday = now.weekday().num_days_from_monday();
    if weekday >= 5 {
        return false;
    }
    let minutes = now.hour() * 60 + now.minute();
    (13 * 60 + 30..20 * 60).contains(&minutes)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::Feature;
    use crate::sources::SourceCapabilities;
    use async_trait::async_trait;
    use chrono::TimeZone;

    struct ScriptedSource {
        id: String,
        verdict: Verdict,
        confidence: f64,
        features: Vec<(String, f64)>,
        delay: Duration,
        error: Option<SourceError>,
    }

    impl ScriptedSource {
        fn ok(id: &str, verdict: Verdict, confidence: f64) -> Self {
            Self {
                id: id.into(),
                verdict,
                confidence,
                features: vec![],
                delay: Duration::ZERO,
                error: None,
            }
        }
    }

    #[async_trait]
    impl DataSource for ScriptedSource {
        fn id(&self) -> &str {
            &self.id
        }

        fn capabilities(&self) -> SourceCapabilities {
            SourceCapabilities {
                supports_equities: true,
                supports_crypto: true,
                rate_limit_per_sec: 100.0,
                feature_schema: self.features.iter().map(|(k, _)| k.clone()).collect(),
            }
        }

        async fn fetch_verdict(
            &self,
            _symbol: &Symbol,
            now_ms: i64,
            _snapshot: &MarketSnapshot,
        ) -> Result<SourceVerdict, SourceError> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if let Some(e) = self.error {
                return Err(e);
            }
            let mut verdict = SourceVerdict::new(&self.id, self.verdict, self.confidence, now_ms);
            for (k, v) in &self.features {
                verdict = verdict.with_feature(k.clone(), Feature::Number(*v));
            }
            Ok(verdict)
        }
    }

    fn source_config(id: &str) -> SourceConfig {
        SourceConfig {
            id: id.into(),
            weight: 0.2,
            rate_limit_per_sec: 100.0,
            cache_ttl_secs: 10,
            timeout_secs: 1,
            regular_session_only: false,
            enabled: true,
            api_key_name: None,
        }
    }

    fn snapshot() -> MarketSnapshot {
        MarketSnapshot {
            symbol: Symbol::from("AAPL"),
            candles: vec![],
            last_price: 100.0,
            as_of: 0,
        }
    }

    #[tokio::test]
    async fn fetch_returns_verdict() {
        let registry = SourceRegistry::new(
            &[source_config("alpha")],
            vec![Arc::new(ScriptedSource::ok("alpha", Verdict::Long, 85.0))],
        );
        let sources = registry.applicable(&Symbol::from("AAPL"), Utc::now());
        let verdict = registry
            .fetch(&sources[0], &Symbol::from("AAPL"), &snapshot(), 1_000)
            .await
            .unwrap();
        assert_eq!(verdict.verdict, Verdict::Long);
    }

    #[tokio::test]
    async fn timeout_is_not_extended() {
        let mut source = ScriptedSource::ok("slow", Verdict::Long, 85.0);
        source.delay = Duration::from_secs(5);
        let registry = SourceRegistry::new(&[source_config("slow")], vec![Arc::new(source)]);
        let sources = registry.applicable(&Symbol::from("AAPL"), Utc::now());
        let err = registry
            .fetch(&sources[0], &Symbol::from("AAPL"), &snapshot(), 1_000)
            .await
            .unwrap_err();
        assert_eq!(err, SourceError::Timeout);
    }

    #[tokio::test]
    async fn permanent_error_disables_for_cycle() {
        let mut source = ScriptedSource::ok("auth", Verdict::Long, 85.0);
        source.error = Some(SourceError::AuthFailed);
        let registry = SourceRegistry::new(&[source_config("auth")], vec![Arc::new(source)]);
        let sources = registry.applicable(&Symbol::from("AAPL"), Utc::now());

        let first = registry
            .fetch(&sources[0], &Symbol::from("AAPL"), &snapshot(), 1_000)
            .await
            .unwrap_err();
        assert_eq!(first, SourceError::AuthFailed);

        let second = registry
            .fetch(&sources[0], &Symbol::from("AAPL"), &snapshot(), 1_000)
            .await
            .unwrap_err();
        assert_eq!(second, SourceError::Disabled);

        registry.begin_cycle();
        let third = registry
            .fetch(&sources[0], &Symbol::from("AAPL"), &snapshot(), 1_000)
            .await
            .unwrap_err();
        assert_eq!(third, SourceError::AuthFailed);
    }

    #[tokio::test]
    async fn cache_hit_skips_rate_limit() {
        let mut config = source_config("alpha");
        config.rate_limit_per_sec = 1.0;
        let registry = SourceRegistry::new(
            &[config],
            vec![Arc::new(ScriptedSource::ok("alpha", Verdict::Long, 85.0))],
        );
        let sources = registry.applicable(&Symbol::from("AAPL"), Utc::now());
        let symbol = Symbol::from("AAPL");

        // First call drains the single token; second hits the cache.
        registry
            .fetch(&sources[0], &symbol, &snapshot(), 1_000)
            .await
            .unwrap();
        registry
            .fetch(&sources[0], &symbol, &snapshot(), 2_000)
            .await
            .unwrap();

        // A different symbol in the same window must take the rate-limit path.
        let err = registry
            .fetch(&sources[0], &Symbol::from("MSFT"), &snapshot(), 2_000)
            .await
            .unwrap_err();
        assert_eq!(err, SourceError::RateLimited);
    }

    #[tokio::test]
    async fn neutral_with_trend_feature_is_promoted_and_capped() {
        let mut source = ScriptedSource::ok("alpha", Verdict::Neutral, 90.0);
        source.features = vec![("trend_strength".into(), 0.8)];
        let registry = SourceRegistry::new(&[source_config("alpha")], vec![Arc::new(source)]);
        let sources = registry.applicable(&Symbol::from("AAPL"), Utc::now());
        let verdict = registry
            .fetch(&sources[0], &Symbol::from("AAPL"), &snapshot(), 1_000)
            .await
            .unwrap();
        assert_eq!(verdict.verdict, Verdict::Long);
        assert!((verdict.confidence - PROMOTION_CAP).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn weak_trend_stays_neutral() {
        let mut source = ScriptedSource::ok("alpha", Verdict::Neutral, 80.0);
        source.features = vec![("trend_strength".into(), 0.2)];
        let registry = SourceRegistry::new(&[source_config("alpha")], vec![Arc::new(source)]);
        let sources = registry.applicable(&Symbol::from("AAPL"), Utc::now());
        let verdict = registry
            .fetch(&sources[0], &Symbol::from("AAPL"), &snapshot(), 1_000)
            .await
            .unwrap();
        assert_eq!(verdict.verdict, Verdict::Neutral);
    }

    #[test]
    fn session_gate_skips_equities_but_not_crypto() {
        let mut config = source_config("gated");
        config.regular_session_only = true;
        let source = ScriptedSource::ok("gated", Verdict::Long, 85.0);
        let registry = SourceRegistry::new(&[config], vec![Arc::new(source)]);

        // Saturday 12:00 UTC — outside the regular session.
        let weekend = Utc.with_ymd_and_hms(2026, 1, 3, 12, 0, 0).unwrap();
        assert!(registry.applicable(&Symbol::from("AAPL"), weekend).is_empty());
        assert_eq!(registry.applicable(&Symbol::from("BTC-USD"), weekend).len(), 1);

        // Tuesday 15:00 UTC — inside the session.
        let weekday = Utc.with_ymd_and_hms(2026, 1, 6, 15, 0, 0).unwrap();
        assert_eq!(registry.applicable(&Symbol::from("AAPL"), weekday).len(), 1);
    }

    #[test]
    fn regular_session_bounds() {
        let open = Utc.with_ymd_and_hms(2026, 1, 6, 13, 30, 0).unwrap();
        let close = Utc.with_ymd_and_hms(2026, 1, 6, 20, 0, 0).unwrap();
        let before = Utc.with_ymd_and_hms(2026, 1, 6, 13, 29, 0).unwrap();
        assert!(regular_session(open));
        assert!(!regular_session(close));
        assert!(!regular_session(before));
    }
}

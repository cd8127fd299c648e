// =============================================================================
// Runtime Configuration — layered precedence with fail-fast validation
// =============================================================================
//
// Precedence: built-in defaults < JSON config file < environment variables
// (prefix MERIDIAN_). Every field carries `#[serde(default)]` so that adding
// new fields never breaks loading an older config file.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash. Secrets are resolved once at boot: secrets file (stand-in for a
// secrets manager) -> environment -> config file. Production refuses to start
// on a known-weak secret.
// =============================================================================

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::EngineError;
use crate::types::Environment;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_true() -> bool {
    true
}

fn default_symbols() -> Vec<String> {
    vec![
        "AAPL".to_string(),
        "MSFT".to_string(),
        "NVDA".to_string(),
        "BTC-USD".to_string(),
        "ETH-USD".to_string(),
    ]
}

fn default_cycle_interval_secs() -> u64 {
    5
}

fn default_cycle_budget_secs() -> u64 {
    30
}

fn default_per_symbol_budget_secs() -> u64 {
    8
}

fn default_min_signal_spacing_secs() -> u64 {
    30
}

fn default_price_change_threshold_pct() -> f64 {
    0.25
}

fn default_max_parallel_symbols() -> usize {
    4
}

fn default_batch_size() -> usize {
    50
}

fn default_flush_interval_secs() -> u64 {
    10
}

fn default_min_confidence() -> f64 {
    80.0
}

fn default_http_port() -> u16 {
    8080
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_store_path() -> String {
    "signals.db".to_string()
}

fn default_archive_path() -> String {
    "signals_archive.db".to_string()
}

fn default_audit_path() -> String {
    "audit.db".to_string()
}

fn default_executions_path() -> String {
    "executions.db".to_string()
}

fn default_floor_directional() -> f64 {
    65.0
}

fn default_floor_unknown() -> f64 {
    60.0
}

fn default_threshold_single() -> f64 {
    80.0
}

fn default_threshold_two_same() -> f64 {
    75.0
}

fn default_threshold_two_mixed() -> f64 {
    70.0
}

fn default_threshold_trending() -> f64 {
    75.0
}

fn default_threshold_base() -> f64 {
    80.0
}

fn default_margin_tiebreak() -> f64 {
    0.02
}

fn default_neutral_split_long() -> f64 {
    0.55
}

fn default_early_exit_sources() -> usize {
    5
}

fn default_early_exit_confidence() -> f64 {
    95.0
}

fn default_adx_trending_min() -> f64 {
    25.0
}

fn default_adx_quiet_max() -> f64 {
    20.0
}

fn default_slope_trending_min() -> f64 {
    0.15
}

fn default_atr_volatile_pct() -> f64 {
    3.0
}

fn default_atr_quiet_pct() -> f64 {
    1.2
}

fn default_regime_window() -> usize {
    200
}

fn default_regime_cache_secs() -> u64 {
    300
}

fn default_stop_atr_multiplier() -> f64 {
    1.5
}

fn default_target_atr_multiplier() -> f64 {
    2.5
}

fn default_min_stop_pct() -> f64 {
    0.4
}

fn default_max_stop_pct() -> f64 {
    5.0
}

fn default_source_rate_limit() -> f64 {
    5.0
}

fn default_source_cache_ttl_secs() -> u64 {
    10
}

fn default_source_timeout_secs() -> u64 {
    3
}

fn default_source_weight() -> f64 {
    0.2
}

fn default_executor_window_secs() -> u64 {
    60
}

fn default_max_signals_per_window() -> u32 {
    30
}

fn default_queue_poll_interval_secs() -> u64 {
    5
}

fn default_executor_state_poll_secs() -> u64 {
    30
}

fn default_rejected_max_age_secs() -> u64 {
    600
}

fn default_rejected_max_retries() -> u32 {
    3
}

fn default_distributor_timeout_secs() -> u64 {
    5
}

fn default_max_positions() -> u32 {
    5
}

fn default_position_pct() -> f64 {
    2.0
}

fn default_risk_budget_pct() -> f64 {
    1.0
}

fn default_daily_loss_limit_pct() -> f64 {
    3.0
}

fn default_max_drawdown_pct() -> f64 {
    6.0
}

fn default_quality_window_days() -> i64 {
    30
}

fn default_quality_band() -> f64 {
    5.0
}

fn default_quality_min_outcomes() -> usize {
    20
}

fn default_audit_retention_days() -> i64 {
    365 * 7
}

fn default_service_type() -> String {
    "standard".to_string()
}

// =============================================================================
// Section structs
// =============================================================================

/// Consensus-engine tunables. Thresholds are regime- and mix-dependent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusParams {
    /// Confidence floor for TRENDING / CONSOLIDATION / VOLATILE regimes.
    #[serde(default = "default_floor_directional")]
    pub floor_directional: f64,

    /// Confidence floor under UNKNOWN regime.
    #[serde(default = "default_floor_unknown")]
    pub floor_unknown: f64,

    /// Accept threshold when a single directional source survives.
    #[serde(default = "default_threshold_single")]
    pub threshold_single_directional: f64,

    /// Accept threshold for two surviving sources of the same direction.
    #[serde(default = "default_threshold_two_same")]
    pub threshold_two_same: f64,

    /// Accept threshold for two surviving sources, NEUTRAL + directional.
    #[serde(default = "default_threshold_two_mixed")]
    pub threshold_two_mixed: f64,

    /// Base threshold for three or more sources under TRENDING.
    #[serde(default = "default_threshold_trending")]
    pub base_threshold_trending: f64,

    /// Base threshold for three or more sources under other regimes.
    #[serde(default = "default_threshold_base")]
    pub base_threshold_default: f64,

    /// Below this vote margin the engine emits no signal.
    #[serde(default = "default_margin_tiebreak")]
    pub margin_tiebreak: f64,

    /// LONG share of a NEUTRAL verdict's fractional vote (SHORT gets 1 - x).
    #[serde(default = "default_neutral_split_long")]
    pub neutral_split_long: f64,

    /// Early exit: minimum returned sources before cancelling the rest.
    #[serde(default = "default_early_exit_sources")]
    pub early_exit_min_sources: usize,

    /// Early exit: provisional confidence required to cancel the rest.
    #[serde(default = "default_early_exit_confidence")]
    pub early_exit_confidence: f64,
}

impl Default for ConsensusParams {
    fn default() -> Self {
        serde_json::from_str("{}").expect("defaults deserialise")
    }
}

/// Regime-detector thresholds. Exposed, never hardcoded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegimeThresholds {
    #[serde(default = "default_adx_trending_min")]
    pub adx_trending_min: f64,

    #[serde(default = "default_adx_quiet_max")]
    pub adx_quiet_max: f64,

    /// Minimum normalised linear-regression slope for TRENDING.
    #[serde(default = "default_slope_trending_min")]
    pub slope_trending_min: f64,

    /// ATR% above which the regime is VOLATILE.
    #[serde(default = "default_atr_volatile_pct")]
    pub atr_volatile_pct: f64,

    /// ATR% below which quiet markets classify as CONSOLIDATION.
    #[serde(default = "default_atr_quiet_pct")]
    pub atr_quiet_pct: f64,

    /// Candle window length fed to the detector.
    #[serde(default = "default_regime_window")]
    pub window: usize,

    /// Regime cache TTL, keyed `(symbol, window-hash)`.
    #[serde(default = "default_regime_cache_secs")]
    pub cache_secs: u64,
}

impl Default for RegimeThresholds {
    fn default() -> Self {
        serde_json::from_str("{}").expect("defaults deserialise")
    }
}

/// Stop/target construction parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskParams {
    #[serde(default = "default_stop_atr_multiplier")]
    pub stop_atr_multiplier: f64,

    #[serde(default = "default_target_atr_multiplier")]
    pub target_atr_multiplier: f64,

    /// Stop distance clamp, as a percentage of entry price.
    #[serde(default = "default_min_stop_pct")]
    pub min_stop_pct: f64,

    #[serde(default = "default_max_stop_pct")]
    pub max_stop_pct: f64,
}

impl Default for RiskParams {
    fn default() -> Self {
        serde_json::from_str("{}").expect("defaults deserialise")
    }
}

/// One registered data source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub id: String,

    /// Consensus weight in [0, 1]; all weights sum to <= 1.
    #[serde(default = "default_source_weight")]
    pub weight: f64,

    /// Token-bucket refill rate, calls per second.
    #[serde(default = "default_source_rate_limit")]
    pub rate_limit_per_sec: f64,

    /// Response cache TTL (10 s market data, 90-120 s expensive AI sources).
    #[serde(default = "default_source_cache_ttl_secs")]
    pub cache_ttl_secs: u64,

    /// Hard per-call timeout. Slow sources may declare up to 10 s.
    #[serde(default = "default_source_timeout_secs")]
    pub timeout_secs: u64,

    /// Skip this source for equities outside the regular session.
    #[serde(default)]
    pub regular_session_only: bool,

    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Name under which the source's API key is resolved from secrets.
    #[serde(default)]
    pub api_key_name: Option<String>,
}

/// One downstream executor endpoint held by the distributor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    pub executor_id: String,
    pub endpoint_url: String,

    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,

    /// Empty allowlist means all symbols qualify.
    #[serde(default)]
    pub symbol_allowlist: Vec<String>,

    /// Empty allowlist means both actions qualify.
    #[serde(default)]
    pub action_allowlist: Vec<String>,

    #[serde(default = "default_max_signals_per_window")]
    pub max_signals_per_window: u32,

    #[serde(default = "default_executor_window_secs")]
    pub window_secs: u64,

    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Name under which the shared HMAC secret is resolved.
    pub secret_name: String,
}

/// Prop-firm gates for the local executor service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PropFirmParams {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_daily_loss_limit_pct")]
    pub daily_loss_limit_pct: f64,

    #[serde(default = "default_max_drawdown_pct")]
    pub max_drawdown_pct: f64,
}

impl Default for PropFirmParams {
    fn default() -> Self {
        serde_json::from_str("{}").expect("defaults deserialise")
    }
}

/// Configuration of the local trading executor service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorServiceParams {
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,

    #[serde(default = "default_max_positions")]
    pub max_positions: u32,

    /// Base position size as a percentage of account equity.
    #[serde(default = "default_position_pct")]
    pub position_pct: f64,

    /// Risk budget per trade as a percentage of account equity.
    #[serde(default = "default_risk_budget_pct")]
    pub risk_budget_pct: f64,

    /// Whether the connected broker supports shorting crypto.
    #[serde(default)]
    pub broker_shorts_crypto: bool,

    #[serde(default)]
    pub prop_firm: PropFirmParams,

    /// Name under which the inbound HMAC secret is resolved.
    #[serde(default)]
    pub secret_name: Option<String>,
}

impl Default for ExecutorServiceParams {
    fn default() -> Self {
        serde_json::from_str("{}").expect("defaults deserialise")
    }
}

/// Rejected-signal queue timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RejectedQueueParams {
    #[serde(default = "default_queue_poll_interval_secs")]
    pub poll_interval_secs: u64,

    #[serde(default = "default_executor_state_poll_secs")]
    pub executor_state_poll_secs: u64,

    #[serde(default = "default_rejected_max_age_secs")]
    pub max_age_secs: u64,

    #[serde(default = "default_rejected_max_retries")]
    pub max_retries: u32,
}

impl Default for RejectedQueueParams {
    fn default() -> Self {
        serde_json::from_str("{}").expect("defaults deserialise")
    }
}

/// Quality-scorer tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityParams {
    #[serde(default = "default_quality_window_days")]
    pub window_days: i64,

    /// Confidence band half-width for the historical lookup.
    #[serde(default = "default_quality_band")]
    pub confidence_band: f64,

    /// Minimum historical outcomes before any adjustment is applied.
    #[serde(default = "default_quality_min_outcomes")]
    pub min_outcomes: usize,

    /// Path to the pre-fit calibration artifact (JSON). None = identity.
    #[serde(default)]
    pub calibrator_path: Option<String>,
}

impl Default for QualityParams {
    fn default() -> Self {
        serde_json::from_str("{}").expect("defaults deserialise")
    }
}

/// Optional best-effort mirror of stored signals to an external receiver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlpineSyncParams {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub endpoint_url: String,
}

impl Default for AlpineSyncParams {
    fn default() -> Self {
        serde_json::from_str("{}").expect("defaults deserialise")
    }
}

// =============================================================================
// Config
// =============================================================================

/// Top-level engine configuration. Read-only after startup; hot reload
/// replaces the whole handle atomically.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub environment: Environment,

    /// 24/7 mode forbids generator PAUSE transitions.
    #[serde(default)]
    pub always_on: bool,

    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,

    #[serde(default = "default_cycle_interval_secs")]
    pub cycle_interval_secs: u64,

    #[serde(default = "default_cycle_budget_secs")]
    pub cycle_budget_secs: u64,

    #[serde(default = "default_per_symbol_budget_secs")]
    pub per_symbol_budget_secs: u64,

    #[serde(default = "default_min_signal_spacing_secs")]
    pub min_signal_spacing_secs: u64,

    /// Price move (percent) below which a recent signal suppresses re-entry.
    #[serde(default = "default_price_change_threshold_pct")]
    pub price_change_threshold_pct: f64,

    #[serde(default = "default_max_parallel_symbols")]
    pub max_parallel_symbols: usize,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_flush_interval_secs")]
    pub flush_interval_secs: u64,

    /// Base confidence threshold applied by the local executor.
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,

    /// Tag stamped on every emitted signal, routing it to executors.
    #[serde(default = "default_service_type")]
    pub service_type: String,

    #[serde(default = "default_http_port")]
    pub http_port: u16,

    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,

    #[serde(default = "default_store_path")]
    pub store_path: String,

    #[serde(default = "default_archive_path")]
    pub archive_path: String,

    #[serde(default = "default_audit_path")]
    pub audit_path: String,

    #[serde(default = "default_executions_path")]
    pub executions_path: String,

    #[serde(default = "default_audit_retention_days")]
    pub audit_retention_days: i64,

    #[serde(default = "default_distributor_timeout_secs")]
    pub distributor_timeout_secs: u64,

    #[serde(default)]
    pub consensus: ConsensusParams,

    #[serde(default)]
    pub regime: RegimeThresholds,

    #[serde(default)]
    pub risk: RiskParams,

    #[serde(default)]
    pub sources: Vec<SourceConfig>,

    #[serde(default)]
    pub executors: Vec<ExecutorConfig>,

    #[serde(default)]
    pub executor_service: ExecutorServiceParams,

    #[serde(default)]
    pub rejected_queue: RejectedQueueParams,

    #[serde(default)]
    pub quality: QualityParams,

    #[serde(default)]
    pub alpine_sync: AlpineSyncParams,

    /// Last-resort secret fallback (name -> value). Dev convenience only.
    #[serde(default)]
    pub secret_fallbacks: HashMap<String, String>,
}

impl Default for Config {
    fn default() -> Self {
        serde_json::from_str("{}").expect("defaults deserialise")
    }
}

impl Config {
    /// Load configuration from a JSON file, then apply environment overrides.
    ///
    /// A missing file is not an error — defaults plus environment apply.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config from {}", path.display()))?;
            let config: Self = serde_json::from_str(&content)
                .with_context(|| format!("failed to parse config from {}", path.display()))?;
            info!(path = %path.display(), symbols = ?config.symbols, "config file loaded");
            config
        } else {
            warn!(path = %path.display(), "config file missing, using defaults");
            Self::default()
        };

        config.apply_env();
        Ok(config)
    }

    /// Apply `MERIDIAN_*` environment variable overrides.
    pub fn apply_env(&mut self) {
        fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
            std::env::var(key).ok().and_then(|v| v.parse().ok())
        }

        if let Ok(env) = std::env::var("MERIDIAN_ENVIRONMENT") {
            match env.as_str() {
                "production" => self.environment = Environment::Production,
                "development" => self.environment = Environment::Development,
                other => warn!(value = other, "unrecognised MERIDIAN_ENVIRONMENT, keeping current"),
            }
        }
        if let Some(v) = env_parse::<bool>("MERIDIAN_24_7_MODE") {
            self.always_on = v;
        }
        if let Ok(syms) = std::env::var("MERIDIAN_SYMBOLS") {
            let parsed: Vec<String> = syms
                .split(',')
                .map(|s| s.trim().to_uppercase())
                .filter(|s| !s.is_empty())
                .collect();
            if !parsed.is_empty() {
                self.symbols = parsed;
            }
        }
        if let Some(v) = env_parse("MERIDIAN_CYCLE_INTERVAL_SECONDS") {
            self.cycle_interval_secs = v;
        }
        if let Some(v) = env_parse("MERIDIAN_CYCLE_BUDGET_SECONDS") {
            self.cycle_budget_secs = v;
        }
        if let Some(v) = env_parse("MERIDIAN_PER_SYMBOL_BUDGET_SECONDS") {
            self.per_symbol_budget_secs = v;
        }
        if let Some(v) = env_parse("MERIDIAN_BATCH_SIZE") {
            self.batch_size = v;
        }
        if let Some(v) = env_parse("MERIDIAN_FLUSH_INTERVAL_SECONDS") {
            self.flush_interval_secs = v;
        }
        if let Some(v) = env_parse::<f64>("MERIDIAN_MIN_CONFIDENCE") {
            self.min_confidence = v;
            // The base threshold also governs the local executor's gate.
            self.executor_service.min_confidence = v;
        }
        if let Some(v) = env_parse("MERIDIAN_HTTP_PORT") {
            self.http_port = v;
        }
        if let Some(v) = env_parse("MERIDIAN_METRICS_PORT") {
            self.metrics_port = v;
        }
        if let Some(v) = env_parse("MERIDIAN_PROP_FIRM_ENABLED") {
            self.executor_service.prop_firm.enabled = v;
        }
        if let Some(v) = env_parse("MERIDIAN_DAILY_LOSS_LIMIT_PCT") {
            self.executor_service.prop_firm.daily_loss_limit_pct = v;
        }
        if let Some(v) = env_parse("MERIDIAN_MAX_DRAWDOWN_PCT") {
            self.executor_service.prop_firm.max_drawdown_pct = v;
        }
    }

    /// Fail-fast validation. Any violation is fatal at startup (exit code 2).
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.symbols.is_empty() {
            return Err(EngineError::Config("watchlist is empty".into()));
        }
        if self.cycle_interval_secs == 0 || self.cycle_budget_secs == 0 {
            return Err(EngineError::Config(
                "cycle interval and budget must be positive".into(),
            ));
        }
        if self.per_symbol_budget_secs > self.cycle_budget_secs {
            return Err(EngineError::Config(
                "per-symbol budget exceeds the cycle budget".into(),
            ));
        }
        if self.batch_size == 0 {
            return Err(EngineError::Config("batch_size must be >= 1".into()));
        }
        if !(0.0..=100.0).contains(&self.min_confidence) {
            return Err(EngineError::Config(
                "min_confidence must be within [0, 100]".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.consensus.neutral_split_long) {
            return Err(EngineError::Config(
                "neutral_split_long must be within [0, 1]".into(),
            ));
        }

        let weight_sum: f64 = self.sources.iter().map(|s| s.weight).sum();
        if weight_sum > 1.0 + 1e-9 {
            return Err(EngineError::Config(format!(
                "source weights sum to {weight_sum:.4}, must be <= 1"
            )));
        }
        for source in &self.sources {
            if !(0.0..=1.0).contains(&source.weight) {
                return Err(EngineError::Config(format!(
                    "source {} weight out of [0, 1]",
                    source.id
                )));
            }
            if source.timeout_secs == 0 || source.timeout_secs > 10 {
                return Err(EngineError::Config(format!(
                    "source {} timeout must be within 1..=10 s",
                    source.id
                )));
            }
            if source.rate_limit_per_sec <= 0.0 {
                return Err(EngineError::Config(format!(
                    "source {} rate limit must be positive",
                    source.id
                )));
            }
        }

        for exec in &self.executors {
            if !exec.endpoint_url.starts_with("http://")
                && !exec.endpoint_url.starts_with("https://")
            {
                return Err(EngineError::Config(format!(
                    "executor {} endpoint is not an http(s) URL",
                    exec.executor_id
                )));
            }
            if !(0.0..=100.0).contains(&exec.min_confidence) {
                return Err(EngineError::Config(format!(
                    "executor {} min_confidence out of [0, 100]",
                    exec.executor_id
                )));
            }
        }

        if self.risk.min_stop_pct <= 0.0 || self.risk.min_stop_pct > self.risk.max_stop_pct {
            return Err(EngineError::Config(
                "stop-distance clamp is inverted or non-positive".into(),
            ));
        }

        Ok(())
    }

    /// Persist to `path` using an atomic write (tmp + rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content =
            serde_json::to_string_pretty(self).context("failed to serialise config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "config saved (atomic)");
        Ok(())
    }
}

// =============================================================================
// Secrets
// =============================================================================

/// Resolved secret material, held in memory only. Never serialised or logged.
pub struct Secrets {
    values: HashMap<String, String>,
}

const WEAK_SECRETS: &[&str] = &["", "changeme", "secret", "password", "test"];

impl Secrets {
    /// Resolve every secret name the config references.
    ///
    /// Order per name: secrets file (`MERIDIAN_SECRETS_FILE`, a JSON map) ->
    /// environment variable of the same name -> config `secret_fallbacks`.
    /// In production a missing or known-weak secret is fatal; in development
    /// it downgrades to a warning and an empty value.
    pub fn resolve(config: &Config) -> Result<Self, EngineError> {
        let file_map: HashMap<String, String> = match std::env::var("MERIDIAN_SECRETS_FILE") {
            Ok(path) => {
                let content = std::fs::read_to_string(&path)
                    .map_err(|e| EngineError::Secrets(format!("cannot read {path}: {e}")))?;
                serde_json::from_str(&content)
                    .map_err(|e| EngineError::Secrets(format!("cannot parse {path}: {e}")))?
            }
            Err(_) => HashMap::new(),
        };

        let mut names: Vec<String> = Vec::new();
        for exec in &config.executors {
            names.push(exec.secret_name.clone());
        }
        if let Some(name) = &config.executor_service.secret_name {
            names.push(name.clone());
        }
        for source in &config.sources {
            if let Some(name) = &source.api_key_name {
                names.push(name.clone());
            }
        }
        names.sort();
        names.dedup();

        let mut values = HashMap::new();
        for name in names {
            let resolved = file_map
                .get(&name)
                .cloned()
                .or_else(|| std::env::var(&name).ok())
                .or_else(|| config.secret_fallbacks.get(&name).cloned());

            match resolved {
                Some(value) if !WEAK_SECRETS.contains(&value.as_str()) => {
                    values.insert(name, value);
                }
                Some(_) | None => {
                    let msg = format!("secret '{name}' is missing or a known-weak default");
                    if config.environment == Environment::Production {
                        return Err(EngineError::Secrets(msg));
                    }
                    warn!(name = %name, "weak or missing secret tolerated in development");
                    values.insert(name, String::new());
                }
            }
        }

        Ok(Self { values })
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(|s| s.as_str())
    }
}

impl std::fmt::Debug for Secrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Secrets")
            .field("count", &self.values.len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        let cfg = Config::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.cycle_interval_secs, 5);
        assert_eq!(cfg.cycle_budget_secs, 30);
        assert_eq!(cfg.batch_size, 50);
        assert_eq!(cfg.flush_interval_secs, 10);
        assert!((cfg.min_confidence - 80.0).abs() < f64::EPSILON);
        assert!((cfg.consensus.threshold_two_mixed - 70.0).abs() < f64::EPSILON);
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.environment, Environment::Development);
        assert!(!cfg.always_on);
        assert_eq!(cfg.per_symbol_budget_secs, 8);
        assert_eq!(cfg.rejected_queue.max_retries, 3);
        assert_eq!(cfg.rejected_queue.max_age_secs, 600);
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "symbols": ["AAPL"], "cycle_interval_secs": 10 }"#;
        let cfg: Config = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.symbols, vec!["AAPL"]);
        assert_eq!(cfg.cycle_interval_secs, 10);
        assert_eq!(cfg.batch_size, 50);
    }

    #[test]
    fn empty_watchlist_rejected() {
        let mut cfg = Config::default();
        cfg.symbols.clear();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn overweight_sources_rejected() {
        let mut cfg = Config::default();
        cfg.sources = vec![
            SourceConfig {
                id: "a".into(),
                weight: 0.7,
                rate_limit_per_sec: 5.0,
                cache_ttl_secs: 10,
                timeout_secs: 3,
                regular_session_only: false,
                enabled: true,
                api_key_name: None,
            },
            SourceConfig {
                id: "b".into(),
                weight: 0.6,
                rate_limit_per_sec: 5.0,
                cache_ttl_secs: 10,
                timeout_secs: 3,
                regular_session_only: false,
                enabled: true,
                api_key_name: None,
            },
        ];
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn slow_source_timeout_capped_at_ten() {
        let mut cfg = Config::default();
        cfg.sources = vec![SourceConfig {
            id: "slow".into(),
            weight: 0.2,
            rate_limit_per_sec: 1.0,
            cache_ttl_secs: 120,
            timeout_secs: 11,
            regular_session_only: false,
            enabled: true,
            api_key_name: None,
        }];
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn per_symbol_budget_cannot_exceed_cycle_budget() {
        let mut cfg = Config::default();
        cfg.per_symbol_budget_secs = 60;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn roundtrip_serialisation() {
        let cfg = Config::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.symbols, cfg2.symbols);
        assert_eq!(cfg.cycle_budget_secs, cfg2.cycle_budget_secs);
        assert_eq!(cfg.executor_service.max_positions, cfg2.executor_service.max_positions);
    }

    #[test]
    fn secrets_weak_default_tolerated_in_dev() {
        let mut cfg = Config::default();
        cfg.executors = vec![ExecutorConfig {
            executor_id: "exec-1".into(),
            endpoint_url: "http://localhost:9000/api/v1/trading/execute".into(),
            min_confidence: 80.0,
            symbol_allowlist: vec![],
            action_allowlist: vec![],
            max_signals_per_window: 30,
            window_secs: 60,
            enabled: true,
            secret_name: "MERIDIAN_TEST_SECRET_UNSET".into(),
        }];
        let secrets = Secrets::resolve(&cfg).unwrap();
        assert_eq!(secrets.get("MERIDIAN_TEST_SECRET_UNSET"), Some(""));
    }

    #[test]
    fn secrets_weak_default_fatal_in_production() {
        let mut cfg = Config::default();
        cfg.environment = Environment::Production;
        cfg.secret_fallbacks
            .insert("MERIDIAN_PROD_WEAK".into(), "changeme".into());
        cfg.executors = vec![ExecutorConfig {
            executor_id: "exec-1".into(),
            endpoint_url: "http://localhost:9000/api/v1/trading/execute".into(),
            min_confidence: 80.0,
            symbol_allowlist: vec![],
            action_allowlist: vec![],
            max_signals_per_window: 30,
            window_secs: 60,
            enabled: true,
            secret_name: "MERIDIAN_PROD_WEAK".into(),
        }];
        assert!(Secrets::resolve(&cfg).is_err());
    }
}

// =============================================================================
// Signal Generator — the periodic multi-symbol cycle loop
// =============================================================================
//
// One `cycle()` iterates the watchlist exactly once under a global time
// budget. Per-symbol work runs in parallel up to `max_parallel_symbols`;
// source fetches within a symbol fan out concurrently, each bounded by its
// own timeout, with an incremental early exit once enough high-confidence
// verdicts are in. A tick that fires while the previous cycle is still in
// flight is dropped, not queued.
//
// Any failure inside the per-symbol pipeline is contained: logged, counted,
// and the cycle moves on. Nothing short of shutdown aborts other symbols.
//
// State machine:
//   INIT -> READY -> RUNNING -> (PAUSED, development only) -> STOPPED
// In 24/7 mode PAUSE transitions are forbidden and the guard clears the flag.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::stream::{FuturesUnordered, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::audit::AuditLog;
use crate::config::Config;
use crate::consensus::{self, ConsensusDecision};
use crate::distributor::Distributor;
use crate::indicators::calculate_atr;
use crate::metrics::Metrics;
use crate::quality::{Calibrator, QualityScorer};
use crate::regime::RegimeDetector;
use crate::signal::{Signal, SourceVerdict};
use crate::sources::market_data::{FallbackFeed, MarketSnapshot};
use crate::sources::SourceRegistry;
use crate::store::SignalStore;
use crate::sync::AlpineSync;
use crate::types::{Action, Regime, Symbol};

/// Generator lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum GeneratorState {
    Init,
    Ready,
    Running,
    Paused,
    Stopped,
}

impl std::fmt::Display for GeneratorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Init => write!(f, "INIT"),
            Self::Ready => write!(f, "READY"),
            Self::Running => write!(f, "RUNNING"),
            Self::Paused => write!(f, "PAUSED"),
            Self::Stopped => write!(f, "STOPPED"),
        }
    }
}

struct RecentSignal {
    emitted_at: Instant,
    price: f64,
}

/// Summary of one completed cycle.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CycleReport {
    pub symbols_processed: usize,
    pub symbols_skipped: usize,
    pub signals_emitted: usize,
    pub errors: usize,
    /// True when the cycle budget expired before every symbol finished.
    pub partial: bool,
}

pub struct SignalGenerator {
    config: Config,
    weights: HashMap<String, f64>,
    registry: Arc<SourceRegistry>,
    market_feed: Arc<FallbackFeed>,
    regime_detector: Arc<RegimeDetector>,
    store: Arc<SignalStore>,
    audit: Arc<AuditLog>,
    distributor: Arc<Distributor>,
    scorer: QualityScorer,
    calibrator: RwLock<Arc<Calibrator>>,
    metrics: Arc<Metrics>,
    sync: Option<Arc<AlpineSync>>,

    state: Mutex<GeneratorState>,
    paused: AtomicBool,
    cycle_in_flight: AtomicBool,
    recent: Mutex<HashMap<Symbol, RecentSignal>>,
}

impl SignalGenerator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Config,
        registry: Arc<SourceRegistry>,
        market_feed: Arc<FallbackFeed>,
        regime_detector: Arc<RegimeDetector>,
        store: Arc<SignalStore>,
        audit: Arc<AuditLog>,
        distributor: Arc<Distributor>,
        calibrator: Calibrator,
        metrics: Arc<Metrics>,
    ) -> Self {
        let weights = config
            .sources
            .iter()
            .map(|s| (s.id.clone(), s.weight))
            .collect();
        let scorer = QualityScorer::new(config.quality.clone());

        Self {
            config,
            weights,
            registry,
            market_feed,
            regime_detector,
            store,
            audit,
            distributor,
            scorer,
            calibrator: RwLock::new(Arc::new(calibrator)),
            metrics,
            sync: None,
            state: Mutex::new(GeneratorState::Init),
            paused: AtomicBool::new(false),
            cycle_in_flight: AtomicBool::new(false),
            recent: Mutex::new(HashMap::new()),
        }
    }

    /// Attach the optional best-effort sync forwarder.
    pub fn with_sync(mut self, sync: Arc<AlpineSync>) -> Self {
        self.sync = Some(sync);
        self
    }

    pub fn state(&self) -> GeneratorState {
        *self.state.lock()
    }

    /// INIT -> READY once dependencies are wired. Config is already validated
    /// at this point (startup fails fast otherwise).
    pub fn mark_ready(&self) {
        let mut state = self.state.lock();
        if *state == GeneratorState::Init {
            *state = GeneratorState::Ready;
        }
    }

    /// Swap in a freshly loaded calibration artifact.
    pub fn reload_calibrator(&self, calibrator: Calibrator) {
        *self.calibrator.write() = Arc::new(calibrator);
        info!("calibrator handle replaced");
    }

    /// Request a pause. Forbidden in 24/7 mode — the guard clears the flag.
    pub fn pause(&self) {
        if self.config.always_on {
            warn!("pause requested in 24/7 mode, ignoring");
            self.paused.store(false, Ordering::SeqCst);
            return;
        }
        self.paused.store(true, Ordering::SeqCst);
        let mut state = self.state.lock();
        if *state == GeneratorState::Running {
            *state = GeneratorState::Paused;
        }
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        let mut state = self.state.lock();
        if *state == GeneratorState::Paused {
            *state = GeneratorState::Running;
        }
    }

    /// Run cycles on the configured interval until shutdown. Ticks that land
    /// while a cycle is in flight are dropped and counted.
    pub async fn start_background_generation(
        self: Arc<Self>,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) {
        {
            let mut state = self.state.lock();
            *state = GeneratorState::Running;
        }
        info!(
            interval_s = self.config.cycle_interval_secs,
            budget_s = self.config.cycle_budget_secs,
            symbols = self.config.symbols.len(),
            "background generation started"
        );

        let mut interval =
            tokio::time::interval(Duration::from_secs(self.config.cycle_interval_secs));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            // 24/7 guard: pause transitions are forbidden.
            if self.config.always_on && self.paused.load(Ordering::SeqCst) {
                warn!("paused flag set in 24/7 mode, resetting");
                self.paused.store(false, Ordering::SeqCst);
            }
            if self.paused.load(Ordering::SeqCst) {
                continue;
            }

            if self
                .cycle_in_flight
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                self.metrics.cycles_dropped.inc();
                warn!("cycle tick dropped, previous cycle still running");
                continue;
            }

            let generator = self.clone();
            tokio::spawn(async move {
                let report = generator.clone().cycle().await;
                debug!(
                    processed = report.symbols_processed,
                    emitted = report.signals_emitted,
                    errors = report.errors,
                    partial = report.partial,
                    "cycle finished"
                );
                generator.cycle_in_flight.store(false, Ordering::SeqCst);
            });
        }

        let mut state = self.state.lock();
        *state = GeneratorState::Stopped;
        info!("background generation stopped");
    }

    // -------------------------------------------------------------------------
    // One cycle
    // -------------------------------------------------------------------------

    /// Iterate the watchlist once under the cycle budget. Symbols that are
    /// still unprocessed when the budget expires are cancelled; signals
    /// already emitted stand.
    pub async fn cycle(self: Arc<Self>) -> CycleReport {
        let started = Instant::now();
        self.registry.begin_cycle();

        let budget = Duration::from_secs(self.config.cycle_budget_secs);
        let semaphore = Arc::new(Semaphore::new(self.config.max_parallel_symbols.max(1)));
        let report = Arc::new(Mutex::new(CycleReport::default()));

        let mut tasks = tokio::task::JoinSet::new();
        for symbol in self.config.symbols.iter().map(|s| Symbol::new(s.clone())) {
            let generator = self.clone();
            let semaphore = semaphore.clone();
            let report = report.clone();
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore open");
                match generator.process_symbol(&symbol).await {
                    Ok(Some(_)) => {
                        let mut r = report.lock();
                        r.symbols_processed += 1;
                        r.signals_emitted += 1;
                    }
                    Ok(None) => {
                        let mut r = report.lock();
                        r.symbols_processed += 1;
                        r.symbols_skipped += 1;
                    }
                    Err(e) => {
                        warn!(symbol = %symbol, error = %e, "symbol pipeline error contained");
                        generator.metrics.cycle_errors.inc();
                        report.lock().errors += 1;
                    }
                }
            });
        }

        let partial = tokio::time::timeout(budget, async {
            while let Some(joined) = tasks.join_next().await {
                if let Err(e) = joined {
                    if !e.is_cancelled() {
                        warn!(error = %e, "symbol task join error");
                        report.lock().errors += 1;
                    }
                }
            }
        })
        .await
        .is_err();
        if partial {
            warn!(
                budget_s = budget.as_secs(),
                "cycle budget expired, cancelling remaining symbols"
            );
            // Aborting the set cancels outstanding source fetches.
            tasks.abort_all();
        }

        self.metrics.cycles_total.inc();
        self.metrics
            .cycle_duration
            .observe(started.elapsed().as_secs_f64());
        self.metrics
            .pending_batch
            .set(self.store.pending_len() as i64);

        let mut report = *report.lock();
        report.partial = partial;
        report
    }

    // -------------------------------------------------------------------------
    // Per-symbol pipeline
    // -------------------------------------------------------------------------

    async fn process_symbol(&self, symbol: &Symbol) -> anyhow::Result<Option<Signal>> {
        let now = chrono::Utc::now();
        let now_ms = now.timestamp_millis();

        // --- 1-2. Recent-signal spacing + market snapshot -------------------
        let spacing = Duration::from_secs(self.config.min_signal_spacing_secs);
        let recently_signalled = {
            let recent = self.recent.lock();
            recent
                .get(symbol)
                .map(|entry| (entry.emitted_at.elapsed() < spacing, entry.price))
        };

        let snapshot = match self
            .market_feed
            .fetch(symbol, self.config.regime.window)
            .await
        {
            Ok(snapshot) => snapshot,
            Err(e) => {
                debug!(symbol = %symbol, error = %e, "market data unavailable, skipping symbol");
                let _ = self.audit.append(
                    "generator",
                    "MARKET_DATA_UNAVAILABLE",
                    symbol.as_str(),
                    serde_json::json!({"error": e.to_string()}),
                );
                return Ok(None);
            }
        };

        if let Some((young, prev_price)) = recently_signalled {
            if young && prev_price > 0.0 {
                let moved_pct = ((snapshot.last_price - prev_price) / prev_price).abs() * 100.0;
                if moved_pct < self.config.price_change_threshold_pct {
                    debug!(symbol = %symbol, moved_pct, "recent signal still fresh, skipping");
                    return Ok(None);
                }
            }
        }

        // --- 3-4. Regime + source fan-out with early exit -------------------
        let regime = self.regime_detector.detect(&snapshot).regime;
        let verdicts = self.collect_verdicts(symbol, &snapshot, regime, now_ms).await;
        if verdicts.is_empty() {
            return Ok(None);
        }

        // --- 5. Consensus ---------------------------------------------------
        let decision = consensus::evaluate(&verdicts, &self.weights, regime, &self.config.consensus);
        let (action, raw_confidence, contributions) = match decision {
            ConsensusDecision::Emit {
                action,
                confidence,
                contributions,
            } => (action, confidence, contributions),
            ConsensusDecision::NoSignal { reason } => {
                debug!(symbol = %symbol, reason = ?reason, "consensus declined");
                return Ok(None);
            }
        };

        // --- 6. Stop/target levels ------------------------------------------
        let Some((entry, stop, target)) = self.build_levels(&snapshot, action) else {
            debug!(symbol = %symbol, "level construction failed, skipping");
            let _ = self.audit.append(
                "generator",
                "MALFORMED_LEVELS",
                symbol.as_str(),
                serde_json::json!({"action": action.to_string()}),
            );
            return Ok(None);
        };

        // --- 7. Quality scorer + calibration (best-effort) ------------------
        let confidence = self.scored_confidence(symbol, raw_confidence);

        // --- 8. Build, persist, distribute, audit ---------------------------
        let signal = Signal {
            signal_id: uuid::Uuid::new_v4().to_string(),
            created_at: now_ms,
            symbol: symbol.clone(),
            action,
            entry_price: entry,
            stop_price: stop,
            target_price: target,
            confidence,
            regime,
            // The sources behind the decision; the verbatim snapshot below
            // also retains verdicts the consensus floors discarded.
            sources_used: contributions.iter().map(|c| c.source_id.clone()).collect(),
            per_source_verdicts: verdicts,
            rationale: format!(
                "{action} consensus at {confidence:.1} from {regime} regime",
            ),
            service_type: self.config.service_type.clone(),
            sha256: String::new(),
            prev_sha256: String::new(),
        }
        .seal();

        if let Err(e) = signal.validate_levels() {
            debug!(symbol = %symbol, error = %e, "signal failed side invariants");
            let _ = self.audit.append(
                "generator",
                "MALFORMED_LEVELS",
                symbol.as_str(),
                serde_json::json!({"error": e.to_string()}),
            );
            return Ok(None);
        }

        self.store.append(signal.clone());
        self.metrics
            .pending_batch
            .set(self.store.pending_len() as i64);
        self.metrics
            .signals_emitted
            .with_label_values(&[action.to_string().as_str()])
            .inc();

        let _ = self.audit.append(
            "generator",
            "SIGNAL_EMITTED",
            symbol.as_str(),
            serde_json::json!({
                "signal_id": signal.signal_id,
                "action": action.to_string(),
                "confidence": confidence,
                "regime": regime.to_string(),
            }),
        );

        self.distributor.dispatch(&signal);
        if let Some(sync) = &self.sync {
            sync.submit(&signal);
        }

        self.recent.lock().insert(
            symbol.clone(),
            RecentSignal {
                emitted_at: Instant::now(),
                price: entry,
            },
        );

        info!(
            symbol = %symbol,
            action = %action,
            confidence = format!("{confidence:.1}"),
            regime = %regime,
            "signal emitted"
        );
        Ok(Some(signal))
    }

    /// Fan out to every applicable source; collect until all return, the
    /// per-symbol budget expires, or the early-exit rule fires.
    async fn collect_verdicts(
        &self,
        symbol: &Symbol,
        snapshot: &MarketSnapshot,
        regime: Regime,
        now_ms: i64,
    ) -> Vec<SourceVerdict> {
        let applicable = self.registry.applicable(symbol, chrono::Utc::now());
        if applicable.is_empty() {
            return Vec::new();
        }

        let mut fetches = FuturesUnordered::new();
        for source in applicable {
            fetches.push(async move {
                let source_id = source.id().to_string();
                let result = self.registry.fetch(&source, symbol, snapshot, now_ms).await;
                (source_id, result)
            });
        }

        let budget = Duration::from_secs(self.config.per_symbol_budget_secs);
        let deadline = Instant::now() + budget;
        let mut verdicts: Vec<SourceVerdict> = Vec::new();

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let next = tokio::time::timeout(remaining, fetches.next()).await;
            match next {
                Err(_) => {
                    debug!(symbol = %symbol, collected = verdicts.len(), "per-symbol budget expired, late sources dropped");
                    break;
                }
                Ok(None) => break,
                Ok(Some((source_id, result))) => {
                    match result {
                        Ok(verdict) => {
                            self.metrics
                                .source_calls
                                .with_label_values(&[source_id.as_str(), "ok"])
                                .inc();
                            verdicts.push(verdict);
                        }
                        Err(e) => {
                            self.metrics
                                .source_calls
                                .with_label_values(&[source_id.as_str(), e.label()])
                                .inc();
                            debug!(symbol = %symbol, source = %source_id, error = %e, "source absent this round");
                        }
                    }

                    // Incremental early exit: enough sources agree loudly.
                    if verdicts.len() >= self.config.consensus.early_exit_min_sources {
                        let provisional = consensus::evaluate(
                            &verdicts,
                            &self.weights,
                            regime,
                            &self.config.consensus,
                        );
                        if let Some((_, confidence)) = provisional.emitted() {
                            if confidence >= self.config.consensus.early_exit_confidence {
                                debug!(
                                    symbol = %symbol,
                                    confidence = format!("{confidence:.1}"),
                                    "early exit, cancelling remaining sources"
                                );
                                break;
                            }
                        }
                    }
                }
            }
        }

        // Dropping the stream cancels any in-flight fetches.
        drop(fetches);
        verdicts
    }

    /// ATR-derived stop and target around the last price, with the stop
    /// distance clamped to the configured percentage band.
    fn build_levels(&self, snapshot: &MarketSnapshot, action: Action) -> Option<(f64, f64, f64)> {
        let entry = snapshot.last_price;
        if entry <= 0.0 {
            return None;
        }
        let atr = calculate_atr(&snapshot.candles, 14)?;

        let risk = &self.config.risk;
        let min_stop = entry * risk.min_stop_pct / 100.0;
        let max_stop = entry * risk.max_stop_pct / 100.0;
        let stop_distance = (atr * risk.stop_atr_multiplier).clamp(min_stop, max_stop);
        let target_distance = (atr * risk.target_atr_multiplier).max(stop_distance * 1.1);

        let (stop, target) = match action {
            Action::Long => (entry - stop_distance, entry + target_distance),
            Action::Short => (entry + stop_distance, entry - target_distance),
        };
        if stop <= 0.0 || target <= 0.0 {
            return None;
        }
        Some((entry, stop, target))
    }

    /// Apply the historical-outcome adjustment and the calibration curve.
    /// Both are best-effort: a store error leaves confidence untouched.
    fn scored_confidence(&self, symbol: &Symbol, raw: f64) -> f64 {
        let adjusted = match self.store.query_outcomes(symbol, self.scorer.window_days()) {
            Ok(outcomes) => raw + self.scorer.adjustment(&outcomes, raw),
            Err(e) => {
                debug!(symbol = %symbol, error = %e, "outcome lookup failed, skipping adjustment");
                raw
            }
        };
        let calibrator = self.calibrator.read().clone();
        calibrator.apply(adjusted)
    }
}

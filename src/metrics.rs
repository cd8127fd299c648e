// =============================================================================
// Metrics — Prometheus registry for the scrape endpoint
// =============================================================================

use prometheus::{
    Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

pub struct Metrics {
    pub registry: Registry,

    // ── Cycle ───────────────────────────────────────────────────────────
    pub cycles_total: IntCounter,
    /// Ticks dropped because the previous cycle was still running.
    pub cycles_dropped: IntCounter,
    pub cycle_errors: IntCounter,
    pub cycle_duration: Histogram,

    // ── Sources ─────────────────────────────────────────────────────────
    /// Labels: source, outcome (ok / timeout / rate_limited / ...).
    pub source_calls: IntCounterVec,

    // ── Store ───────────────────────────────────────────────────────────
    pub pending_batch: IntGauge,
    pub flush_duration: Histogram,
    pub flush_failures: IntCounter,

    // ── Signals ─────────────────────────────────────────────────────────
    /// Label: action (LONG / SHORT).
    pub signals_emitted: IntCounterVec,

    // ── Distribution / executors ────────────────────────────────────────
    /// Labels: executor, status (http status class or "timeout").
    pub executor_responses: IntCounterVec,
    pub undelivered_signals: IntCounter,
    pub rejected_queue_depth: IntGauge,

    // ── Compliance ──────────────────────────────────────────────────────
    pub integrity_duration: Histogram,
    /// Labels: stage (audit_append / distribute / execute).
    pub stage_latency: HistogramVec,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let cycles_total =
            IntCounter::with_opts(Opts::new("meridian_cycles_total", "Completed cycles")).unwrap();
        let cycles_dropped = IntCounter::with_opts(Opts::new(
            "meridian_cycles_dropped_total",
            "Ticks dropped while a cycle was in flight",
        ))
        .unwrap();
        let cycle_errors = IntCounter::with_opts(Opts::new(
            "meridian_cycle_errors_total",
            "Contained per-symbol pipeline errors",
        ))
        .unwrap();
        let cycle_duration = Histogram::with_opts(
            HistogramOpts::new("meridian_cycle_duration_seconds", "Cycle wall time")
                .buckets(vec![0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 20.0, 30.0]),
        )
        .unwrap();

        let source_calls = IntCounterVec::new(
            Opts::new("meridian_source_calls_total", "Source call outcomes"),
            &["source", "outcome"],
        )
        .unwrap();

        let pending_batch = IntGauge::with_opts(Opts::new(
            "meridian_pending_batch_size",
            "Signals awaiting flush",
        ))
        .unwrap();
        let flush_duration = Histogram::with_opts(
            HistogramOpts::new("meridian_flush_duration_seconds", "Batch flush wall time")
                .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0]),
        )
        .unwrap();
        let flush_failures = IntCounter::with_opts(Opts::new(
            "meridian_flush_failures_total",
            "Batches diverted to the sidecar file",
        ))
        .unwrap();

        let signals_emitted = IntCounterVec::new(
            Opts::new("meridian_signals_emitted_total", "Signals emitted"),
            &["action"],
        )
        .unwrap();

        let executor_responses = IntCounterVec::new(
            Opts::new(
                "meridian_executor_responses_total",
                "Distributor delivery outcomes",
            ),
            &["executor", "status"],
        )
        .unwrap();
        let undelivered_signals = IntCounter::with_opts(Opts::new(
            "meridian_undelivered_signals_total",
            "Deliveries abandoned after max retries",
        ))
        .unwrap();
        let rejected_queue_depth = IntGauge::with_opts(Opts::new(
            "meridian_rejected_queue_depth",
            "Signals waiting on a wake condition",
        ))
        .unwrap();

        let integrity_duration = Histogram::with_opts(
            HistogramOpts::new(
                "meridian_integrity_check_duration_seconds",
                "verify_integrity wall time",
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        )
        .unwrap();
        let stage_latency = HistogramVec::new(
            HistogramOpts::new("meridian_stage_latency_seconds", "Per-stage latency")
                .buckets(vec![0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0]),
            &["stage"],
        )
        .unwrap();

        for collector in [
            Box::new(cycles_total.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(cycles_dropped.clone()),
            Box::new(cycle_errors.clone()),
            Box::new(cycle_duration.clone()),
            Box::new(source_calls.clone()),
            Box::new(pending_batch.clone()),
            Box::new(flush_duration.clone()),
            Box::new(flush_failures.clone()),
            Box::new(signals_emitted.clone()),
            Box::new(executor_responses.clone()),
            Box::new(undelivered_signals.clone()),
            Box::new(rejected_queue_depth.clone()),
            Box::new(integrity_duration.clone()),
            Box::new(stage_latency.clone()),
        ] {
            registry.register(collector).unwrap();
        }

        Self {
            registry,
            cycles_total,
            cycles_dropped,
            cycle_errors,
            cycle_duration,
            source_calls,
            pending_batch,
            flush_duration,
            flush_failures,
            signals_emitted,
            executor_responses,
            undelivered_signals,
            rejected_queue_depth,
            integrity_duration,
            stage_latency,
        }
    }

    /// Render the registry in the Prometheus text exposition format.
    pub fn encode(&self) -> String {
        let encoder = TextEncoder::new();
        encoder
            .encode_to_string(&self.registry.gather())
            .unwrap_or_default()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

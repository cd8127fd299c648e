// =============================================================================
// Signal Distributor — filtered HTTP fan-out to executor endpoints
// =============================================================================
//
// Each executor gets its own worker fed by a bounded channel, so deliveries
// to one executor happen strictly in the order signals were dispatched
// (cross-executor order is not guaranteed). Requests carry an HMAC-SHA256
// `X-Signature` over the body and an `Idempotency-Key` of
// `<signal_id>:<executor_id>`.
//
// Response taxonomy:
//   200 {"success": true}            -> EXECUTED, order id recorded
//   200 {"success": false, reason}   -> expected business decline; recoverable
//                                       reasons go to the rejected queue
//   4xx                              -> bad request, never retried
//   5xx / timeout                    -> retried with backoff, then UNDELIVERED
//
// The distributor never mutates signals; it holds only the envelope copy.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use serde::Deserialize;
use sha2::Sha256;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::audit::AuditLog;
use crate::config::ExecutorConfig;
use crate::metrics::Metrics;
use crate::signal::{ExecutionEnvelope, Signal};
use crate::store::SignalStore;

type HmacSha256 = Hmac<Sha256>;

/// Backoff schedule between delivery attempts.
const BACKOFF: [Duration; 5] = [
    Duration::from_secs(1),
    Duration::from_secs(5),
    Duration::from_secs(15),
    Duration::from_secs(60),
    Duration::from_secs(6 * 60 * 60),
];
/// Attempts before a delivery is recorded UNDELIVERED.
const MAX_ATTEMPTS: usize = 5;
/// Per-executor delivery queue depth.
const QUEUE_DEPTH: usize = 256;

/// Reason codes the rejected-signal queue can act on.
pub const RECOVERABLE_REASONS: &[&str] =
    &["POSITION_CAP", "INSUFFICIENT_BALANCE", "BROKER_TRANSIENT"];

/// Executor reply body.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutorReply {
    pub success: bool,
    #[serde(default)]
    pub order_id: Option<String>,
    #[serde(default)]
    pub reason_code: Option<String>,
    #[serde(default)]
    pub executor_id: Option<String>,
}

/// Terminal outcome of one delivery.
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryOutcome {
    Executed { order_id: String },
    Declined { reason_code: String },
    BadRequest,
    Undelivered,
}

/// A business decline the rejected queue may replay later.
#[derive(Debug, Clone)]
pub struct RecoverableRejection {
    pub envelope: ExecutionEnvelope,
    pub executor_id: String,
    pub reason_code: String,
}

struct ExecutorTarget {
    config: ExecutorConfig,
    secret: String,
    /// Sliding delivery window timestamps.
    window: Mutex<VecDeque<Instant>>,
    tx: mpsc::Sender<ExecutionEnvelope>,
}

impl ExecutorTarget {
    /// Sliding-window rate limit: true when another delivery fits.
    fn under_rate_limit(&self) -> bool {
        let mut window = self.window.lock();
        let horizon = Instant::now().checked_sub(Duration::from_secs(self.config.window_secs));
        while window
            .front()
            .is_some_and(|t| horizon.is_some_and(|h| *t < h))
        {
            window.pop_front();
        }
        if window.len() >= self.config.max_signals_per_window as usize {
            return false;
        }
        window.push_back(Instant::now());
        true
    }

    fn accepts(&self, signal: &Signal) -> bool {
        if !self.config.enabled {
            return false;
        }
        if signal.confidence < self.config.min_confidence {
            return false;
        }
        if !self.config.symbol_allowlist.is_empty()
            && !self
                .config
                .symbol_allowlist
                .iter()
                .any(|s| s == signal.symbol.as_str())
        {
            return false;
        }
        if !self.config.action_allowlist.is_empty()
            && !self
                .config
                .action_allowlist
                .iter()
                .any(|a| a == &signal.action.to_string())
        {
            return false;
        }
        true
    }
}

pub struct Distributor {
    targets: Vec<Arc<ExecutorTarget>>,
    http: reqwest::Client,
    store: Arc<SignalStore>,
    audit: Arc<AuditLog>,
    metrics: Arc<Metrics>,
    rejection_tx: mpsc::UnboundedSender<RecoverableRejection>,
    backoff: Vec<Duration>,
}

impl Distributor {
    /// Build the distributor and spawn one delivery worker per executor.
    /// Returns the receiver carrying recoverable rejections for the
    /// rejected-signal queue.
    pub fn new(
        configs: &[ExecutorConfig],
        secret_for: impl Fn(&str) -> String,
        request_timeout: Duration,
        store: Arc<SignalStore>,
        audit: Arc<AuditLog>,
        metrics: Arc<Metrics>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<RecoverableRejection>) {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .expect("failed to build distributor http client");

        let (rejection_tx, rejection_rx) = mpsc::unbounded_channel();

        let mut targets = Vec::new();
        let mut receivers = Vec::new();
        for config in configs {
            let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
            targets.push(Arc::new(ExecutorTarget {
                secret: secret_for(&config.secret_name),
                config: config.clone(),
                window: Mutex::new(VecDeque::new()),
                tx,
            }));
            receivers.push(rx);
        }

        let distributor = Arc::new(Self {
            targets,
            http,
            store,
            audit,
            metrics,
            rejection_tx,
            backoff: BACKOFF.to_vec(),
        });

        for (target, mut rx) in distributor.targets.iter().cloned().zip(receivers) {
            let distributor = distributor.clone();
            tokio::spawn(async move {
                while let Some(envelope) = rx.recv().await {
                    distributor.deliver_with_retries(&target, &envelope).await;
                }
            });
        }

        (distributor, rejection_rx)
    }

    /// Route one signal: apply per-executor filters and enqueue the envelope
    /// to every qualifying executor's worker.
    pub fn dispatch(&self, signal: &Signal) {
        let envelope = signal.envelope();
        for target in &self.targets {
            if !target.accepts(signal) {
                continue;
            }
            if !target.under_rate_limit() {
                warn!(
                    executor = %target.config.executor_id,
                    symbol = %signal.symbol,
                    "delivery dropped by distributor rate limit"
                );
                let _ = self.audit.append(
                    "distributor",
                    "RATE_LIMITED_BY_DISTRIBUTOR",
                    signal.symbol.as_str(),
                    serde_json::json!({
                        "signal_id": signal.signal_id,
                        "executor_id": target.config.executor_id,
                    }),
                );
                continue;
            }
            if target.tx.try_send(envelope.clone()).is_err() {
                warn!(
                    executor = %target.config.executor_id,
                    "delivery queue full, signal undelivered"
                );
                self.metrics.undelivered_signals.inc();
            }
        }
    }

    /// Executor ids currently registered (used by the rejected queue).
    pub fn executor_ids(&self) -> Vec<String> {
        self.targets
            .iter()
            .map(|t| t.config.executor_id.clone())
            .collect()
    }

    /// One delivery attempt to a specific executor, without retries. The
    /// rejected queue owns its own attempt budget.
    pub async fn deliver_once(
        &self,
        executor_id: &str,
        envelope: &ExecutionEnvelope,
    ) -> DeliveryOutcome {
        let Some(target) = self
            .targets
            .iter()
            .find(|t| t.config.executor_id == executor_id)
        else {
            warn!(executor = executor_id, "unknown executor for redelivery");
            return DeliveryOutcome::Undelivered;
        };
        match self.post_envelope(target, envelope).await {
            Some(outcome) => {
                self.settle(target, envelope, &outcome, false);
                outcome
            }
            None => DeliveryOutcome::Undelivered,
        }
    }

    // -------------------------------------------------------------------------
    // Delivery internals
    // -------------------------------------------------------------------------

    async fn deliver_with_retries(&self, target: &ExecutorTarget, envelope: &ExecutionEnvelope) {
        for attempt in 1..=MAX_ATTEMPTS {
            match self.post_envelope(target, envelope).await {
                Some(outcome) => {
                    self.settle(target, envelope, &outcome, true);
                    return;
                }
                None if attempt < MAX_ATTEMPTS => {
                    let delay = self.backoff[attempt - 1];
                    debug!(
                        executor = %target.config.executor_id,
                        attempt,
                        delay_s = delay.as_secs(),
                        "transient delivery failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                None => {}
            }
        }

        warn!(
            executor = %target.config.executor_id,
            signal_id = %envelope.signal_id,
            "delivery abandoned after max attempts"
        );
        self.metrics.undelivered_signals.inc();
        let _ = self.audit.append(
            "distributor",
            "SIGNAL_UNDELIVERED",
            envelope.symbol.as_str(),
            serde_json::json!({
                "signal_id": envelope.signal_id,
                "executor_id": target.config.executor_id,
            }),
        );
    }

    /// POST the envelope once. `Some(outcome)` is terminal for this attempt
    /// chain; `None` means transient (5xx / timeout) and retryable.
    async fn post_envelope(
        &self,
        target: &ExecutorTarget,
        envelope: &ExecutionEnvelope,
    ) -> Option<DeliveryOutcome> {
        let body = serde_json::to_string(envelope).expect("envelope serialises");
        let signature = sign_body(&target.secret, &body);
        let idempotency_key = format!("{}:{}", envelope.signal_id, target.config.executor_id);

        let started = Instant::now();
        let response = self
            .http
            .post(&target.config.endpoint_url)
            .header("Content-Type", "application/json")
            .header("X-Signature", signature)
            .header("Idempotency-Key", idempotency_key)
            .body(body)
            .send()
            .await;
        self.metrics
            .stage_latency
            .with_label_values(&["distribute"])
            .observe(started.elapsed().as_secs_f64());

        let response = match response {
            Ok(r) => r,
            Err(e) => {
                debug!(executor = %target.config.executor_id, error = %e, "delivery transport error");
                self.metrics
                    .executor_responses
                    .with_label_values(&[target.config.executor_id.as_str(), "timeout"])
                    .inc();
                return None;
            }
        };

        let status = response.status();
        self.metrics
            .executor_responses
            .with_label_values(&[target.config.executor_id.as_str(), status.as_str()])
            .inc();

        if status.is_server_error() {
            return None;
        }
        if status.is_client_error() {
            warn!(
                executor = %target.config.executor_id,
                status = %status,
                signal_id = %envelope.signal_id,
                "executor rejected request as malformed"
            );
            return Some(DeliveryOutcome::BadRequest);
        }

        match response.json::<ExecutorReply>().await {
            Ok(reply) if reply.success => Some(DeliveryOutcome::Executed {
                order_id: reply.order_id.unwrap_or_default(),
            }),
            Ok(reply) => Some(DeliveryOutcome::Declined {
                reason_code: reply.reason_code.unwrap_or_else(|| "UNSPECIFIED".into()),
            }),
            Err(e) => {
                warn!(executor = %target.config.executor_id, error = %e, "unparseable executor reply");
                Some(DeliveryOutcome::BadRequest)
            }
        }
    }

    /// Record the terminal outcome of a delivery: order id, audit trail, and
    /// recoverable rejections toward the queue.
    fn settle(
        &self,
        target: &ExecutorTarget,
        envelope: &ExecutionEnvelope,
        outcome: &DeliveryOutcome,
        enqueue_recoverable: bool,
    ) {
        let executor_id = &target.config.executor_id;
        match outcome {
            DeliveryOutcome::Executed { order_id } => {
                info!(
                    executor = %executor_id,
                    signal_id = %envelope.signal_id,
                    order_id = %order_id,
                    "signal executed"
                );
                if let Err(e) = self.store.record_order(&envelope.signal_id, order_id) {
                    warn!(error = %e, "failed to record order id");
                }
                let _ = self.audit.append(
                    "distributor",
                    "SIGNAL_EXECUTED",
                    envelope.symbol.as_str(),
                    serde_json::json!({
                        "signal_id": envelope.signal_id,
                        "executor_id": executor_id,
                        "order_id": order_id,
                    }),
                );
            }
            DeliveryOutcome::Declined { reason_code } => {
                // Expected for risk-rejected signals; not an HTTP error.
                debug!(
                    executor = %executor_id,
                    signal_id = %envelope.signal_id,
                    reason = %reason_code,
                    "executor declined signal"
                );
                let _ = self.audit.append(
                    "distributor",
                    "EXECUTOR_DECLINED",
                    envelope.symbol.as_str(),
                    serde_json::json!({
                        "signal_id": envelope.signal_id,
                        "executor_id": executor_id,
                        "reason_code": reason_code,
                    }),
                );
                if enqueue_recoverable && RECOVERABLE_REASONS.contains(&reason_code.as_str()) {
                    let _ = self.rejection_tx.send(RecoverableRejection {
                        envelope: envelope.clone(),
                        executor_id: executor_id.clone(),
                        reason_code: reason_code.clone(),
                    });
                }
            }
            DeliveryOutcome::BadRequest => {
                let _ = self.audit.append(
                    "distributor",
                    "DELIVERY_BAD_REQUEST",
                    envelope.symbol.as_str(),
                    serde_json::json!({
                        "signal_id": envelope.signal_id,
                        "executor_id": executor_id,
                    }),
                );
            }
            DeliveryOutcome::Undelivered => {}
        }
    }
}

/// Hex HMAC-SHA256 of `body` under the executor's shared secret.
pub fn sign_body(secret: &str, body: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key size");
    mac.update(body.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Action, Regime, Symbol};
    use axum::routing::post;
    use axum::Router;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn make_signal(symbol: &str, confidence: f64) -> Signal {
        Signal {
            signal_id: uuid::Uuid::new_v4().to_string(),
            created_at: chrono::Utc::now().timestamp_millis(),
            symbol: Symbol::from(symbol),
            action: Action::Long,
            entry_price: 100.0,
            stop_price: 98.0,
            target_price: 105.0,
            confidence,
            regime: Regime::Trending,
            sources_used: vec!["alpha".into()],
            per_source_verdicts: vec![],
            rationale: "test".into(),
            service_type: "premium".into(),
            sha256: String::new(),
            prev_sha256: String::new(),
        }
        .seal()
    }

    fn executor_config(id: &str, url: &str, min_confidence: f64) -> ExecutorConfig {
        ExecutorConfig {
            executor_id: id.into(),
            endpoint_url: url.into(),
            min_confidence,
            symbol_allowlist: vec![],
            action_allowlist: vec![],
            max_signals_per_window: 10,
            window_secs: 60,
            enabled: true,
            secret_name: "TEST_SECRET".into(),
        }
    }

    async fn spawn_executor_stub(
        reply: serde_json::Value,
        hits: Arc<AtomicUsize>,
    ) -> String {
        let app = Router::new().route(
            "/api/v1/trading/execute",
            post(move || {
                let reply = reply.clone();
                let hits = hits.clone();
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    axum::Json(reply)
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/api/v1/trading/execute")
    }

    fn deps() -> (Arc<SignalStore>, Arc<AuditLog>, Arc<Metrics>) {
        (
            Arc::new(SignalStore::open_in_memory(50).unwrap()),
            Arc::new(AuditLog::open_in_memory().unwrap()),
            Arc::new(Metrics::new()),
        )
    }

    #[tokio::test]
    async fn successful_delivery_records_order_id() {
        let hits = Arc::new(AtomicUsize::new(0));
        let url = spawn_executor_stub(
            serde_json::json!({"success": true, "order_id": "ord-7", "executor_id": "e1"}),
            hits.clone(),
        )
        .await;

        let (store, audit, metrics) = deps();
        let signal = make_signal("AAPL", 90.0);
        store.append(signal.clone());
        store.flush().unwrap();

        let (distributor, _rx) = Distributor::new(
            &[executor_config("e1", &url, 80.0)],
            |_| "secret".into(),
            Duration::from_secs(5),
            store.clone(),
            audit,
            metrics,
        );

        distributor.dispatch(&signal);
        tokio::time::timeout(Duration::from_secs(2), async {
            while hits.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        // Let the worker settle the outcome.
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if store.order_id_of(&signal.signal_id).unwrap().is_some() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(
            store.order_id_of(&signal.signal_id).unwrap().as_deref(),
            Some("ord-7")
        );
    }

    #[tokio::test]
    async fn below_min_confidence_is_filtered() {
        let hits = Arc::new(AtomicUsize::new(0));
        let url =
            spawn_executor_stub(serde_json::json!({"success": true}), hits.clone()).await;

        let (store, audit, metrics) = deps();
        let (distributor, _rx) = Distributor::new(
            &[executor_config("e1", &url, 95.0)],
            |_| "secret".into(),
            Duration::from_secs(5),
            store,
            audit,
            metrics,
        );

        distributor.dispatch(&make_signal("AAPL", 90.0));
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn recoverable_decline_reaches_rejected_channel() {
        let hits = Arc::new(AtomicUsize::new(0));
        let url = spawn_executor_stub(
            serde_json::json!({"success": false, "reason_code": "POSITION_CAP", "executor_id": "e1"}),
            hits,
        )
        .await;

        let (store, audit, metrics) = deps();
        let (distributor, mut rejection_rx) = Distributor::new(
            &[executor_config("e1", &url, 80.0)],
            |_| "secret".into(),
            Duration::from_secs(5),
            store,
            audit,
            metrics,
        );

        distributor.dispatch(&make_signal("AAPL", 90.0));

        let rejection = tokio::time::timeout(Duration::from_secs(2), rejection_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(rejection.reason_code, "POSITION_CAP");
        assert_eq!(rejection.executor_id, "e1");
    }

    #[tokio::test]
    async fn terminal_decline_is_not_queued() {
        let hits = Arc::new(AtomicUsize::new(0));
        let url = spawn_executor_stub(
            serde_json::json!({"success": false, "reason_code": "SHORT_CRYPTO_UNSUPPORTED"}),
            hits.clone(),
        )
        .await;

        let (store, audit, metrics) = deps();
        let (distributor, mut rejection_rx) = Distributor::new(
            &[executor_config("e1", &url, 80.0)],
            |_| "secret".into(),
            Duration::from_secs(5),
            store,
            audit,
            metrics,
        );

        distributor.dispatch(&make_signal("BTC-USD", 90.0));
        tokio::time::timeout(Duration::from_secs(2), async {
            while hits.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rejection_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn sliding_window_drops_over_limit() {
        let hits = Arc::new(AtomicUsize::new(0));
        let url =
            spawn_executor_stub(serde_json::json!({"success": true}), hits.clone()).await;

        let (store, audit, metrics) = deps();
        let mut config = executor_config("e1", &url, 0.0);
        config.max_signals_per_window = 2;
        let (distributor, _rx) = Distributor::new(
            &[config],
            |_| "secret".into(),
            Duration::from_secs(5),
            store,
            audit.clone(),
            metrics,
        );

        for _ in 0..5 {
            distributor.dispatch(&make_signal("AAPL", 90.0));
        }
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn signature_is_stable_hmac() {
        let body = r#"{"signal_id":"abc"}"#;
        let a = sign_body("secret", body);
        let b = sign_body("secret", body);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert_ne!(a, sign_body("other", body));
    }
}

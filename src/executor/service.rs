// =============================================================================
// Trading Executor Service — signature check, risk gates, broker submission
// =============================================================================
//
// POST /api/v1/trading/execute pipeline:
//
//   signature (401) -> schema (400) -> idempotency replay -> risk gates ->
//   symbol conversion -> time-in-force -> bracket order -> journal row
//
// All business outcomes ride on `200 {success:false, reason_code}`; HTTP
// errors are reserved for malformed requests (400) and bad signatures (401).
// Once the daily-loss gate trips, every request for the rest of the UTC day
// is refused; the max-drawdown trip is terminal for the session.
//
// GET /api/v1/trading/state exposes the executor's occupancy so the
// rejected-signal queue can evaluate wake conditions.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use serde::Serialize;
use sha2::Sha256;
use tracing::{debug, info, warn};

use crate::audit::AuditLog;
use crate::config::ExecutorServiceParams;
use crate::executor::broker::{Broker, BrokerError, BracketOrder, TimeInForce};
use crate::executor::positions::{Position, PositionBook};
use crate::metrics::Metrics;
use crate::signal::ExecutionEnvelope;
use crate::sources::registry::regular_session;
use crate::types::Action;

type HmacSha256 = Hmac<Sha256>;

/// Global ceiling on one broker call.
const BROKER_CALL_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);
/// Concurrent in-flight broker submissions.
const BROKER_CONCURRENCY: usize = 4;

/// Occupancy snapshot served to the rejected-signal queue.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutorStateView {
    pub executor_id: String,
    pub open_positions: usize,
    pub max_positions: u32,
    pub buying_power: f64,
    pub market_open: bool,
}

struct GateTrips {
    /// UTC date (`YYYY-MM-DD`) on which the daily-loss gate tripped.
    daily_tripped_date: Option<String>,
    /// Terminal for the session; no auto-reset.
    drawdown_tripped: bool,
}

pub struct ExecutorService {
    executor_id: String,
    params: ExecutorServiceParams,
    secret: String,
    broker: Arc<dyn Broker>,
    book: PositionBook,
    trips: Mutex<GateTrips>,
    /// Idempotency-Key -> previously returned body.
    replays: Mutex<HashMap<String, serde_json::Value>>,
    journal: Mutex<Connection>,
    audit: Arc<AuditLog>,
    metrics: Arc<Metrics>,
    broker_gate: tokio::sync::Semaphore,
}

impl ExecutorService {
    pub fn new(
        executor_id: impl Into<String>,
        params: ExecutorServiceParams,
        secret: impl Into<String>,
        broker: Arc<dyn Broker>,
        journal_path: impl AsRef<Path>,
        audit: Arc<AuditLog>,
        metrics: Arc<Metrics>,
        starting_equity: f64,
    ) -> Result<Arc<Self>> {
        let journal = Connection::open(journal_path.as_ref()).with_context(|| {
            format!(
                "failed to open execution journal at {}",
                journal_path.as_ref().display()
            )
        })?;
        journal
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS executions (
                     signal_id    TEXT NOT NULL,
                     executor_id  TEXT NOT NULL,
                     order_id     TEXT NOT NULL,
                     submitted_at INTEGER NOT NULL,
                     PRIMARY KEY (signal_id, executor_id)
                 );",
            )
            .context("failed to initialise execution journal schema")?;

        Ok(Arc::new(Self {
            executor_id: executor_id.into(),
            params,
            secret: secret.into(),
            broker,
            book: PositionBook::new(starting_equity),
            trips: Mutex::new(GateTrips {
                daily_tripped_date: None,
                drawdown_tripped: false,
            }),
            replays: Mutex::new(HashMap::new()),
            journal: Mutex::new(journal),
            audit,
            metrics,
            broker_gate: tokio::sync::Semaphore::new(BROKER_CONCURRENCY),
        }))
    }

    pub fn router(self: Arc<Self>) -> Router {
        Router::new()
            .route("/api/v1/trading/execute", post(execute))
            .route("/api/v1/trading/state", get(state_view))
            .with_state(self)
    }

    // -------------------------------------------------------------------------
    // Responses
    // -------------------------------------------------------------------------

    fn accepted(&self, order_id: &str) -> serde_json::Value {
        serde_json::json!({
            "success": true,
            "order_id": order_id,
            "executor_id": self.executor_id,
        })
    }

    fn declined(&self, reason_code: &str) -> serde_json::Value {
        serde_json::json!({
            "success": false,
            "reason_code": reason_code,
            "executor_id": self.executor_id,
        })
    }

    fn audit_decision(&self, envelope: &ExecutionEnvelope, decision: &str) {
        let _ = self.audit.append(
            &self.executor_id,
            "EXECUTOR_DECISION",
            envelope.symbol.as_str(),
            serde_json::json!({
                "signal_id": envelope.signal_id,
                "decision": decision,
            }),
        );
    }

    // -------------------------------------------------------------------------
    // Gate pipeline
    // -------------------------------------------------------------------------

    async fn run_pipeline(&self, envelope: &ExecutionEnvelope) -> serde_json::Value {
        // A tripped risk gate refuses everything, regardless of content.
        {
            let trips = self.trips.lock();
            if trips.daily_tripped_date.as_deref() == Some(self.book.current_date().as_str()) {
                self.audit_decision(envelope, "DAILY_LOSS_TRIPPED");
                return self.declined("DAILY_LOSS_TRIPPED");
            }
            if trips.drawdown_tripped {
                self.audit_decision(envelope, "MAX_DRAWDOWN_TRIPPED");
                return self.declined("MAX_DRAWDOWN_TRIPPED");
            }
        }

        // Serialise handling per symbol; unrelated symbols run in parallel.
        let _symbol_guard = self.book.lock_symbol(&envelope.symbol).await;

        // --- Crypto SHORT gate: reject before any broker call ---------------
        if envelope.symbol.is_crypto()
            && envelope.action == Action::Short
            && !self.broker.shorts_crypto()
        {
            self.audit_decision(envelope, "SHORT_CRYPTO_UNSUPPORTED");
            return self.declined("SHORT_CRYPTO_UNSUPPORTED");
        }

        // --- Confidence gate -------------------------------------------------
        if envelope.confidence < self.params.min_confidence {
            self.audit_decision(envelope, "MIN_CONFIDENCE_NOT_MET");
            return self.declined("MIN_CONFIDENCE_NOT_MET");
        }

        // --- Position gate ---------------------------------------------------
        if self.book.has_same_direction(&envelope.symbol, envelope.action) {
            self.audit_decision(envelope, "DUPLICATE_POSITION");
            return self.declined("DUPLICATE_POSITION");
        }
        if !self.book.has_position(&envelope.symbol)
            && self.book.open_count() >= self.params.max_positions as usize
        {
            self.audit_decision(envelope, "POSITION_CAP");
            return self.declined("POSITION_CAP");
        }

        // --- Size gate --------------------------------------------------------
        let account = match self.broker.get_account().await {
            Ok(account) => account,
            Err(e) => {
                warn!(error = %e, "account fetch failed during sizing");
                self.audit_decision(envelope, "BROKER_TRANSIENT");
                return self.declined("BROKER_TRANSIENT");
            }
        };

        let quantity = sized_quantity(
            &self.params,
            account.equity,
            envelope.entry_price,
            envelope.stop_price,
            envelope.symbol.is_crypto(),
        );
        if quantity <= 0.0 {
            self.audit_decision(envelope, "SIZE_TOO_SMALL");
            return self.declined("SIZE_TOO_SMALL");
        }

        // --- Prop-firm gates (daily loss, then max drawdown) -----------------
        if self.params.prop_firm.enabled {
            let (loss_today_pct, drawdown_pct) = self.book.observe_equity(account.equity);

            if loss_today_pct > self.params.prop_firm.daily_loss_limit_pct {
                self.trips.lock().daily_tripped_date = Some(self.book.current_date());
                warn!(
                    loss_today_pct = format!("{loss_today_pct:.2}"),
                    "daily-loss gate tripped until UTC day rollover"
                );
                self.audit_decision(envelope, "DAILY_LOSS_TRIPPED");
                return self.declined("DAILY_LOSS_TRIPPED");
            }
            if drawdown_pct > self.params.prop_firm.max_drawdown_pct {
                self.trips.lock().drawdown_tripped = true;
                warn!(
                    drawdown_pct = format!("{drawdown_pct:.2}"),
                    "max-drawdown gate tripped, terminal for this session"
                );
                self.audit_decision(envelope, "MAX_DRAWDOWN_TRIPPED");
                return self.declined("MAX_DRAWDOWN_TRIPPED");
            }
        }

        // --- Symbol conversion at the broker edge ---------------------------
        let broker_symbol = envelope.symbol.broker_form();
        let time_in_force = if envelope.symbol.is_crypto() {
            TimeInForce::Gtc
        } else {
            TimeInForce::Day
        };

        let order = BracketOrder {
            broker_symbol,
            symbol: envelope.symbol.clone(),
            action: envelope.action,
            quantity,
            entry_price: envelope.entry_price,
            stop_price: envelope.stop_price,
            target_price: envelope.target_price,
            time_in_force,
        };

        let submission = {
            let _permit = self.broker_gate.acquire().await.expect("broker gate open");
            tokio::time::timeout(BROKER_CALL_TIMEOUT, self.broker.submit_bracket_order(&order))
                .await
        };
        let submission = match submission {
            Ok(result) => result,
            Err(_) => {
                warn!(symbol = %envelope.symbol, "broker call exceeded the global timeout");
                self.audit_decision(envelope, "BROKER_TRANSIENT");
                return self.declined("BROKER_TRANSIENT");
            }
        };

        match submission {
            Ok(order_id) => {
                self.book.open(Position {
                    symbol: envelope.symbol.clone(),
                    action: envelope.action,
                    quantity,
                    entry_price: envelope.entry_price,
                    opened_at: chrono::Utc::now().timestamp_millis(),
                    order_id: order_id.clone(),
                });
                if let Err(e) = self.journal_execution(&envelope.signal_id, &order_id) {
                    warn!(error = %e, "failed to journal execution");
                }
                info!(
                    symbol = %envelope.symbol,
                    action = %envelope.action,
                    quantity,
                    order_id = %order_id,
                    "bracket order submitted"
                );
                self.audit_decision(envelope, "EXECUTED");
                self.accepted(&order_id)
            }
            Err(BrokerError::Transient(e)) => {
                warn!(symbol = %envelope.symbol, error = %e, "broker transient failure");
                self.audit_decision(envelope, "BROKER_TRANSIENT");
                self.declined("BROKER_TRANSIENT")
            }
            Err(BrokerError::InsufficientBalance) => {
                self.audit_decision(envelope, "INSUFFICIENT_BALANCE");
                self.declined("INSUFFICIENT_BALANCE")
            }
            Err(BrokerError::InstrumentNotTradable) => {
                self.audit_decision(envelope, "INSTRUMENT_NOT_TRADABLE");
                self.declined("INSTRUMENT_NOT_TRADABLE")
            }
        }
    }

    fn journal_execution(&self, signal_id: &str, order_id: &str) -> Result<()> {
        let journal = self.journal.lock();
        journal.execute(
            "INSERT OR IGNORE INTO executions (signal_id, executor_id, order_id, submitted_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                signal_id,
                self.executor_id,
                order_id,
                chrono::Utc::now().timestamp_millis()
            ],
        )?;
        Ok(())
    }

    /// Close a tracked position (exercised by the position monitor / tests).
    pub fn release_position(&self, symbol: &crate::types::Symbol) -> bool {
        self.book.close(symbol).is_some()
    }

    pub fn state(&self) -> ExecutorStateView {
        ExecutorStateView {
            executor_id: self.executor_id.clone(),
            open_positions: self.book.open_count(),
            max_positions: self.params.max_positions,
            buying_power: 0.0,
            market_open: regular_session(chrono::Utc::now()),
        }
    }
}

/// `min(configured_pct, risk_budget / stop_distance) x equity`, rounded to
/// the broker lot: whole shares for equities, 1e-4 units for crypto.
fn sized_quantity(
    params: &ExecutorServiceParams,
    equity: f64,
    entry_price: f64,
    stop_price: f64,
    crypto: bool,
) -> f64 {
    if entry_price <= 0.0 {
        return 0.0;
    }
    let stop_fraction = (entry_price - stop_price).abs() / entry_price;
    if stop_fraction <= 0.0 {
        return 0.0;
    }

    let risk_fraction = params.risk_budget_pct / 100.0;
    let size_fraction = (params.position_pct / 100.0).min(risk_fraction / stop_fraction);
    let notional = size_fraction * equity;
    let raw_quantity = notional / entry_price;

    if crypto {
        (raw_quantity * 10_000.0).floor() / 10_000.0
    } else {
        raw_quantity.floor()
    }
}

// =============================================================================
// Axum handlers
// =============================================================================

async fn execute(
    State(service): State<Arc<ExecutorService>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let started = std::time::Instant::now();

    // --- 1. Signature ------------------------------------------------------
    let provided = headers
        .get("X-Signature")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if !verify_signature(&service.secret, &body, provided) {
        warn!("execute request with bad or missing signature");
        return (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({"error": "invalid signature"})),
        )
            .into_response();
    }

    // --- 2. Schema ---------------------------------------------------------
    let envelope: ExecutionEnvelope = match serde_json::from_slice(&body) {
        Ok(envelope) => envelope,
        Err(e) => {
            debug!(error = %e, "malformed execute envelope");
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({"error": format!("malformed envelope: {e}")})),
            )
                .into_response();
        }
    };

    // --- 3. Idempotency replay ---------------------------------------------
    let idempotency_key = headers
        .get("Idempotency-Key")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| format!("{}:{}", envelope.signal_id, service.executor_id));
    if let Some(previous) = service.replays.lock().get(&idempotency_key) {
        debug!(key = %idempotency_key, "idempotent replay served from cache");
        return Json(previous.clone()).into_response();
    }

    let reply = service.run_pipeline(&envelope).await;
    service
        .replays
        .lock()
        .insert(idempotency_key, reply.clone());

    service
        .metrics
        .stage_latency
        .with_label_values(&["execute"])
        .observe(started.elapsed().as_secs_f64());

    Json(reply).into_response()
}

async fn state_view(State(service): State<Arc<ExecutorService>>) -> Response {
    let mut view = service.state();
    if let Ok(account) = service.broker.get_account().await {
        view.buying_power = account.buying_power;
    }
    Json(view).into_response()
}

/// Constant-time HMAC comparison via the Mac verifier.
fn verify_signature(secret: &str, body: &[u8], provided_hex: &str) -> bool {
    let Ok(provided) = hex::decode(provided_hex) else {
        return false;
    };
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key size");
    mac.update(body);
    mac.verify_slice(&provided).is_ok()
}

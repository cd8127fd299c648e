// =============================================================================
// Rejected-Signal Queue — condition-triggered re-execution
// =============================================================================
//
// Recoverable business rejections (position cap, buying power, transient
// broker trouble) park here with a set of wake conditions. A background loop
// re-checks every `poll_interval`; executor occupancy is probed at a longer
// cadence. A woken entry re-POSTs the original envelope; entries terminate
// on success, on a terminal decline, at `max_age` (EXPIRED) or after
// `max_retries` (MAX_RETRIES).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::audit::AuditLog;
use crate::config::RejectedQueueParams;
use crate::distributor::{DeliveryOutcome, Distributor, RecoverableRejection, RECOVERABLE_REASONS};
use crate::metrics::Metrics;
use crate::signal::ExecutionEnvelope;

/// What has to become true before a parked signal is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WakeCondition {
    AccountBuyingPowerRestored,
    PositionSlotFree,
    MarketOpen,
    Manual,
}

/// Map a recoverable reason code to its wake conditions.
pub fn wake_conditions_for(reason_code: &str) -> Vec<WakeCondition> {
    match reason_code {
        "POSITION_CAP" => vec![WakeCondition::PositionSlotFree],
        "INSUFFICIENT_BALANCE" => vec![WakeCondition::AccountBuyingPowerRestored],
        "BROKER_TRANSIENT" => vec![WakeCondition::MarketOpen, WakeCondition::Manual],
        _ => vec![],
    }
}

/// One parked signal.
#[derive(Debug, Clone)]
pub struct RejectedSignal {
    pub envelope: ExecutionEnvelope,
    pub executor_id: String,
    pub reason_code: String,
    pub rejected_at: Instant,
    pub wake_conditions: Vec<WakeCondition>,
    pub attempts: u32,
    pub manual_release: bool,
}

/// Executor occupancy as seen by the queue's prober.
#[derive(Debug, Clone, Copy)]
pub struct ProbedState {
    pub slot_free: bool,
    pub buying_power_ok: bool,
    pub market_open: bool,
}

/// Probes an executor's current state. The HTTP implementation polls the
/// executor's state endpoint; tests script it.
#[async_trait]
pub trait StateProbe: Send + Sync {
    async fn probe(&self, executor_id: &str) -> Option<ProbedState>;
}

/// Re-delivers a parked envelope. Implemented by the distributor.
#[async_trait]
pub trait Redeliver: Send + Sync {
    async fn redeliver(&self, executor_id: &str, envelope: &ExecutionEnvelope) -> DeliveryOutcome;
}

#[async_trait]
impl Redeliver for Distributor {
    async fn redeliver(&self, executor_id: &str, envelope: &ExecutionEnvelope) -> DeliveryOutcome {
        self.deliver_once(executor_id, envelope).await
    }
}

/// HTTP prober hitting `<execute endpoint>/../state`.
pub struct HttpStateProbe {
    endpoints: HashMap<String, String>,
    http: reqwest::Client,
}

impl HttpStateProbe {
    /// Derive state URLs from execute endpoints (`.../execute` -> `.../state`).
    pub fn new(executors: impl IntoIterator<Item = (String, String)>) -> Self {
        let endpoints = executors
            .into_iter()
            .map(|(id, execute_url)| {
                let state_url = execute_url
                    .strip_suffix("/execute")
                    .map(|base| format!("{base}/state"))
                    .unwrap_or(execute_url);
                (id, state_url)
            })
            .collect();
        Self {
            endpoints,
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(5))
                .build()
                .expect("failed to build probe http client"),
        }
    }
}

#[async_trait]
impl StateProbe for HttpStateProbe {
    async fn probe(&self, executor_id: &str) -> Option<ProbedState> {
        let url = self.endpoints.get(executor_id)?;
        let body: serde_json::Value = self.http.get(url).send().await.ok()?.json().await.ok()?;
        let open = body.get("open_positions")?.as_u64()?;
        let max = body.get("max_positions")?.as_u64()?;
        Some(ProbedState {
            slot_free: open < max,
            buying_power_ok: body
                .get("buying_power")
                .and_then(|v| v.as_f64())
                .is_some_and(|bp| bp > 0.0),
            market_open: body
                .get("market_open")
                .and_then(|v| v.as_bool())
                .unwrap_or(false),
        })
    }
}

// =============================================================================
// Queue
// =============================================================================

pub struct RejectedSignalQueue {
    params: RejectedQueueParams,
    entries: Mutex<HashMap<String, RejectedSignal>>,
    audit: Arc<AuditLog>,
    metrics: Arc<Metrics>,
}

impl RejectedSignalQueue {
    pub fn new(params: RejectedQueueParams, audit: Arc<AuditLog>, metrics: Arc<Metrics>) -> Self {
        Self {
            params,
            entries: Mutex::new(HashMap::new()),
            audit,
            metrics,
        }
    }

    fn key(envelope: &ExecutionEnvelope, executor_id: &str) -> String {
        format!("{}:{}", envelope.signal_id, executor_id)
    }

    pub fn depth(&self) -> usize {
        self.entries.lock().len()
    }

    /// Park a recoverable rejection.
    pub fn enqueue(&self, rejection: RecoverableRejection) {
        let wake_conditions = wake_conditions_for(&rejection.reason_code);
        if wake_conditions.is_empty() {
            debug!(reason = %rejection.reason_code, "rejection is terminal, not queueing");
            return;
        }
        let key = Self::key(&rejection.envelope, &rejection.executor_id);
        info!(
            signal_id = %rejection.envelope.signal_id,
            executor = %rejection.executor_id,
            reason = %rejection.reason_code,
            "signal parked awaiting wake condition"
        );
        self.entries.lock().insert(
            key,
            RejectedSignal {
                envelope: rejection.envelope,
                executor_id: rejection.executor_id,
                reason_code: rejection.reason_code,
                rejected_at: Instant::now(),
                wake_conditions,
                attempts: 0,
                manual_release: false,
            },
        );
        self.metrics.rejected_queue_depth.set(self.depth() as i64);
    }

    /// Operator-triggered release of one parked signal.
    pub fn trigger_manual(&self, signal_id: &str) {
        let mut entries = self.entries.lock();
        for entry in entries.values_mut() {
            if entry.envelope.signal_id == signal_id {
                entry.manual_release = true;
            }
        }
    }

    fn remove(&self, key: &str, terminal_reason: &str, entry: &RejectedSignal) {
        self.entries.lock().remove(key);
        self.metrics.rejected_queue_depth.set(self.depth() as i64);
        let _ = self.audit.append(
            "rejected-queue",
            terminal_reason,
            entry.envelope.symbol.as_str(),
            serde_json::json!({
                "signal_id": entry.envelope.signal_id,
                "executor_id": entry.executor_id,
                "attempts": entry.attempts,
            }),
        );
    }

    fn is_awake(entry: &RejectedSignal, state: Option<&ProbedState>) -> bool {
        entry.wake_conditions.iter().any(|condition| match condition {
            WakeCondition::Manual => entry.manual_release,
            WakeCondition::PositionSlotFree => state.is_some_and(|s| s.slot_free),
            WakeCondition::AccountBuyingPowerRestored => state.is_some_and(|s| s.buying_power_ok),
            WakeCondition::MarketOpen => state.is_some_and(|s| s.market_open),
        })
    }

    /// One scan: expire stale entries, retry the awake ones. Returns the
    /// number of redeliveries attempted.
    pub async fn scan(
        &self,
        redeliverer: &dyn Redeliver,
        states: &HashMap<String, ProbedState>,
    ) -> usize {
        let max_age = Duration::from_secs(self.params.max_age_secs);
        let candidates: Vec<(String, RejectedSignal)> = {
            let entries = self.entries.lock();
            entries
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        };

        let mut retried = 0;
        for (key, entry) in candidates {
            if entry.rejected_at.elapsed() >= max_age {
                info!(signal_id = %entry.envelope.signal_id, "parked signal expired");
                self.remove(&key, "REJECTED_SIGNAL_EXPIRED", &entry);
                continue;
            }

            if !Self::is_awake(&entry, states.get(&entry.executor_id)) {
                continue;
            }

            retried += 1;
            let outcome = redeliverer
                .redeliver(&entry.executor_id, &entry.envelope)
                .await;

            let mut entries = self.entries.lock();
            let Some(live) = entries.get_mut(&key) else {
                continue;
            };
            live.attempts += 1;
            live.manual_release = false;
            let attempts = live.attempts;
            let live = live.clone();
            drop(entries);

            match outcome {
                DeliveryOutcome::Executed { .. } => {
                    self.remove(&key, "REJECTED_SIGNAL_EXECUTED", &live);
                }
                DeliveryOutcome::Declined { ref reason_code }
                    if !RECOVERABLE_REASONS.contains(&reason_code.as_str()) =>
                {
                    self.remove(&key, "REJECTED_SIGNAL_TERMINAL", &live);
                }
                DeliveryOutcome::BadRequest => {
                    self.remove(&key, "REJECTED_SIGNAL_TERMINAL", &live);
                }
                _ if attempts >= self.params.max_retries => {
                    warn!(
                        signal_id = %live.envelope.signal_id,
                        attempts,
                        "parked signal exhausted retries"
                    );
                    self.remove(&key, "REJECTED_SIGNAL_MAX_RETRIES", &live);
                }
                _ => {}
            }
        }
        retried
    }
}

/// Background loop: ingest recoverable rejections and drive scans.
pub async fn run_rejected_queue(
    queue: Arc<RejectedSignalQueue>,
    redeliverer: Arc<dyn Redeliver>,
    probe: Arc<dyn StateProbe>,
    executor_ids: Vec<String>,
    mut rejection_rx: mpsc::UnboundedReceiver<RecoverableRejection>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let mut poll = tokio::time::interval(Duration::from_secs(queue.params.poll_interval_secs));
    poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let probe_every = Duration::from_secs(queue.params.executor_state_poll_secs);
    let mut last_probe: Option<Instant> = None;
    let mut states: HashMap<String, ProbedState> = HashMap::new();

    loop {
        tokio::select! {
            rejection = rejection_rx.recv() => {
                match rejection {
                    Some(rejection) => queue.enqueue(rejection),
                    None => break,
                }
            }
            _ = poll.tick() => {
                if queue.depth() == 0 {
                    continue;
                }
                let stale = last_probe.map_or(true, |t| t.elapsed() >= probe_every);
                if stale {
                    for executor_id in &executor_ids {
                        if let Some(state) = probe.probe(executor_id).await {
                            states.insert(executor_id.clone(), state);
                        }
                    }
                    last_probe = Some(Instant::now());
                }
                queue.scan(redeliverer.as_ref(), &states).await;
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

// =============================================================================
// Broker interface — bracket orders behind a uniform trait
// =============================================================================
//
// The executor talks to exactly one broker through this trait. A simulation
// implementation exists for development: it returns synthetic order ids and
// maintains in-memory account state, so the whole pipeline runs end-to-end
// without touching an exchange.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use crate::types::{Action, Symbol};

/// Order lifetime: GTC for crypto, DAY for equities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeInForce {
    #[serde(rename = "GTC")]
    Gtc,
    #[serde(rename = "DAY")]
    Day,
}

impl std::fmt::Display for TimeInForce {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Gtc => write!(f, "GTC"),
            Self::Day => write!(f, "DAY"),
        }
    }
}

/// Entry + stop + take-profit submitted as one request.
#[derive(Debug, Clone, Serialize)]
pub struct BracketOrder {
    /// Broker wire symbol (`BTCUSD`), converted at this edge only.
    pub broker_symbol: String,
    /// Canonical symbol retained for logs and downstream joins.
    pub symbol: Symbol,
    pub action: Action,
    pub quantity: f64,
    pub entry_price: f64,
    pub stop_price: f64,
    pub target_price: f64,
    pub time_in_force: TimeInForce,
}

/// One open position as the broker reports it.
#[derive(Debug, Clone, Serialize)]
pub struct BrokerPosition {
    pub broker_symbol: String,
    pub action: Action,
    pub quantity: f64,
    pub entry_price: f64,
}

/// Account headline numbers.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct AccountSummary {
    pub equity: f64,
    pub buying_power: f64,
}

/// Broker-side failure classification. Transient failures map to
/// `BROKER_TRANSIENT`; business rejections map to their own reason codes.
#[derive(Debug, Clone, Error)]
pub enum BrokerError {
    #[error("broker transient failure: {0}")]
    Transient(String),
    #[error("insufficient balance")]
    InsufficientBalance,
    #[error("instrument not tradable")]
    InstrumentNotTradable,
}

#[async_trait]
pub trait Broker: Send + Sync {
    /// Whether this broker supports opening short crypto positions.
    fn shorts_crypto(&self) -> bool;

    async fn submit_bracket_order(&self, order: &BracketOrder) -> Result<String, BrokerError>;

    async fn list_positions(&self) -> Result<Vec<BrokerPosition>, BrokerError>;

    async fn get_account(&self) -> Result<AccountSummary, BrokerError>;
}

// =============================================================================
// Simulation broker
// =============================================================================

struct SimState {
    equity: f64,
    buying_power: f64,
    positions: Vec<BrokerPosition>,
}

/// In-memory broker for development and tests.
pub struct SimBroker {
    state: Mutex<SimState>,
    shorts_crypto: bool,
}

impl SimBroker {
    pub fn new(starting_equity: f64, shorts_crypto: bool) -> Self {
        info!(starting_equity, shorts_crypto, "SimBroker initialised");
        Self {
            state: Mutex::new(SimState {
                equity: starting_equity,
                buying_power: starting_equity,
                positions: Vec::new(),
            }),
            shorts_crypto,
        }
    }

    /// Adjust simulated equity (used by tests to model losses).
    pub fn set_equity(&self, equity: f64) {
        let mut state = self.state.lock();
        state.equity = equity;
        state.buying_power = equity;
    }
}

#[async_trait]
impl Broker for SimBroker {
    fn shorts_crypto(&self) -> bool {
        self.shorts_crypto
    }

    async fn submit_bracket_order(&self, order: &BracketOrder) -> Result<String, BrokerError> {
        let notional = order.quantity * order.entry_price;
        let mut state = self.state.lock();

        if notional > state.buying_power {
            return Err(BrokerError::InsufficientBalance);
        }

        state.buying_power -= notional;
        state.positions.push(BrokerPosition {
            broker_symbol: order.broker_symbol.clone(),
            action: order.action,
            quantity: order.quantity,
            entry_price: order.entry_price,
        });

        let order_id = format!("sim-{}", Uuid::new_v4());
        debug!(
            symbol = %order.symbol,
            broker_symbol = %order.broker_symbol,
            action = %order.action,
            quantity = order.quantity,
            tif = %order.time_in_force,
            order_id = %order_id,
            "simulated bracket order filled"
        );
        Ok(order_id)
    }

    async fn list_positions(&self) -> Result<Vec<BrokerPosition>, BrokerError> {
        Ok(self.state.lock().positions.clone())
    }

    async fn get_account(&self) -> Result<AccountSummary, BrokerError> {
        let state = self.state.lock();
        Ok(AccountSummary {
            equity: state.equity,
            buying_power: state.buying_power,
        })
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn order(quantity: f64) -> BracketOrder {
        BracketOrder {
            broker_symbol: "BTCUSD".into(),
            symbol: Symbol::from("BTC-USD"),
            action: Action::Long,
            quantity,
            entry_price: 100.0,
            stop_price: 95.0,
            target_price: 110.0,
            time_in_force: TimeInForce::Gtc,
        }
    }

    #[tokio::test]
    async fn sim_fill_returns_synthetic_order_id() {
        let broker = SimBroker::new(10_000.0, false);
        let order_id = broker.submit_bracket_order(&order(1.0)).await.unwrap();
        assert!(order_id.starts_with("sim-"));
        assert_eq!(broker.list_positions().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn sim_rejects_oversized_order() {
        let broker = SimBroker::new(50.0, false);
        let err = broker.submit_bracket_order(&order(1.0)).await.unwrap_err();
        assert!(matches!(err, BrokerError::InsufficientBalance));
    }

    #[tokio::test]
    async fn buying_power_decreases_on_fill() {
        let broker = SimBroker::new(1_000.0, false);
        broker.submit_bracket_order(&order(5.0)).await.unwrap();
        let account = broker.get_account().await.unwrap();
        assert!((account.buying_power - 500.0).abs() < f64::EPSILON);
    }
}

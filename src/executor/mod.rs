pub mod broker;
pub mod positions;
pub mod service;

pub use broker::{Broker, BrokerError, BracketOrder, SimBroker, TimeInForce};
pub use service::{ExecutorService, ExecutorStateView};

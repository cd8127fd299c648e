pub mod adx;
pub mod atr;
pub mod slope;

pub use adx::calculate_adx;
pub use atr::{calculate_atr, calculate_atr_pct};
pub use slope::regression_slope;

//! Strategy definitions and stop-loss placement.
//!
//! Contains:
//! - The static catalog of strategy risk profiles (DCA, swing, day)
//! - Volatility-scaled stop-loss calculation

mod catalog;
mod stop_loss;

pub use catalog::{StrategyCatalog, StrategyKind, StrategyProfile};
pub use stop_loss::compute_stop;

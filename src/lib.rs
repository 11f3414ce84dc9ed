//! # Strategy Ledger
//!
//! Capital and position bookkeeping for a multi-strategy long-only trading
//! system: allocation admission, volatility-scaled stop-losses, portfolio
//! emergency latch and durable state.
//!
//! ## Architecture
//!
//! - `config`: Configuration management and validation
//! - `strategy`: Strategy profiles and stop-loss calculation
//! - `risk`: Budget, position lifecycle, emergency latch and statistics
//! - `persistence`: Atomic JSON snapshots and the SQLite audit journal
//! - `ledger`: Thread-safe facade over all of the above
//! - `utils`: Shared utilities and decimal arithmetic

pub mod config;
pub mod error;
pub mod ledger;
pub mod persistence;
pub mod risk;
pub mod strategy;
pub mod utils;

pub use config::Config;
pub use error::{LedgerError, LedgerResult};
pub use ledger::Ledger;

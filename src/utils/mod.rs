//! Shared utilities.

mod decimal;

pub use decimal::{mean, median, round_to_precision, safe_div, std_dev};

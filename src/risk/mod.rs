//! Position and capital risk management.
//!
//! - Budget commitments and allocation admission
//! - Position lifecycle and stop-loss detection
//! - Portfolio emergency latch and drawdown tracking
//! - Performance statistics

mod budget;
mod emergency;
mod position_store;
mod statistics;

pub use budget::{Admission, BudgetLedger, BudgetSnapshot, StrategyAllocation};
pub use emergency::{DrawdownStats, EmergencyAudit, EmergencySupervisor};
pub use position_store::{
    Annotations, ExecutionResult, ExitReason, Holdings, LargeMove, MonitorResult, OpenRequest,
    Position, PositionSize, PositionStatus, PositionStore,
};
pub use statistics::{compute_statistics, PortfolioStatistics, StrategyPerformance};

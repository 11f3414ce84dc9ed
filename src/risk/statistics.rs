//! Portfolio performance statistics over the full position history.

use rust_decimal::Decimal;
use serde::Serialize;

use super::{BudgetSnapshot, DrawdownStats, Position, PositionStatus};
use crate::strategy::StrategyKind;
use crate::utils::{mean, median, safe_div, std_dev};

/// Realized performance of one strategy.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StrategyPerformance {
    pub strategy: StrategyKind,
    /// Closed or stopped-out positions
    pub finished: usize,
    pub win_rate: Decimal,
    pub avg_pnl_pct: Decimal,
}

/// Portfolio-wide statistics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PortfolioStatistics {
    pub total_positions: usize,
    pub open_positions: usize,
    pub closed_positions: usize,
    pub stopped_positions: usize,
    pub total_unrealized_pnl: Decimal,
    pub total_realized_pnl: Decimal,
    pub avg_realized_pnl_pct: Option<Decimal>,
    pub median_realized_pnl_pct: Option<Decimal>,
    pub win_rate: Option<Decimal>,
    pub best_trade_pct: Option<Decimal>,
    pub worst_trade_pct: Option<Decimal>,
    pub stdev_pnl_pct: Option<Decimal>,
    pub by_strategy: Vec<StrategyPerformance>,
    pub emergency_active: bool,
    pub budget: BudgetSnapshot,
    pub drawdown: DrawdownStats,
}

fn win_rate(pnl_pcts: &[Decimal]) -> Option<Decimal> {
    if pnl_pcts.is_empty() {
        return None;
    }
    let wins = pnl_pcts.iter().filter(|p| **p > Decimal::ZERO).count();
    Some(safe_div(Decimal::from(wins), Decimal::from(pnl_pcts.len())))
}

/// Compute statistics from every position the ledger has recorded.
pub fn compute_statistics(
    positions: &[Position],
    budget: BudgetSnapshot,
    drawdown: DrawdownStats,
    emergency_active: bool,
) -> PortfolioStatistics {
    let count = |status: PositionStatus| positions.iter().filter(|p| p.status == status).count();

    let finished: Vec<&Position> = positions.iter().filter(|p| !p.is_open()).collect();
    let pnl_pcts: Vec<Decimal> = finished.iter().filter_map(|p| p.realized_pnl_pct).collect();

    let by_strategy = StrategyKind::ALL
        .iter()
        .map(|kind| {
            let pcts: Vec<Decimal> = finished
                .iter()
                .filter(|p| p.strategy == *kind)
                .filter_map(|p| p.realized_pnl_pct)
                .collect();
            StrategyPerformance {
                strategy: *kind,
                finished: finished.iter().filter(|p| p.strategy == *kind).count(),
                win_rate: win_rate(&pcts).unwrap_or(Decimal::ZERO),
                avg_pnl_pct: mean(&pcts).unwrap_or(Decimal::ZERO),
            }
        })
        .collect();

    PortfolioStatistics {
        total_positions: positions.len(),
        open_positions: count(PositionStatus::Open),
        closed_positions: count(PositionStatus::Closed),
        stopped_positions: count(PositionStatus::StoppedOut),
        total_unrealized_pnl: budget.unrealized_pnl,
        total_realized_pnl: finished.iter().map(|p| p.realized_pnl).sum(),
        avg_realized_pnl_pct: mean(&pnl_pcts),
        median_realized_pnl_pct: median(&pnl_pcts),
        win_rate: win_rate(&pnl_pcts),
        best_trade_pct: pnl_pcts.iter().copied().max(),
        worst_trade_pct: pnl_pcts.iter().copied().min(),
        stdev_pnl_pct: std_dev(&pnl_pcts),
        by_strategy,
        emergency_active,
        budget,
        drawdown,
    }
}

//! Capital budget and allocation admission.
//!
//! Tracks how much of the initial capital is committed to open positions,
//! globally and per strategy, plus the realized P&L accumulated by exits.

use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::debug;

use super::Position;
use crate::error::{LedgerError, LedgerResult};
use crate::strategy::{StrategyKind, StrategyProfile};
use crate::utils::safe_div;

/// Outcome of an allocation check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Granted,
    Denied { reason: String },
}

impl Admission {
    fn denied(reason: String) -> Self {
        Admission::Denied { reason }
    }

    pub fn is_granted(&self) -> bool {
        matches!(self, Admission::Granted)
    }

    /// Human-readable reason ("OK" when granted).
    pub fn reason(&self) -> &str {
        match self {
            Admission::Granted => "OK",
            Admission::Denied { reason } => reason,
        }
    }

    /// Convert a denial into `LedgerError::AllocationDenied`.
    pub fn into_result(self) -> LedgerResult<()> {
        match self {
            Admission::Granted => Ok(()),
            Admission::Denied { reason } => Err(LedgerError::denied(reason)),
        }
    }
}

/// Capital commitments across strategies.
#[derive(Debug, Clone, PartialEq)]
pub struct BudgetLedger {
    initial_capital: Decimal,
    global_allocation_cap: Decimal,
    committed: BTreeMap<StrategyKind, Decimal>,
    realized_pnl_total: Decimal,
}

impl BudgetLedger {
    /// Create an empty ledger. `initial_capital` is fixed for the ledger's lifetime.
    pub fn new(initial_capital: Decimal, global_allocation_cap: Decimal) -> Self {
        Self {
            initial_capital,
            global_allocation_cap,
            committed: BTreeMap::new(),
            realized_pnl_total: Decimal::ZERO,
        }
    }

    /// Restore a ledger from persisted parts.
    pub(crate) fn from_parts(
        initial_capital: Decimal,
        global_allocation_cap: Decimal,
        committed: BTreeMap<StrategyKind, Decimal>,
        realized_pnl_total: Decimal,
    ) -> Self {
        Self {
            initial_capital,
            global_allocation_cap,
            committed,
            realized_pnl_total,
        }
    }

    pub fn initial_capital(&self) -> Decimal {
        self.initial_capital
    }

    pub fn global_allocation_cap(&self) -> Decimal {
        self.global_allocation_cap
    }

    pub fn realized_pnl_total(&self) -> Decimal {
        self.realized_pnl_total
    }

    pub fn committed(&self, kind: StrategyKind) -> Decimal {
        self.committed.get(&kind).copied().unwrap_or(Decimal::ZERO)
    }

    pub fn committed_by_strategy(&self) -> &BTreeMap<StrategyKind, Decimal> {
        &self.committed
    }

    pub fn total_committed(&self) -> Decimal {
        self.committed.values().copied().sum()
    }

    /// Cash not tied up in open positions: capital + realized P&L - commitments.
    pub fn available(&self) -> Decimal {
        self.initial_capital + self.realized_pnl_total - self.total_committed()
    }

    /// Room left under the global allocation cap.
    pub fn global_headroom(&self) -> Decimal {
        self.initial_capital * self.global_allocation_cap - self.total_committed()
    }

    /// Room left under a strategy's own allocation cap.
    pub fn strategy_headroom(&self, profile: &StrategyProfile) -> Decimal {
        self.initial_capital * profile.allocation_limit - self.committed(profile.kind)
    }

    /// Check whether `amount` may be committed under `profile`.
    ///
    /// Fails closed while emergency mode is active. Never mutates.
    pub fn can_allocate(
        &self,
        profile: &StrategyProfile,
        amount: Decimal,
        emergency_active: bool,
    ) -> Admission {
        if emergency_active {
            return Admission::denied("Emergency mode active - all new positions blocked".into());
        }

        if amount <= Decimal::ZERO {
            return Admission::denied(format!("Allocation amount must be positive, got {amount}"));
        }

        let available = self.available();
        if amount > available {
            return Admission::denied(format!(
                "Insufficient capital: ${available:.2} available, ${amount:.2} required"
            ));
        }

        let total_after = self.total_committed() + amount;
        let global_limit = self.initial_capital * self.global_allocation_cap;
        if total_after > global_limit {
            return Admission::denied(format!(
                "Global allocation limit: ${total_after:.2} > ${global_limit:.2} ({:.1}% cap)",
                self.global_allocation_cap * Decimal::ONE_HUNDRED
            ));
        }

        let strategy_after = self.committed(profile.kind) + amount;
        let strategy_limit = self.initial_capital * profile.allocation_limit;
        if strategy_after > strategy_limit {
            return Admission::denied(format!(
                "{} allocation limit: ${strategy_after:.2} > ${strategy_limit:.2} ({:.1}% cap)",
                profile.kind,
                profile.allocation_limit * Decimal::ONE_HUNDRED
            ));
        }

        Admission::Granted
    }

    /// Commit capital to a strategy.
    pub fn commit(&mut self, kind: StrategyKind, amount: Decimal) -> LedgerResult<()> {
        if amount < Decimal::ZERO {
            return Err(LedgerError::InvalidInput(format!(
                "cannot commit negative amount {amount}"
            )));
        }

        let entry = self.committed.entry(kind).or_insert(Decimal::ZERO);
        *entry += amount;

        debug!(strategy = %kind, %amount, committed = %*entry, "Committed capital");
        Ok(())
    }

    /// Release previously committed capital. Never lets a commitment go negative.
    pub fn release(&mut self, kind: StrategyKind, amount: Decimal) -> LedgerResult<()> {
        if amount < Decimal::ZERO {
            return Err(LedgerError::InvalidInput(format!(
                "cannot release negative amount {amount}"
            )));
        }

        let committed = self.committed(kind);
        if amount > committed {
            return Err(LedgerError::BudgetUnderflow {
                strategy: kind,
                committed,
                release: amount,
            });
        }

        let remaining = committed - amount;
        if remaining == Decimal::ZERO {
            self.committed.remove(&kind);
        } else {
            self.committed.insert(kind, remaining);
        }

        debug!(strategy = %kind, %amount, committed = %remaining, "Released capital");
        Ok(())
    }

    /// Book realized P&L from an exit.
    pub fn realize(&mut self, pnl: Decimal) -> LedgerResult<()> {
        self.realized_pnl_total = self
            .realized_pnl_total
            .checked_add(pnl)
            .ok_or_else(|| LedgerError::overflow("realized P&L total"))?;
        Ok(())
    }

    /// Read-only view for reporting, valued with the open positions' last seen prices.
    pub fn snapshot<'a>(&self, open_positions: impl IntoIterator<Item = &'a Position>) -> BudgetSnapshot {
        let mut unrealized_pnl = Decimal::ZERO;
        let mut market_value = Decimal::ZERO;
        let mut counts: BTreeMap<StrategyKind, usize> = BTreeMap::new();

        for position in open_positions {
            unrealized_pnl += position.unrealized_pnl;
            market_value += position.market_value();
            *counts.entry(position.strategy).or_default() += 1;
        }

        let allocated = self.total_committed();
        let available = self.available();

        let by_strategy = StrategyKind::ALL
            .iter()
            .map(|kind| {
                let committed = self.committed(*kind);
                StrategyAllocation {
                    strategy: *kind,
                    open_positions: counts.get(kind).copied().unwrap_or(0),
                    allocated: committed,
                    allocation_pct: safe_div(committed, self.initial_capital),
                }
            })
            .collect();

        BudgetSnapshot {
            initial_capital: self.initial_capital,
            allocated,
            available,
            allocation_pct: safe_div(allocated, self.initial_capital),
            global_headroom: self.global_headroom(),
            unrealized_pnl,
            realized_pnl: self.realized_pnl_total,
            total_pnl: unrealized_pnl + self.realized_pnl_total,
            portfolio_value: available + market_value,
            by_strategy,
        }
    }
}

/// Budget view for statistics and dashboards.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BudgetSnapshot {
    pub initial_capital: Decimal,
    pub allocated: Decimal,
    pub available: Decimal,
    pub allocation_pct: Decimal,
    pub global_headroom: Decimal,
    pub unrealized_pnl: Decimal,
    pub realized_pnl: Decimal,
    pub total_pnl: Decimal,
    /// Available cash plus the market value of open positions
    pub portfolio_value: Decimal,
    pub by_strategy: Vec<StrategyAllocation>,
}

impl BudgetSnapshot {
    /// Portfolio return against initial capital.
    pub fn portfolio_pnl_pct(&self) -> Decimal {
        safe_div(self.portfolio_value - self.initial_capital, self.initial_capital)
    }

    pub fn strategy(&self, kind: StrategyKind) -> Option<&StrategyAllocation> {
        self.by_strategy.iter().find(|s| s.strategy == kind)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StrategyAllocation {
    pub strategy: StrategyKind,
    pub open_positions: usize,
    pub allocated: Decimal,
    pub allocation_pct: Decimal,
}

//! Position lifecycle: admission, monitoring, and exits.
//!
//! Positions move `Open -> Closed` or `Open -> StoppedOut` and never back.
//! Terminal positions are kept for audit and statistics.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{Admission, BudgetLedger, EmergencySupervisor};
use crate::error::{LedgerError, LedgerResult};
use crate::strategy::{compute_stop, StrategyCatalog, StrategyKind, StrategyProfile};
use crate::utils::safe_div;

/// Auxiliary context attached to a position. Stored, never interpreted.
pub type Annotations = BTreeMap<String, serde_json::Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionStatus {
    Open,
    Closed,
    StoppedOut,
}

impl PositionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, PositionStatus::Open)
    }
}

impl fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PositionStatus::Open => write!(f, "open"),
            PositionStatus::Closed => write!(f, "closed"),
            PositionStatus::StoppedOut => write!(f, "stopped_out"),
        }
    }
}

/// Why a position left the `Open` state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    Manual,
    TakeProfit,
    SignalReversal,
    StopLoss,
    Emergency,
}

impl ExitReason {
    /// Signal-driven exits wait out the strategy's minimum hold time.
    /// Manual, stop-loss and emergency exits never do.
    pub fn respects_min_hold(&self) -> bool {
        matches!(self, ExitReason::TakeProfit | ExitReason::SignalReversal)
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ExitReason::Manual => "manual",
            ExitReason::TakeProfit => "take_profit",
            ExitReason::SignalReversal => "signal_reversal",
            ExitReason::StopLoss => "stop_loss",
            ExitReason::Emergency => "emergency",
        };
        f.write_str(label)
    }
}

/// Requested position size.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PositionSize {
    /// Quote-currency amount to invest; asset quantity is derived from the entry price.
    Quote(Decimal),
    /// Asset quantity to buy; quote amount is derived from the entry price.
    Asset(Decimal),
}

/// Parameters for opening a long position.
#[derive(Debug, Clone)]
pub struct OpenRequest {
    pub strategy: StrategyKind,
    pub entry_price: Decimal,
    pub size: PositionSize,
    /// Volatility measure (e.g., ATR) used for the stop distance
    pub volatility: Decimal,
    pub annotations: Annotations,
}

impl OpenRequest {
    /// Size the position by quote-currency amount.
    pub fn quote(
        strategy: StrategyKind,
        entry_price: Decimal,
        amount_quote: Decimal,
        volatility: Decimal,
    ) -> Self {
        Self {
            strategy,
            entry_price,
            size: PositionSize::Quote(amount_quote),
            volatility,
            annotations: Annotations::new(),
        }
    }

    /// Size the position by asset quantity.
    pub fn asset(
        strategy: StrategyKind,
        entry_price: Decimal,
        quantity_asset: Decimal,
        volatility: Decimal,
    ) -> Self {
        Self {
            size: PositionSize::Asset(quantity_asset),
            ..Self::quote(strategy, entry_price, Decimal::ZERO, volatility)
        }
    }

    pub fn with_annotation(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.annotations.insert(key.to_string(), value.into());
        self
    }

    /// Resolve `(quantity_asset, quantity_quote)`.
    fn quantities(&self) -> LedgerResult<(Decimal, Decimal)> {
        if self.entry_price <= Decimal::ZERO {
            return Err(LedgerError::InvalidInput(format!(
                "entry price must be positive, got {}",
                self.entry_price
            )));
        }

        let (asset, quote) = match self.size {
            PositionSize::Quote(amount) => (
                amount
                    .checked_div(self.entry_price)
                    .ok_or_else(|| LedgerError::overflow("asset quantity"))?,
                amount,
            ),
            PositionSize::Asset(qty) => (
                qty,
                qty.checked_mul(self.entry_price)
                    .ok_or_else(|| LedgerError::overflow("quote amount"))?,
            ),
        };

        if asset <= Decimal::ZERO || quote <= Decimal::ZERO {
            return Err(LedgerError::InvalidInput(format!(
                "position size must be positive (asset {asset}, quote {quote})"
            )));
        }
        Ok((asset, quote))
    }
}

/// A long position tracked by the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub id: Uuid,
    pub strategy: StrategyKind,
    pub quantity_asset: Decimal,
    /// Cost basis in quote currency
    pub quantity_quote: Decimal,
    pub entry_price: Decimal,
    /// Frozen at creation
    pub stop_price: Decimal,
    /// Volatility measure the stop was computed from
    #[serde(default)]
    pub volatility: Decimal,
    pub status: PositionStatus,
    pub opened_at: DateTime<Utc>,
    #[serde(default)]
    pub closed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub exit_price: Option<Decimal>,
    #[serde(default)]
    pub exit_reason: Option<ExitReason>,
    #[serde(default)]
    pub realized_pnl: Decimal,
    #[serde(default)]
    pub realized_pnl_pct: Option<Decimal>,
    /// Valid only while open
    #[serde(default)]
    pub unrealized_pnl: Decimal,
    pub last_seen_price: Decimal,
    #[serde(default)]
    pub annotations: Annotations,
}

impl Position {
    pub fn is_open(&self) -> bool {
        self.status == PositionStatus::Open
    }

    /// Current value at the last seen price (zero once terminal).
    pub fn market_value(&self) -> Decimal {
        if self.is_open() {
            self.quantity_asset * self.last_seen_price
        } else {
            Decimal::ZERO
        }
    }

    pub fn unrealized_pnl_pct(&self) -> Decimal {
        safe_div(self.last_seen_price - self.entry_price, self.entry_price)
    }

    /// Long-only: triggered when the price is at or below the stop.
    pub fn is_stop_triggered(&self, current_price: Decimal) -> bool {
        self.is_open() && current_price <= self.stop_price
    }

    /// Time left in the minimum hold window, if any.
    pub fn hold_remaining(&self, min_hold: Duration, now: DateTime<Utc>) -> Option<Duration> {
        // A window reaching past the representable range never ends
        let Some(until) = self.opened_at.checked_add_signed(min_hold) else {
            return Some(min_hold);
        };
        let remaining = until - now;
        (remaining > Duration::zero()).then_some(remaining)
    }

    fn ensure_open(&self) -> LedgerResult<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(LedgerError::InvalidState {
                position_id: self.id,
                status: self.status,
            })
        }
    }
}

/// Result of an exit (stop-loss, manual close, or emergency close).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionResult {
    pub position_id: Uuid,
    pub strategy: StrategyKind,
    pub status: PositionStatus,
    pub exit_reason: ExitReason,
    pub exit_price: Decimal,
    pub realized_pnl: Decimal,
    pub realized_pnl_pct: Decimal,
    /// Commitment released back to the budget (the cost basis)
    pub capital_freed: Decimal,
    /// Quote currency received for the asset
    pub proceeds: Decimal,
    /// Seconds left in the minimum hold when an unconditional exit cut it short
    pub hold_remaining_secs: Option<i64>,
}

/// An open position whose price moved sharply since the previous tick.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LargeMove {
    pub position_id: Uuid,
    pub strategy: StrategyKind,
    pub previous_price: Decimal,
    pub current_price: Decimal,
    /// Price change since the last tick, relative to entry
    pub move_pct: Decimal,
    pub unrealized_pnl: Decimal,
}

/// Outcome of a monitoring tick.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonitorResult {
    pub updated_count: usize,
    pub total_unrealized_pnl: Decimal,
    pub portfolio_value: Decimal,
    pub portfolio_pnl_pct: Decimal,
    pub large_moves: Vec<LargeMove>,
    /// True only on the tick that latched emergency mode
    pub emergency_triggered: bool,
    /// Portfolio is close to the emergency threshold
    pub emergency_warning: bool,
}

/// Aggregate holdings across open positions.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Holdings {
    pub asset_balance: Decimal,
    pub quote_balance: Decimal,
    pub open_positions: usize,
}

/// Authoritative collection of positions.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PositionStore {
    /// In opening order
    positions: Vec<Position>,
    /// Last entry time per strategy, for the re-entry cooldown
    last_entry_at: BTreeMap<StrategyKind, DateTime<Utc>>,
}

impl PositionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn from_parts(
        positions: Vec<Position>,
        last_entry_at: BTreeMap<StrategyKind, DateTime<Utc>>,
    ) -> Self {
        Self {
            positions,
            last_entry_at,
        }
    }

    pub fn last_entry_at(&self) -> &BTreeMap<StrategyKind, DateTime<Utc>> {
        &self.last_entry_at
    }

    /// Pre-trade checks that depend on the strategy rather than on capital.
    pub fn check_entry_rules(&self, profile: &StrategyProfile, now: DateTime<Utc>) -> Admission {
        if !profile.enabled {
            return Admission::Denied {
                reason: format!("{} strategy is disabled", profile.kind),
            };
        }

        if let Some(last) = self.last_entry_at.get(&profile.kind) {
            let elapsed = now - *last;
            if elapsed < profile.min_reentry_interval {
                return Admission::Denied {
                    reason: format!(
                        "Too soon since last {} entry: {}s elapsed, {}s required",
                        profile.kind,
                        elapsed.num_seconds(),
                        profile.min_reentry_interval.num_seconds()
                    ),
                };
            }
        }

        Admission::Granted
    }

    /// Open a position. Admission is checked before anything is mutated.
    pub fn open(
        &mut self,
        budget: &mut BudgetLedger,
        catalog: &StrategyCatalog,
        emergency_active: bool,
        request: OpenRequest,
        now: DateTime<Utc>,
    ) -> LedgerResult<Position> {
        let profile = catalog.get(request.strategy);
        let (quantity_asset, quantity_quote) = request.quantities()?;
        let stop_price = compute_stop(request.entry_price, request.volatility, profile)?;

        self.check_entry_rules(profile, now).into_result()?;
        budget
            .can_allocate(profile, quantity_quote, emergency_active)
            .into_result()?;

        budget.commit(profile.kind, quantity_quote)?;

        let position = Position {
            id: Uuid::new_v4(),
            strategy: profile.kind,
            quantity_asset,
            quantity_quote,
            entry_price: request.entry_price,
            stop_price,
            volatility: request.volatility,
            status: PositionStatus::Open,
            opened_at: now,
            closed_at: None,
            exit_price: None,
            exit_reason: None,
            realized_pnl: Decimal::ZERO,
            realized_pnl_pct: None,
            unrealized_pnl: Decimal::ZERO,
            last_seen_price: request.entry_price,
            annotations: request.annotations,
        };

        self.last_entry_at.insert(profile.kind, now);
        self.positions.push(position.clone());

        info!(
            position_id = %position.id,
            strategy = %position.strategy,
            quantity_asset = %position.quantity_asset.round_dp(8),
            quantity_quote = %position.quantity_quote,
            entry = %position.entry_price,
            stop = %position.stop_price,
            volatility = %position.volatility,
            multiplier = %profile.volatility_multiplier,
            "Opened position"
        );

        Ok(position)
    }

    /// Mark every open position to `current_price` and re-evaluate the emergency latch.
    pub fn update_all(
        &mut self,
        current_price: Decimal,
        large_move_threshold: Decimal,
        budget: &BudgetLedger,
        emergency: &mut EmergencySupervisor,
        now: DateTime<Utc>,
    ) -> LedgerResult<MonitorResult> {
        if current_price <= Decimal::ZERO {
            return Err(LedgerError::InvalidInput(format!(
                "current price must be positive, got {current_price}"
            )));
        }

        if self.checked_valuation(current_price, budget).is_none() {
            return Err(LedgerError::overflow(&format!(
                "portfolio valuation at price {current_price}"
            )));
        }

        let mut updated_count = 0;
        let mut large_moves = Vec::new();

        for position in self.positions.iter_mut().filter(|p| p.is_open()) {
            let previous_price = position.last_seen_price;
            position.last_seen_price = current_price;
            position.unrealized_pnl = (current_price - position.entry_price) * position.quantity_asset;
            updated_count += 1;

            let move_pct = safe_div(current_price - previous_price, position.entry_price);
            if move_pct.abs() >= large_move_threshold {
                warn!(
                    position_id = %position.id,
                    strategy = %position.strategy,
                    from = %previous_price,
                    to = %current_price,
                    move_pct = %(move_pct * Decimal::ONE_HUNDRED).round_dp(2),
                    "Large move detected"
                );
                large_moves.push(LargeMove {
                    position_id: position.id,
                    strategy: position.strategy,
                    previous_price,
                    current_price,
                    move_pct,
                    unrealized_pnl: position.unrealized_pnl,
                });
            }
        }

        let snapshot = budget.snapshot(self.open_iter());
        let portfolio_pnl_pct = snapshot.portfolio_pnl_pct();

        emergency.record_value(snapshot.portfolio_value);
        let emergency_triggered = emergency.evaluate(portfolio_pnl_pct, now);
        let emergency_warning = emergency.warning_check(portfolio_pnl_pct);

        debug!(
            updated_count,
            portfolio_value = %snapshot.portfolio_value,
            pnl_pct = %(portfolio_pnl_pct * Decimal::ONE_HUNDRED).round_dp(2),
            "Positions marked to market"
        );

        Ok(MonitorResult {
            updated_count,
            total_unrealized_pnl: snapshot.unrealized_pnl,
            portfolio_value: snapshot.portfolio_value,
            portfolio_pnl_pct,
            large_moves,
            emergency_triggered,
            emergency_warning,
        })
    }

    /// Open positions whose stop is at or above `current_price`. Does not mutate.
    pub fn find_stop_triggered(&self, current_price: Decimal) -> Vec<Position> {
        self.open_iter()
            .filter(|p| p.is_stop_triggered(current_price))
            .inspect(|p| {
                warn!(
                    position_id = %p.id,
                    strategy = %p.strategy,
                    entry = %p.entry_price,
                    stop = %p.stop_price,
                    current = %current_price,
                    loss_pct = %(p.unrealized_pnl_pct() * Decimal::ONE_HUNDRED).round_dp(2),
                    "Stop-loss triggered"
                );
            })
            .cloned()
            .collect()
    }

    /// Exit a position at its stop (forced; ignores the hold window).
    pub fn trigger_stop(
        &mut self,
        budget: &mut BudgetLedger,
        position_id: Uuid,
        exit_price: Decimal,
        now: DateTime<Utc>,
    ) -> LedgerResult<ExecutionResult> {
        self.finalize(
            budget,
            position_id,
            exit_price,
            PositionStatus::StoppedOut,
            ExitReason::StopLoss,
            now,
        )
    }

    /// Close a position. Signal-driven reasons are refused inside the strategy's hold window.
    pub fn close(
        &mut self,
        budget: &mut BudgetLedger,
        catalog: &StrategyCatalog,
        position_id: Uuid,
        exit_price: Decimal,
        reason: ExitReason,
        now: DateTime<Utc>,
    ) -> LedgerResult<ExecutionResult> {
        if reason == ExitReason::StopLoss {
            return self.trigger_stop(budget, position_id, exit_price, now);
        }

        let position = self.get(position_id)?;
        position.ensure_open()?;

        let hold_remaining = position.hold_remaining(catalog.get(position.strategy).min_hold, now);
        if let Some(remaining) = hold_remaining {
            if reason.respects_min_hold() {
                return Err(LedgerError::HoldPeriodActive {
                    position_id,
                    remaining_secs: remaining.num_seconds(),
                });
            }
            warn!(
                %position_id,
                strategy = %position.strategy,
                %reason,
                remaining_secs = remaining.num_seconds(),
                "Closing inside minimum hold window"
            );
        }

        let mut result = self.finalize(
            budget,
            position_id,
            exit_price,
            PositionStatus::Closed,
            reason,
            now,
        )?;
        result.hold_remaining_secs = hold_remaining.map(|d| d.num_seconds());
        Ok(result)
    }

    /// Close every open position at `current_price` (emergency liquidation).
    pub fn close_all(
        &mut self,
        budget: &mut BudgetLedger,
        current_price: Decimal,
        now: DateTime<Utc>,
    ) -> LedgerResult<Vec<ExecutionResult>> {
        let ids: Vec<Uuid> = self.open_iter().map(|p| p.id).collect();

        let results = ids
            .into_iter()
            .map(|id| {
                self.finalize(
                    budget,
                    id,
                    current_price,
                    PositionStatus::Closed,
                    ExitReason::Emergency,
                    now,
                )
            })
            .collect::<LedgerResult<Vec<_>>>()?;

        warn!(closed = results.len(), price = %current_price, "Emergency close completed");
        Ok(results)
    }

    fn finalize(
        &mut self,
        budget: &mut BudgetLedger,
        position_id: Uuid,
        exit_price: Decimal,
        status: PositionStatus,
        reason: ExitReason,
        now: DateTime<Utc>,
    ) -> LedgerResult<ExecutionResult> {
        if exit_price <= Decimal::ZERO {
            return Err(LedgerError::InvalidInput(format!(
                "exit price must be positive, got {exit_price}"
            )));
        }

        let position = self
            .positions
            .iter_mut()
            .find(|p| p.id == position_id)
            .ok_or(LedgerError::PositionNotFound(position_id))?;
        position.ensure_open()?;

        let price_change = exit_price - position.entry_price;
        let realized_pnl = price_change
            .checked_mul(position.quantity_asset)
            .ok_or_else(|| LedgerError::overflow("realized P&L"))?;
        let realized_pnl_pct = price_change
            .checked_div(position.entry_price)
            .ok_or_else(|| LedgerError::overflow("realized P&L %"))?;
        let proceeds = position
            .quantity_asset
            .checked_mul(exit_price)
            .ok_or_else(|| LedgerError::overflow("exit proceeds"))?;

        budget.release(position.strategy, position.quantity_quote)?;
        budget.realize(realized_pnl)?;

        position.status = status;
        position.closed_at = Some(now);
        position.exit_price = Some(exit_price);
        position.exit_reason = Some(reason);
        position.last_seen_price = exit_price;
        position.realized_pnl = realized_pnl;
        position.realized_pnl_pct = Some(realized_pnl_pct);
        position.unrealized_pnl = Decimal::ZERO;

        info!(
            position_id = %position.id,
            strategy = %position.strategy,
            %status,
            %reason,
            exit = %exit_price,
            realized_pnl = %realized_pnl.round_dp(2),
            realized_pnl_pct = %(realized_pnl_pct * Decimal::ONE_HUNDRED).round_dp(2),
            capital_freed = %position.quantity_quote,
            "Position exited"
        );

        Ok(ExecutionResult {
            position_id,
            strategy: position.strategy,
            status,
            exit_reason: reason,
            exit_price,
            realized_pnl,
            realized_pnl_pct,
            capital_freed: position.quantity_quote,
            proceeds,
            hold_remaining_secs: None,
        })
    }

    /// Portfolio return if every open position were marked at `price`.
    /// `None` when any step of the valuation leaves the decimal range.
    fn checked_valuation(&self, price: Decimal, budget: &BudgetLedger) -> Option<Decimal> {
        let mut value = budget.available();
        let mut unrealized = Decimal::ZERO;

        for position in self.open_iter() {
            let change = price.checked_sub(position.entry_price)?;
            unrealized = unrealized.checked_add(change.checked_mul(position.quantity_asset)?)?;
            value = value.checked_add(position.quantity_asset.checked_mul(price)?)?;
            price
                .checked_sub(position.last_seen_price)?
                .checked_div(position.entry_price)?;
        }

        value
            .checked_sub(budget.initial_capital())?
            .checked_div(budget.initial_capital())
    }

    pub fn get(&self, position_id: Uuid) -> LedgerResult<&Position> {
        self.positions
            .iter()
            .find(|p| p.id == position_id)
            .ok_or(LedgerError::PositionNotFound(position_id))
    }

    pub fn all(&self) -> &[Position] {
        &self.positions
    }

    pub fn open_iter(&self) -> impl Iterator<Item = &Position> {
        self.positions.iter().filter(|p| p.is_open())
    }

    /// Positions with the given status (all when `None`), sorted by open time.
    pub fn by_status(&self, status: Option<PositionStatus>) -> Vec<Position> {
        let mut positions: Vec<Position> = self
            .positions
            .iter()
            .filter(|p| status.map_or(true, |s| p.status == s))
            .cloned()
            .collect();
        positions.sort_by_key(|p| p.opened_at);
        positions
    }

    pub fn holdings(&self, budget: &BudgetLedger) -> Holdings {
        Holdings {
            asset_balance: self.open_iter().map(|p| p.quantity_asset).sum(),
            quote_balance: budget.available(),
            open_positions: self.open_iter().count(),
        }
    }
}

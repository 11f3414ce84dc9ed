//! Thread-safe ledger facade.
//!
//! All mutable state (budget, positions, emergency latch) sits behind one
//! `RwLock`. Mutations hold the write lock for their full duration, including
//! the snapshot write, so admission checks and commits are atomic and readers
//! never observe intermediate state.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{Config, WritePolicy};
use crate::error::{LedgerError, LedgerResult};
use crate::persistence::{
    EquityRecord, Journal, JournalEventKind, LedgerSnapshot, PersistenceGateway,
};
use crate::risk::{
    compute_statistics, Admission, BudgetLedger, BudgetSnapshot, EmergencySupervisor,
    ExecutionResult, ExitReason, Holdings, MonitorResult, OpenRequest, PortfolioStatistics,
    Position, PositionStatus, PositionStore,
};
use crate::strategy::{StrategyCatalog, StrategyKind};

/// Everything a mutation may touch.
#[derive(Debug, Clone)]
struct LedgerState {
    budget: BudgetLedger,
    store: PositionStore,
    emergency: EmergencySupervisor,
}

impl LedgerState {
    fn fresh(config: &Config) -> Self {
        let ledger = &config.ledger;
        Self {
            budget: BudgetLedger::new(ledger.initial_capital, ledger.global_allocation_cap),
            store: PositionStore::new(),
            emergency: EmergencySupervisor::new(ledger.emergency_threshold, ledger.initial_capital),
        }
    }

    fn from_snapshot(snapshot: LedgerSnapshot, config: &Config) -> Self {
        let ledger = &config.ledger;

        if snapshot.initial_capital != ledger.initial_capital {
            warn!(
                stored = %snapshot.initial_capital,
                configured = %ledger.initial_capital,
                "Stored initial capital differs from configuration, keeping stored value"
            );
        }

        let committed = snapshot
            .committed_by_strategy
            .clone()
            .unwrap_or_else(|| snapshot.commitments_from_positions());
        let realized = snapshot
            .realized_pnl_total
            .unwrap_or_else(|| snapshot.realized_from_positions());

        let budget = BudgetLedger::from_parts(
            snapshot.initial_capital,
            ledger.global_allocation_cap,
            committed,
            realized,
        );
        let store = PositionStore::from_parts(snapshot.positions, snapshot.last_entry_at);
        let portfolio_value = budget.snapshot(store.open_iter()).portfolio_value;
        let emergency = EmergencySupervisor::restore(
            ledger.emergency_threshold,
            portfolio_value,
            snapshot.emergency_active,
            snapshot.emergency_audit,
        );

        Self {
            budget,
            store,
            emergency,
        }
    }

    fn to_snapshot(&self) -> LedgerSnapshot {
        LedgerSnapshot {
            initial_capital: self.budget.initial_capital(),
            emergency_active: self.emergency.is_active(),
            emergency_audit: self.emergency.audit().clone(),
            committed_by_strategy: Some(self.budget.committed_by_strategy().clone()),
            realized_pnl_total: Some(self.budget.realized_pnl_total()),
            last_entry_at: self.store.last_entry_at().clone(),
            positions: self.store.all().to_vec(),
        }
    }

    fn budget_snapshot(&self) -> BudgetSnapshot {
        self.budget.snapshot(self.store.open_iter())
    }
}

/// Single point of entry for allocation, position lifecycle and monitoring.
///
/// Construct once and share with `Arc`.
pub struct Ledger {
    catalog: StrategyCatalog,
    large_move_threshold: Decimal,
    write_policy: WritePolicy,
    state: RwLock<LedgerState>,
    gateway: PersistenceGateway,
    journal: Option<Mutex<Journal>>,
}

impl Ledger {
    /// Open the ledger described by `config`, restoring the persisted snapshot.
    ///
    /// A corrupt snapshot is fatal. An unavailable journal is not.
    pub fn open(config: &Config) -> LedgerResult<Self> {
        let gateway = PersistenceGateway::new(&config.ledger.state_file).with_retries(
            config.ledger.save_retries,
            Duration::from_millis(config.ledger.save_retry_backoff_ms),
        );

        let journal = if config.journal.enabled {
            match Journal::open(&config.journal.path) {
                Ok(journal) => Some(journal),
                Err(e) => {
                    warn!(error = %e, "Audit journal unavailable, continuing without it");
                    None
                }
            }
        } else {
            None
        };

        Self::with_gateway(config, gateway, journal)
    }

    /// Build a ledger on an explicit gateway and optional journal.
    pub fn with_gateway(
        config: &Config,
        gateway: PersistenceGateway,
        journal: Option<Journal>,
    ) -> LedgerResult<Self> {
        let state = match gateway.load()? {
            Some(snapshot) => LedgerState::from_snapshot(snapshot, config),
            None => LedgerState::fresh(config),
        };

        let snapshot = state.budget_snapshot();
        info!(
            initial_capital = %snapshot.initial_capital,
            allocated = %snapshot.allocated,
            available = %snapshot.available,
            open_positions = state.store.open_iter().count(),
            emergency = state.emergency.is_active(),
            write_policy = ?config.ledger.write_policy,
            "Ledger ready"
        );

        Ok(Self {
            catalog: StrategyCatalog::from_config(&config.strategies),
            large_move_threshold: config.ledger.large_move_threshold,
            write_policy: config.ledger.write_policy,
            state: RwLock::new(state),
            gateway,
            journal: journal.map(Mutex::new),
        })
    }

    pub fn catalog(&self) -> &StrategyCatalog {
        &self.catalog
    }

    /// Run `op` against a copy of the state, persist the copy, then publish it.
    fn mutate<T>(&self, op: impl FnOnce(&mut LedgerState) -> LedgerResult<T>) -> LedgerResult<T> {
        let mut guard = self.state.write();
        let mut next = guard.clone();
        let out = op(&mut next)?;

        if let Err(e) = self.gateway.save(&next.to_snapshot()) {
            match self.write_policy {
                WritePolicy::WriteThrough => {
                    error!(error = %e, "Snapshot not persisted, mutation discarded");
                    return Err(e.into());
                }
                WritePolicy::BestEffort => {
                    error!(error = %e, "Snapshot not persisted, keeping in-memory mutation");
                }
            }
        }

        *guard = next;
        Ok(out)
    }

    fn journal_event(
        &self,
        at: DateTime<Utc>,
        kind: JournalEventKind,
        position_id: Option<Uuid>,
        strategy: Option<StrategyKind>,
        details: serde_json::Value,
    ) {
        if let Some(journal) = &self.journal {
            if let Err(e) = journal
                .lock()
                .record_event(at, kind, position_id, strategy, &details)
            {
                warn!(%kind, error = %e, "Failed to journal event");
            }
        }
    }

    fn journal_exit(&self, at: DateTime<Utc>, result: &ExecutionResult) {
        let kind = match result.status {
            PositionStatus::StoppedOut => JournalEventKind::StopTriggered,
            _ => JournalEventKind::PositionClosed,
        };
        self.journal_event(
            at,
            kind,
            Some(result.position_id),
            Some(result.strategy),
            json!({
                "exit_reason": result.exit_reason,
                "exit_price": result.exit_price,
                "realized_pnl": result.realized_pnl,
                "realized_pnl_pct": result.realized_pnl_pct,
                "capital_freed": result.capital_freed,
                "hold_remaining_secs": result.hold_remaining_secs,
            }),
        );
    }

    fn log_rejection(err: &LedgerError) {
        if err.is_business_rejection() {
            info!(reason = %err, "Request rejected");
        }
    }

    // ==================== Admission ====================

    /// Capital-only admission check. Never mutates.
    pub fn can_allocate(&self, strategy: StrategyKind, amount_quote: Decimal) -> Admission {
        let state = self.state.read();
        state.budget.can_allocate(
            self.catalog.get(strategy),
            amount_quote,
            state.emergency.is_active(),
        )
    }

    /// Full pre-trade check: strategy enabled, re-entry cooldown, then capital.
    pub fn can_open(
        &self,
        strategy: StrategyKind,
        amount_quote: Decimal,
        now: DateTime<Utc>,
    ) -> Admission {
        let state = self.state.read();
        let profile = self.catalog.get(strategy);

        match state.store.check_entry_rules(profile, now) {
            Admission::Granted => {
                state
                    .budget
                    .can_allocate(profile, amount_quote, state.emergency.is_active())
            }
            denied => denied,
        }
    }

    // ==================== Position lifecycle ====================

    pub fn open_position(&self, request: OpenRequest) -> LedgerResult<Position> {
        self.open_position_at(request, Utc::now())
    }

    /// Open a position as of `now`. A rejected request changes nothing.
    pub fn open_position_at(&self, request: OpenRequest, now: DateTime<Utc>) -> LedgerResult<Position> {
        let position = self
            .mutate(|state| {
                let emergency_active = state.emergency.is_active();
                state
                    .store
                    .open(&mut state.budget, &self.catalog, emergency_active, request, now)
            })
            .inspect_err(Self::log_rejection)?;

        self.journal_event(
            now,
            JournalEventKind::PositionOpened,
            Some(position.id),
            Some(position.strategy),
            json!({
                "entry_price": position.entry_price,
                "stop_price": position.stop_price,
                "quantity_asset": position.quantity_asset,
                "quantity_quote": position.quantity_quote,
                "volatility": position.volatility,
                "annotations": position.annotations,
            }),
        );

        Ok(position)
    }

    /// Mark all open positions to `current_price` and re-evaluate the emergency latch.
    pub fn update_all(&self, current_price: Decimal) -> LedgerResult<MonitorResult> {
        let now = Utc::now();
        let (result, budget) = self.mutate(|state| {
            let result = state.store.update_all(
                current_price,
                self.large_move_threshold,
                &state.budget,
                &mut state.emergency,
                now,
            )?;
            Ok((result, state.budget_snapshot()))
        })?;

        if result.emergency_triggered {
            self.journal_event(
                now,
                JournalEventKind::EmergencyLatched,
                None,
                None,
                json!({
                    "portfolio_pnl_pct": result.portfolio_pnl_pct,
                    "portfolio_value": result.portfolio_value,
                    "price": current_price,
                }),
            );
        } else if result.emergency_warning {
            warn!(
                pnl_pct = %(result.portfolio_pnl_pct * Decimal::ONE_HUNDRED).round_dp(2),
                "Portfolio approaching emergency threshold"
            );
        }

        if let Some(journal) = &self.journal {
            let record = EquityRecord {
                timestamp: now,
                portfolio_value: budget.portfolio_value,
                allocated: budget.allocated,
                available: budget.available,
                unrealized_pnl: budget.unrealized_pnl,
                realized_pnl: budget.realized_pnl,
                open_positions: result.updated_count,
                emergency_active: self.is_emergency_active(),
            };
            if let Err(e) = journal.lock().record_equity(&record) {
                warn!(error = %e, "Failed to journal equity snapshot");
            }
        }

        Ok(result)
    }

    /// Open positions whose stop has been reached at `current_price`.
    pub fn find_stop_triggered(&self, current_price: Decimal) -> Vec<Position> {
        self.state.read().store.find_stop_triggered(current_price)
    }

    /// Exit a position at `exit_price` as stopped out. Fails on a terminal position.
    pub fn trigger_stop(&self, position_id: Uuid, exit_price: Decimal) -> LedgerResult<ExecutionResult> {
        let now = Utc::now();
        let result = self.mutate(|state| {
            state
                .store
                .trigger_stop(&mut state.budget, position_id, exit_price, now)
        })?;

        self.journal_exit(now, &result);
        Ok(result)
    }

    pub fn close_position(
        &self,
        position_id: Uuid,
        exit_price: Decimal,
        reason: ExitReason,
    ) -> LedgerResult<ExecutionResult> {
        self.close_position_at(position_id, exit_price, reason, Utc::now())
    }

    /// Close a position as of `now`. Signal-driven reasons respect the minimum hold.
    pub fn close_position_at(
        &self,
        position_id: Uuid,
        exit_price: Decimal,
        reason: ExitReason,
        now: DateTime<Utc>,
    ) -> LedgerResult<ExecutionResult> {
        let result = self
            .mutate(|state| {
                state.store.close(
                    &mut state.budget,
                    &self.catalog,
                    position_id,
                    exit_price,
                    reason,
                    now,
                )
            })
            .inspect_err(Self::log_rejection)?;

        self.journal_exit(now, &result);
        Ok(result)
    }

    /// Close every open position at `current_price`.
    pub fn close_all(&self, current_price: Decimal) -> LedgerResult<Vec<ExecutionResult>> {
        let now = Utc::now();
        if !self.is_emergency_active() {
            warn!("Closing all positions while emergency mode is not active");
        }

        let results = self.mutate(|state| {
            state.store.close_all(&mut state.budget, current_price, now)
        })?;

        for result in &results {
            self.journal_exit(now, result);
        }
        Ok(results)
    }

    /// Operator action: release the emergency latch. Returns false if it was not set.
    pub fn clear_emergency(&self, operator: &str, note: &str) -> LedgerResult<bool> {
        if operator.trim().is_empty() {
            return Err(LedgerError::InvalidInput(
                "clearing emergency mode requires an operator name".into(),
            ));
        }

        let now = Utc::now();
        let cleared = self.mutate(|state| Ok(state.emergency.clear(operator, note, now)))?;

        if cleared {
            self.journal_event(
                now,
                JournalEventKind::EmergencyCleared,
                None,
                None,
                json!({ "operator": operator, "note": note }),
            );
        } else {
            debug!(%operator, "Emergency mode was not active, nothing to clear");
        }
        Ok(cleared)
    }

    // ==================== Queries ====================

    pub fn is_emergency_active(&self) -> bool {
        self.state.read().emergency.is_active()
    }

    pub fn budget_snapshot(&self) -> BudgetSnapshot {
        self.state.read().budget_snapshot()
    }

    pub fn statistics(&self) -> PortfolioStatistics {
        let state = self.state.read();
        compute_statistics(
            state.store.all(),
            state.budget_snapshot(),
            state.emergency.drawdown_stats(),
            state.emergency.is_active(),
        )
    }

    pub fn holdings(&self) -> Holdings {
        let state = self.state.read();
        state.store.holdings(&state.budget)
    }

    pub fn position(&self, position_id: Uuid) -> LedgerResult<Position> {
        self.state.read().store.get(position_id).cloned()
    }

    /// Positions with the given status (all when `None`), oldest first.
    pub fn positions(&self, status: Option<PositionStatus>) -> Vec<Position> {
        self.state.read().store.by_status(status)
    }

    pub fn open_positions(&self) -> Vec<Position> {
        self.positions(Some(PositionStatus::Open))
    }

    /// Full state as it would be persisted.
    pub fn export_state(&self) -> LedgerSnapshot {
        self.state.read().to_snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn test_config() -> Config {
        let mut config = Config::default();
        config.ledger.save_retry_backoff_ms = 0;
        config.journal.enabled = false;
        config
    }

    fn ledger_in(dir: &TempDir, config: &Config) -> Ledger {
        let gateway = PersistenceGateway::new(dir.path().join("positions.json"))
            .with_retries(1, Duration::ZERO);
        let journal = Journal::open(":memory:").unwrap();
        Ledger::with_gateway(config, gateway, Some(journal)).unwrap()
    }

    fn approx(actual: Decimal, expected: Decimal) -> bool {
        (actual - expected).abs() < dec!(0.01)
    }

    #[test]
    fn test_dca_stop_scenario() {
        let dir = TempDir::new().unwrap();
        let ledger = ledger_in(&dir, &test_config());

        let position = ledger
            .open_position(OpenRequest::quote(
                StrategyKind::Dca,
                dec!(60000),
                dec!(500),
                dec!(850),
            ))
            .unwrap();
        assert_eq!(position.stop_price, dec!(58300));

        let budget = ledger.budget_snapshot();
        assert_eq!(budget.strategy(StrategyKind::Dca).unwrap().allocated, dec!(500));
        assert_eq!(budget.available, dec!(9500));

        ledger.update_all(dec!(58000)).unwrap();
        let triggered = ledger.find_stop_triggered(dec!(58000));
        assert_eq!(triggered.len(), 1);
        assert_eq!(triggered[0].id, position.id);

        let result = ledger.trigger_stop(position.id, dec!(58000)).unwrap();
        assert!(approx(result.realized_pnl, dec!(-16.67)));
        assert_eq!(result.capital_freed, dec!(500));
        assert_eq!(result.status, PositionStatus::StoppedOut);

        let budget = ledger.budget_snapshot();
        assert_eq!(budget.allocated, Decimal::ZERO);
        assert!(approx(budget.available, dec!(9983.33)));

        // Second trigger fails and does not double-release
        let err = ledger.trigger_stop(position.id, dec!(58000)).unwrap_err();
        assert!(matches!(err, LedgerError::InvalidState { .. }));
        assert_eq!(ledger.budget_snapshot(), budget);
    }

    #[test]
    fn test_rejected_open_changes_nothing() {
        let dir = TempDir::new().unwrap();
        let ledger = ledger_in(&dir, &test_config());

        // SWING may hold 30% of 10000
        let err = ledger
            .open_position(OpenRequest::quote(
                StrategyKind::Swing,
                dec!(100),
                dec!(3500),
                dec!(1),
            ))
            .unwrap_err();
        assert!(err.is_business_rejection());
        assert!(ledger.positions(None).is_empty());
        assert_eq!(ledger.budget_snapshot().allocated, Decimal::ZERO);
        assert!(!dir.path().join("positions.json").exists());
    }

    #[test]
    fn test_emergency_latch_blocks_opens_until_cleared() {
        let dir = TempDir::new().unwrap();
        let config = test_config();
        let ledger = ledger_in(&dir, &config);

        ledger
            .open_position(OpenRequest::quote(
                StrategyKind::Dca,
                dec!(100),
                dec!(5000),
                dec!(1),
            ))
            .unwrap();

        // 5000 cash + 50 units at 48 = 7400 -> -26%
        let result = ledger.update_all(dec!(48)).unwrap();
        assert_eq!(result.portfolio_pnl_pct, dec!(-0.26));
        assert!(result.emergency_triggered);
        assert!(ledger.is_emergency_active());

        let request = OpenRequest::quote(StrategyKind::Swing, dec!(48), dec!(100), dec!(1));
        let err = ledger.open_position(request.clone()).unwrap_err();
        assert!(matches!(err, LedgerError::AllocationDenied { .. }));
        assert!(!ledger.can_allocate(StrategyKind::Swing, dec!(1)).is_granted());

        // Price recovery does not clear the latch
        let result = ledger.update_all(dec!(100)).unwrap();
        assert!(!result.emergency_triggered);
        assert!(ledger.is_emergency_active());

        // Latch survives a restart
        drop(ledger);
        let ledger = ledger_in(&dir, &config);
        assert!(ledger.is_emergency_active());

        assert!(ledger.clear_emergency("", "no operator").is_err());
        assert!(ledger.clear_emergency("alice", "positions reviewed").unwrap());
        assert!(!ledger.clear_emergency("alice", "again").unwrap());
        assert_eq!(
            ledger.export_state().emergency_audit.cleared_by.as_deref(),
            Some("alice")
        );
        assert!(ledger.open_position(request).is_ok());
    }

    #[test]
    fn test_close_all_releases_everything() {
        let dir = TempDir::new().unwrap();
        let ledger = ledger_in(&dir, &test_config());

        for amount in [dec!(1000), dec!(500)] {
            ledger
                .open_position(OpenRequest::quote(
                    StrategyKind::Swing,
                    dec!(100),
                    amount,
                    dec!(1),
                ))
                .unwrap();
        }

        let results = ledger.close_all(dec!(90)).unwrap();
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.exit_reason == ExitReason::Emergency));
        assert!(ledger.open_positions().is_empty());

        let budget = ledger.budget_snapshot();
        assert_eq!(budget.allocated, Decimal::ZERO);
        assert_eq!(budget.realized_pnl, dec!(-150));
        assert_eq!(budget.available, dec!(9850));
    }

    #[test]
    fn test_hold_period_and_cooldown() {
        let dir = TempDir::new().unwrap();
        let ledger = ledger_in(&dir, &test_config());
        let t0 = Utc::now();

        let position = ledger
            .open_position_at(
                OpenRequest::quote(StrategyKind::Dca, dec!(100), dec!(200), dec!(1)),
                t0,
            )
            .unwrap();

        // DCA re-entry cooldown is one hour
        let soon = t0 + chrono::Duration::minutes(10);
        assert!(!ledger.can_open(StrategyKind::Dca, dec!(200), soon).is_granted());
        assert!(ledger
            .can_open(StrategyKind::Dca, dec!(200), t0 + chrono::Duration::hours(2))
            .is_granted());

        // DAY is disabled by default
        let day = ledger.can_open(StrategyKind::Day, dec!(100), soon);
        assert!(day.reason().contains("disabled"));

        // DCA minimum hold is one day
        let err = ledger
            .close_position_at(position.id, dec!(110), ExitReason::TakeProfit, soon)
            .unwrap_err();
        assert!(matches!(err, LedgerError::HoldPeriodActive { .. }));

        let result = ledger
            .close_position_at(
                position.id,
                dec!(110),
                ExitReason::TakeProfit,
                t0 + chrono::Duration::days(2),
            )
            .unwrap();
        assert_eq!(result.realized_pnl, dec!(20));
        assert_eq!(result.proceeds, dec!(220));

        // An operator can always exit by hand; the hold window is only reported
        let swing = ledger
            .open_position_at(
                OpenRequest::quote(StrategyKind::Swing, dec!(100), dec!(300), dec!(1)),
                t0,
            )
            .unwrap();
        let manual = ledger
            .close_position_at(swing.id, dec!(101), ExitReason::Manual, soon)
            .unwrap();
        assert_eq!(manual.status, PositionStatus::Closed);
        assert_eq!(manual.hold_remaining_secs, Some(50 * 60));
    }

    #[test]
    fn test_oversized_open_is_invalid_input() {
        let dir = TempDir::new().unwrap();
        let ledger = ledger_in(&dir, &test_config());

        let err = ledger
            .open_position(OpenRequest::asset(
                StrategyKind::Swing,
                dec!(1000000000000000),
                dec!(1000000000000000),
                dec!(1),
            ))
            .unwrap_err();
        assert!(matches!(err, LedgerError::InvalidInput(_)));
        assert!(ledger.positions(None).is_empty());

        // The ledger stays usable afterwards
        assert!(ledger
            .open_position(OpenRequest::quote(StrategyKind::Swing, dec!(100), dec!(300), dec!(1)))
            .is_ok());
    }

    #[test]
    fn test_reload_matches_exported_state() {
        let dir = TempDir::new().unwrap();
        let config = test_config();
        let ledger = ledger_in(&dir, &config);

        let kept = ledger
            .open_position(
                OpenRequest::asset(StrategyKind::Swing, dec!(60000), dec!(0.02), dec!(850))
                    .with_annotation("confidence", 0.72),
            )
            .unwrap();
        let stopped = ledger
            .open_position(OpenRequest::quote(
                StrategyKind::Dca,
                dec!(60000),
                dec!(500),
                dec!(850),
            ))
            .unwrap();
        ledger.update_all(dec!(58000)).unwrap();
        ledger.trigger_stop(stopped.id, dec!(58000)).unwrap();

        let before = ledger.export_state();
        drop(ledger);

        let reloaded = ledger_in(&dir, &config);
        assert_eq!(reloaded.export_state(), before);

        let position = reloaded.position(kept.id).unwrap();
        assert_eq!(position.quantity_quote, dec!(1200));
        assert_eq!(position.last_seen_price, dec!(58000));
        assert_eq!(position.annotations["confidence"], 0.72);
        assert_eq!(reloaded.positions(Some(PositionStatus::StoppedOut)).len(), 1);
    }

    #[test]
    fn test_write_through_discards_unpersisted_mutation() {
        let dir = TempDir::new().unwrap();
        let config = test_config();
        let gateway = PersistenceGateway::new(dir.path().join("state").join("positions.json"))
            .with_retries(2, Duration::ZERO);
        let ledger = Ledger::with_gateway(&config, gateway, None).unwrap();

        // A file where the state directory should be makes every write fail
        std::fs::write(dir.path().join("state"), "blocked").unwrap();

        let err = ledger
            .open_position(OpenRequest::quote(
                StrategyKind::Swing,
                dec!(100),
                dec!(500),
                dec!(1),
            ))
            .unwrap_err();
        assert!(matches!(err, LedgerError::Persistence(_)));
        assert!(ledger.positions(None).is_empty());
        assert_eq!(ledger.budget_snapshot().allocated, Decimal::ZERO);
    }

    #[test]
    fn test_best_effort_keeps_unpersisted_mutation() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config();
        config.ledger.write_policy = WritePolicy::BestEffort;
        let gateway = PersistenceGateway::new(dir.path().join("state").join("positions.json"))
            .with_retries(1, Duration::ZERO);
        let ledger = Ledger::with_gateway(&config, gateway, None).unwrap();

        std::fs::write(dir.path().join("state"), "blocked").unwrap();

        ledger
            .open_position(OpenRequest::quote(
                StrategyKind::Swing,
                dec!(100),
                dec!(500),
                dec!(1),
            ))
            .unwrap();
        assert_eq!(ledger.open_positions().len(), 1);
        assert_eq!(ledger.budget_snapshot().allocated, dec!(500));
    }

    #[test]
    fn test_concurrent_opens_respect_strategy_cap() {
        let dir = TempDir::new().unwrap();
        let ledger = Arc::new(ledger_in(&dir, &test_config()));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ledger = Arc::clone(&ledger);
                std::thread::spawn(move || {
                    (0..5)
                        .filter(|_| {
                            ledger
                                .open_position(OpenRequest::quote(
                                    StrategyKind::Swing,
                                    dec!(100),
                                    dec!(400),
                                    dec!(1),
                                ))
                                .is_ok()
                        })
                        .count()
                })
            })
            .collect();

        let opened: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();

        // 3000 SWING limit / 400 per position
        assert_eq!(opened, 7);
        assert_eq!(
            ledger.budget_snapshot().strategy(StrategyKind::Swing).unwrap().allocated,
            dec!(2800)
        );
    }

    #[test]
    fn test_statistics_and_holdings() {
        let dir = TempDir::new().unwrap();
        let ledger = ledger_in(&dir, &test_config());

        ledger
            .open_position(OpenRequest::asset(StrategyKind::Swing, dec!(100), dec!(5), dec!(1)))
            .unwrap();
        let loser = ledger
            .open_position(OpenRequest::asset(StrategyKind::Dca, dec!(100), dec!(2), dec!(1)))
            .unwrap();
        ledger.trigger_stop(loser.id, dec!(98)).unwrap();
        ledger.update_all(dec!(110)).unwrap();

        let holdings = ledger.holdings();
        assert_eq!(holdings.asset_balance, dec!(5));
        assert_eq!(holdings.open_positions, 1);
        assert_eq!(holdings.quote_balance, dec!(9496));

        let stats = ledger.statistics();
        assert_eq!(stats.total_positions, 2);
        assert_eq!(stats.stopped_positions, 1);
        assert_eq!(stats.total_unrealized_pnl, dec!(50));
        assert_eq!(stats.total_realized_pnl, dec!(-4));
        assert_eq!(stats.budget.portfolio_value, dec!(10046));
    }

    #[derive(Debug, Clone)]
    enum Op {
        Open { kind: usize, amount: u32 },
        Close { index: usize, price: u32 },
        Stop { index: usize },
        Tick { price: u32 },
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0usize..3, 1u32..4000).prop_map(|(kind, amount)| Op::Open { kind, amount }),
            (0usize..16, 50u32..200).prop_map(|(index, price)| Op::Close { index, price }),
            (0usize..16).prop_map(|index| Op::Stop { index }),
            (50u32..200).prop_map(|price| Op::Tick { price }),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn prop_commitments_stay_within_caps(ops in prop::collection::vec(op_strategy(), 1..20)) {
            let dir = TempDir::new().unwrap();
            let ledger = ledger_in(&dir, &test_config());
            let mut now = Utc::now();

            for op in ops {
                now += chrono::Duration::hours(2);
                let ids: Vec<Uuid> = ledger.positions(None).iter().map(|p| p.id).collect();

                // Business rejections and terminal-position errors are valid outcomes
                let _ = match op {
                    Op::Open { kind, amount } => ledger
                        .open_position_at(
                            OpenRequest::quote(
                                StrategyKind::ALL[kind],
                                dec!(100),
                                Decimal::from(amount),
                                dec!(5),
                            ),
                            now,
                        )
                        .map(|_| ()),
                    Op::Close { index, price } => match ids.get(index) {
                        Some(id) => ledger
                            .close_position_at(*id, Decimal::from(price), ExitReason::Manual, now)
                            .map(|_| ()),
                        None => Ok(()),
                    },
                    Op::Stop { index } => match ids.get(index) {
                        Some(id) => ledger.trigger_stop(*id, dec!(90)).map(|_| ()),
                        None => Ok(()),
                    },
                    Op::Tick { price } => ledger.update_all(Decimal::from(price)).map(|_| ()),
                };

                let budget = ledger.budget_snapshot();
                prop_assert!(budget.allocated <= dec!(9500));
                for profile in ledger.catalog().iter() {
                    let allocated = budget.strategy(profile.kind).unwrap().allocated;
                    prop_assert!(allocated <= dec!(10000) * profile.allocation_limit);

                    let open_sum: Decimal = ledger
                        .open_positions()
                        .iter()
                        .filter(|p| p.strategy == profile.kind)
                        .map(|p| p.quantity_quote)
                        .sum();
                    prop_assert_eq!(allocated, open_sum);
                }
            }
        }
    }
}

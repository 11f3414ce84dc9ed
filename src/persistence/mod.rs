//! Durable ledger state.
//!
//! - `PersistenceGateway`: versioned JSON snapshot, written atomically
//!   (temp file in the same directory, then rename over the target)
//! - `Journal`: append-only SQLite audit trail of ledger events

mod journal;

pub use journal::{EquityRecord, Journal, JournalEvent, JournalEventKind};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::NamedTempFile;
use tracing::{debug, error, info, warn};

use crate::error::{LedgerError, LedgerResult, PersistenceError};
use crate::risk::{EmergencyAudit, Position};
use crate::strategy::StrategyKind;

/// Snapshot schema written by this build.
pub const SCHEMA_VERSION: u32 = 1;

/// Commitment totals may differ from the position sum only by rounding.
const COMMITMENT_TOLERANCE: Decimal = dec!(0.00000001);

/// Full persisted ledger state.
///
/// Every field but `initial_capital` has a default so older documents load;
/// unknown fields are ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    pub initial_capital: Decimal,
    #[serde(default)]
    pub emergency_active: bool,
    #[serde(default)]
    pub emergency_audit: EmergencyAudit,
    /// Rebuilt from open positions when absent
    #[serde(default)]
    pub committed_by_strategy: Option<BTreeMap<StrategyKind, Decimal>>,
    /// Rebuilt from terminal positions when absent
    #[serde(default)]
    pub realized_pnl_total: Option<Decimal>,
    #[serde(default)]
    pub last_entry_at: BTreeMap<StrategyKind, DateTime<Utc>>,
    #[serde(default)]
    pub positions: Vec<Position>,
}

impl LedgerSnapshot {
    /// Empty state for a fresh ledger.
    pub fn empty(initial_capital: Decimal) -> Self {
        Self {
            initial_capital,
            emergency_active: false,
            emergency_audit: EmergencyAudit::default(),
            committed_by_strategy: Some(BTreeMap::new()),
            realized_pnl_total: Some(Decimal::ZERO),
            last_entry_at: BTreeMap::new(),
            positions: Vec::new(),
        }
    }

    /// Commitments implied by the open positions.
    pub fn commitments_from_positions(&self) -> BTreeMap<StrategyKind, Decimal> {
        let mut committed = BTreeMap::new();
        for position in self.positions.iter().filter(|p| p.is_open()) {
            *committed.entry(position.strategy).or_insert(Decimal::ZERO) += position.quantity_quote;
        }
        committed
    }

    /// Realized P&L implied by the terminal positions.
    pub fn realized_from_positions(&self) -> Decimal {
        self.positions
            .iter()
            .filter(|p| !p.is_open())
            .map(|p| p.realized_pnl)
            .sum()
    }

    /// Structural checks; a failure means the document cannot be trusted.
    pub fn validate(&self) -> Result<(), String> {
        if self.initial_capital <= Decimal::ZERO {
            return Err(format!("initial_capital must be positive, got {}", self.initial_capital));
        }

        let mut seen = HashSet::new();
        for p in &self.positions {
            if !seen.insert(p.id) {
                return Err(format!("duplicate position id {}", p.id));
            }
            if p.quantity_asset <= Decimal::ZERO
                || p.quantity_quote <= Decimal::ZERO
                || p.entry_price <= Decimal::ZERO
            {
                return Err(format!("position {} has non-positive size or price", p.id));
            }
            if p.is_open() && (p.closed_at.is_some() || p.exit_price.is_some()) {
                return Err(format!("open position {} carries exit fields", p.id));
            }
            if !p.is_open() && (p.closed_at.is_none() || p.exit_price.is_none()) {
                return Err(format!("{} position {} is missing exit fields", p.status, p.id));
            }
        }

        if let Some(stored) = &self.committed_by_strategy {
            let derived = self.commitments_from_positions();
            for kind in StrategyKind::ALL {
                let a = stored.get(&kind).copied().unwrap_or(Decimal::ZERO);
                let b = derived.get(&kind).copied().unwrap_or(Decimal::ZERO);
                if (a - b).abs() > COMMITMENT_TOLERANCE {
                    return Err(format!(
                        "{kind} commitment {a} does not match open positions ({b})"
                    ));
                }
            }
        }

        Ok(())
    }
}

#[derive(Serialize)]
struct DocumentOut<'a> {
    schema_version: u32,
    saved_at: DateTime<Utc>,
    #[serde(flatten)]
    state: &'a LedgerSnapshot,
}

#[derive(Deserialize)]
struct DocumentIn {
    /// 0 for documents written before versioning
    #[serde(default)]
    schema_version: u32,
    #[serde(default)]
    saved_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    state: LedgerSnapshot,
}

/// File-backed snapshot store.
#[derive(Debug, Clone)]
pub struct PersistenceGateway {
    path: PathBuf,
    max_attempts: u32,
    backoff: Duration,
}

impl PersistenceGateway {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            max_attempts: 3,
            backoff: Duration::from_millis(50),
        }
    }

    /// Configure retry of transient write failures.
    pub fn with_retries(mut self, max_attempts: u32, backoff: Duration) -> Self {
        self.max_attempts = max_attempts.max(1);
        self.backoff = backoff;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Write the snapshot, retrying I/O failures with linear backoff.
    pub fn save(&self, snapshot: &LedgerSnapshot) -> Result<(), PersistenceError> {
        let document = DocumentOut {
            schema_version: SCHEMA_VERSION,
            saved_at: Utc::now(),
            state: snapshot,
        };
        let bytes = serde_json::to_vec_pretty(&document)?;

        let mut attempt = 1;
        loop {
            match self.write_atomic(&bytes) {
                Ok(()) => {
                    debug!(
                        path = %self.path.display(),
                        positions = snapshot.positions.len(),
                        emergency = snapshot.emergency_active,
                        "Snapshot saved"
                    );
                    return Ok(());
                }
                Err(e) if attempt < self.max_attempts => {
                    warn!(
                        path = %self.path.display(),
                        attempt,
                        error = %e,
                        "Snapshot write failed, retrying"
                    );
                    std::thread::sleep(self.backoff * attempt);
                    attempt += 1;
                }
                Err(e) => {
                    error!(
                        path = %self.path.display(),
                        attempts = attempt,
                        error = %e,
                        "Snapshot write failed"
                    );
                    return Err(e.into());
                }
            }
        }
    }

    fn write_atomic(&self, bytes: &[u8]) -> std::io::Result<()> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        fs::create_dir_all(dir)?;

        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(bytes)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| e.error)?;
        Ok(())
    }

    /// Load the snapshot. `Ok(None)` when no file exists yet.
    ///
    /// An unreadable or inconsistent document is `CorruptPersistence`, never
    /// silently replaced.
    pub fn load(&self) -> LedgerResult<Option<LedgerSnapshot>> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                info!(path = %self.path.display(), "No snapshot found, starting fresh");
                return Ok(None);
            }
            Err(e) => return Err(PersistenceError::from(e).into()),
        };

        let document: DocumentIn =
            serde_json::from_slice(&bytes).map_err(|e| self.corrupt(e.to_string()))?;

        if document.schema_version > SCHEMA_VERSION {
            return Err(self.corrupt(format!(
                "schema version {} is newer than supported version {}",
                document.schema_version, SCHEMA_VERSION
            )));
        }

        document.state.validate().map_err(|reason| self.corrupt(reason))?;

        info!(
            path = %self.path.display(),
            schema_version = document.schema_version,
            positions = document.state.positions.len(),
            emergency = document.state.emergency_active,
            saved_at = ?document.saved_at,
            "Loaded snapshot"
        );

        Ok(Some(document.state))
    }

    fn corrupt(&self, reason: String) -> LedgerError {
        error!(path = %self.path.display(), %reason, "Snapshot is corrupt");
        LedgerError::CorruptPersistence {
            path: self.path.clone(),
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::risk::{ExitReason, PositionStatus};
    use tempfile::TempDir;
    use uuid::Uuid;

    fn temp_gateway() -> (TempDir, PersistenceGateway) {
        let dir = TempDir::new().unwrap();
        let gateway = PersistenceGateway::new(dir.path().join("positions.json"));
        (dir, gateway)
    }

    fn position(status: PositionStatus) -> Position {
        let now = Utc::now();
        let terminal = status != PositionStatus::Open;
        Position {
            id: Uuid::new_v4(),
            strategy: StrategyKind::Swing,
            quantity_asset: dec!(0.02),
            quantity_quote: dec!(1200),
            entry_price: dec!(60000),
            stop_price: dec!(58725),
            volatility: dec!(850),
            status,
            opened_at: now,
            closed_at: terminal.then_some(now),
            exit_price: terminal.then_some(dec!(59000)),
            exit_reason: terminal.then_some(ExitReason::StopLoss),
            realized_pnl: if terminal { dec!(-20) } else { Decimal::ZERO },
            realized_pnl_pct: terminal.then_some(dec!(-0.0166)),
            unrealized_pnl: Decimal::ZERO,
            last_seen_price: dec!(60000),
            annotations: [("confidence".to_string(), serde_json::json!(0.8))].into(),
        }
    }

    #[test]
    fn test_missing_file_is_none() {
        let (_dir, gateway) = temp_gateway();
        assert!(gateway.load().unwrap().is_none());
    }

    #[test]
    fn test_roundtrip_mixed_state() {
        let (_dir, gateway) = temp_gateway();

        let mut snapshot = LedgerSnapshot::empty(dec!(10000));
        snapshot.positions = vec![
            position(PositionStatus::Open),
            position(PositionStatus::StoppedOut),
        ];
        snapshot.committed_by_strategy = Some(snapshot.commitments_from_positions());
        snapshot.realized_pnl_total = Some(dec!(-20));
        snapshot.emergency_active = true;
        snapshot.emergency_audit.latched_at = Some(Utc::now());
        snapshot.last_entry_at.insert(StrategyKind::Swing, Utc::now());

        gateway.save(&snapshot).unwrap();
        let loaded = gateway.load().unwrap().unwrap();
        assert_eq!(loaded, snapshot);
    }

    #[test]
    fn test_roundtrip_empty_state() {
        let (_dir, gateway) = temp_gateway();
        let snapshot = LedgerSnapshot::empty(dec!(2500));

        gateway.save(&snapshot).unwrap();
        assert_eq!(gateway.load().unwrap().unwrap(), snapshot);
    }

    #[test]
    fn test_corrupt_file_fails_loudly() {
        let (_dir, gateway) = temp_gateway();
        fs::write(gateway.path(), "not valid json {{{").unwrap();

        assert!(matches!(
            gateway.load(),
            Err(LedgerError::CorruptPersistence { .. })
        ));
    }

    #[test]
    fn test_newer_schema_rejected() {
        let (_dir, gateway) = temp_gateway();
        fs::write(
            gateway.path(),
            r#"{ "schema_version": 99, "initial_capital": "10000", "positions": [] }"#,
        )
        .unwrap();

        let err = gateway.load().unwrap_err();
        assert!(matches!(err, LedgerError::CorruptPersistence { .. }));
        assert!(err.to_string().contains("newer than supported"));
    }

    #[test]
    fn test_inconsistent_commitments_rejected() {
        let (_dir, gateway) = temp_gateway();

        let mut snapshot = LedgerSnapshot::empty(dec!(10000));
        snapshot.positions = vec![position(PositionStatus::Open)];
        snapshot.committed_by_strategy = Some([(StrategyKind::Swing, dec!(999))].into());
        gateway.save(&snapshot).unwrap();

        let err = gateway.load().unwrap_err();
        assert!(err.to_string().contains("does not match open positions"));
    }

    #[test]
    fn test_older_document_defaults_missing_fields() {
        let (_dir, gateway) = temp_gateway();
        let id = Uuid::new_v4();
        let doc = format!(
            r#"{{
                "initial_capital": "10000",
                "future_field": {{ "nested": true }},
                "positions": [{{
                    "id": "{id}",
                    "strategy": "dca",
                    "quantity_asset": "0.01",
                    "quantity_quote": "600",
                    "entry_price": "60000",
                    "stop_price": "58300",
                    "status": "open",
                    "opened_at": "2025-05-11T14:30:00Z",
                    "last_seen_price": "60000"
                }}]
            }}"#
        );
        fs::write(gateway.path(), doc).unwrap();

        let loaded = gateway.load().unwrap().unwrap();
        assert!(!loaded.emergency_active);
        assert_eq!(loaded.committed_by_strategy, None);
        assert_eq!(loaded.positions[0].id, id);
        assert_eq!(loaded.positions[0].volatility, Decimal::ZERO);
        assert!(loaded.positions[0].annotations.is_empty());
        assert_eq!(
            loaded.commitments_from_positions().get(&StrategyKind::Dca),
            Some(&dec!(600))
        );
    }

    #[test]
    fn test_failed_write_keeps_previous_snapshot() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("positions.json");
        let gateway = PersistenceGateway::new(&target).with_retries(2, Duration::ZERO);

        let first = LedgerSnapshot::empty(dec!(10000));
        gateway.save(&first).unwrap();

        // A directory in place of the parent makes every write fail
        let blocked = PersistenceGateway::new(target.join("nested.json"))
            .with_retries(2, Duration::ZERO);
        assert!(blocked.save(&LedgerSnapshot::empty(dec!(1))).is_err());

        assert_eq!(gateway.load().unwrap().unwrap(), first);
        let leftovers = fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(leftovers, 1);
    }
}

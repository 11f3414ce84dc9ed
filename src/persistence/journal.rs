//! SQLite audit journal.
//!
//! Append-only record of what the ledger did:
//! - Position opens and exits
//! - Emergency latch and operator clears
//! - Equity snapshots from monitoring ticks
//!
//! The JSON snapshot stays authoritative; the journal is never read back
//! into ledger state.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use rust_decimal::Decimal;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info};
use uuid::Uuid;

use crate::strategy::StrategyKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JournalEventKind {
    PositionOpened,
    PositionClosed,
    StopTriggered,
    EmergencyLatched,
    EmergencyCleared,
}

impl JournalEventKind {
    fn as_str(&self) -> &'static str {
        match self {
            JournalEventKind::PositionOpened => "position_opened",
            JournalEventKind::PositionClosed => "position_closed",
            JournalEventKind::StopTriggered => "stop_triggered",
            JournalEventKind::EmergencyLatched => "emergency_latched",
            JournalEventKind::EmergencyCleared => "emergency_cleared",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "position_opened" => Some(JournalEventKind::PositionOpened),
            "position_closed" => Some(JournalEventKind::PositionClosed),
            "stop_triggered" => Some(JournalEventKind::StopTriggered),
            "emergency_latched" => Some(JournalEventKind::EmergencyLatched),
            "emergency_cleared" => Some(JournalEventKind::EmergencyCleared),
            _ => None,
        }
    }
}

impl fmt::Display for JournalEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A journaled ledger event.
#[derive(Debug, Clone, PartialEq)]
pub struct JournalEvent {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub kind: JournalEventKind,
    pub position_id: Option<Uuid>,
    pub strategy: Option<StrategyKind>,
    pub details: serde_json::Value,
}

/// Portfolio valuation at one monitoring tick.
#[derive(Debug, Clone, PartialEq)]
pub struct EquityRecord {
    pub timestamp: DateTime<Utc>,
    pub portfolio_value: Decimal,
    pub allocated: Decimal,
    pub available: Decimal,
    pub unrealized_pnl: Decimal,
    pub realized_pnl: Decimal,
    pub open_positions: usize,
    pub emergency_active: bool,
}

/// SQLite-backed audit journal.
pub struct Journal {
    conn: Connection,
}

impl Journal {
    /// Open (or create) the journal database.
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let path = db_path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create journal directory {:?}", parent))?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open journal at {:?}", path))?;

        let journal = Self { conn };
        journal.init_schema()?;

        info!("Audit journal initialized at {:?}", path);
        Ok(journal)
    }

    fn init_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS ledger_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                kind TEXT NOT NULL,
                position_id TEXT,
                strategy TEXT,
                details TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_events_timestamp ON ledger_events(timestamp);
            CREATE INDEX IF NOT EXISTS idx_events_position ON ledger_events(position_id);

            CREATE TABLE IF NOT EXISTS equity_snapshots (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                portfolio_value TEXT NOT NULL,
                allocated TEXT NOT NULL,
                available TEXT NOT NULL,
                unrealized_pnl TEXT NOT NULL,
                realized_pnl TEXT NOT NULL,
                open_positions INTEGER NOT NULL,
                emergency_active INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_equity_timestamp ON equity_snapshots(timestamp);
            "#,
        )?;

        debug!("Journal schema initialized");
        Ok(())
    }

    /// Append an event. Returns its row id.
    pub fn record_event(
        &self,
        at: DateTime<Utc>,
        kind: JournalEventKind,
        position_id: Option<Uuid>,
        strategy: Option<StrategyKind>,
        details: &serde_json::Value,
    ) -> Result<i64> {
        self.conn.execute(
            r#"
            INSERT INTO ledger_events (timestamp, kind, position_id, strategy, details)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![
                at.to_rfc3339(),
                kind.as_str(),
                position_id.map(|id| id.to_string()),
                strategy.map(|s| s.to_string()),
                details.to_string(),
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn record_equity(&self, record: &EquityRecord) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO equity_snapshots (timestamp, portfolio_value, allocated, available,
                                          unrealized_pnl, realized_pnl, open_positions,
                                          emergency_active)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            params![
                record.timestamp.to_rfc3339(),
                record.portfolio_value.to_string(),
                record.allocated.to_string(),
                record.available.to_string(),
                record.unrealized_pnl.to_string(),
                record.realized_pnl.to_string(),
                record.open_positions,
                record.emergency_active as i32,
            ],
        )?;
        Ok(())
    }

    /// Most recent events, newest first.
    pub fn recent_events(&self, limit: usize) -> Result<Vec<JournalEvent>> {
        self.query_events(
            "SELECT id, timestamp, kind, position_id, strategy, details
             FROM ledger_events ORDER BY id DESC LIMIT ?1",
            params![limit],
        )
    }

    /// Events for a single position, oldest first.
    pub fn position_history(&self, position_id: Uuid) -> Result<Vec<JournalEvent>> {
        self.query_events(
            "SELECT id, timestamp, kind, position_id, strategy, details
             FROM ledger_events WHERE position_id = ?1 ORDER BY id ASC",
            params![position_id.to_string()],
        )
    }

    fn query_events(&self, sql: &str, args: &[&dyn rusqlite::ToSql]) -> Result<Vec<JournalEvent>> {
        let mut stmt = self.conn.prepare(sql)?;

        let rows: Vec<(i64, String, String, Option<String>, Option<String>, String)> = stmt
            .query_map(args, |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                ))
            })?
            .collect::<rusqlite::Result<_>>()?;

        rows.into_iter()
            .map(|(id, ts, kind, position_id, strategy, details)| {
                Ok(JournalEvent {
                    id,
                    timestamp: parse_timestamp(&ts)?,
                    kind: JournalEventKind::parse(&kind)
                        .with_context(|| format!("Unknown journal event kind '{kind}'"))?,
                    position_id: position_id.as_deref().map(Uuid::parse_str).transpose()?,
                    strategy: strategy.as_deref().map(StrategyKind::from_str).transpose()?,
                    details: serde_json::from_str(&details)?,
                })
            })
            .collect()
    }

    pub fn latest_equity(&self) -> Result<Option<EquityRecord>> {
        let row: Option<(String, String, String, String, String, String, usize, bool)> = self
            .conn
            .query_row(
                r#"
                SELECT timestamp, portfolio_value, allocated, available, unrealized_pnl,
                       realized_pnl, open_positions, emergency_active
                FROM equity_snapshots
                ORDER BY id DESC
                LIMIT 1
                "#,
                [],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                        row.get(6)?,
                        row.get(7)?,
                    ))
                },
            )
            .optional()?;

        let Some((ts, value, allocated, available, unrealized, realized, open_positions, emergency)) =
            row
        else {
            return Ok(None);
        };

        Ok(Some(EquityRecord {
            timestamp: parse_timestamp(&ts)?,
            portfolio_value: Decimal::from_str(&value)?,
            allocated: Decimal::from_str(&allocated)?,
            available: Decimal::from_str(&available)?,
            unrealized_pnl: Decimal::from_str(&unrealized)?,
            realized_pnl: Decimal::from_str(&realized)?,
            open_positions,
            emergency_active: emergency,
        }))
    }
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("Bad journal timestamp '{raw}'"))?
        .with_timezone(&Utc))
}

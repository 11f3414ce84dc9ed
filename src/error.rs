//! Ledger error taxonomy.
//!
//! Three buckets:
//! - business-rule rejections (`AllocationDenied`, `HoldPeriodActive`), expected and frequent
//! - caller/programmer errors (`InvalidInput`, `InvalidState`, `PositionNotFound`,
//!   `BudgetUnderflow`)
//! - persistence failures (`CorruptPersistence`, `Persistence`)

use rust_decimal::Decimal;
use std::path::PathBuf;
use thiserror::Error;
use uuid::Uuid;

use crate::risk::PositionStatus;
use crate::strategy::StrategyKind;

/// Errors returned by ledger operations.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// Allocation refused by a business rule (caps, emergency, cooldown, disabled strategy).
    #[error("Allocation denied: {reason}")]
    AllocationDenied { reason: String },

    /// Signal-driven close attempted inside the strategy's minimum hold window.
    #[error("Position {position_id} is within its hold period ({remaining_secs}s remaining)")]
    HoldPeriodActive {
        position_id: Uuid,
        remaining_secs: i64,
    },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Mutation attempted on a position that is no longer open.
    #[error("Position {position_id} is {status}, expected open")]
    InvalidState {
        position_id: Uuid,
        status: PositionStatus,
    },

    #[error("Position {0} not found")]
    PositionNotFound(Uuid),

    /// A release would drive a strategy's committed capital below zero.
    #[error("Budget underflow for {strategy}: committed {committed}, release {release}")]
    BudgetUnderflow {
        strategy: StrategyKind,
        committed: Decimal,
        release: Decimal,
    },

    /// The snapshot on disk exists but cannot be trusted.
    #[error("Corrupt persistence file {path:?}: {reason}")]
    CorruptPersistence { path: PathBuf, reason: String },

    /// Snapshot write failed after all retries.
    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),
}

impl LedgerError {
    /// True for expected rejections that callers handle as normal outcomes.
    pub fn is_business_rejection(&self) -> bool {
        matches!(
            self,
            LedgerError::AllocationDenied { .. } | LedgerError::HoldPeriodActive { .. }
        )
    }

    pub(crate) fn denied(reason: impl Into<String>) -> Self {
        LedgerError::AllocationDenied {
            reason: reason.into(),
        }
    }

    pub(crate) fn overflow(what: &str) -> Self {
        LedgerError::InvalidInput(format!("{what} exceeds the decimal range"))
    }
}

/// Low-level snapshot I/O failures.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type LedgerResult<T> = Result<T, LedgerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_business_rejection_classification() {
        assert!(LedgerError::denied("cap").is_business_rejection());
        assert!(LedgerError::HoldPeriodActive {
            position_id: Uuid::nil(),
            remaining_secs: 10,
        }
        .is_business_rejection());
        assert!(!LedgerError::InvalidInput("qty".into()).is_business_rejection());
        assert!(!LedgerError::PositionNotFound(Uuid::nil()).is_business_rejection());
    }
}

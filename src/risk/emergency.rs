//! Portfolio-level emergency latch and drawdown tracking.
//!
//! The latch trips when the portfolio return falls to the configured threshold
//! and stays set until an operator clears it. Price recovery never clears it.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

/// Audit trail of the most recent latch and clear.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EmergencyAudit {
    #[serde(default)]
    pub latched_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub latched_pnl_pct: Option<Decimal>,
    #[serde(default)]
    pub cleared_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub cleared_by: Option<String>,
    #[serde(default)]
    pub clear_note: Option<String>,
}

/// One-way emergency latch with session drawdown statistics.
#[derive(Debug, Clone)]
pub struct EmergencySupervisor {
    /// Portfolio return that trips the latch (e.g., -0.25)
    threshold: Decimal,
    active: bool,
    audit: EmergencyAudit,
    /// Highest portfolio value observed this session
    peak_value: Decimal,
    /// Current drawdown from peak (0.0-1.0)
    current_drawdown: Decimal,
    /// Worst drawdown observed this session
    session_mdd: Decimal,
}

impl EmergencySupervisor {
    pub fn new(threshold: Decimal, initial_value: Decimal) -> Self {
        Self {
            threshold,
            active: false,
            audit: EmergencyAudit::default(),
            peak_value: initial_value,
            current_drawdown: Decimal::ZERO,
            session_mdd: Decimal::ZERO,
        }
    }

    /// Restore persisted latch state. Drawdown statistics restart with the session.
    pub(crate) fn restore(
        threshold: Decimal,
        initial_value: Decimal,
        active: bool,
        audit: EmergencyAudit,
    ) -> Self {
        Self {
            active,
            audit,
            ..Self::new(threshold, initial_value)
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn threshold(&self) -> Decimal {
        self.threshold
    }

    pub fn audit(&self) -> &EmergencyAudit {
        &self.audit
    }

    /// Evaluate the latest portfolio return.
    ///
    /// Returns true only on the tick that trips the latch.
    pub fn evaluate(&mut self, portfolio_pnl_pct: Decimal, now: DateTime<Utc>) -> bool {
        if self.active || portfolio_pnl_pct > self.threshold {
            return false;
        }

        self.active = true;
        self.audit.latched_at = Some(now);
        self.audit.latched_pnl_pct = Some(portfolio_pnl_pct);

        error!(
            pnl_pct = %(portfolio_pnl_pct * dec!(100)).round_dp(2),
            threshold_pct = %(self.threshold * dec!(100)),
            "EMERGENCY STOP TRIGGERED - all new positions blocked"
        );
        true
    }

    /// True while not latched but within 20% of the threshold distance.
    pub fn warning_check(&self, portfolio_pnl_pct: Decimal) -> bool {
        if self.active {
            return false;
        }
        let distance = portfolio_pnl_pct - self.threshold;
        let warning_band = self.threshold.abs() * dec!(0.2);
        distance <= warning_band
    }

    /// Operator action: release the latch. Returns false if it was not active.
    pub fn clear(&mut self, operator: &str, note: &str, now: DateTime<Utc>) -> bool {
        if !self.active {
            return false;
        }

        self.active = false;
        self.audit.cleared_at = Some(now);
        self.audit.cleared_by = Some(operator.to_string());
        self.audit.clear_note = Some(note.to_string());

        warn!(%operator, %note, "Emergency mode cleared by operator");
        true
    }

    /// Track portfolio value for drawdown statistics.
    pub fn record_value(&mut self, portfolio_value: Decimal) {
        if portfolio_value > self.peak_value {
            self.peak_value = portfolio_value;
            self.current_drawdown = Decimal::ZERO;
            return;
        }

        if self.peak_value > Decimal::ZERO {
            self.current_drawdown = (self.peak_value - portfolio_value) / self.peak_value;
        }

        if self.current_drawdown > self.session_mdd {
            self.session_mdd = self.current_drawdown;
            info!(
                mdd = %self.session_mdd.round_dp(4),
                peak = %self.peak_value,
                current = %portfolio_value,
                "New maximum drawdown recorded"
            );
        }
    }

    pub fn drawdown_stats(&self) -> DrawdownStats {
        DrawdownStats {
            peak_value: self.peak_value,
            current_drawdown: self.current_drawdown,
            session_mdd: self.session_mdd,
        }
    }
}

/// Drawdown statistics for the current session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DrawdownStats {
    pub peak_value: Decimal,
    pub current_drawdown: Decimal,
    pub session_mdd: Decimal,
}

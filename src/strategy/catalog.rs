//! Static strategy table.
//!
//! Strategies are a closed set of kinds, each with an immutable profile built
//! once from validated configuration.

use chrono::Duration;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::config::{StrategiesConfig, StrategyConfig};
use crate::error::LedgerError;

/// Strategy kinds known to the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyKind {
    Dca,
    Swing,
    Day,
}

impl StrategyKind {
    pub const ALL: [StrategyKind; 3] = [StrategyKind::Dca, StrategyKind::Swing, StrategyKind::Day];
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StrategyKind::Dca => write!(f, "DCA"),
            StrategyKind::Swing => write!(f, "SWING"),
            StrategyKind::Day => write!(f, "DAY"),
        }
    }
}

impl FromStr for StrategyKind {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "dca" => Ok(StrategyKind::Dca),
            "swing" => Ok(StrategyKind::Swing),
            "day" => Ok(StrategyKind::Day),
            other => Err(LedgerError::InvalidInput(format!(
                "unknown strategy '{other}'"
            ))),
        }
    }
}

/// Immutable per-strategy risk profile.
#[derive(Debug, Clone, PartialEq)]
pub struct StrategyProfile {
    pub kind: StrategyKind,
    /// Stop distance in volatility units (stop = entry - multiplier * volatility)
    pub volatility_multiplier: Decimal,
    /// Share of initial capital this strategy may hold (0.0-1.0)
    pub allocation_limit: Decimal,
    pub min_hold: Duration,
    /// Cooldown between two entries of the same strategy
    pub min_reentry_interval: Duration,
    pub enabled: bool,
}

impl StrategyProfile {
    fn from_config(kind: StrategyKind, config: &StrategyConfig) -> Self {
        Self {
            kind,
            volatility_multiplier: config.volatility_multiplier,
            allocation_limit: config.allocation_limit,
            min_hold: seconds(config.min_hold_secs),
            min_reentry_interval: seconds(config.min_reentry_secs),
            enabled: config.enabled,
        }
    }
}

/// Whole seconds as a duration, saturating at `Duration::MAX`.
fn seconds(secs: u64) -> Duration {
    i64::try_from(secs)
        .ok()
        .and_then(Duration::try_seconds)
        .unwrap_or(Duration::MAX)
}

/// Read-only table of strategy profiles.
#[derive(Debug, Clone)]
pub struct StrategyCatalog {
    dca: StrategyProfile,
    swing: StrategyProfile,
    day: StrategyProfile,
}

impl StrategyCatalog {
    /// Build the catalog from (already validated) configuration.
    pub fn from_config(config: &StrategiesConfig) -> Self {
        Self {
            dca: StrategyProfile::from_config(StrategyKind::Dca, &config.dca),
            swing: StrategyProfile::from_config(StrategyKind::Swing, &config.swing),
            day: StrategyProfile::from_config(StrategyKind::Day, &config.day),
        }
    }

    pub fn get(&self, kind: StrategyKind) -> &StrategyProfile {
        match kind {
            StrategyKind::Dca => &self.dca,
            StrategyKind::Swing => &self.swing,
            StrategyKind::Day => &self.day,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &StrategyProfile> {
        [&self.dca, &self.swing, &self.day].into_iter()
    }
}

impl Default for StrategyCatalog {
    fn default() -> Self {
        Self::from_config(&StrategiesConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_default_profiles() {
        let catalog = StrategyCatalog::default();

        let dca = catalog.get(StrategyKind::Dca);
        assert_eq!(dca.volatility_multiplier, dec!(2.0));
        assert_eq!(dca.allocation_limit, dec!(0.5));
        assert_eq!(dca.min_reentry_interval, Duration::hours(1));
        assert!(dca.enabled);

        assert_eq!(catalog.get(StrategyKind::Swing).volatility_multiplier, dec!(1.5));
        assert!(!catalog.get(StrategyKind::Day).enabled);
        assert_eq!(catalog.iter().count(), 3);
    }

    #[test]
    fn test_durations_saturate_instead_of_wrapping() {
        assert_eq!(seconds(900), Duration::minutes(15));
        assert_eq!(seconds(u64::MAX), Duration::MAX);
        assert_eq!(seconds(i64::MAX as u64), Duration::MAX);
    }

    #[test]
    fn test_kind_parsing() {
        assert_eq!("DCA".parse::<StrategyKind>().unwrap(), StrategyKind::Dca);
        assert_eq!("swing".parse::<StrategyKind>().unwrap(), StrategyKind::Swing);
        assert!("scalp".parse::<StrategyKind>().is_err());
        assert_eq!(StrategyKind::Day.to_string(), "DAY");
    }
}

//! Configuration management for the strategy ledger.
//!
//! Loads settings from an optional config file and environment variables.

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Capital, safeguards and snapshot persistence
    #[serde(default)]
    pub ledger: LedgerConfig,
    /// Per-strategy risk profiles
    #[serde(default)]
    pub strategies: StrategiesConfig,
    /// SQLite audit journal
    #[serde(default)]
    pub journal: JournalConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// Starting capital in quote currency
    #[serde(default = "default_initial_capital")]
    pub initial_capital: Decimal,
    /// Maximum share of capital committed across all strategies (0.0-1.0)
    #[serde(default = "default_global_allocation_cap")]
    pub global_allocation_cap: Decimal,
    /// Portfolio return that latches emergency mode (e.g., -0.25 = -25%)
    #[serde(default = "default_emergency_threshold")]
    pub emergency_threshold: Decimal,
    /// Per-tick price move (relative to entry) reported as a large move
    #[serde(default = "default_large_move_threshold")]
    pub large_move_threshold: Decimal,
    /// Snapshot document location
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,
    /// What to do with an in-memory mutation when its snapshot write fails
    #[serde(default)]
    pub write_policy: WritePolicy,
    /// Snapshot write attempts before giving up
    #[serde(default = "default_save_retries")]
    pub save_retries: u32,
    /// Backoff between snapshot write attempts (multiplied by attempt number)
    #[serde(default = "default_save_retry_backoff_ms")]
    pub save_retry_backoff_ms: u64,
}

/// Snapshot write policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WritePolicy {
    /// A mutation is published only after its snapshot is durable.
    #[default]
    WriteThrough,
    /// A mutation is published even if its snapshot write fails.
    BestEffort,
}

/// Risk parameters for a single strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyConfig {
    /// ATR multiple for the stop distance
    pub volatility_multiplier: Decimal,
    /// Maximum share of capital (0.0-1.0)
    pub allocation_limit: Decimal,
    /// Minimum seconds before a signal-driven exit
    pub min_hold_secs: u64,
    /// Minimum seconds between entries of this strategy
    #[serde(default)]
    pub min_reentry_secs: u64,
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategiesConfig {
    #[serde(default = "default_dca")]
    pub dca: StrategyConfig,
    #[serde(default = "default_swing")]
    pub swing: StrategyConfig,
    #[serde(default = "default_day")]
    pub day: StrategyConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalConfig {
    #[serde(default = "default_journal_enabled")]
    pub enabled: bool,
    #[serde(default = "default_journal_path")]
    pub path: PathBuf,
}

// Default value functions
fn default_initial_capital() -> Decimal {
    Decimal::new(10_000, 0) // 10,000 USD
}

fn default_global_allocation_cap() -> Decimal {
    Decimal::new(95, 2) // 0.95 - keep 5% cash buffer
}

fn default_emergency_threshold() -> Decimal {
    Decimal::new(-25, 2) // -0.25
}

fn default_large_move_threshold() -> Decimal {
    Decimal::new(2, 2) // 0.02
}

fn default_state_file() -> PathBuf {
    PathBuf::from("data/positions.json")
}

fn default_save_retries() -> u32 {
    3
}

fn default_save_retry_backoff_ms() -> u64 {
    50
}

fn default_dca() -> StrategyConfig {
    StrategyConfig {
        volatility_multiplier: Decimal::new(20, 1), // wide stops for accumulation
        allocation_limit: Decimal::new(50, 2),
        min_hold_secs: 86_400,
        min_reentry_secs: 3_600,
        enabled: true,
    }
}

fn default_swing() -> StrategyConfig {
    StrategyConfig {
        volatility_multiplier: Decimal::new(15, 1),
        allocation_limit: Decimal::new(30, 2),
        min_hold_secs: 3_600,
        min_reentry_secs: 0,
        enabled: true,
    }
}

fn default_day() -> StrategyConfig {
    StrategyConfig {
        volatility_multiplier: Decimal::new(10, 1), // tight stops
        allocation_limit: Decimal::new(20, 2),
        min_hold_secs: 900,
        min_reentry_secs: 0,
        enabled: false, // opt-in only
    }
}

fn default_journal_enabled() -> bool {
    true
}

fn default_journal_path() -> PathBuf {
    PathBuf::from("data/ledger_journal.db")
}

impl Config {
    /// Load configuration from environment variables and config files.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::default().separator("__").prefix("SLEDGER"))
            .build()
            .context("Failed to build configuration")?;

        let config: Self = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        let ledger = &self.ledger;

        anyhow::ensure!(
            ledger.initial_capital > Decimal::ZERO,
            "initial_capital must be positive"
        );
        anyhow::ensure!(
            ledger.global_allocation_cap > Decimal::ZERO
                && ledger.global_allocation_cap <= Decimal::ONE,
            "global_allocation_cap must be between 0 and 1"
        );
        anyhow::ensure!(
            ledger.emergency_threshold >= Decimal::NEGATIVE_ONE
                && ledger.emergency_threshold < Decimal::ZERO,
            "emergency_threshold must be in [-1, 0)"
        );
        anyhow::ensure!(
            ledger.large_move_threshold > Decimal::ZERO,
            "large_move_threshold must be positive"
        );
        anyhow::ensure!(ledger.save_retries >= 1, "save_retries must be at least 1");

        for (name, strategy) in [
            ("dca", &self.strategies.dca),
            ("swing", &self.strategies.swing),
            ("day", &self.strategies.day),
        ] {
            strategy
                .validate()
                .with_context(|| format!("invalid strategy '{name}'"))?;
        }

        Ok(())
    }
}

/// Upper bound for hold and re-entry durations (10 years).
pub const MAX_STRATEGY_DURATION_SECS: u64 = 10 * 365 * 86_400;

impl StrategyConfig {
    fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.min_hold_secs <= MAX_STRATEGY_DURATION_SECS,
            "min_hold_secs must be at most {MAX_STRATEGY_DURATION_SECS}"
        );
        anyhow::ensure!(
            self.min_reentry_secs <= MAX_STRATEGY_DURATION_SECS,
            "min_reentry_secs must be at most {MAX_STRATEGY_DURATION_SECS}"
        );
        anyhow::ensure!(
            self.volatility_multiplier >= Decimal::ZERO,
            "volatility_multiplier must be non-negative"
        );
        anyhow::ensure!(
            self.allocation_limit > Decimal::ZERO && self.allocation_limit <= Decimal::ONE,
            "allocation_limit must be between 0 and 1"
        );
        Ok(())
    }
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            initial_capital: default_initial_capital(),
            global_allocation_cap: default_global_allocation_cap(),
            emergency_threshold: default_emergency_threshold(),
            large_move_threshold: default_large_move_threshold(),
            state_file: default_state_file(),
            write_policy: WritePolicy::default(),
            save_retries: default_save_retries(),
            save_retry_backoff_ms: default_save_retry_backoff_ms(),
        }
    }
}

impl Default for StrategiesConfig {
    fn default() -> Self {
        Self {
            dca: default_dca(),
            swing: default_swing(),
            day: default_day(),
        }
    }
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            enabled: default_journal_enabled(),
            path: default_journal_path(),
        }
    }
}

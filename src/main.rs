//! Strategy Ledger - operator CLI
//!
//! Inspects persisted ledger state and performs operator actions.

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::path::PathBuf;
use strategy_ledger::config::Config;
use strategy_ledger::persistence::Journal;
use strategy_ledger::risk::{Position, PositionStatus};
use strategy_ledger::Ledger;
use tracing::{info, Level};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

/// Strategy Ledger CLI
#[derive(Parser)]
#[command(name = "strategy-ledger")]
#[command(version, about = "Capital and position ledger for multi-strategy trading")]
struct Cli {
    /// Override the snapshot file from configuration
    #[arg(long, global = true)]
    state: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show budget, emergency state and statistics from persisted state
    Status {
        /// Show per-strategy details and recent journal entries
        #[arg(short, long)]
        verbose: bool,
    },

    /// Release the emergency latch after review
    ClearEmergency {
        /// Who is clearing the latch
        #[arg(short, long)]
        operator: String,

        /// Why it is safe to resume
        #[arg(short, long)]
        note: String,
    },

    /// List positions
    Positions {
        /// Only positions with this status
        #[arg(short, long, value_enum)]
        status: Option<StatusFilter>,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StatusFilter {
    Open,
    Closed,
    Stopped,
}

impl From<StatusFilter> for PositionStatus {
    fn from(filter: StatusFilter) -> Self {
        match filter {
            StatusFilter::Open => PositionStatus::Open,
            StatusFilter::Closed => PositionStatus::Closed,
            StatusFilter::Stopped => PositionStatus::StoppedOut,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging()?;

    let mut config = Config::load().context("Failed to load configuration")?;
    if let Some(state) = cli.state {
        config.ledger.state_file = state;
    }

    match cli.command.unwrap_or(Commands::Status { verbose: false }) {
        Commands::Status { verbose } => show_status(&config, verbose),
        Commands::ClearEmergency { operator, note } => clear_emergency(&config, &operator, &note),
        Commands::Positions { status } => list_positions(&config, status.map(Into::into)),
    }
}

/// Initialize logging with stdout and an hourly rolling file.
fn init_logging() -> Result<()> {
    use tracing_subscriber::fmt::writer::MakeWriterExt;

    std::fs::create_dir_all("logs")?;

    let file_appender = tracing_appender::rolling::hourly("logs", "strategy-ledger.log");
    let (file_writer, _guard) = tracing_appender::non_blocking(file_appender);

    // Leak the guard to keep it alive for the program duration
    Box::leak(Box::new(_guard));

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("strategy_ledger=debug".parse()?)
                .add_directive(Level::INFO.into()),
        )
        .with_writer(std::io::stderr.and(file_writer))
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .init();

    Ok(())
}

fn pct(value: Decimal) -> Decimal {
    (value * dec!(100)).round_dp(2)
}

fn show_status(config: &Config, verbose: bool) -> Result<()> {
    println!("╔════════════════════════════════════════════════════════════╗");
    println!("║              STRATEGY LEDGER STATUS                        ║");
    println!("╚════════════════════════════════════════════════════════════╝");

    if !config.ledger.state_file.exists() {
        println!("\n❌ Snapshot not found: {}", config.ledger.state_file.display());
        println!("   No position has been recorded yet, or the state path is incorrect.");
        return Ok(());
    }

    let ledger = Ledger::open(config)?;
    let stats = ledger.statistics();
    let budget = &stats.budget;

    println!("\n📊 Budget");
    println!("   ├─ Initial Capital:  ${:.2}", budget.initial_capital);
    println!("   ├─ Allocated:        ${:.2} ({:.2}%)", budget.allocated, pct(budget.allocation_pct));
    println!("   ├─ Available:        ${:.2}", budget.available);
    println!("   ├─ Global Headroom:  ${:.2}", budget.global_headroom);
    println!("   └─ Portfolio Value:  ${:.2} ({:+.2}%)", budget.portfolio_value, pct(budget.portfolio_pnl_pct()));

    println!("\n💰 P&L");
    println!("   ├─ Unrealized:       ${:.2}", stats.total_unrealized_pnl);
    println!("   ├─ Realized:         ${:.2}", stats.total_realized_pnl);
    match stats.win_rate {
        Some(win_rate) => println!("   └─ Win Rate:         {:.1}%", pct(win_rate)),
        None => println!("   └─ Win Rate:         n/a"),
    }

    println!("\n📈 Positions");
    println!("   ├─ Open:             {}", stats.open_positions);
    println!("   ├─ Closed:           {}", stats.closed_positions);
    println!("   └─ Stopped Out:      {}", stats.stopped_positions);

    let audit = ledger.export_state().emergency_audit;
    if stats.emergency_active {
        println!("\n🚨 EMERGENCY MODE ACTIVE - new positions blocked");
        if let (Some(at), Some(pnl)) = (audit.latched_at, audit.latched_pnl_pct) {
            println!("   └─ Latched {} at {:+.2}%", at.format("%Y-%m-%d %H:%M:%S UTC"), pct(pnl));
        }
    } else if let (Some(at), Some(by)) = (audit.cleared_at, audit.cleared_by.as_deref()) {
        println!("\n✅ Emergency mode clear (last cleared by {} at {})", by, at.format("%Y-%m-%d %H:%M:%S UTC"));
    }

    if verbose {
        println!("\n🧮 Strategies");
        for allocation in &budget.by_strategy {
            let profile = ledger.catalog().get(allocation.strategy);
            let performance = stats.by_strategy.iter().find(|p| p.strategy == allocation.strategy);
            println!("   ┌─ {}{}", allocation.strategy, if profile.enabled { "" } else { " (disabled)" });
            println!(
                "   ├─ Allocated: ${:.2} of ${:.2} ({} open)",
                allocation.allocated,
                budget.initial_capital * profile.allocation_limit,
                allocation.open_positions
            );
            if let Some(perf) = performance.filter(|p| p.finished > 0) {
                println!(
                    "   └─ Finished: {} (win rate {:.1}%, avg {:+.2}%)",
                    perf.finished,
                    pct(perf.win_rate),
                    pct(perf.avg_pnl_pct)
                );
            } else {
                println!("   └─ Finished: 0");
            }
        }

        if config.journal.enabled && config.journal.path.exists() {
            let journal = Journal::open(&config.journal.path)?;
            if let Some(equity) = journal.latest_equity()? {
                println!("\n📉 Last Equity Snapshot");
                println!("   └─ {}: ${:.2}", equity.timestamp.format("%Y-%m-%d %H:%M"), equity.portfolio_value);
            }

            let events = journal.recent_events(10)?;
            if !events.is_empty() {
                println!("\n📜 Recent Events");
                for event in &events {
                    println!("   ├─ {} {}", event.timestamp.format("%Y-%m-%d %H:%M:%S"), event.kind);
                }
            }
        }
    }

    println!();
    Ok(())
}

fn clear_emergency(config: &Config, operator: &str, note: &str) -> Result<()> {
    let ledger = Ledger::open(config)?;

    if ledger.clear_emergency(operator, note)? {
        info!(%operator, "Emergency mode cleared");
        println!("✅ Emergency mode cleared by {}", operator);
    } else {
        println!("ℹ️  Emergency mode was not active");
    }
    Ok(())
}

fn list_positions(config: &Config, status: Option<PositionStatus>) -> Result<()> {
    let ledger = Ledger::open(config)?;
    let positions = ledger.positions(status);

    if positions.is_empty() {
        println!("No positions");
        return Ok(());
    }

    let now = Utc::now();
    for position in &positions {
        print_position(position, now);
    }
    println!("\n{} position(s)", positions.len());
    Ok(())
}

fn print_position(p: &Position, now: chrono::DateTime<Utc>) {
    println!("\n   ┌─ {} [{}] {}", p.id, p.strategy, p.status);
    println!("   ├─ Size:    {} @ ${:.2} (${:.2})", p.quantity_asset.round_dp(8), p.entry_price, p.quantity_quote);
    println!("   ├─ Stop:    ${:.2}", p.stop_price);

    match (p.exit_price, p.exit_reason) {
        (Some(exit), Some(reason)) => {
            println!("   ├─ Exit:    ${:.2} ({})", exit, reason);
            println!(
                "   ├─ P/L:     ${:.2} ({:+.2}%)",
                p.realized_pnl,
                pct(p.realized_pnl_pct.unwrap_or_default())
            );
        }
        _ => {
            println!(
                "   ├─ Last:    ${:.2} (unrealized ${:.2}, {:+.2}%)",
                p.last_seen_price,
                p.unrealized_pnl,
                pct(p.unrealized_pnl_pct())
            );
            println!("   ├─ Held:    {}h", (now - p.opened_at).num_hours());
        }
    }
    println!("   └─ Opened:  {}", p.opened_at.format("%Y-%m-%d %H:%M:%S UTC"));
}

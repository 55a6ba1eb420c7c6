//! Take-Profit Position Engine
//!
//! Consumes buy signals and profit observations, opens positions behind
//! risk gates and exits them with trailing, fixed or tiered strategies.

mod config;
mod error;
mod executor;
mod models;
mod notify;
mod orchestrator;
mod store;
mod trading;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use crate::config::EngineConfig;
use crate::executor::DryRunExecutor;
use crate::models::{Position, SignalEvent};
use crate::orchestrator::{ControlCommand, Orchestrator};
use crate::store::PositionStore;
use crate::trading::presets;

/// Take-profit position engine CLI.
#[derive(Parser)]
#[command(name = "tpengine")]
#[command(about = "Signal-driven position lifecycle engine with take-profit strategies", long_about = None)]
struct Cli {
    /// JSON configuration file
    #[arg(short, long, env = "TPENGINE_CONFIG")]
    config: Option<PathBuf>,

    /// Position snapshot file (overrides the config file)
    #[arg(short, long, env = "TPENGINE_STATE_FILE")]
    state_file: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Process signal events until EOF or Ctrl+C
    Run {
        /// JSON-lines event source, `-` for stdin
        #[arg(short, long, default_value = "-")]
        events: String,

        /// Strategy preset id (see `strategies`)
        #[arg(long, env = "TPENGINE_STRATEGY")]
        strategy: Option<String>,
    },

    /// Show portfolio statistics and open positions
    Status,

    /// List positions
    Positions {
        /// Include closed positions
        #[arg(long)]
        all: bool,
    },

    /// List strategy presets
    Strategies,

    /// Show the effective configuration
    Config,

    /// Manually close a position without trading
    Close {
        /// Asset address
        asset: String,

        #[arg(short, long, default_value = "manual")]
        reason: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // Setup logging
    let log_level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let mut config = EngineConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    if let Some(path) = cli.state_file {
        config.state_file = path;
    }

    match cli.command {
        Commands::Run { events, strategy } => {
            if let Some(id) = strategy {
                config = config.with_preset(&id)?;
            }
            config.validate().context("Invalid configuration")?;
            if !config.dry_run {
                warn!("No live executor configured, trades will be simulated");
            }

            let engine = Arc::new(open_engine(&config).await?);

            println!("\n=== Take-Profit Engine ===");
            println!("State file: {}", config.state_file.display());
            println!("Strategy:   {}", engine.active_strategy());
            println!("Positions:  {} open", engine.list_open_positions().len());
            println!("Events:     {}", if events == "-" { "stdin" } else { events.as_str() });
            println!("Mode:       DRY RUN (no real trades)");
            println!("\nPress Ctrl+C to stop.\n");

            let printer = tokio::spawn(print_events(engine.subscribe()));

            let (tx, rx) = mpsc::channel(1024);
            let runner = {
                let engine = engine.clone();
                tokio::spawn(async move { engine.run(rx).await })
            };

            tokio::select! {
                result = feed_events(&events, tx, &engine) => {
                    let count = result?;
                    info!(events = count, "Event source exhausted");
                }
                _ = tokio::signal::ctrl_c() => {
                    println!(
                        "\n\nStopping, draining {} active lanes...",
                        engine.active_lanes()
                    );
                }
            }

            runner.await.context("Orchestrator task failed")?;

            println!("\n{}", engine.statistics());
            println!("{}", engine.get_risk_state());

            // Dropping the last handle closes the notification channel
            drop(engine);
            printer.await.ok();
        }

        Commands::Status => {
            let store = open_store(&config.state_file).await?;
            let stats = store.statistics();
            let open = store.list_open();

            println!("\nState file: {}", store.path().display());
            println!("{}", stats);

            if open.is_empty() {
                println!("No open positions.");
            } else {
                println!("=== Open Positions ===");
                print_positions(&open);
            }
        }

        Commands::Positions { all } => {
            let store = open_store(&config.state_file).await?;
            let positions = if all { store.list_all() } else { store.list_open() };

            if positions.is_empty() {
                println!("No positions. Use 'tpengine run' to process signals.");
                return Ok(());
            }
            print_positions(&positions);
        }

        Commands::Strategies => {
            let active = config.strategy.clone();

            println!("\n{:>4}  {:<16} {:<36} {}", "RANK", "ID", "NAME", "CONFIG");
            println!("{}", "-".repeat(96));

            for preset in presets::all() {
                let marker = if preset.config == active { "*" } else { " " };
                println!(
                    "{:>4}{} {:<16} {:<36} {}",
                    preset.rank,
                    marker,
                    preset.id,
                    truncate(preset.name, 34),
                    preset.config
                );
            }
            println!("\n* active strategy (default: {})", presets::DEFAULT_PRESET);
        }

        Commands::Config => {
            config.validate().context("Invalid configuration")?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }

        Commands::Close { asset, reason } => {
            let engine = open_engine(&config).await?;
            let before = engine
                .get_position(&asset)
                .with_context(|| format!("No position for {}", asset))?;
            let position = engine
                .force_close(&asset, &reason)
                .await
                .with_context(|| format!("Failed to close {}", asset))?;

            println!(
                "Closed {} ({}): {} -> {}, {}% sold, realized {:+}",
                position.asset_address,
                position.symbol,
                before.status,
                engine.phase(&asset),
                position.sold_percentage,
                position.realized_pnl()
            );
        }
    }

    Ok(())
}

async fn open_store(path: &Path) -> Result<PositionStore> {
    let store = PositionStore::open(path).await.map_err(|e| {
        if e.is_fatal() {
            error!(path = %path.display(), error = %e, "Manual recovery required");
        }
        e
    });
    store.with_context(|| format!("Failed to open position store {}", path.display()))
}

async fn open_engine(config: &EngineConfig) -> Result<Orchestrator> {
    let store = Arc::new(open_store(&config.state_file).await?);
    let engine = Orchestrator::new(config, store, Arc::new(DryRunExecutor::default()))
        .map_err(|e| {
            if e.is_fatal() {
                error!(error = %e, "Engine cannot start with this configuration");
            }
            e
        })?;
    Ok(engine)
}

/// Read JSON-lines events into the orchestrator.
///
/// Control commands are applied as soon as they are read. Malformed lines are skipped.
async fn feed_events(
    source: &str,
    tx: mpsc::Sender<SignalEvent>,
    engine: &Orchestrator,
) -> Result<usize> {
    let reader: Box<dyn AsyncBufRead + Unpin + Send> = if source == "-" {
        Box::new(BufReader::new(tokio::io::stdin()))
    } else {
        let file = tokio::fs::File::open(source)
            .await
            .with_context(|| format!("Failed to open event file {}", source))?;
        Box::new(BufReader::new(file))
    };

    let mut lines = reader.lines();
    let mut line_no = 0usize;
    let mut sent = 0usize;

    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        match serde_json::from_str::<SignalEvent>(line) {
            Ok(event) => {
                if tx.send(event).await.is_err() {
                    warn!("Orchestrator stopped accepting events");
                    break;
                }
                sent += 1;
            }
            Err(e) => match serde_json::from_str::<ControlCommand>(line) {
                Ok(command) => {
                    info!(line = line_no, command = ?command, "Control command");
                    if let Err(e) = engine.apply_control(command) {
                        warn!(line = line_no, error = %e, "Control command failed");
                    }
                }
                Err(_) => warn!(line = line_no, error = %e, "Skipping malformed event"),
            },
        }
    }

    Ok(sent)
}

async fn print_events(mut rx: broadcast::Receiver<notify::EngineEvent>) {
    loop {
        match rx.recv().await {
            Ok(event) => println!("[{}] {}", chrono::Local::now().format("%H:%M:%S"), event),
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(missed, "Notification printer lagging");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn print_positions(positions: &[Position]) {
    println!(
        "\n{:<20} {:<10} {:<16} {:>7} {:>8} {:>8} {:>12}",
        "ASSET", "SYMBOL", "STATUS", "SOLD%", "PEAK", "LAST", "REALIZED"
    );
    println!("{}", "-".repeat(87));

    for pos in positions {
        println!(
            "{:<20} {:<10} {:<16} {:>7} {:>7}x {:>7}x {:>+12}",
            truncate(&pos.asset_address, 18),
            truncate(&pos.symbol, 10),
            pos.status,
            pos.sold_percentage.round_dp(2),
            pos.peak_multiplier.round_dp(2),
            pos.last_multiplier.round_dp(2),
            pos.realized_pnl().round_dp(6)
        );
    }
}

/// Truncate a string with ellipsis if too long.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", head)
    }
}

//! Vela-bot: candle-driven trading strategy engine.
//!
//! Usage:
//!   vela-bot [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>   Config file path (default: config/bot.toml)
//!   -m, --mode <MODE>     Trading mode: paper, shadow (overrides config)
//!       --pairs <PAIRS>   Comma-separated pairs (overrides config)

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use vela_bot::config::{BotConfig, TradingMode};
use vela_bot::engine::Engine;
use vela_common::CurrencyPair;

/// CLI arguments for vela-bot.
#[derive(Parser, Debug)]
#[command(name = "vela-bot")]
#[command(about = "Candle-driven trading strategy engine")]
#[command(version)]
struct Args {
    /// Config file path
    #[arg(short, long, default_value = "config/bot.toml")]
    config: PathBuf,

    /// Trading mode: paper, shadow
    #[arg(short, long)]
    mode: Option<String>,

    /// Comma-separated pairs to trade (e.g., "BTC_USD,ETH_USD")
    #[arg(long, value_delimiter = ',')]
    pairs: Option<Vec<String>>,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<()> {
    let args = Args::parse();

    let mut config = if args.config.exists() {
        BotConfig::load(&args.config)
            .with_context(|| format!("Failed to load config from {:?}", args.config))?
    } else {
        warn!("Config file not found at {:?}, using defaults", args.config);
        BotConfig::default()
    };

    if let Some(mode) = &args.mode {
        config.mode = mode.parse::<TradingMode>().map_err(anyhow::Error::msg)?;
    }
    if let Some(pairs) = args.pairs {
        config.pairs = pairs
            .iter()
            .map(|p| p.parse::<CurrencyPair>())
            .collect::<Result<Vec<_>, _>>()
            .context("Invalid --pairs value")?;
    }

    let log_level = match config.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder().with_max_level(log_level).finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set global tracing subscriber")?;

    info!("Starting vela-bot");
    info!("Mode: {:?}", config.mode);
    info!("Pairs: {:?}", config.pairs);

    config.validate().context("Configuration validation failed")?;

    let engine = Engine::start(&config).context("Failed to start engine")?;

    // Market data feeds push events through Engine::send; the process
    // itself just runs until interrupted.
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown signal received");

    engine.shutdown().await;
    Ok(())
}

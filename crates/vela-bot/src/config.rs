//! Configuration for the trading engine.
//!
//! Loaded from a TOML file. Required settings that contradict each other
//! halt initialization; invalid *values* inside a strategy block are
//! repaired to safe defaults with a logged error so a typo never takes
//! the whole engine down.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use tracing::error;

use vela_common::{CandleInterval, CurrencyPair};

/// Execution mode for the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradingMode {
    /// Simulated fills against a paper balance.
    #[default]
    Paper,
    /// Log decisions, execute nothing.
    Shadow,
}

impl TradingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradingMode::Paper => "paper",
            TradingMode::Shadow => "shadow",
        }
    }
}

impl std::fmt::Display for TradingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for TradingMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "paper" => Ok(TradingMode::Paper),
            "shadow" | "noop" => Ok(TradingMode::Shadow),
            _ => Err(format!("Unknown trading mode: {}", s)),
        }
    }
}

/// When a stop strategy is allowed to close a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClosePositionMode {
    /// Close regardless of current P&L.
    #[default]
    Always,
    /// Only close positions currently in profit.
    Profit,
    /// Only close positions currently at a loss.
    Loss,
}

impl ClosePositionMode {
    /// Parse a config string, repairing unknown values to `Always`.
    /// The repair is logged as an error but never fails startup.
    pub fn parse_or_repair(s: &str) -> Self {
        match s.parse() {
            Ok(mode) => mode,
            Err(_) => {
                error!(
                    value = %s,
                    "Invalid close_position value, repaired to 'always'"
                );
                ClosePositionMode::Always
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ClosePositionMode::Always => "always",
            ClosePositionMode::Profit => "profit",
            ClosePositionMode::Loss => "loss",
        }
    }
}

impl std::fmt::Display for ClosePositionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ClosePositionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "always" => Ok(ClosePositionMode::Always),
            "profit" => Ok(ClosePositionMode::Profit),
            "loss" => Ok(ClosePositionMode::Loss),
            _ => Err(format!("Unknown close_position mode: {}", s)),
        }
    }
}

/// Settings block for one strategy instance.
///
/// All keys are optional in the file; unset keys receive their defaults
/// at construction time so every strategy sees a fully-populated config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyConfig {
    /// Candle size in minutes this strategy subscribes to.
    pub candle_size: u32,
    /// Stop countdown in seconds. 0 = act immediately.
    pub time: u64,
    /// Trailing stop distance in percent of the position extreme.
    pub trailing_stop_perc: Decimal,
    /// Fixed absolute stop rate. 0 = disabled.
    pub stop: Decimal,
    /// When closing is allowed ("always" / "profit" / "loss").
    pub close_position: String,
    /// Pending order lifetime in candle ticks. 0 = never expires.
    pub expiry: u32,
    /// Delete expired pending orders (true) or force-execute them (false).
    pub delete_expired: bool,
    /// Delete a pending order when the governing value signals strongly
    /// in the opposite direction.
    pub delete_opposite: bool,
    /// Keep a position open while the last candle still moves its way.
    pub keep_trend_open: bool,
    /// Seconds of warning before a stop countdown fires. 0 = disabled.
    pub notify_before_stop_sec: u64,
    /// Lower band threshold for the governing value.
    pub low: f64,
    /// Upper band threshold for the governing value.
    pub high: f64,
    /// Execute pending orders on the first threshold breach instead of
    /// waiting for a bounce-back confirmation.
    pub immediate: bool,
    /// Trailing setback in percent once take-profit has armed.
    pub setback: Decimal,
    /// Unrealized profit in percent that arms take-profit.
    pub profit_perc: Decimal,
    /// Indicator period (e.g., RSI length).
    pub interval: u32,
    /// Names of strategies a runner consults for direction agreement.
    pub consult: Vec<String>,
    /// Consecutive agreeing candle ticks a runner requires.
    pub confirm_ticks: u32,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            candle_size: 60,               // 1h candles
            time: 7200,                    // 2h stop countdown
            trailing_stop_perc: dec!(1.0), // 1% trailing distance
            stop: Decimal::ZERO,           // fixed stop disabled
            close_position: "always".to_string(),
            expiry: 5,                // pending orders live 5 candle ticks
            delete_expired: true,     // drop instead of force-execute
            delete_opposite: true,    // cancel on a strong opposite signal
            keep_trend_open: true,    // don't fight a running trend
            notify_before_stop_sec: 0,
            low: 40.0,
            high: 60.0,
            immediate: false, // wait for bounce-back confirmation
            setback: dec!(0.3),
            profit_perc: dec!(1.5),
            interval: 14, // standard RSI length
            consult: Vec::new(),
            confirm_ticks: 1,
        }
    }
}

impl StrategyConfig {
    pub fn candle_interval(&self) -> CandleInterval {
        CandleInterval(self.candle_size)
    }

    /// Effective close-position mode, with invalid strings repaired.
    pub fn close_position_mode(&self) -> ClosePositionMode {
        ClosePositionMode::parse_or_repair(&self.close_position)
    }
}

/// One strategy to instantiate, by registered name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategySpec {
    /// Registered strategy name (e.g., "stop_loss", "rsi_orderer").
    pub strategy: String,
    /// Pairs this strategy runs on. Empty = all configured pairs.
    #[serde(default)]
    pub pairs: Vec<CurrencyPair>,
    /// Strategy settings, merged over defaults.
    #[serde(default)]
    pub settings: StrategyConfig,
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BotConfig {
    /// Execution mode.
    pub mode: TradingMode,
    /// Pairs the engine trades.
    pub pairs: Vec<CurrencyPair>,
    /// Log level filter (e.g., "info", "vela_bot=debug").
    pub log_level: String,
    /// Seconds of market data required before any trade may execute.
    pub warmup_secs: u64,
    /// Hard deadline after which a stuck in-flight trade is released.
    pub in_flight_timeout_secs: u64,
    /// Snapshot file for strategy state.
    pub snapshot_path: PathBuf,
    /// Seconds between periodic snapshots. 0 = only on shutdown.
    pub snapshot_interval_secs: u64,
    /// Minimum seconds between notifications sharing the same key.
    pub notify_throttle_secs: u64,
    /// Paper trading starting balance (quote currency).
    pub paper_balance: Decimal,
    /// Strategies to instantiate.
    pub strategies: Vec<StrategySpec>,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            mode: TradingMode::Paper,
            pairs: Vec::new(),
            log_level: "info".to_string(),
            warmup_secs: 300,           // 5 min of data before trading
            in_flight_timeout_secs: 90, // deadlock guard
            snapshot_path: PathBuf::from("state/strategies.json"),
            snapshot_interval_secs: 600,
            notify_throttle_secs: 900,
            paper_balance: dec!(10000),
            strategies: Vec::new(),
        }
    }
}

impl BotConfig {
    /// Load and validate a config file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: BotConfig = toml::from_str(&raw)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Structural validation. Contradictory required settings halt startup;
    /// value-level repairs happen later at strategy construction.
    pub fn validate(&self) -> Result<()> {
        if self.pairs.is_empty() {
            bail!("No trading pairs configured");
        }
        if self.strategies.is_empty() {
            bail!("No strategies configured");
        }
        if self.in_flight_timeout_secs == 0 {
            bail!("in_flight_timeout_secs must be > 0 (it is the deadlock guard)");
        }
        for spec in &self.strategies {
            if spec.settings.candle_size == 0 {
                bail!("Strategy '{}' has candle_size 0", spec.strategy);
            }
            for pair in &spec.pairs {
                if !self.pairs.contains(pair) {
                    bail!(
                        "Strategy '{}' references unconfigured pair {}",
                        spec.strategy,
                        pair
                    );
                }
            }
        }
        Ok(())
    }

    /// Pairs a spec applies to: its own list, or every configured pair.
    pub fn pairs_for(&self, spec: &StrategySpec) -> Vec<CurrencyPair> {
        if spec.pairs.is_empty() {
            self.pairs.clone()
        } else {
            spec.pairs.clone()
        }
    }
}

//! Candle-driven strategy composition and execution-gating engine.
//!
//! Strategies are small per-pair state machines driven by a logical
//! market clock: live trade batches keep rates and timers current, and
//! completed candles are the canonical decision points. Every decision
//! flows through a single gateway that enforces pause flags, a warmup
//! gate and per-pair in-flight exclusion before anything executes.
//!
//! ## Architecture
//!
//! - **One worker per pair**: strategies of a pair always run
//!   sequentially; pairs run concurrently and share only atomics
//! - **Logical market time**: countdowns and warmup follow event
//!   timestamps, never the wall clock, so replayed data behaves
//!   exactly like live data
//! - **Drop, never queue**: a gated action is discarded; the strategy
//!   re-decides on the next candle with fresh data
//!
//! ## Modules
//!
//! - `config`: TOML configuration loading and validation
//! - `state`: shared control flags, in-flight registry, metrics
//! - `strategy`: the strategy core and the concrete machines
//! - `group`: per-pair strategy registry and action routing
//! - `gateway`: the gating ladder in front of the execution backend
//! - `engine`: pair workers, candle building, snapshot scheduling

pub mod config;
pub mod engine;
pub mod executor;
pub mod gateway;
pub mod group;
pub mod indicator;
pub mod notify;
pub mod snapshot;
pub mod state;
pub mod strategy;
pub mod types;

pub use config::{BotConfig, ClosePositionMode, StrategyConfig, StrategySpec, TradingMode};
pub use engine::{CandleBuilder, Engine, MarketEvent};
pub use executor::{ExecutorError, NoopExecutor, PaperExecutor, TradeExecutor};
pub use gateway::{DispatchOutcome, DropReason, TradeGateway};
pub use group::StrategyGroup;
pub use notify::{LogNotifier, Notifier};
pub use snapshot::{SnapshotError, SnapshotFile, StrategySnapshot};
pub use state::{ControlFlags, EngineState, InFlightRegistry, MetricsCounters};
pub use strategy::{
    build_strategy, DirectionRunner, IntervalExtremes, LookbackWindow, RsiEntry, RsiOrderer,
    StopLoss, Strategy, StrategyCore, TakeProfit,
};
pub use types::{ActionRequest, ExecutedTrade, PortfolioSync, StrategyRole};

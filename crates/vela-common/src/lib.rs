//! Shared market types for the vela trading engine.

pub mod types;

pub use types::{
    Candle, CandleInterval, CandleTrend, CurrencyPair, PairParseError, PositionState, RawTrade,
    Side, TradeAction,
};

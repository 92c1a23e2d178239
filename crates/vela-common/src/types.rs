//! Shared types for the vela trading engine.
//!
//! CRITICAL: All prices and amounts use `rust_decimal::Decimal`.
//! NEVER use f64 for financial math.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A trading pair (base and quote currency).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CurrencyPair {
    /// Base currency (e.g., "BTC").
    pub base: String,
    /// Quote currency (e.g., "USD").
    pub quote: String,
}

impl CurrencyPair {
    pub fn new(base: impl Into<String>, quote: impl Into<String>) -> Self {
        Self {
            base: base.into().to_uppercase(),
            quote: quote.into().to_uppercase(),
        }
    }

    /// Canonical symbol form (e.g., "BTC_USD").
    pub fn symbol(&self) -> String {
        format!("{}_{}", self.base, self.quote)
    }
}

impl std::fmt::Display for CurrencyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}_{}", self.base, self.quote)
    }
}

/// Error returned when a pair symbol cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid currency pair: {0}")]
pub struct PairParseError(pub String);

impl std::str::FromStr for CurrencyPair {
    type Err = PairParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (base, quote) = s
            .split_once(['_', '/', '-'])
            .ok_or_else(|| PairParseError(s.to_string()))?;
        if base.is_empty() || quote.is_empty() {
            return Err(PairParseError(s.to_string()));
        }
        Ok(CurrencyPair::new(base, quote))
    }
}

impl TryFrom<String> for CurrencyPair {
    type Error = PairParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<CurrencyPair> for String {
    fn from(pair: CurrencyPair) -> Self {
        pair.symbol()
    }
}

/// Side of an executed market trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(&self) -> Self {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

/// Action a strategy can request from the execution layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeAction {
    /// Open (or add to) a long position.
    Buy,
    /// Open (or add to) a short position.
    Sell,
    /// Close whatever position is open.
    Close,
}

impl TradeAction {
    /// True for actions that open a position (buy/sell), false for close.
    pub fn opens_position(&self) -> bool {
        matches!(self, TradeAction::Buy | TradeAction::Sell)
    }

    /// The opening action in the opposite direction. Close has no opposite.
    pub fn opposite(&self) -> Option<TradeAction> {
        match self {
            TradeAction::Buy => Some(TradeAction::Sell),
            TradeAction::Sell => Some(TradeAction::Buy),
            TradeAction::Close => None,
        }
    }

    /// The position state this action leads into when it fills.
    pub fn resulting_position(&self) -> PositionState {
        match self {
            TradeAction::Buy => PositionState::Long,
            TradeAction::Sell => PositionState::Short,
            TradeAction::Close => PositionState::None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TradeAction::Buy => "buy",
            TradeAction::Sell => "sell",
            TradeAction::Close => "close",
        }
    }
}

impl std::fmt::Display for TradeAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for TradeAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "buy" | "long" => Ok(TradeAction::Buy),
            "sell" | "short" => Ok(TradeAction::Sell),
            "close" => Ok(TradeAction::Close),
            _ => Err(format!("Unknown trade action: {}", s)),
        }
    }
}

/// Current position of a strategy in its pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionState {
    /// No open position.
    #[default]
    None,
    Long,
    Short,
}

impl PositionState {
    pub fn is_open(&self) -> bool {
        !matches!(self, PositionState::None)
    }

    /// The action that would close this position, if any.
    pub fn closing_action(&self) -> Option<TradeAction> {
        match self {
            PositionState::None => None,
            PositionState::Long | PositionState::Short => Some(TradeAction::Close),
        }
    }

    /// Unrealized gain per unit for this position at `rate` given `entry`.
    /// Positive means the position is in profit.
    pub fn gain(&self, entry: Decimal, rate: Decimal) -> Decimal {
        match self {
            PositionState::None => Decimal::ZERO,
            PositionState::Long => rate - entry,
            PositionState::Short => entry - rate,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PositionState::None => "none",
            PositionState::Long => "long",
            PositionState::Short => "short",
        }
    }
}

impl std::fmt::Display for PositionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for PositionState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "none" | "flat" => Ok(PositionState::None),
            "long" => Ok(PositionState::Long),
            "short" => Ok(PositionState::Short),
            _ => Err(format!("Unknown position state: {}", s)),
        }
    }
}

/// Candle interval in minutes.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct CandleInterval(pub u32);

impl CandleInterval {
    pub const ONE_MIN: CandleInterval = CandleInterval(1);
    pub const ONE_HOUR: CandleInterval = CandleInterval(60);

    pub fn minutes(&self) -> u32 {
        self.0
    }

    pub fn as_duration(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.0 as i64)
    }
}

impl std::fmt::Display for CandleInterval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}m", self.0)
    }
}

/// A single executed market trade, as streamed from the exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawTrade {
    /// Execution price.
    #[serde(with = "rust_decimal::serde::str")]
    pub rate: Decimal,
    /// Traded base amount.
    #[serde(with = "rust_decimal::serde::str")]
    pub amount: Decimal,
    /// Exchange timestamp. Drives market time; never wall-clock.
    pub timestamp: DateTime<Utc>,
    pub side: Side,
}

impl RawTrade {
    pub fn new(rate: Decimal, amount: Decimal, timestamp: DateTime<Utc>, side: Side) -> Self {
        Self {
            rate,
            amount,
            timestamp,
            side,
        }
    }
}

/// Direction a completed candle moved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CandleTrend {
    Up,
    Down,
    Flat,
}

/// A completed OHLCV candle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub pair: CurrencyPair,
    pub interval: CandleInterval,
    /// Start of the candle period (market time).
    pub start: DateTime<Utc>,
    #[serde(with = "rust_decimal::serde::str")]
    pub open: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub high: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub low: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub close: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub volume: Decimal,
    /// Number of trades aggregated into this candle.
    pub trade_count: u32,
}

impl Candle {
    /// End of the candle period.
    pub fn end(&self) -> DateTime<Utc> {
        self.start + self.interval.as_duration()
    }

    pub fn trend(&self) -> CandleTrend {
        if self.close > self.open {
            CandleTrend::Up
        } else if self.close < self.open {
            CandleTrend::Down
        } else {
            CandleTrend::Flat
        }
    }

    /// Midpoint of high and low.
    pub fn hl2(&self) -> Decimal {
        (self.high + self.low) / Decimal::TWO
    }

    /// Build a candle by aggregating a non-empty trade slice.
    /// Returns None for an empty slice.
    pub fn from_trades(
        pair: CurrencyPair,
        interval: CandleInterval,
        start: DateTime<Utc>,
        trades: &[RawTrade],
    ) -> Option<Self> {
        let first = trades.first()?;
        let mut high = first.rate;
        let mut low = first.rate;
        let mut volume = Decimal::ZERO;
        for t in trades {
            high = high.max(t.rate);
            low = low.min(t.rate);
            volume += t.amount;
        }
        Some(Self {
            pair,
            interval,
            start,
            open: first.rate,
            high,
            low,
            close: trades[trades.len() - 1].rate,
            volume,
            trade_count: trades.len() as u32,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn ts(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn test_pair_parse_and_display() {
        let pair: CurrencyPair = "btc_usd".parse().unwrap();
        assert_eq!(pair, CurrencyPair::new("BTC", "USD"));
        assert_eq!(pair.to_string(), "BTC_USD");

        let slash: CurrencyPair = "ETH/USDT".parse().unwrap();
        assert_eq!(slash.symbol(), "ETH_USDT");

        assert!("BTCUSD".parse::<CurrencyPair>().is_err());
        assert!("_USD".parse::<CurrencyPair>().is_err());
    }

    #[test]
    fn test_trade_action_roundtrip() {
        for action in [TradeAction::Buy, TradeAction::Sell, TradeAction::Close] {
            let parsed: TradeAction = action.as_str().parse().unwrap();
            assert_eq!(parsed, action);
        }
        assert_eq!(TradeAction::Buy.opposite(), Some(TradeAction::Sell));
        assert_eq!(TradeAction::Close.opposite(), None);
        assert!(TradeAction::Buy.opens_position());
        assert!(!TradeAction::Close.opens_position());
    }

    #[test]
    fn test_position_gain() {
        assert_eq!(
            PositionState::Long.gain(dec!(100), dec!(110)),
            dec!(10)
        );
        assert_eq!(
            PositionState::Short.gain(dec!(100), dec!(110)),
            dec!(-10)
        );
        assert_eq!(PositionState::None.gain(dec!(100), dec!(110)), dec!(0));
    }

    #[test]
    fn test_candle_trend() {
        let pair = CurrencyPair::new("BTC", "USD");
        let mut candle = Candle {
            pair,
            interval: CandleInterval::ONE_HOUR,
            start: ts("2025-01-01T12:00:00Z"),
            open: dec!(100),
            high: dec!(110),
            low: dec!(95),
            close: dec!(105),
            volume: dec!(12),
            trade_count: 3,
        };
        assert_eq!(candle.trend(), CandleTrend::Up);
        assert_eq!(candle.end(), ts("2025-01-01T13:00:00Z"));

        candle.close = dec!(90);
        assert_eq!(candle.trend(), CandleTrend::Down);
        candle.close = candle.open;
        assert_eq!(candle.trend(), CandleTrend::Flat);
    }

    #[test]
    fn test_candle_from_trades() {
        let pair = CurrencyPair::new("BTC", "USD");
        let t0 = ts("2025-01-01T12:00:00Z");
        let trades = vec![
            RawTrade::new(dec!(100), dec!(1), t0, Side::Buy),
            RawTrade::new(dec!(120), dec!(2), t0 + chrono::Duration::minutes(5), Side::Buy),
            RawTrade::new(dec!(90), dec!(1), t0 + chrono::Duration::minutes(10), Side::Sell),
        ];
        let candle =
            Candle::from_trades(pair.clone(), CandleInterval::ONE_HOUR, t0, &trades).unwrap();
        assert_eq!(candle.open, dec!(100));
        assert_eq!(candle.high, dec!(120));
        assert_eq!(candle.low, dec!(90));
        assert_eq!(candle.close, dec!(90));
        assert_eq!(candle.volume, dec!(4));
        assert_eq!(candle.trade_count, 3);

        assert!(Candle::from_trades(pair, CandleInterval::ONE_HOUR, t0, &[]).is_none());
    }

    #[test]
    fn test_pair_serde_as_string() {
        let pair = CurrencyPair::new("BTC", "USD");
        let json = serde_json::to_string(&pair).unwrap();
        assert_eq!(json, "\"BTC_USD\"");
        let back: CurrencyPair = serde_json::from_str(&json).unwrap();
        assert_eq!(back, pair);
    }
}

//! Engine-level types: strategy roles, emitted actions, confirmed trades.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use vela_common::{CurrencyPair, PositionState, TradeAction};

/// Role tag a strategy declares at construction.
///
/// Role queries replace runtime type inspection: the gateway and the
/// strategy group only ever ask "is this a stop?", never "what type is
/// this?".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyRole {
    /// Opens positions from market signals.
    Entry,
    /// Closes losing positions.
    StopLoss,
    /// Closes winning positions.
    TakeProfit,
    /// Defers another strategy's signal until confirmation.
    Orderer,
    /// Computes values for others to consult; never trades.
    Indicator,
}

impl StrategyRole {
    /// True for roles whose closes must bypass the opening-pause gate.
    pub fn is_protective(&self) -> bool {
        matches!(self, StrategyRole::StopLoss | StrategyRole::TakeProfit)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyRole::Entry => "entry",
            StrategyRole::StopLoss => "stop_loss",
            StrategyRole::TakeProfit => "take_profit",
            StrategyRole::Orderer => "orderer",
            StrategyRole::Indicator => "indicator",
        }
    }
}

impl std::fmt::Display for StrategyRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An action a strategy asked the gateway to execute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRequest {
    pub pair: CurrencyPair,
    pub action: TradeAction,
    /// Name of the emitting strategy.
    pub origin: String,
    /// Role of the emitting strategy at emission time.
    pub role: StrategyRole,
    /// Human-readable reason, forwarded to logs and notifications.
    pub reason: String,
    /// Optional sizing weight, passed through to the backend untouched.
    #[serde(default, with = "rust_decimal::serde::str_option")]
    pub weight: Option<Decimal>,
    /// Venue routing hint for the backend (e.g., a preferred exchange).
    #[serde(default)]
    pub exchange_hint: Option<String>,
    /// Market time at emission.
    pub market_time: DateTime<Utc>,
}

impl ActionRequest {
    /// True if the opening-pause gate applies to this request.
    /// Closes always pass, as do stop/take-profit requests.
    pub fn blocked_by_opening_pause(&self) -> bool {
        self.action.opens_position() && !self.role.is_protective()
    }
}

/// A trade the backend confirmed as executed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutedTrade {
    pub order_id: String,
    pub pair: CurrencyPair,
    pub action: TradeAction,
    #[serde(with = "rust_decimal::serde::str")]
    pub rate: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub amount: Decimal,
    pub timestamp: DateTime<Utc>,
}

/// Exchange-reported position for one pair.
///
/// The exchange is the source of truth: strategies reconcile their local
/// state against this on every sync.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortfolioSync {
    pub pair: CurrencyPair,
    pub position: PositionState,
    #[serde(with = "rust_decimal::serde::str")]
    pub amount: Decimal,
    /// Exchange-side average entry rate, when a position is open.
    #[serde(default, with = "rust_decimal::serde::str_option")]
    pub entry_rate: Option<Decimal>,
    pub timestamp: DateTime<Utc>,
}

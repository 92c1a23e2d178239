//! Strategy machinery.
//!
//! Every strategy composes a [`StrategyCore`] (the shared lifecycle state
//! machine) and implements [`Strategy`] on top of it. The engine drives
//! strategies with trade batches and completed candles; strategies hand
//! back [`ActionRequest`]s through their core, and the gateway decides
//! what actually executes.

pub mod core;
pub mod intervals;
pub mod orderer;
pub mod stop;
pub mod take_profit;
pub mod technical;

use std::sync::Arc;

use anyhow::bail;
use serde_json::Value;

use vela_common::{Candle, CurrencyPair, RawTrade, TradeAction};

use crate::config::StrategyConfig;
use crate::notify::Notifier;
use crate::types::{ActionRequest, ExecutedTrade, PortfolioSync, StrategyRole};

pub use self::core::{CoreSnapshot, StrategyCore, SyncOutcome};
pub use self::intervals::{Extreme, ExtremeMap, IntervalExtremes, LookbackWindow};
pub use self::orderer::{DirectionRunner, PendingOrder, RsiOrderer};
pub use self::stop::{StopLoss, StopTimer};
pub use self::take_profit::TakeProfit;
pub use self::technical::{RsiEntry, TechnicalCore};

/// A per-pair trading strategy.
///
/// Default methods route the shared lifecycle through the core; concrete
/// strategies mostly implement `on_candle` plus their own reset hook.
pub trait Strategy: Send {
    fn core(&self) -> &StrategyCore;
    fn core_mut(&mut self) -> &mut StrategyCore;

    fn name(&self) -> &str {
        self.core().name()
    }

    fn role(&self) -> StrategyRole {
        self.core().role()
    }

    fn pair(&self) -> &CurrencyPair {
        self.core().pair()
    }

    /// Live trade batch. Updates market time, the rolling rate and the
    /// position extremes; no trading decisions are made here.
    fn on_tick(&mut self, trades: &[RawTrade]) {
        self.core_mut().update_from_trades(trades);
    }

    /// A completed candle for this strategy's interval: the canonical
    /// decision point.
    fn on_candle(&mut self, candle: &Candle);

    /// A confirmed execution for this strategy's pair, regardless of which
    /// strategy originated it. Core bookkeeping runs first, then the
    /// strategy-specific reset hook.
    fn on_trade(&mut self, trade: &ExecutedTrade) {
        if trade.pair != *self.core().pair() {
            return;
        }
        self.core_mut().apply_trade(trade);
        self.reset_values();
    }

    /// Exchange-reported position. The exchange wins every disagreement;
    /// a close the strategy missed is replayed through `on_trade` at most
    /// once.
    fn on_sync_portfolio(&mut self, sync: &PortfolioSync) {
        if sync.pair != *self.core().pair() {
            return;
        }
        if let SyncOutcome::MissedClose(trade) = self.core_mut().reconcile(sync) {
            self.on_trade(&trade);
        }
    }

    /// Clear strategy-specific position state. Runs after the core reset
    /// on every confirmed trade.
    fn reset_values(&mut self) {}

    /// The action this strategy most recently asked for, for runners that
    /// consult other strategies' direction.
    fn last_action(&self) -> Option<TradeAction> {
        self.core().last_emitted()
    }

    /// Offer an opening action for deferred execution. Orderer-role
    /// strategies accept buy/sell requests and return true; everything
    /// else declines and the request goes straight to the gateway.
    fn schedule(&mut self, _request: &ActionRequest) -> bool {
        false
    }

    /// Deferred orders this strategy dropped without executing since the
    /// last drain. The group releases the originators' emission guards so
    /// they can decide again.
    fn take_cancellations(&mut self) -> Vec<PendingOrder> {
        Vec::new()
    }

    /// Names of strategies whose direction this one consults each candle
    /// tick. The group feeds the answers through [`Strategy::on_direction`].
    fn consulted(&self) -> &[String] {
        &[]
    }

    /// Latest emitted action of a consulted strategy, delivered by the
    /// group before `on_candle`.
    fn on_direction(&mut self, _name: &str, _action: Option<TradeAction>) {}

    /// Wire a notification sink. Strategies that never notify ignore it.
    fn set_notifier(&mut self, _notifier: Arc<dyn Notifier>) {}

    /// Strategy-specific snapshot state, merged into the persisted record.
    fn snapshot_extra(&self) -> Value {
        Value::Null
    }

    /// Restore strategy-specific snapshot state. Implementations must
    /// tolerate missing or malformed values (old snapshots).
    fn restore_extra(&mut self, _extra: &Value) {}
}

/// Build a strategy by its registered name.
///
/// Unknown names halt initialization: a typo in the config must never
/// silently trade without its stop.
pub fn build_strategy(
    name: &str,
    pair: CurrencyPair,
    settings: &StrategyConfig,
) -> anyhow::Result<Box<dyn Strategy>> {
    match name {
        "stop_loss" => Ok(Box::new(StopLoss::new(pair, settings))),
        "take_profit" => Ok(Box::new(TakeProfit::new(pair, settings))),
        "rsi_orderer" => Ok(Box::new(RsiOrderer::new(pair, settings))),
        "direction_runner" => Ok(Box::new(DirectionRunner::new(pair, settings)?)),
        "rsi_entry" => Ok(Box::new(RsiEntry::new(pair, settings))),
        "interval_extremes" => Ok(Box::new(IntervalExtremes::new(pair, settings))),
        _ => bail!("Unknown strategy: {}", name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vela_common::CurrencyPair;

    #[test]
    fn test_build_strategy_known_names() {
        let settings = StrategyConfig {
            consult: vec!["rsi_entry".to_string()],
            ..StrategyConfig::default()
        };
        for name in [
            "stop_loss",
            "take_profit",
            "rsi_orderer",
            "direction_runner",
            "rsi_entry",
            "interval_extremes",
        ] {
            let strategy =
                build_strategy(name, CurrencyPair::new("BTC", "USD"), &settings).unwrap();
            assert_eq!(strategy.name(), name);
        }
    }

    #[test]
    fn test_build_strategy_unknown_name_fails() {
        let settings = StrategyConfig::default();
        assert!(build_strategy("hodl", CurrencyPair::new("BTC", "USD"), &settings).is_err());
    }

    #[test]
    fn test_build_direction_runner_without_consult_fails() {
        // Default settings carry an empty consult list: a runner built
        // from them could never confirm an order.
        let settings = StrategyConfig::default();
        assert!(
            build_strategy("direction_runner", CurrencyPair::new("BTC", "USD"), &settings)
                .is_err()
        );
    }
}

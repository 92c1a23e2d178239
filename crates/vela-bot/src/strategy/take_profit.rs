//! Take-profit strategy: locks in gains with a tighter trailing setback
//! once a profit target has been reached. Closes only, never opens.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde_json::{json, Value};
use tracing::debug;

use vela_common::{Candle, CurrencyPair, PositionState, TradeAction};

use crate::config::StrategyConfig;
use crate::indicator::{BollingerBandwidth, Indicator};
use crate::notify::Notifier;
use crate::strategy::stop::StopTimer;
use crate::strategy::technical::TechnicalCore;
use crate::strategy::{Strategy, StrategyCore};
use crate::types::StrategyRole;

pub struct TakeProfit {
    technical: TechnicalCore,
    timer: StopTimer,
    bandwidth: BollingerBandwidth,

    /// Unrealized profit in percent that arms the trailing setback.
    profit_perc: Decimal,
    /// Trailing distance in percent once armed. Tighter than a stop-loss.
    setback: Decimal,
    notify_before_sec: u64,

    /// Profit target reached for the current position.
    armed: bool,
    notified: bool,
    notifier: Option<Arc<dyn Notifier>>,
}

impl TakeProfit {
    pub fn new(pair: CurrencyPair, settings: &StrategyConfig) -> Self {
        let core = StrategyCore::new(
            "take_profit",
            StrategyRole::TakeProfit,
            pair,
            settings.candle_interval(),
        );
        Self {
            technical: TechnicalCore::new(core),
            timer: StopTimer::new(settings.time),
            bandwidth: BollingerBandwidth::new(settings.interval),
            profit_perc: settings.profit_perc,
            setback: settings.setback,
            notify_before_sec: settings.notify_before_stop_sec,
            armed: false,
            notified: false,
            notifier: None,
        }
    }

    /// Trailing exit rate once armed.
    fn exit_price(&self) -> Decimal {
        let core = self.technical.core();
        let perc = self.setback / Decimal::ONE_HUNDRED;
        match core.position() {
            PositionState::Long => core.highest_price() * (Decimal::ONE - perc),
            PositionState::Short => core.lowest_price() * (Decimal::ONE + perc),
            PositionState::None => Decimal::ZERO,
        }
    }
}

impl Strategy for TakeProfit {
    fn core(&self) -> &StrategyCore {
        self.technical.core()
    }

    fn core_mut(&mut self) -> &mut StrategyCore {
        self.technical.core_mut()
    }

    fn on_candle(&mut self, candle: &Candle) {
        self.technical.push_candle(candle);
        self.bandwidth.update(candle);

        let core = self.technical.core();
        if !core.position().is_open() || core.is_done() {
            self.armed = false;
            self.timer.disarm();
            self.notified = false;
            return;
        }

        if !self.armed {
            if core.profit_perc() >= self.profit_perc {
                debug!(
                    pair = %core.pair(),
                    profit = %core.profit_perc(),
                    "Profit target reached, trailing setback armed"
                );
                self.armed = true;
            } else {
                return;
            }
        }

        let exit = self.exit_price();
        let rate = core.rate();
        let pulled_back = match core.position() {
            PositionState::Long => rate <= exit,
            PositionState::Short => rate >= exit,
            PositionState::None => false,
        };
        let now = core.market_time().unwrap_or_else(|| candle.end());

        if !pulled_back {
            self.timer.disarm();
            self.notified = false;
            return;
        }

        self.timer.arm(now);
        let factor = self.bandwidth.volatility_factor();

        if !self.notified && self.timer.should_notify(now, factor, self.notify_before_sec) {
            if let Some(notifier) = &self.notifier {
                let pair = core.pair();
                notifier.notify(
                    &format!("take_profit.{}", pair),
                    "Take-profit imminent",
                    &format!("{} {} will take profit at {}", pair, core.position(), exit),
                    true,
                );
            }
            self.notified = true;
        }

        if !self.timer.should_fire(now, factor) {
            return;
        }
        // A pullback can overshoot past break-even; never close at a loss
        // from the strategy whose whole purpose is realizing a gain.
        if self.technical.core().profit_perc() <= Decimal::ZERO {
            debug!(pair = %self.core().pair(), "Pullback past break-even, leaving close to the stop");
            return;
        }

        let reason = format!("profit pullback to {}", exit);
        self.core_mut().emit(TradeAction::Close, reason);
        self.core_mut().set_done();
        self.timer.disarm();
        self.notified = false;
    }

    fn reset_values(&mut self) {
        self.armed = false;
        self.timer.disarm();
        self.notified = false;
    }

    fn set_notifier(&mut self, notifier: Arc<dyn Notifier>) {
        self.notifier = Some(notifier);
    }

    fn snapshot_extra(&self) -> Value {
        json!({
            "armed": self.armed,
            "timer_started": self.timer.started(),
        })
    }

    fn restore_extra(&mut self, extra: &Value) {
        if let Some(armed) = extra.get("armed").and_then(Value::as_bool) {
            self.armed = armed;
        }
        if let Some(started) = extra.get("timer_started") {
            let parsed: Option<DateTime<Utc>> =
                serde_json::from_value(started.clone()).unwrap_or(None);
            self.timer.restore(parsed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ExecutedTrade;
    use chrono::Duration;
    use rust_decimal_macros::dec;
    use vela_common::CandleInterval;

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn flat_candle(hour: i64, rate: Decimal) -> Candle {
        Candle {
            pair: CurrencyPair::new("BTC", "USD"),
            interval: CandleInterval::ONE_HOUR,
            start: t0() + Duration::hours(hour),
            open: rate,
            high: rate,
            low: rate,
            close: rate,
            volume: dec!(1),
            trade_count: 1,
        }
    }

    fn take_profit(time: u64) -> TakeProfit {
        let settings = StrategyConfig {
            time,
            profit_perc: dec!(2),
            setback: dec!(1),
            ..StrategyConfig::default()
        };
        let mut tp = TakeProfit::new(CurrencyPair::new("BTC", "USD"), &settings);
        tp.on_trade(&ExecutedTrade {
            order_id: "o1".to_string(),
            pair: CurrencyPair::new("BTC", "USD"),
            action: TradeAction::Buy,
            rate: dec!(100),
            amount: dec!(1),
            timestamp: t0(),
        });
        tp
    }

    #[test]
    fn test_quiet_below_profit_target() {
        let mut tp = take_profit(0);
        tp.on_candle(&flat_candle(1, dec!(101)));
        // +1% < 2% target: not armed, pullbacks irrelevant.
        tp.on_candle(&flat_candle(2, dec!(100)));
        assert!(tp.core_mut().take_actions().is_empty());
        assert!(!tp.armed);
    }

    #[test]
    fn test_closes_on_pullback_after_target() {
        let mut tp = take_profit(0);
        tp.on_candle(&flat_candle(1, dec!(103)));
        assert!(tp.armed);

        // Exit = 103 * 0.99 = 101.97; 101.5 pulls back through it.
        tp.on_candle(&flat_candle(2, dec!(101.5)));
        let actions = tp.core_mut().take_actions();
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].action, TradeAction::Close);
        assert!(tp.core().is_done());
    }

    #[test]
    fn test_never_closes_at_a_loss() {
        let mut tp = take_profit(0);
        tp.on_candle(&flat_candle(1, dec!(103)));
        assert!(tp.armed);

        // Crash straight through break-even: leave it to the stop-loss.
        tp.on_candle(&flat_candle(2, dec!(98)));
        assert!(tp.core_mut().take_actions().is_empty());
    }

    #[test]
    fn test_countdown_applies_to_pullback() {
        // 1h countdown on 1h candles.
        let mut tp = take_profit(3600);
        tp.on_candle(&flat_candle(1, dec!(103)));
        tp.on_candle(&flat_candle(2, dec!(101.5)));
        // Armed this tick; countdown not elapsed yet.
        assert!(tp.core_mut().take_actions().is_empty());

        tp.on_candle(&flat_candle(3, dec!(101.5)));
        assert_eq!(tp.core_mut().take_actions().len(), 1);
    }

    #[test]
    fn test_reset_disarms() {
        let mut tp = take_profit(0);
        tp.on_candle(&flat_candle(1, dec!(103)));
        assert!(tp.armed);

        tp.on_trade(&ExecutedTrade {
            order_id: "o2".to_string(),
            pair: CurrencyPair::new("BTC", "USD"),
            action: TradeAction::Close,
            rate: dec!(102),
            amount: dec!(1),
            timestamp: t0() + Duration::hours(2),
        });
        assert!(!tp.armed);
        assert_eq!(tp.core().position(), PositionState::None);
    }
}

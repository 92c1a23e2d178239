//! Stop-loss machinery: the volatility-scaled countdown timer and the
//! trailing stop strategy built on it.
//!
//! All timing is logical market time. A stop price crossing arms the
//! countdown; a favorable recross cancels it; only when the countdown
//! elapses does the close go out. High relative volatility shortens the
//! countdown so a fast market is exited faster.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use vela_common::{Candle, CandleTrend, CurrencyPair, PositionState, TradeAction};

use crate::config::{ClosePositionMode, StrategyConfig};
use crate::indicator::{BollingerBandwidth, Indicator, Rsi};
use crate::notify::Notifier;
use crate::strategy::technical::TechnicalCore;
use crate::strategy::{Strategy, StrategyCore};
use crate::types::StrategyRole;

/// Countdown armed when price crosses a stop, driven by market time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StopTimer {
    /// Configured countdown in seconds. 0 = fire immediately on breach.
    configured_secs: u64,
    /// Market time the current breach started, if any.
    started: Option<DateTime<Utc>>,
}

impl StopTimer {
    pub fn new(configured_secs: u64) -> Self {
        Self {
            configured_secs,
            started: None,
        }
    }

    /// Arm the countdown at `now`. A second arm while running is a no-op:
    /// the original breach time stands.
    pub fn arm(&mut self, now: DateTime<Utc>) {
        if self.started.is_none() {
            self.started = Some(now);
        }
    }

    /// Cancel the countdown (favorable recross).
    pub fn disarm(&mut self) {
        self.started = None;
    }

    pub fn is_armed(&self) -> bool {
        self.started.is_some()
    }

    pub fn started(&self) -> Option<DateTime<Utc>> {
        self.started
    }

    pub fn restore(&mut self, started: Option<DateTime<Utc>>) {
        self.started = started;
    }

    /// Effective countdown under a volatility factor: the configured
    /// duration divided by the factor, floored at one second. Factors
    /// below 1.0 are treated as 1.0, so the result never exceeds the
    /// configured duration. A configured 0 stays 0.
    pub fn effective_secs(&self, volatility_factor: f64) -> u64 {
        if self.configured_secs == 0 {
            return 0;
        }
        let scaled = (self.configured_secs as f64 / volatility_factor.max(1.0)).floor() as u64;
        scaled.max(1)
    }

    /// Market time the countdown elapses, if armed.
    pub fn fires_at(&self, volatility_factor: f64) -> Option<DateTime<Utc>> {
        self.started
            .map(|s| s + Duration::seconds(self.effective_secs(volatility_factor) as i64))
    }

    /// True once the armed countdown has elapsed at `now`.
    pub fn should_fire(&self, now: DateTime<Utc>, volatility_factor: f64) -> bool {
        match self.fires_at(volatility_factor) {
            Some(at) => now >= at,
            None => false,
        }
    }

    /// True inside the pre-fire warning window of `notify_before_sec`.
    pub fn should_notify(
        &self,
        now: DateTime<Utc>,
        volatility_factor: f64,
        notify_before_sec: u64,
    ) -> bool {
        if notify_before_sec == 0 {
            return false;
        }
        let Some(at) = self.fires_at(volatility_factor) else {
            return false;
        };
        now < at && now >= at - Duration::seconds(notify_before_sec as i64)
    }
}

/// Trailing stop-loss strategy.
///
/// Stop price priority: fixed stop, then break-even once the profit
/// trigger confirmed, then the trailing percentage off the position
/// extreme. Closing passes through three vetoes: the close-position
/// mode, the candle-trend hold and the RSI band.
pub struct StopLoss {
    technical: TechnicalCore,
    timer: StopTimer,
    bandwidth: BollingerBandwidth,

    trailing_perc: Decimal,
    fixed_stop: Decimal,
    close_mode: ClosePositionMode,
    keep_trend_open: bool,
    profit_trigger_perc: Decimal,
    rsi_low: f64,
    rsi_high: f64,
    notify_before_sec: u64,

    /// Break-even floor armed: profit threshold was confirmed at a
    /// candle close for the current position.
    profit_trigger_reached: bool,
    /// Pre-close warning already sent for the current breach.
    notified: bool,
    notifier: Option<Arc<dyn Notifier>>,
}

impl StopLoss {
    pub fn new(pair: CurrencyPair, settings: &StrategyConfig) -> Self {
        let core = StrategyCore::new(
            "stop_loss",
            StrategyRole::StopLoss,
            pair,
            settings.candle_interval(),
        );
        let mut technical = TechnicalCore::new(core);
        technical.add_indicator("rsi", Box::new(Rsi::new(settings.interval)));
        Self {
            technical,
            timer: StopTimer::new(settings.time),
            bandwidth: BollingerBandwidth::new(settings.interval),
            trailing_perc: settings.trailing_stop_perc,
            fixed_stop: settings.stop,
            close_mode: settings.close_position_mode(),
            keep_trend_open: settings.keep_trend_open,
            profit_trigger_perc: settings.profit_perc,
            rsi_low: settings.low,
            rsi_high: settings.high,
            notify_before_sec: settings.notify_before_stop_sec,
            profit_trigger_reached: false,
            notified: false,
            notifier: None,
        }
    }

    /// Current stop rate for the open position.
    pub fn stop_price(&self) -> Decimal {
        let core = self.technical.core();
        let perc = self.trailing_perc / Decimal::ONE_HUNDRED;
        match core.position() {
            PositionState::Long => {
                if self.fixed_stop > Decimal::ZERO {
                    return self.fixed_stop;
                }
                let trailing = core.highest_price() * (Decimal::ONE - perc);
                if self.profit_trigger_reached {
                    trailing.max(core.entry_price())
                } else {
                    trailing
                }
            }
            PositionState::Short => {
                if self.fixed_stop > Decimal::ZERO {
                    return self.fixed_stop;
                }
                let trailing = core.lowest_price() * (Decimal::ONE + perc);
                if self.profit_trigger_reached {
                    trailing.min(core.entry_price())
                } else {
                    trailing
                }
            }
            PositionState::None => Decimal::ZERO,
        }
    }

    fn close_mode_allows(&self) -> bool {
        let profit = self.technical.core().profit_perc();
        match self.close_mode {
            ClosePositionMode::Always => true,
            ClosePositionMode::Profit => profit > Decimal::ZERO,
            ClosePositionMode::Loss => profit <= Decimal::ZERO,
        }
    }

    fn trend_holds(&self, candle: &Candle) -> bool {
        if !self.keep_trend_open {
            return false;
        }
        matches!(
            (self.technical.core().position(), candle.trend()),
            (PositionState::Long, CandleTrend::Up) | (PositionState::Short, CandleTrend::Down)
        )
    }

    fn rsi_holds(&self) -> bool {
        let Some(rsi) = self.technical.indicator_value("rsi") else {
            return false;
        };
        // Don't sell into oversold, don't cover into overbought.
        match self.technical.core().position() {
            PositionState::Long => rsi < self.rsi_low,
            PositionState::Short => rsi > self.rsi_high,
            PositionState::None => false,
        }
    }
}

impl Strategy for StopLoss {
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
            self.timer.disarm();
            self.notified = false;
            return;
        }

        // The profit trigger only arms at a candle close, never intra-tick.
        if !self.profit_trigger_reached && core.profit_perc() >= self.profit_trigger_perc {
            debug!(
                pair = %core.pair(),
                profit = %core.profit_perc(),
                "Profit trigger reached, stop raised to break-even"
            );
            self.profit_trigger_reached = true;
        }

        let stop = self.stop_price();
        let rate = core.rate();
        let breached = match core.position() {
            PositionState::Long => rate <= stop,
            PositionState::Short => rate >= stop,
            PositionState::None => false,
        };
        let now = core.market_time().unwrap_or_else(|| candle.end());

        if !breached {
            if self.timer.is_armed() {
                debug!(pair = %core.pair(), rate = %rate, stop = %stop, "Recross, stop countdown cancelled");
            }
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
                    &format!("stop.{}", pair),
                    "Stop-loss imminent",
                    &format!(
                        "{} {} stop at {} will close in under {}s",
                        pair,
                        core.position(),
                        stop,
                        self.notify_before_sec
                    ),
                    true,
                );
            }
            self.notified = true;
        }

        if !self.timer.should_fire(now, factor) {
            return;
        }
        if !self.close_mode_allows() {
            debug!(pair = %core.pair(), mode = %self.close_mode, "Close-position mode vetoed stop");
            return;
        }
        if self.trend_holds(candle) {
            debug!(pair = %core.pair(), "Last candle still favors the position, holding");
            return;
        }
        if self.rsi_holds() {
            debug!(pair = %core.pair(), "RSI band vetoed stop");
            return;
        }

        let reason = format!("stop {} crossed for {}s", stop, self.timer.effective_secs(factor));
        self.core_mut().emit(TradeAction::Close, reason);
        self.core_mut().set_done();
        self.timer.disarm();
        self.notified = false;
    }

    fn reset_values(&mut self) {
        self.timer.disarm();
        self.profit_trigger_reached = false;
        self.notified = false;
    }

    fn set_notifier(&mut self, notifier: Arc<dyn Notifier>) {
        self.notifier = Some(notifier);
    }

    fn snapshot_extra(&self) -> Value {
        json!({
            "timer_started": self.timer.started(),
            "profit_trigger_reached": self.profit_trigger_reached,
        })
    }

    fn restore_extra(&mut self, extra: &Value) {
        if let Some(started) = extra.get("timer_started") {
            let parsed: Option<DateTime<Utc>> =
                serde_json::from_value(started.clone()).unwrap_or(None);
            self.timer.restore(parsed);
        }
        if let Some(reached) = extra.get("profit_trigger_reached").and_then(Value::as_bool) {
            self.profit_trigger_reached = reached;
        }
    }
}

//! Technical strategy base: core + candle history + indicators.

use std::collections::VecDeque;

use serde_json::Value;
use tracing::debug;

use vela_common::{Candle, CurrencyPair, TradeAction};

use crate::config::StrategyConfig;
use crate::indicator::{BollingerBandwidth, Indicator, IndicatorSet, Rsi};
use crate::strategy::{Strategy, StrategyCore};
use crate::types::StrategyRole;

/// How many completed candles a technical strategy retains.
const CANDLE_HISTORY: usize = 200;

/// Shared base for strategies that compute over candle history.
#[derive(Debug)]
pub struct TechnicalCore {
    core: StrategyCore,
    history: VecDeque<Candle>,
    indicators: IndicatorSet,
}

impl TechnicalCore {
    pub fn new(core: StrategyCore) -> Self {
        Self {
            core,
            history: VecDeque::with_capacity(CANDLE_HISTORY),
            indicators: IndicatorSet::new(),
        }
    }

    pub fn core(&self) -> &StrategyCore {
        &self.core
    }

    pub fn core_mut(&mut self) -> &mut StrategyCore {
        &mut self.core
    }

    pub fn add_indicator(&mut self, name: impl Into<String>, indicator: Box<dyn Indicator>) {
        self.indicators.add(name, indicator);
    }

    /// Fold a completed candle into the core, the history and every
    /// registered indicator.
    pub fn push_candle(&mut self, candle: &Candle) {
        self.core.update_from_candle(candle);
        self.history.push_back(candle.clone());
        if self.history.len() > CANDLE_HISTORY {
            self.history.pop_front();
        }
        self.indicators.update_all(candle);
    }

    pub fn indicator_value(&self, name: &str) -> Option<f64> {
        self.indicators.value(name)
    }

    pub fn history(&self) -> &VecDeque<Candle> {
        &self.history
    }
}

/// RSI entry strategy: opens long on oversold, short on overbought.
pub struct RsiEntry {
    technical: TechnicalCore,
    low: f64,
    high: f64,
}

impl RsiEntry {
    pub fn new(pair: CurrencyPair, settings: &StrategyConfig) -> Self {
        let core = StrategyCore::new(
            "rsi_entry",
            StrategyRole::Entry,
            pair,
            settings.candle_interval(),
        );
        let mut technical = TechnicalCore::new(core);
        technical.add_indicator("rsi", Box::new(Rsi::new(settings.interval)));
        technical.add_indicator(
            "bandwidth",
            Box::new(BollingerBandwidth::new(settings.interval)),
        );
        Self {
            technical,
            low: settings.low,
            high: settings.high,
        }
    }
}

impl Strategy for RsiEntry {
    fn core(&self) -> &StrategyCore {
        self.technical.core()
    }

    fn core_mut(&mut self) -> &mut StrategyCore {
        self.technical.core_mut()
    }

    fn on_candle(&mut self, candle: &Candle) {
        self.technical.push_candle(candle);

        let Some(rsi) = self.technical.indicator_value("rsi") else {
            return;
        };
        if self.core().position().is_open() {
            return;
        }

        if rsi < self.low {
            let reason = format!("RSI {:.1} below {:.1}, oversold", rsi, self.low);
            self.core_mut().emit(TradeAction::Buy, reason);
        } else if rsi > self.high {
            let reason = format!("RSI {:.1} above {:.1}, overbought", rsi, self.high);
            self.core_mut().emit(TradeAction::Sell, reason);
        } else {
            debug!(
                pair = %self.core().pair(),
                rsi,
                "RSI inside neutral band, no entry"
            );
        }
    }

    fn snapshot_extra(&self) -> Value {
        Value::Null
    }
}

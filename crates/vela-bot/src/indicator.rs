//! Technical indicators over completed candles.
//!
//! Indicators are black boxes to the rest of the engine: strategies
//! register them by name, feed them candles, and read back a plain `f64`.
//! Prices stay `Decimal` until the final dimensionless computation.

use std::collections::{HashMap, VecDeque};

use rust_decimal::prelude::ToPrimitive;
use vela_common::Candle;

/// A value computed from completed candles.
pub trait Indicator: Send {
    /// Feed one completed candle.
    fn update(&mut self, candle: &Candle);

    /// Current value, once enough candles have been seen.
    fn value(&self) -> Option<f64>;

    fn is_ready(&self) -> bool {
        self.value().is_some()
    }
}

/// Name-keyed indicator registry owned by a technical strategy.
#[derive(Default)]
pub struct IndicatorSet {
    indicators: HashMap<String, Box<dyn Indicator>>,
}

impl IndicatorSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, name: impl Into<String>, indicator: Box<dyn Indicator>) {
        self.indicators.insert(name.into(), indicator);
    }

    pub fn update_all(&mut self, candle: &Candle) {
        for indicator in self.indicators.values_mut() {
            indicator.update(candle);
        }
    }

    pub fn value(&self, name: &str) -> Option<f64> {
        self.indicators.get(name).and_then(|i| i.value())
    }

    pub fn get(&self, name: &str) -> Option<&dyn Indicator> {
        self.indicators.get(name).map(|i| i.as_ref())
    }

    pub fn is_empty(&self) -> bool {
        self.indicators.is_empty()
    }
}

impl std::fmt::Debug for IndicatorSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndicatorSet")
            .field("names", &self.indicators.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Relative Strength Index with Wilder smoothing.
#[derive(Debug)]
pub struct Rsi {
    period: u32,
    last_close: Option<f64>,
    /// Changes seen before the initial averages exist.
    seed_changes: Vec<f64>,
    avg_gain: f64,
    avg_loss: f64,
    value: Option<f64>,
}

impl Rsi {
    pub fn new(period: u32) -> Self {
        Self {
            period: period.max(1),
            last_close: None,
            seed_changes: Vec::new(),
            avg_gain: 0.0,
            avg_loss: 0.0,
            value: None,
        }
    }

    fn compute(&self) -> f64 {
        if self.avg_loss == 0.0 {
            return 100.0;
        }
        let rs = self.avg_gain / self.avg_loss;
        100.0 - 100.0 / (1.0 + rs)
    }
}

impl Indicator for Rsi {
    fn update(&mut self, candle: &Candle) {
        let close = candle.close.to_f64().unwrap_or(0.0);
        let Some(last) = self.last_close.replace(close) else {
            return;
        };
        let change = close - last;

        if self.value.is_none() && (self.seed_changes.len() as u32) < self.period {
            self.seed_changes.push(change);
            if self.seed_changes.len() as u32 == self.period {
                let n = self.period as f64;
                self.avg_gain = self.seed_changes.iter().filter(|c| **c > 0.0).sum::<f64>() / n;
                self.avg_loss =
                    -self.seed_changes.iter().filter(|c| **c < 0.0).sum::<f64>() / n;
                self.value = Some(self.compute());
            }
            return;
        }

        let n = self.period as f64;
        self.avg_gain = (self.avg_gain * (n - 1.0) + change.max(0.0)) / n;
        self.avg_loss = (self.avg_loss * (n - 1.0) + (-change).max(0.0)) / n;
        self.value = Some(self.compute());
    }

    fn value(&self) -> Option<f64> {
        self.value
    }
}

/// Bollinger bandwidth, plus its ratio to a trailing average bandwidth.
///
/// The ratio is the volatility factor stop timers divide their configured
/// duration by: high relative volatility shortens the countdown.
#[derive(Debug)]
pub struct BollingerBandwidth {
    period: usize,
    mult: f64,
    closes: VecDeque<f64>,
    /// Trailing bandwidth samples used for the average.
    history: VecDeque<f64>,
    history_cap: usize,
    value: Option<f64>,
}

impl BollingerBandwidth {
    const DEFAULT_MULT: f64 = 2.0;

    pub fn new(period: u32) -> Self {
        let period = period.max(2) as usize;
        Self {
            period,
            mult: Self::DEFAULT_MULT,
            closes: VecDeque::with_capacity(period),
            history: VecDeque::new(),
            history_cap: period * 3,
            value: None,
        }
    }

    /// Current bandwidth divided by the trailing average bandwidth,
    /// clamped to >= 1.0 so quiet markets never stretch a stop beyond
    /// its configured duration. 1.0 until ready.
    pub fn volatility_factor(&self) -> f64 {
        let Some(current) = self.value else {
            return 1.0;
        };
        if self.history.is_empty() {
            return 1.0;
        }
        let avg = self.history.iter().sum::<f64>() / self.history.len() as f64;
        if avg <= 0.0 {
            return 1.0;
        }
        (current / avg).max(1.0)
    }
}

impl Indicator for BollingerBandwidth {
    fn update(&mut self, candle: &Candle) {
        let close = candle.close.to_f64().unwrap_or(0.0);
        self.closes.push_back(close);
        if self.closes.len() > self.period {
            self.closes.pop_front();
        }
        if self.closes.len() < self.period {
            return;
        }

        let n = self.period as f64;
        let mean = self.closes.iter().sum::<f64>() / n;
        let variance = self.closes.iter().map(|c| (c - mean).powi(2)).sum::<f64>() / n;
        let std_dev = variance.sqrt();
        let bandwidth = if mean.abs() > f64::EPSILON {
            2.0 * self.mult * std_dev / mean
        } else {
            0.0
        };

        if let Some(previous) = self.value.replace(bandwidth) {
            self.history.push_back(previous);
            if self.history.len() > self.history_cap {
                self.history.pop_front();
            }
        }
    }

    fn value(&self) -> Option<f64> {
        self.value
    }
}

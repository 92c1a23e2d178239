//! Price extremes over ordered lookback windows.
//!
//! Hourly candles are retained up to the longest window; each completed
//! candle updates the per-window extremes incrementally. A full rescan of
//! a window only happens when its defining sample ages out.

use std::collections::{BTreeMap, VecDeque};

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::error;

use vela_common::{Candle, CurrencyPair};

use crate::config::StrategyConfig;
use crate::strategy::{Strategy, StrategyCore};
use crate::types::StrategyRole;

/// Ordered lookback windows, shortest first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum LookbackWindow {
    HalfDay,
    Day,
    Week,
    TwoWeeks,
    Month,
}

impl LookbackWindow {
    pub const ALL: [LookbackWindow; 5] = [
        LookbackWindow::HalfDay,
        LookbackWindow::Day,
        LookbackWindow::Week,
        LookbackWindow::TwoWeeks,
        LookbackWindow::Month,
    ];

    pub fn hours(&self) -> i64 {
        match self {
            LookbackWindow::HalfDay => 12,
            LookbackWindow::Day => 24,
            LookbackWindow::Week => 7 * 24,
            LookbackWindow::TwoWeeks => 14 * 24,
            LookbackWindow::Month => 30 * 24,
        }
    }

    pub fn as_duration(&self) -> Duration {
        Duration::hours(self.hours())
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LookbackWindow::HalfDay => "12h",
            LookbackWindow::Day => "1d",
            LookbackWindow::Week => "1w",
            LookbackWindow::TwoWeeks => "2w",
            LookbackWindow::Month => "1M",
        }
    }
}

impl std::fmt::Display for LookbackWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Low/high of a window, with the candle times that defined them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Extreme {
    #[serde(with = "rust_decimal::serde::str")]
    pub low: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub high: Decimal,
    pub low_time: DateTime<Utc>,
    pub high_time: DateTime<Utc>,
}

/// Per-window extremes over a retained hourly-candle buffer.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtremeMap {
    candles: VecDeque<Candle>,
    extremes: BTreeMap<LookbackWindow, Extreme>,
}

impl ExtremeMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.extremes.is_empty()
    }

    pub fn extreme(&self, window: LookbackWindow) -> Option<&Extreme> {
        self.extremes.get(&window)
    }

    /// Fold in a completed candle and bring every window up to date.
    pub fn push(&mut self, candle: &Candle) {
        self.candles.push_back(candle.clone());
        let now = candle.end();

        // Retention is bounded by the longest window.
        let horizon = now - LookbackWindow::Month.as_duration();
        while let Some(front) = self.candles.front() {
            if front.start < horizon {
                self.candles.pop_front();
            } else {
                break;
            }
        }

        for window in LookbackWindow::ALL {
            self.update_window(window, candle, now);
        }
    }

    fn update_window(&mut self, window: LookbackWindow, candle: &Candle, now: DateTime<Utc>) {
        let cutoff = now - window.as_duration();
        let current = self.extremes.get(&window);

        // The new candle extends the extreme, or the defining sample aged
        // out; anything else leaves the entry untouched.
        let needs_rescan = match current {
            None => true,
            Some(extreme) => extreme.low_time < cutoff || extreme.high_time < cutoff,
        };

        if needs_rescan {
            if let Some(extreme) = self.scan(cutoff) {
                self.extremes.insert(window, extreme);
            }
            return;
        }

        let Some(extreme) = self.extremes.get_mut(&window) else {
            return;
        };
        if candle.low < extreme.low {
            extreme.low = candle.low;
            extreme.low_time = candle.start;
        }
        if candle.high > extreme.high {
            extreme.high = candle.high;
            extreme.high_time = candle.start;
        }
    }

    fn scan(&self, cutoff: DateTime<Utc>) -> Option<Extreme> {
        let mut iter = self.candles.iter().filter(|c| c.start >= cutoff);
        let first = iter.next()?;
        let mut extreme = Extreme {
            low: first.low,
            high: first.high,
            low_time: first.start,
            high_time: first.start,
        };
        for candle in iter {
            if candle.low < extreme.low {
                extreme.low = candle.low;
                extreme.low_time = candle.start;
            }
            if candle.high > extreme.high {
                extreme.high = candle.high;
                extreme.high_time = candle.start;
            }
        }
        Some(extreme)
    }
}

/// Indicator-role strategy that maintains an [`ExtremeMap`] for its pair.
pub struct IntervalExtremes {
    core: StrategyCore,
    map: ExtremeMap,
}

impl IntervalExtremes {
    pub fn new(pair: CurrencyPair, settings: &StrategyConfig) -> Self {
        Self {
            core: StrategyCore::new(
                "interval_extremes",
                StrategyRole::Indicator,
                pair,
                settings.candle_interval(),
            ),
            map: ExtremeMap::new(),
        }
    }

    pub fn map(&self) -> &ExtremeMap {
        &self.map
    }
}

impl Strategy for IntervalExtremes {
    fn core(&self) -> &StrategyCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut StrategyCore {
        &mut self.core
    }

    fn on_candle(&mut self, candle: &Candle) {
        self.core.update_from_candle(candle);
        self.map.push(candle);
    }

    fn snapshot_extra(&self) -> Value {
        json!({ "extreme_map": self.map })
    }

    fn restore_extra(&mut self, extra: &Value) {
        let Some(raw) = extra.get("extreme_map") else {
            return;
        };
        match serde_json::from_value::<ExtremeMap>(raw.clone()) {
            Ok(map) if !map.is_empty() => self.map = map,
            Ok(_) => {
                error!(
                    pair = %self.core.pair(),
                    "Snapshot carried an empty extreme map, rebuilding from live candles"
                );
            }
            Err(err) => {
                error!(
                    pair = %self.core.pair(),
                    error = %err,
                    "Corrupt extreme map in snapshot, rebuilding from live candles"
                );
            }
        }
    }
}

//! Orderers: strategies that hold another strategy's opening action until
//! a confirmation arrives, instead of executing it on the spot.
//!
//! At most one order is pending per orderer. Rescheduling the identical
//! order is a no-op; a different one overwrites with a warning. Pending
//! orders age by candle ticks and either get deleted or force-executed
//! when they expire.

use std::collections::HashMap;

use anyhow::bail;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use vela_common::{Candle, CurrencyPair, TradeAction};

use crate::config::StrategyConfig;
use crate::indicator::Rsi;
use crate::strategy::technical::TechnicalCore;
use crate::strategy::{Strategy, StrategyCore};
use crate::types::{ActionRequest, StrategyRole};

/// An opening action waiting for confirmation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingOrder {
    pub action: TradeAction,
    /// Name of the strategy that requested it.
    pub origin: String,
    pub reason: String,
    #[serde(default, with = "rust_decimal::serde::str_option")]
    pub weight: Option<Decimal>,
    /// Venue routing hint, carried through to the eventual execution.
    #[serde(default)]
    pub exchange_hint: Option<String>,
    /// Candle ticks survived so far.
    pub age_ticks: u32,
}

impl PendingOrder {
    fn from_request(request: &ActionRequest) -> Self {
        Self {
            action: request.action,
            origin: request.origin.clone(),
            reason: request.reason.clone(),
            weight: request.weight,
            exchange_hint: request.exchange_hint.clone(),
            age_ticks: 0,
        }
    }

    fn same_as(&self, request: &ActionRequest) -> bool {
        self.action == request.action && self.origin == request.origin
    }
}

/// What a candle tick did to the pending slot.
#[derive(Debug, Clone, PartialEq)]
enum ExpiryOutcome {
    /// Still pending (or nothing pending).
    Kept,
    Deleted(PendingOrder),
    ForceExecute(PendingOrder),
}

/// The single-order slot shared by all orderers.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
struct PendingSlot {
    order: Option<PendingOrder>,
}

impl PendingSlot {
    /// Accept, ignore or overwrite. Identical action+origin is a no-op
    /// that keeps the original age; anything else replaces the slot and
    /// hands back the order it displaced.
    fn schedule(
        &mut self,
        strategy: &str,
        pair: &CurrencyPair,
        request: &ActionRequest,
    ) -> Option<PendingOrder> {
        match &self.order {
            Some(pending) if pending.same_as(request) => {
                debug!(
                    strategy = %strategy,
                    pair = %pair,
                    action = %request.action,
                    "Identical order already pending, keeping original"
                );
                None
            }
            Some(pending) => {
                warn!(
                    strategy = %strategy,
                    pair = %pair,
                    old_action = %pending.action,
                    old_origin = %pending.origin,
                    new_action = %request.action,
                    new_origin = %request.origin,
                    "Overwriting pending order"
                );
                self.order.replace(PendingOrder::from_request(request))
            }
            None => {
                info!(
                    strategy = %strategy,
                    pair = %pair,
                    action = %request.action,
                    origin = %request.origin,
                    "Order pending confirmation"
                );
                self.order = Some(PendingOrder::from_request(request));
                None
            }
        }
    }

    /// Age the pending order by one candle tick and resolve expiry.
    fn tick(&mut self, expiry: u32, delete_expired: bool) -> ExpiryOutcome {
        let Some(order) = self.order.as_mut() else {
            return ExpiryOutcome::Kept;
        };
        order.age_ticks += 1;
        if expiry == 0 || order.age_ticks < expiry {
            return ExpiryOutcome::Kept;
        }
        match self.order.take() {
            Some(order) if delete_expired => ExpiryOutcome::Deleted(order),
            Some(order) => ExpiryOutcome::ForceExecute(order),
            None => ExpiryOutcome::Kept,
        }
    }

    fn take(&mut self) -> Option<PendingOrder> {
        self.order.take()
    }

    fn get(&self) -> Option<&PendingOrder> {
        self.order.as_ref()
    }

    fn clear(&mut self) {
        self.order = None;
    }
}

// ============================================================================
// RSI orderer
// ============================================================================

/// Defers opening orders until its own RSI confirms the direction.
///
/// Immediate mode executes a pending buy the moment RSI breaks above the
/// upper threshold (sell below the lower one). Bounce-back mode demands a
/// reversal first: the value must cross the band midline away from the
/// pending direction and then come back through it.
pub struct RsiOrderer {
    technical: TechnicalCore,
    slot: PendingSlot,

    low: f64,
    high: f64,
    immediate: bool,
    expiry: u32,
    delete_expired: bool,
    delete_opposite: bool,

    /// Previous governing value, kept across resets.
    prev_value: Option<f64>,
    /// Orders dropped without executing, awaiting the group's drain so
    /// their originators can decide again.
    cancelled: Vec<PendingOrder>,
}

impl RsiOrderer {
    pub fn new(pair: CurrencyPair, settings: &StrategyConfig) -> Self {
        let core = StrategyCore::new(
            "rsi_orderer",
            StrategyRole::Orderer,
            pair,
            settings.candle_interval(),
        );
        let mut technical = TechnicalCore::new(core);
        technical.add_indicator("rsi", Box::new(Rsi::new(settings.interval)));
        Self {
            technical,
            slot: PendingSlot::default(),
            low: settings.low,
            high: settings.high,
            immediate: settings.immediate,
            expiry: settings.expiry,
            delete_expired: settings.delete_expired,
            delete_opposite: settings.delete_opposite,
            prev_value: None,
            cancelled: Vec::new(),
        }
    }

    pub fn pending(&self) -> Option<&PendingOrder> {
        self.slot.get()
    }

    /// Drop whatever is pending.
    pub fn delete_pending(&mut self) {
        if let Some(order) = self.slot.take() {
            info!(
                pair = %self.core().pair(),
                action = %order.action,
                origin = %order.origin,
                "Pending order deleted"
            );
            self.cancelled.push(order);
        }
    }

    fn midline(&self) -> f64 {
        (self.low + self.high) / 2.0
    }

    fn execute(&mut self, order: PendingOrder, how: &str) {
        let reason = format!("{} ({}: {})", order.reason, how, order.origin);
        self.core_mut()
            .emit_weighted(order.action, reason, order.weight, order.exchange_hint);
    }

    /// Evaluate the governing value against the pending order.
    fn evaluate(&mut self, value: f64) {
        let prev = self.prev_value.replace(value);
        let Some(pending) = self.slot.get().cloned() else {
            return;
        };

        // A strong signal against the pending direction cancels it.
        if self.delete_opposite {
            let against = match pending.action {
                TradeAction::Buy => value <= self.low,
                TradeAction::Sell => value >= self.high,
                TradeAction::Close => false,
            };
            if against {
                info!(
                    pair = %self.core().pair(),
                    value,
                    action = %pending.action,
                    "Opposite signal, deleting pending order"
                );
                if let Some(order) = self.slot.take() {
                    self.cancelled.push(order);
                }
                return;
            }
        }

        if self.immediate {
            let confirmed = match pending.action {
                TradeAction::Buy => value >= self.high,
                TradeAction::Sell => value <= self.low,
                TradeAction::Close => true,
            };
            if confirmed {
                self.slot.clear();
                self.execute(pending, "immediate threshold");
            }
            return;
        }

        // Bounce-back: the value must cross the band midline against the
        // pending direction, then reverse back through it. The first
        // sample only establishes state.
        let Some(prev) = prev else {
            return;
        };
        let mid = self.midline();
        let bounced = match pending.action {
            TradeAction::Buy => prev < mid && value >= mid,
            TradeAction::Sell => prev > mid && value <= mid,
            TradeAction::Close => true,
        };
        if bounced {
            self.slot.clear();
            self.execute(pending, "bounce-back");
        }
    }
}

impl Strategy for RsiOrderer {
    fn core(&self) -> &StrategyCore {
        self.technical.core()
    }

    fn core_mut(&mut self) -> &mut StrategyCore {
        self.technical.core_mut()
    }

    fn schedule(&mut self, request: &ActionRequest) -> bool {
        if !request.action.opens_position() {
            return false;
        }
        let pair = self.core().pair().clone();
        if let Some(displaced) = self.slot.schedule("rsi_orderer", &pair, request) {
            self.cancelled.push(displaced);
        }
        true
    }

    fn take_cancellations(&mut self) -> Vec<PendingOrder> {
        std::mem::take(&mut self.cancelled)
    }

    fn on_candle(&mut self, candle: &Candle) {
        self.technical.push_candle(candle);

        match self.slot.tick(self.expiry, self.delete_expired) {
            ExpiryOutcome::Kept => {}
            ExpiryOutcome::Deleted(order) => {
                info!(
                    pair = %self.core().pair(),
                    action = %order.action,
                    origin = %order.origin,
                    age = order.age_ticks,
                    "Pending order expired, deleted"
                );
                self.cancelled.push(order);
                return;
            }
            ExpiryOutcome::ForceExecute(order) => {
                info!(
                    pair = %self.core().pair(),
                    action = %order.action,
                    age = order.age_ticks,
                    "Pending order expired, force-executing"
                );
                self.execute(order, "expiry");
                return;
            }
        }

        if let Some(rsi) = self.technical.indicator_value("rsi") {
            self.evaluate(rsi);
        }
    }

    fn reset_values(&mut self) {
        // The governing-value history deliberately survives; only the
        // pending slot belongs to the position that just traded.
        self.slot.clear();
    }

    fn snapshot_extra(&self) -> Value {
        json!({
            "pending": self.slot,
            "prev_value": self.prev_value,
        })
    }

    fn restore_extra(&mut self, extra: &Value) {
        if let Some(pending) = extra.get("pending") {
            if let Ok(slot) = serde_json::from_value::<PendingSlot>(pending.clone()) {
                self.slot = slot;
            }
        }
        if let Some(prev) = extra.get("prev_value").and_then(Value::as_f64) {
            self.prev_value = Some(prev);
        }
    }
}

// ============================================================================
// Direction runner
// ============================================================================

/// Defers opening orders until every consulted strategy's latest action
/// agrees with the pending direction for `confirm_ticks` consecutive
/// candle ticks.
pub struct DirectionRunner {
    core: StrategyCore,
    slot: PendingSlot,

    consult: Vec<String>,
    confirm_ticks: u32,
    expiry: u32,
    delete_expired: bool,

    /// Latest known direction per consulted strategy.
    directions: HashMap<String, Option<TradeAction>>,
    /// Consecutive agreeing candle ticks.
    streak: u32,
    /// Orders dropped without executing, awaiting the group's drain.
    cancelled: Vec<PendingOrder>,
}

impl DirectionRunner {
    /// A runner without anyone to consult can never confirm anything, so
    /// an empty `consult` list halts initialization.
    pub fn new(pair: CurrencyPair, settings: &StrategyConfig) -> anyhow::Result<Self> {
        if settings.consult.is_empty() {
            bail!("direction_runner for {} has no 'consult' strategies", pair);
        }
        Ok(Self {
            core: StrategyCore::new(
                "direction_runner",
                StrategyRole::Orderer,
                pair,
                settings.candle_interval(),
            ),
            slot: PendingSlot::default(),
            consult: settings.consult.clone(),
            confirm_ticks: settings.confirm_ticks.max(1),
            expiry: settings.expiry,
            delete_expired: settings.delete_expired,
            directions: HashMap::new(),
            streak: 0,
            cancelled: Vec::new(),
        })
    }

    pub fn pending(&self) -> Option<&PendingOrder> {
        self.slot.get()
    }

    fn all_agree(&self, action: TradeAction) -> bool {
        self.consult.iter().all(|name| {
            self.directions.get(name).copied().flatten() == Some(action)
        })
    }
}

impl Strategy for DirectionRunner {
    fn core(&self) -> &StrategyCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut StrategyCore {
        &mut self.core
    }

    fn schedule(&mut self, request: &ActionRequest) -> bool {
        if !request.action.opens_position() {
            return false;
        }
        let pair = self.core.pair().clone();
        if let Some(displaced) = self.slot.schedule("direction_runner", &pair, request) {
            self.cancelled.push(displaced);
        }
        self.streak = 0;
        true
    }

    fn take_cancellations(&mut self) -> Vec<PendingOrder> {
        std::mem::take(&mut self.cancelled)
    }

    fn consulted(&self) -> &[String] {
        &self.consult
    }

    fn on_direction(&mut self, name: &str, action: Option<TradeAction>) {
        self.directions.insert(name.to_string(), action);
    }

    fn on_candle(&mut self, candle: &Candle) {
        self.core.update_from_candle(candle);

        match self.slot.tick(self.expiry, self.delete_expired) {
            ExpiryOutcome::Kept => {}
            ExpiryOutcome::Deleted(order) => {
                info!(
                    pair = %self.core.pair(),
                    action = %order.action,
                    "Unconfirmed order expired, deleted"
                );
                self.cancelled.push(order);
                self.streak = 0;
                return;
            }
            ExpiryOutcome::ForceExecute(order) => {
                let reason = format!("{} (expiry: {})", order.reason, order.origin);
                self.core
                    .emit_weighted(order.action, reason, order.weight, order.exchange_hint);
                self.streak = 0;
                return;
            }
        }

        let Some(pending) = self.slot.get().cloned() else {
            return;
        };
        if self.all_agree(pending.action) {
            self.streak += 1;
        } else {
            self.streak = 0;
        }
        if self.streak >= self.confirm_ticks {
            self.slot.clear();
            self.streak = 0;
            let reason = format!(
                "{} (confirmed by {})",
                pending.reason,
                self.consult.join(", ")
            );
            self.core
                .emit_weighted(pending.action, reason, pending.weight, pending.exchange_hint);
        }
    }

    fn reset_values(&mut self) {
        self.slot.clear();
        self.streak = 0;
    }

    fn snapshot_extra(&self) -> Value {
        json!({
            "pending": self.slot,
            "streak": self.streak,
        })
    }

    fn restore_extra(&mut self, extra: &Value) {
        if let Some(pending) = extra.get("pending") {
            if let Ok(slot) = serde_json::from_value::<PendingSlot>(pending.clone()) {
                self.slot = slot;
            }
        }
        if let Some(streak) = extra.get("streak").and_then(Value::as_u64) {
            self.streak = streak as u32;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration, Utc};
    use rust_decimal_macros::dec;
    use vela_common::CandleInterval;

    fn pair() -> CurrencyPair {
        CurrencyPair::new("BTC", "USD")
    }

    fn request(action: TradeAction, origin: &str) -> ActionRequest {
        ActionRequest {
            pair: pair(),
            action,
            origin: origin.to_string(),
            role: StrategyRole::Entry,
            reason: "signal".to_string(),
            weight: None,
            exchange_hint: None,
            market_time: Utc::now(),
        }
    }

    fn candle(hour: i64) -> Candle {
        let start: DateTime<Utc> = DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        Candle {
            pair: pair(),
            interval: CandleInterval::ONE_HOUR,
            start: start + Duration::hours(hour),
            open: dec!(100),
            high: dec!(100),
            low: dec!(100),
            close: dec!(100),
            volume: dec!(1),
            trade_count: 1,
        }
    }

    fn orderer(immediate: bool) -> RsiOrderer {
        let settings = StrategyConfig {
            low: 40.0,
            high: 60.0,
            immediate,
            expiry: 0, // expiry off unless the test wants it
            ..StrategyConfig::default()
        };
        RsiOrderer::new(pair(), &settings)
    }

    #[test]
    fn test_bounce_back_needs_reversal() {
        // The acceptance vector: [55, 45, 55] with band 40/60 executes on
        // the third sample only, never on the first breach.
        let mut orderer = orderer(false);
        assert!(orderer.schedule(&request(TradeAction::Buy, "rsi_entry")));

        orderer.evaluate(55.0);
        assert!(orderer.core_mut().take_actions().is_empty());

        orderer.evaluate(45.0);
        assert!(orderer.core_mut().take_actions().is_empty());

        orderer.evaluate(55.0);
        let actions = orderer.core_mut().take_actions();
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].action, TradeAction::Buy);
        assert!(orderer.pending().is_none());
    }

    #[test]
    fn test_immediate_mode_executes_on_threshold() {
        let mut orderer = orderer(true);
        orderer.schedule(&request(TradeAction::Buy, "rsi_entry"));

        orderer.evaluate(55.0);
        assert!(orderer.core_mut().take_actions().is_empty());

        orderer.evaluate(61.0);
        let actions = orderer.core_mut().take_actions();
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].action, TradeAction::Buy);
    }

    #[test]
    fn test_opposite_signal_deletes_pending() {
        let mut orderer = orderer(false);
        orderer.schedule(&request(TradeAction::Buy, "rsi_entry"));

        orderer.evaluate(39.0);
        assert!(orderer.pending().is_none());
        assert!(orderer.core_mut().take_actions().is_empty());

        // The deletion is reported so the originator can decide again.
        let cancelled = orderer.take_cancellations();
        assert_eq!(cancelled.len(), 1);
        assert_eq!(cancelled[0].origin, "rsi_entry");
        assert_eq!(cancelled[0].action, TradeAction::Buy);
        assert!(orderer.take_cancellations().is_empty());
    }

    #[test]
    fn test_reschedule_identical_is_noop() {
        let mut orderer = orderer(false);
        orderer.schedule(&request(TradeAction::Buy, "rsi_entry"));
        orderer.on_candle(&candle(0));
        assert_eq!(orderer.pending().unwrap().age_ticks, 1);

        // Same action + origin: the original (and its age) stand.
        orderer.schedule(&request(TradeAction::Buy, "rsi_entry"));
        assert_eq!(orderer.pending().unwrap().age_ticks, 1);
    }

    #[test]
    fn test_different_order_overwrites() {
        let mut orderer = orderer(false);
        orderer.schedule(&request(TradeAction::Buy, "rsi_entry"));
        orderer.schedule(&request(TradeAction::Sell, "trend_entry"));

        let pending = orderer.pending().unwrap();
        assert_eq!(pending.action, TradeAction::Sell);
        assert_eq!(pending.origin, "trend_entry");

        // The displaced order counts as cancelled.
        let cancelled = orderer.take_cancellations();
        assert_eq!(cancelled.len(), 1);
        assert_eq!(cancelled[0].origin, "rsi_entry");
    }

    #[test]
    fn test_exchange_hint_survives_deferral() {
        let mut orderer = orderer(true);
        let mut buy = request(TradeAction::Buy, "rsi_entry");
        buy.exchange_hint = Some("kraken".to_string());
        orderer.schedule(&buy);

        orderer.evaluate(61.0);
        let actions = orderer.core_mut().take_actions();
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].exchange_hint.as_deref(), Some("kraken"));
    }

    #[test]
    fn test_expiry_deletes_after_five_ticks() {
        let settings = StrategyConfig {
            expiry: 5,
            delete_expired: true,
            ..StrategyConfig::default()
        };
        let mut orderer = RsiOrderer::new(pair(), &settings);
        orderer.schedule(&request(TradeAction::Buy, "rsi_entry"));

        for hour in 0..4 {
            orderer.on_candle(&candle(hour));
            assert!(orderer.pending().is_some(), "gone at tick {}", hour);
        }
        orderer.on_candle(&candle(4));
        assert!(orderer.pending().is_none());
        assert!(orderer.core_mut().take_actions().is_empty());
        assert_eq!(orderer.take_cancellations().len(), 1);
    }

    #[test]
    fn test_expiry_force_executes_when_configured() {
        let settings = StrategyConfig {
            expiry: 2,
            delete_expired: false,
            ..StrategyConfig::default()
        };
        let mut orderer = RsiOrderer::new(pair(), &settings);
        orderer.schedule(&request(TradeAction::Sell, "rsi_entry"));

        orderer.on_candle(&candle(0));
        orderer.on_candle(&candle(1));
        let actions = orderer.core_mut().take_actions();
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].action, TradeAction::Sell);
    }

    #[test]
    fn test_close_requests_not_intercepted() {
        let mut orderer = orderer(false);
        assert!(!orderer.schedule(&request(TradeAction::Close, "stop_loss")));
        assert!(orderer.pending().is_none());
    }

    #[test]
    fn test_reset_clears_pending_keeps_history() {
        let mut orderer = orderer(false);
        orderer.evaluate(45.0);
        orderer.schedule(&request(TradeAction::Buy, "rsi_entry"));
        orderer.reset_values();

        assert!(orderer.pending().is_none());
        // History survived: the next sample can complete a bounce.
        orderer.schedule(&request(TradeAction::Buy, "rsi_entry"));
        orderer.evaluate(55.0);
        assert_eq!(orderer.core_mut().take_actions().len(), 1);
    }

    #[test]
    fn test_direction_runner_waits_for_agreement() {
        let settings = StrategyConfig {
            consult: vec!["rsi_entry".to_string()],
            confirm_ticks: 2,
            expiry: 0,
            ..StrategyConfig::default()
        };
        let mut runner = DirectionRunner::new(pair(), &settings).unwrap();
        runner.schedule(&request(TradeAction::Buy, "trend_entry"));

        // Disagreement: streak stays 0.
        runner.on_direction("rsi_entry", Some(TradeAction::Sell));
        runner.on_candle(&candle(0));
        assert!(runner.core_mut().take_actions().is_empty());

        // Agreement for two consecutive ticks executes.
        runner.on_direction("rsi_entry", Some(TradeAction::Buy));
        runner.on_candle(&candle(1));
        assert!(runner.core_mut().take_actions().is_empty());
        runner.on_candle(&candle(2));
        let actions = runner.core_mut().take_actions();
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].action, TradeAction::Buy);
        assert!(runner.pending().is_none());
    }

    #[test]
    fn test_direction_runner_streak_resets_on_disagreement() {
        let settings = StrategyConfig {
            consult: vec!["rsi_entry".to_string()],
            confirm_ticks: 2,
            expiry: 0,
            ..StrategyConfig::default()
        };
        let mut runner = DirectionRunner::new(pair(), &settings).unwrap();
        runner.schedule(&request(TradeAction::Buy, "trend_entry"));

        runner.on_direction("rsi_entry", Some(TradeAction::Buy));
        runner.on_candle(&candle(0));
        runner.on_direction("rsi_entry", None);
        runner.on_candle(&candle(1));
        runner.on_direction("rsi_entry", Some(TradeAction::Buy));
        runner.on_candle(&candle(2));
        // Streak restarted at tick 2: one agreeing tick so far.
        assert!(runner.core_mut().take_actions().is_empty());
    }

    #[test]
    fn test_direction_runner_rejects_empty_consult() {
        // Nobody to consult means nothing can ever confirm.
        let settings = StrategyConfig {
            consult: Vec::new(),
            ..StrategyConfig::default()
        };
        assert!(DirectionRunner::new(pair(), &settings).is_err());
    }

    #[test]
    fn test_pending_slot_snapshot_roundtrip() {
        let mut orderer = orderer(false);
        orderer.schedule(&request(TradeAction::Buy, "rsi_entry"));
        orderer.evaluate(45.0);

        let extra = orderer.snapshot_extra();
        let mut restored = RsiOrderer::new(
            pair(),
            &StrategyConfig {
                low: 40.0,
                high: 60.0,
                expiry: 0,
                ..StrategyConfig::default()
            },
        );
        restored.restore_extra(&extra);

        assert_eq!(restored.pending().unwrap().action, TradeAction::Buy);
        // The restored value history completes the bounce.
        restored.evaluate(55.0);
        assert_eq!(restored.core_mut().take_actions().len(), 1);
    }
}

//! Shared per-strategy lifecycle state machine.
//!
//! Tracks position, entry price, the extremes seen since entry, logical
//! market time and the emission guard. Concrete strategies own one core
//! each and route all lifecycle events through it.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use vela_common::{Candle, CandleInterval, CurrencyPair, PositionState, RawTrade, TradeAction};

use crate::types::{ActionRequest, ExecutedTrade, PortfolioSync, StrategyRole};

/// Sentinel for "no entry price": kept as -1 (not an Option) so the
/// flat-position invariant is directly visible in snapshots and logs.
pub const NO_PRICE: Decimal = Decimal::NEGATIVE_ONE;

/// Outcome of reconciling local state against an exchange sync.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome {
    /// Local and exchange agree.
    InSync,
    /// Exchange had a position the strategy didn't know about; adopted.
    AdoptedOpen,
    /// Exchange closed a position the strategy still thought open.
    /// The synthesized close must be replayed through `on_trade`.
    MissedClose(ExecutedTrade),
}

/// Shared strategy state machine.
#[derive(Debug)]
pub struct StrategyCore {
    name: String,
    role: StrategyRole,
    pair: CurrencyPair,
    interval: CandleInterval,
    enabled: bool,

    position: PositionState,
    /// Average entry rate; NO_PRICE while flat.
    entry_price: Decimal,
    position_amount: Decimal,
    /// Highest rate seen since entry; NO_PRICE while flat.
    highest_price: Decimal,
    /// Lowest rate seen since entry; NO_PRICE while flat.
    lowest_price: Decimal,
    /// Terminal flag for the current position: a protective strategy that
    /// fired sets this and stays quiet until the next position.
    done: bool,
    /// Last confirmed execution seen for this pair.
    last_trade: Option<TradeAction>,

    latest_candle: Option<Candle>,
    market_time: Option<DateTime<Utc>>,
    /// Volume-weighted rate of the most recent trade batch, falling back
    /// to the latest candle close.
    avg_rate: Decimal,

    /// Emission guard: the action kind most recently emitted for the
    /// current position. Cleared by a confirmed trade, or released via
    /// [`Self::clear_emission`] when the emission can no longer confirm.
    last_emitted: Option<TradeAction>,
    /// Guards the at-most-once replay of a close missed before a sync.
    sync_close_emitted: bool,

    pending: Vec<ActionRequest>,
}

impl StrategyCore {
    pub fn new(
        name: impl Into<String>,
        role: StrategyRole,
        pair: CurrencyPair,
        interval: CandleInterval,
    ) -> Self {
        Self {
            name: name.into(),
            role,
            pair,
            interval,
            enabled: true,
            position: PositionState::None,
            entry_price: NO_PRICE,
            position_amount: Decimal::ZERO,
            highest_price: NO_PRICE,
            lowest_price: NO_PRICE,
            done: false,
            last_trade: None,
            latest_candle: None,
            market_time: None,
            avg_rate: Decimal::ZERO,
            last_emitted: None,
            sync_close_emitted: false,
            pending: Vec::new(),
        }
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn role(&self) -> StrategyRole {
        self.role
    }

    pub fn pair(&self) -> &CurrencyPair {
        &self.pair
    }

    pub fn interval(&self) -> CandleInterval {
        self.interval
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn disable(&mut self) {
        self.enabled = false;
    }

    pub fn position(&self) -> PositionState {
        self.position
    }

    pub fn entry_price(&self) -> Decimal {
        self.entry_price
    }

    pub fn position_amount(&self) -> Decimal {
        self.position_amount
    }

    pub fn highest_price(&self) -> Decimal {
        self.highest_price
    }

    pub fn lowest_price(&self) -> Decimal {
        self.lowest_price
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn set_done(&mut self) {
        self.done = true;
    }

    pub fn last_trade(&self) -> Option<TradeAction> {
        self.last_trade
    }

    pub fn latest_candle(&self) -> Option<&Candle> {
        self.latest_candle.as_ref()
    }

    pub fn market_time(&self) -> Option<DateTime<Utc>> {
        self.market_time
    }

    pub fn rate(&self) -> Decimal {
        self.avg_rate
    }

    pub fn last_emitted(&self) -> Option<TradeAction> {
        self.last_emitted
    }

    /// Unrealized gain in percent of the entry price. Zero while flat.
    pub fn profit_perc(&self) -> Decimal {
        if !self.position.is_open() || self.entry_price <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        self.position.gain(self.entry_price, self.avg_rate) * Decimal::ONE_HUNDRED
            / self.entry_price
    }

    // ========================================================================
    // Market data
    // ========================================================================

    /// Fold a live trade batch into the core: market time advances to the
    /// newest trade, the rolling rate becomes the batch VWAP, and open
    /// positions update their extremes.
    pub fn update_from_trades(&mut self, trades: &[RawTrade]) {
        if trades.is_empty() {
            return;
        }
        let mut notional = Decimal::ZERO;
        let mut volume = Decimal::ZERO;
        for trade in trades {
            notional += trade.rate * trade.amount;
            volume += trade.amount;
            self.advance_time(trade.timestamp);
            self.track_extreme(trade.rate);
        }
        if volume > Decimal::ZERO {
            self.avg_rate = notional / volume;
        }
    }

    /// Fold a completed candle into the core. Market time advances to the
    /// candle end; the candle high/low update the position extremes.
    pub fn update_from_candle(&mut self, candle: &Candle) {
        self.advance_time(candle.end());
        self.avg_rate = candle.close;
        self.track_extreme(candle.high);
        self.track_extreme(candle.low);
        self.latest_candle = Some(candle.clone());
    }

    fn advance_time(&mut self, time: DateTime<Utc>) {
        // Market time is monotone; out-of-order data never rewinds it.
        if self.market_time.map(|t| time > t).unwrap_or(true) {
            self.market_time = Some(time);
        }
    }

    fn track_extreme(&mut self, rate: Decimal) {
        if !self.position.is_open() {
            return;
        }
        if self.highest_price == NO_PRICE || rate > self.highest_price {
            self.highest_price = rate;
        }
        if self.lowest_price == NO_PRICE || rate < self.lowest_price {
            self.lowest_price = rate;
        }
    }

    // ========================================================================
    // Emission
    // ========================================================================

    /// Ask the gateway to execute an action.
    ///
    /// Guards: no duplicate action kind for the same position without an
    /// intervening confirmed trade, no close while flat, and no direct
    /// long<->short flip (a close must execute first). Rejected emissions
    /// are dropped and logged, never queued.
    pub fn emit(&mut self, action: TradeAction, reason: impl Into<String>) {
        self.emit_weighted(action, reason, None, None);
    }

    pub fn emit_weighted(
        &mut self,
        action: TradeAction,
        reason: impl Into<String>,
        weight: Option<Decimal>,
        exchange_hint: Option<String>,
    ) {
        if !self.enabled {
            return;
        }
        if self.last_emitted == Some(action) {
            debug!(
                strategy = %self.name,
                pair = %self.pair,
                action = %action,
                "Duplicate emission for the same position, dropped"
            );
            return;
        }
        if action == TradeAction::Close && !self.position.is_open() {
            debug!(
                strategy = %self.name,
                pair = %self.pair,
                "Close emitted while flat, dropped"
            );
            return;
        }
        if action.opens_position()
            && self.position.is_open()
            && self.position != action.resulting_position()
        {
            warn!(
                strategy = %self.name,
                pair = %self.pair,
                position = %self.position,
                action = %action,
                "Direct position flip rejected, close first"
            );
            return;
        }

        let reason = reason.into();
        let market_time = self.market_time.unwrap_or_else(Utc::now);
        info!(
            strategy = %self.name,
            pair = %self.pair,
            action = %action,
            reason = %reason,
            "Emitting trade action"
        );
        self.last_emitted = Some(action);
        self.pending.push(ActionRequest {
            pair: self.pair.clone(),
            action,
            origin: self.name.clone(),
            role: self.role,
            reason,
            weight,
            exchange_hint,
            market_time,
        });
    }

    /// Drain the actions emitted since the last drain.
    pub fn take_actions(&mut self) -> Vec<ActionRequest> {
        std::mem::take(&mut self.pending)
    }

    /// Release the emission guard for an action that will never confirm:
    /// dropped by a gate, failed at the backend, or deleted while
    /// deferred. The strategy may re-decide on a later candle.
    pub fn clear_emission(&mut self, action: TradeAction) {
        if self.last_emitted == Some(action) {
            debug!(
                strategy = %self.name,
                pair = %self.pair,
                action = %action,
                "Emission released without confirmation"
            );
            self.last_emitted = None;
        }
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Apply a confirmed execution for this pair.
    pub fn apply_trade(&mut self, trade: &ExecutedTrade) {
        self.last_emitted = None;
        self.sync_close_emitted = false;
        self.last_trade = Some(trade.action);
        self.advance_time(trade.timestamp);

        match trade.action {
            TradeAction::Buy | TradeAction::Sell => {
                self.position = trade.action.resulting_position();
                self.entry_price = trade.rate;
                self.position_amount = trade.amount;
                self.highest_price = trade.rate;
                self.lowest_price = trade.rate;
                self.done = false;
            }
            TradeAction::Close => {
                self.clear_position();
            }
        }
    }

    fn clear_position(&mut self) {
        self.position = PositionState::None;
        self.entry_price = NO_PRICE;
        self.position_amount = Decimal::ZERO;
        self.highest_price = NO_PRICE;
        self.lowest_price = NO_PRICE;
        self.done = false;
    }

    /// Reconcile local state against an exchange sync. The exchange wins
    /// every disagreement; a close it saw and we didn't is synthesized at
    /// most once for replay.
    pub fn reconcile(&mut self, sync: &PortfolioSync) -> SyncOutcome {
        self.advance_time(sync.timestamp);

        if sync.position == self.position {
            if self.position.is_open() {
                // Same direction: adopt the exchange's numbers quietly.
                self.position_amount = sync.amount;
                if let Some(rate) = sync.entry_rate {
                    self.entry_price = rate;
                }
            }
            return SyncOutcome::InSync;
        }

        match (self.position, sync.position) {
            (PositionState::None, _) => {
                // Exchange opened (or we restarted mid-position): adopt.
                let entry = sync.entry_rate.unwrap_or(self.avg_rate);
                warn!(
                    strategy = %self.name,
                    pair = %self.pair,
                    position = %sync.position,
                    entry = %entry,
                    "Adopting exchange position unknown to strategy"
                );
                self.position = sync.position;
                self.entry_price = entry;
                self.position_amount = sync.amount;
                self.highest_price = entry;
                self.lowest_price = entry;
                self.done = false;
                SyncOutcome::AdoptedOpen
            }
            (_, PositionState::None) => {
                if self.sync_close_emitted {
                    debug!(
                        strategy = %self.name,
                        pair = %self.pair,
                        "Missed close already replayed, ignoring repeat sync"
                    );
                    return SyncOutcome::InSync;
                }
                warn!(
                    strategy = %self.name,
                    pair = %self.pair,
                    position = %self.position,
                    "Exchange closed a position we thought open, replaying close"
                );
                self.sync_close_emitted = true;
                SyncOutcome::MissedClose(ExecutedTrade {
                    order_id: format!("sync-{}", sync.timestamp.timestamp_millis()),
                    pair: self.pair.clone(),
                    action: TradeAction::Close,
                    rate: self.avg_rate,
                    amount: self.position_amount,
                    timestamp: sync.timestamp,
                })
            }
            (_, _) => {
                // Long vs short disagreement: adopt the exchange direction.
                let entry = sync.entry_rate.unwrap_or(self.avg_rate);
                warn!(
                    strategy = %self.name,
                    pair = %self.pair,
                    local = %self.position,
                    exchange = %sync.position,
                    "Position direction disagrees with exchange, adopting"
                );
                self.position = sync.position;
                self.entry_price = entry;
                self.position_amount = sync.amount;
                self.highest_price = entry;
                self.lowest_price = entry;
                self.done = false;
                SyncOutcome::AdoptedOpen
            }
        }
    }

    // ========================================================================
    // Persistence
    // ========================================================================

    pub fn snapshot(&self) -> CoreSnapshot {
        CoreSnapshot {
            position: self.position,
            entry_price: self.entry_price,
            position_amount: self.position_amount,
            highest_price: self.highest_price,
            lowest_price: self.lowest_price,
            done: self.done,
            last_trade: self.last_trade,
            market_time: self.market_time,
            avg_rate: self.avg_rate,
        }
    }

    pub fn restore(&mut self, snapshot: &CoreSnapshot) {
        self.position = snapshot.position;
        self.entry_price = snapshot.entry_price;
        self.position_amount = snapshot.position_amount;
        self.highest_price = snapshot.highest_price;
        self.lowest_price = snapshot.lowest_price;
        self.done = snapshot.done;
        self.last_trade = snapshot.last_trade;
        self.market_time = snapshot.market_time;
        self.avg_rate = snapshot.avg_rate;
    }
}

/// Persisted core fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoreSnapshot {
    pub position: PositionState,
    #[serde(with = "rust_decimal::serde::str")]
    pub entry_price: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub position_amount: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub highest_price: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub lowest_price: Decimal,
    pub done: bool,
    pub last_trade: Option<TradeAction>,
    pub market_time: Option<DateTime<Utc>>,
    #[serde(with = "rust_decimal::serde::str")]
    pub avg_rate: Decimal,
}

impl CoreSnapshot {
    /// Structural validity: a flat snapshot must carry the NO_PRICE
    /// sentinel, an open one a positive entry.
    pub fn is_valid(&self) -> bool {
        match self.position {
            PositionState::None => self.entry_price == NO_PRICE,
            PositionState::Long | PositionState::Short => self.entry_price > Decimal::ZERO,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rust_decimal_macros::dec;
    use vela_common::Side;

    fn ts(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn core() -> StrategyCore {
        StrategyCore::new(
            "test",
            StrategyRole::Entry,
            CurrencyPair::new("BTC", "USD"),
            CandleInterval::ONE_HOUR,
        )
    }

    fn buy_fill(rate: Decimal) -> ExecutedTrade {
        ExecutedTrade {
            order_id: "o1".to_string(),
            pair: CurrencyPair::new("BTC", "USD"),
            action: TradeAction::Buy,
            rate,
            amount: dec!(1),
            timestamp: ts("2025-01-01T12:00:00Z"),
        }
    }

    fn close_fill(rate: Decimal) -> ExecutedTrade {
        ExecutedTrade {
            order_id: "o2".to_string(),
            pair: CurrencyPair::new("BTC", "USD"),
            action: TradeAction::Close,
            rate,
            amount: dec!(1),
            timestamp: ts("2025-01-01T13:00:00Z"),
        }
    }

    #[test]
    fn test_flat_invariant() {
        let core = core();
        assert_eq!(core.position(), PositionState::None);
        assert_eq!(core.entry_price(), NO_PRICE);
        assert_eq!(core.highest_price(), NO_PRICE);
        assert!(!core.is_done());
    }

    #[test]
    fn test_open_and_close_lifecycle() {
        let mut core = core();
        core.apply_trade(&buy_fill(dec!(100)));
        assert_eq!(core.position(), PositionState::Long);
        assert_eq!(core.entry_price(), dec!(100));
        assert_eq!(core.highest_price(), dec!(100));
        assert_eq!(core.last_trade(), Some(TradeAction::Buy));

        core.apply_trade(&close_fill(dec!(110)));
        assert_eq!(core.position(), PositionState::None);
        assert_eq!(core.entry_price(), NO_PRICE);
        assert_eq!(core.last_trade(), Some(TradeAction::Close));
        assert!(!core.is_done());
    }

    #[test]
    fn test_extremes_track_only_while_open() {
        let mut core = core();
        let t0 = ts("2025-01-01T12:00:00Z");
        // Flat: no extremes.
        core.update_from_trades(&[RawTrade::new(dec!(120), dec!(1), t0, Side::Buy)]);
        assert_eq!(core.highest_price(), NO_PRICE);

        core.apply_trade(&buy_fill(dec!(100)));
        core.update_from_trades(&[
            RawTrade::new(dec!(120), dec!(1), t0 + Duration::seconds(1), Side::Buy),
            RawTrade::new(dec!(95), dec!(1), t0 + Duration::seconds(2), Side::Sell),
        ]);
        assert_eq!(core.highest_price(), dec!(120));
        assert_eq!(core.lowest_price(), dec!(95));
    }

    #[test]
    fn test_vwap_rate() {
        let mut core = core();
        let t0 = ts("2025-01-01T12:00:00Z");
        core.update_from_trades(&[
            RawTrade::new(dec!(100), dec!(1), t0, Side::Buy),
            RawTrade::new(dec!(200), dec!(3), t0, Side::Buy),
        ]);
        // (100*1 + 200*3) / 4 = 175
        assert_eq!(core.rate(), dec!(175));
    }

    #[test]
    fn test_market_time_monotone() {
        let mut core = core();
        let t0 = ts("2025-01-01T12:00:00Z");
        core.update_from_trades(&[RawTrade::new(dec!(1), dec!(1), t0, Side::Buy)]);
        // Older data never rewinds the clock.
        core.update_from_trades(&[RawTrade::new(
            dec!(1),
            dec!(1),
            t0 - Duration::seconds(60),
            Side::Buy,
        )]);
        assert_eq!(core.market_time(), Some(t0));
    }

    #[test]
    fn test_duplicate_emission_dropped() {
        let mut core = core();
        core.emit(TradeAction::Buy, "signal");
        core.emit(TradeAction::Buy, "signal again");
        assert_eq!(core.take_actions().len(), 1);

        // A confirmed trade clears the guard.
        core.apply_trade(&buy_fill(dec!(100)));
        core.emit(TradeAction::Close, "stop");
        assert_eq!(core.take_actions().len(), 1);
    }

    #[test]
    fn test_released_emission_can_reemit() {
        let mut core = core();
        core.emit(TradeAction::Buy, "signal");
        assert_eq!(core.take_actions().len(), 1);

        // Guarded while the emission could still confirm.
        core.emit(TradeAction::Buy, "signal again");
        assert!(core.take_actions().is_empty());

        // A mismatched release leaves the guard in place.
        core.clear_emission(TradeAction::Sell);
        core.emit(TradeAction::Buy, "still guarded");
        assert!(core.take_actions().is_empty());

        // Once the buy is released (dropped, failed or deleted) the
        // strategy is free to decide again.
        core.clear_emission(TradeAction::Buy);
        core.emit(TradeAction::Buy, "retry");
        assert_eq!(core.take_actions().len(), 1);
    }

    #[test]
    fn test_exchange_hint_carried() {
        let mut core = core();
        core.emit_weighted(
            TradeAction::Buy,
            "signal",
            Some(dec!(0.5)),
            Some("kraken".to_string()),
        );
        let actions = core.take_actions();
        assert_eq!(actions[0].weight, Some(dec!(0.5)));
        assert_eq!(actions[0].exchange_hint.as_deref(), Some("kraken"));
    }

    #[test]
    fn test_close_while_flat_dropped() {
        let mut core = core();
        core.emit(TradeAction::Close, "bogus");
        assert!(core.take_actions().is_empty());
    }

    #[test]
    fn test_direct_flip_rejected() {
        let mut core = core();
        core.apply_trade(&buy_fill(dec!(100)));
        core.emit(TradeAction::Sell, "flip");
        assert!(core.take_actions().is_empty());
    }

    #[test]
    fn test_profit_perc() {
        let mut core = core();
        core.apply_trade(&buy_fill(dec!(100)));
        core.update_from_trades(&[RawTrade::new(
            dec!(102),
            dec!(1),
            ts("2025-01-01T12:30:00Z"),
            Side::Buy,
        )]);
        assert_eq!(core.profit_perc(), dec!(2));
    }

    #[test]
    fn test_sync_in_agreement_adopts_numbers() {
        let mut core = core();
        core.apply_trade(&buy_fill(dec!(100)));
        let outcome = core.reconcile(&PortfolioSync {
            pair: CurrencyPair::new("BTC", "USD"),
            position: PositionState::Long,
            amount: dec!(2),
            entry_rate: Some(dec!(99)),
            timestamp: ts("2025-01-01T12:30:00Z"),
        });
        assert_eq!(outcome, SyncOutcome::InSync);
        assert_eq!(core.position_amount(), dec!(2));
        assert_eq!(core.entry_price(), dec!(99));
    }

    #[test]
    fn test_sync_missed_close_replayed_once() {
        let mut core = core();
        core.apply_trade(&buy_fill(dec!(100)));

        let sync = PortfolioSync {
            pair: CurrencyPair::new("BTC", "USD"),
            position: PositionState::None,
            amount: Decimal::ZERO,
            entry_rate: None,
            timestamp: ts("2025-01-01T12:30:00Z"),
        };
        let outcome = core.reconcile(&sync);
        let SyncOutcome::MissedClose(trade) = outcome else {
            panic!("expected missed close, got {:?}", outcome);
        };
        assert_eq!(trade.action, TradeAction::Close);

        // A second sync before the replay lands must not synthesize again.
        assert_eq!(core.reconcile(&sync), SyncOutcome::InSync);

        // After the replay the position is flat and later syncs agree.
        core.apply_trade(&trade);
        assert_eq!(core.position(), PositionState::None);
        assert_eq!(core.reconcile(&sync), SyncOutcome::InSync);
    }

    #[test]
    fn test_sync_adopts_unknown_position() {
        let mut core = core();
        let outcome = core.reconcile(&PortfolioSync {
            pair: CurrencyPair::new("BTC", "USD"),
            position: PositionState::Short,
            amount: dec!(1),
            entry_rate: Some(dec!(105)),
            timestamp: ts("2025-01-01T12:30:00Z"),
        });
        assert_eq!(outcome, SyncOutcome::AdoptedOpen);
        assert_eq!(core.position(), PositionState::Short);
        assert_eq!(core.entry_price(), dec!(105));
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let mut core = core();
        core.apply_trade(&buy_fill(dec!(100)));
        core.update_from_trades(&[RawTrade::new(
            dec!(110),
            dec!(1),
            ts("2025-01-01T12:30:00Z"),
            Side::Buy,
        )]);

        let snapshot = core.snapshot();
        assert!(snapshot.is_valid());
        let json = serde_json::to_string(&snapshot).unwrap();
        let restored: CoreSnapshot = serde_json::from_str(&json).unwrap();

        let mut fresh = StrategyCore::new(
            "test",
            StrategyRole::Entry,
            CurrencyPair::new("BTC", "USD"),
            CandleInterval::ONE_HOUR,
        );
        fresh.restore(&restored);
        assert_eq!(fresh.position(), PositionState::Long);
        assert_eq!(fresh.entry_price(), dec!(100));
        assert_eq!(fresh.highest_price(), dec!(110));
    }

    #[test]
    fn test_invalid_snapshot_detected() {
        let snapshot = CoreSnapshot {
            position: PositionState::Long,
            entry_price: NO_PRICE,
            position_amount: Decimal::ZERO,
            highest_price: NO_PRICE,
            lowest_price: NO_PRICE,
            done: false,
            last_trade: None,
            market_time: None,
            avg_rate: Decimal::ZERO,
        };
        assert!(!snapshot.is_valid());
    }

    #[test]
    fn test_disabled_core_emits_nothing() {
        let mut core = core();
        core.disable();
        core.emit(TradeAction::Buy, "signal");
        assert!(core.take_actions().is_empty());
    }
}

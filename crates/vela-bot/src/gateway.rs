//! The trade gateway: the single path between strategy decisions and the
//! execution backend.
//!
//! Every action passes the gating ladder in order: trading pause, opening
//! pause (closes are exempt), the per-pair in-flight slot, and the warmup
//! gate. A gated action is dropped, never queued; the strategy will
//! re-decide on a later candle with fresh data. Dispatched actions are
//! forwarded to an optional observer channel before execution.

use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::executor::{ExecutorError, TradeExecutor};
use crate::notify::Notifier;
use crate::state::EngineState;
use crate::types::{ActionRequest, ExecutedTrade};

/// Why the gateway refused to dispatch an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    TradingPaused,
    OpeningPaused,
    InFlight,
    Warmup,
}

/// Result of offering an action to the gateway.
#[derive(Debug)]
pub enum DispatchOutcome {
    /// Backend confirmed the trade.
    Executed(ExecutedTrade),
    /// A gate refused the action; it was dropped, not queued.
    Dropped(DropReason),
    /// All gates passed but the backend call failed or timed out.
    Failed,
}

pub struct TradeGateway {
    state: Arc<EngineState>,
    executor: Arc<dyn TradeExecutor>,
    notifier: Arc<dyn Notifier>,
    /// Dispatched actions are mirrored here for external observers.
    forward: Option<mpsc::UnboundedSender<ActionRequest>>,
    warmup_secs: u64,
    in_flight_timeout_secs: u64,
}

impl TradeGateway {
    pub fn new(
        state: Arc<EngineState>,
        executor: Arc<dyn TradeExecutor>,
        notifier: Arc<dyn Notifier>,
        warmup_secs: u64,
        in_flight_timeout_secs: u64,
    ) -> Self {
        Self {
            state,
            executor,
            notifier,
            forward: None,
            warmup_secs,
            in_flight_timeout_secs,
        }
    }

    /// Mirror every dispatched (not dropped) action to a channel.
    pub fn set_forward(&mut self, sender: mpsc::UnboundedSender<ActionRequest>) {
        self.forward = Some(sender);
    }

    pub fn state(&self) -> &Arc<EngineState> {
        &self.state
    }

    /// Run an action through the gates and, if it survives, the backend.
    ///
    /// `rate` is the emitting strategy's current market rate; market time
    /// is taken from the request itself.
    pub async fn dispatch(&self, request: &ActionRequest, rate: Decimal) -> DispatchOutcome {
        self.state.metrics.inc_emitted();
        let now = request.market_time;

        if self.state.control.is_trading_paused() {
            warn!(
                pair = %request.pair,
                action = %request.action,
                origin = %request.origin,
                "Dropping action: trading is paused"
            );
            self.state.metrics.inc_dropped();
            return DispatchOutcome::Dropped(DropReason::TradingPaused);
        }

        if self.state.control.is_opening_paused() && request.blocked_by_opening_pause() {
            warn!(
                pair = %request.pair,
                action = %request.action,
                origin = %request.origin,
                "Dropping opening action: opening is paused"
            );
            self.state.metrics.inc_dropped();
            return DispatchOutcome::Dropped(DropReason::OpeningPaused);
        }

        if self.state.in_flight.is_in_flight(&request.pair, now) {
            warn!(
                pair = %request.pair,
                action = %request.action,
                origin = %request.origin,
                "Dropping action: trade already in flight"
            );
            self.state.metrics.inc_dropped();
            return DispatchOutcome::Dropped(DropReason::InFlight);
        }

        if !self
            .state
            .control
            .warmup_complete(now, self.warmup_secs)
        {
            debug!(
                pair = %request.pair,
                action = %request.action,
                "Dropping action: still warming up"
            );
            self.state.metrics.inc_dropped();
            return DispatchOutcome::Dropped(DropReason::Warmup);
        }

        if !self
            .state
            .in_flight
            .try_begin(&request.pair, now, self.in_flight_timeout_secs)
        {
            self.state.metrics.inc_dropped();
            return DispatchOutcome::Dropped(DropReason::InFlight);
        }

        if let Some(forward) = &self.forward {
            let _ = forward.send(request.clone());
        }

        info!(
            pair = %request.pair,
            action = %request.action,
            origin = %request.origin,
            rate = %rate,
            reason = %request.reason,
            exchange_hint = ?request.exchange_hint,
            backend = self.executor.name(),
            "Dispatching action"
        );

        let timeout = Duration::from_secs(self.in_flight_timeout_secs);
        let result = tokio::time::timeout(timeout, self.executor.execute(request, rate)).await;
        self.state.in_flight.finish(&request.pair);

        match result {
            Ok(Ok(trade)) => {
                self.state.metrics.inc_executed();
                self.notifier.notify(
                    &format!("trade.{}", request.pair),
                    &format!("{} {}", request.action, request.pair),
                    &format!(
                        "{} at {} ({}), origin {}",
                        request.action, trade.rate, trade.amount, request.origin
                    ),
                    false,
                );
                DispatchOutcome::Executed(trade)
            }
            Ok(Err(ExecutorError::ExecutionDisabled)) => {
                // Shadow mode: the decision was logged, nothing traded.
                DispatchOutcome::Failed
            }
            Ok(Err(err)) => {
                self.state.metrics.inc_failed();
                warn!(
                    pair = %request.pair,
                    action = %request.action,
                    error = %err,
                    "Execution failed"
                );
                DispatchOutcome::Failed
            }
            Err(_) => {
                self.state.metrics.inc_failed();
                warn!(
                    pair = %request.pair,
                    action = %request.action,
                    timeout_secs = self.in_flight_timeout_secs,
                    "Execution timed out"
                );
                DispatchOutcome::Failed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::PaperExecutor;
    use crate::notify::testing::RecordingNotifier;
    use crate::types::StrategyRole;
    use chrono::{DateTime, Duration as ChronoDuration, Utc};
    use rust_decimal_macros::dec;
    use vela_common::{CurrencyPair, TradeAction};

    fn ts(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn pair() -> CurrencyPair {
        CurrencyPair::new("BTC", "USD")
    }

    fn request(action: TradeAction, role: StrategyRole, at: DateTime<Utc>) -> ActionRequest {
        ActionRequest {
            pair: pair(),
            action,
            origin: "test".to_string(),
            role,
            reason: "unit test".to_string(),
            weight: None,
            exchange_hint: None,
            market_time: at,
        }
    }

    fn gateway(warmup_secs: u64) -> (TradeGateway, Arc<EngineState>) {
        let state = Arc::new(EngineState::new());
        let gateway = TradeGateway::new(
            Arc::clone(&state),
            Arc::new(PaperExecutor::new(dec!(10000))),
            Arc::new(RecordingNotifier::default()),
            warmup_secs,
            90,
        );
        (gateway, state)
    }

    #[tokio::test]
    async fn test_trading_pause_blocks_everything() {
        let (gateway, state) = gateway(0);
        let t0 = ts("2025-01-01T12:00:00Z");
        state.control.note_market_data(t0);
        state.control.set_trading_paused(true);

        let outcome = gateway
            .dispatch(&request(TradeAction::Close, StrategyRole::StopLoss, t0), dec!(100))
            .await;
        assert!(matches!(
            outcome,
            DispatchOutcome::Dropped(DropReason::TradingPaused)
        ));
        assert_eq!(
            state
                .metrics
                .actions_dropped
                .load(std::sync::atomic::Ordering::Relaxed),
            1
        );
    }

    #[tokio::test]
    async fn test_opening_pause_exempts_protective_close() {
        let (gateway, state) = gateway(0);
        let t0 = ts("2025-01-01T12:00:00Z");
        state.control.note_market_data(t0);
        state.control.set_opening_paused(true);

        // Opening buy is refused.
        let outcome = gateway
            .dispatch(&request(TradeAction::Buy, StrategyRole::Entry, t0), dec!(100))
            .await;
        assert!(matches!(
            outcome,
            DispatchOutcome::Dropped(DropReason::OpeningPaused)
        ));

        // A stop's close still goes through the remaining gates. The
        // paper backend rejects it (no position) but the gate passed.
        let outcome = gateway
            .dispatch(&request(TradeAction::Close, StrategyRole::StopLoss, t0), dec!(100))
            .await;
        assert!(matches!(outcome, DispatchOutcome::Failed));
    }

    #[tokio::test]
    async fn test_warmup_gate_drops_until_elapsed() {
        let (gateway, state) = gateway(300);
        let t0 = ts("2025-01-01T12:00:00Z");
        state.control.note_market_data(t0);

        let outcome = gateway
            .dispatch(&request(TradeAction::Buy, StrategyRole::Entry, t0), dec!(100))
            .await;
        assert!(matches!(
            outcome,
            DispatchOutcome::Dropped(DropReason::Warmup)
        ));

        let later = t0 + ChronoDuration::seconds(300);
        let outcome = gateway
            .dispatch(
                &request(TradeAction::Buy, StrategyRole::Entry, later),
                dec!(100),
            )
            .await;
        assert!(matches!(outcome, DispatchOutcome::Executed(_)));
    }

    #[tokio::test]
    async fn test_in_flight_slot_blocks_second_action() {
        let (gateway, state) = gateway(0);
        let t0 = ts("2025-01-01T12:00:00Z");
        state.control.note_market_data(t0);

        // Occupy the slot as a wedged backend call would.
        assert!(state.in_flight.try_begin(&pair(), t0, 90));

        let outcome = gateway
            .dispatch(&request(TradeAction::Buy, StrategyRole::Entry, t0), dec!(100))
            .await;
        assert!(matches!(
            outcome,
            DispatchOutcome::Dropped(DropReason::InFlight)
        ));

        // Past the deadline the slot is reclaimed and the action runs.
        let later = t0 + ChronoDuration::seconds(90);
        let outcome = gateway
            .dispatch(
                &request(TradeAction::Buy, StrategyRole::Entry, later),
                dec!(100),
            )
            .await;
        assert!(matches!(outcome, DispatchOutcome::Executed(_)));
    }

    #[tokio::test]
    async fn test_slot_released_after_execution() {
        let (gateway, state) = gateway(0);
        let t0 = ts("2025-01-01T12:00:00Z");
        state.control.note_market_data(t0);

        let outcome = gateway
            .dispatch(&request(TradeAction::Buy, StrategyRole::Entry, t0), dec!(100))
            .await;
        assert!(matches!(outcome, DispatchOutcome::Executed(_)));
        assert!(state.in_flight.is_empty());

        // Slot is also released after a failed call.
        let outcome = gateway
            .dispatch(&request(TradeAction::Buy, StrategyRole::Entry, t0), dec!(100))
            .await;
        assert!(matches!(outcome, DispatchOutcome::Failed));
        assert!(state.in_flight.is_empty());
    }

    #[tokio::test]
    async fn test_dispatched_actions_forwarded() {
        let (mut gateway, state) = gateway(0);
        let t0 = ts("2025-01-01T12:00:00Z");
        state.control.note_market_data(t0);

        let (tx, mut rx) = mpsc::unbounded_channel();
        gateway.set_forward(tx);

        // Dropped action is not forwarded.
        state.control.set_trading_paused(true);
        gateway
            .dispatch(&request(TradeAction::Buy, StrategyRole::Entry, t0), dec!(100))
            .await;
        assert!(rx.try_recv().is_err());

        state.control.set_trading_paused(false);
        gateway
            .dispatch(&request(TradeAction::Buy, StrategyRole::Entry, t0), dec!(100))
            .await;
        let forwarded = rx.try_recv().unwrap();
        assert_eq!(forwarded.action, TradeAction::Buy);
    }
}

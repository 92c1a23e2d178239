//! Per-pair strategy registry and event fan-out.
//!
//! The group owns every strategy of one pair, fans lifecycle events out
//! to them in registration order and routes emitted actions: opening
//! actions are offered to an enabled orderer for deferred execution,
//! closes go straight through.

use anyhow::bail;

use vela_common::{Candle, CurrencyPair, RawTrade, TradeAction};

use crate::strategy::Strategy;
use crate::types::{ActionRequest, ExecutedTrade, PortfolioSync, StrategyRole};

pub struct StrategyGroup {
    pair: CurrencyPair,
    strategies: Vec<Box<dyn Strategy>>,
}

impl StrategyGroup {
    pub fn new(pair: CurrencyPair) -> Self {
        Self {
            pair,
            strategies: Vec::new(),
        }
    }

    pub fn pair(&self) -> &CurrencyPair {
        &self.pair
    }

    /// Register a strategy. Names are the lookup key and must be unique
    /// within the group.
    pub fn add(&mut self, strategy: Box<dyn Strategy>) -> anyhow::Result<()> {
        if strategy.pair() != &self.pair {
            bail!(
                "Strategy '{}' is for {} but the group trades {}",
                strategy.name(),
                strategy.pair(),
                self.pair
            );
        }
        if self.get(strategy.name()).is_some() {
            bail!("Duplicate strategy name '{}' for {}", strategy.name(), self.pair);
        }
        self.strategies.push(strategy);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&dyn Strategy> {
        self.strategies
            .iter()
            .find(|s| s.name() == name)
            .map(|s| s.as_ref())
    }

    /// Disable a strategy by name. Returns false if the name is unknown.
    pub fn disable(&mut self, name: &str) -> bool {
        for strategy in &mut self.strategies {
            if strategy.name() == name {
                strategy.core_mut().disable();
                return true;
            }
        }
        false
    }

    pub fn has_role(&self, role: StrategyRole) -> bool {
        self.strategies
            .iter()
            .any(|s| s.role() == role && s.core().is_enabled())
    }

    pub fn len(&self) -> usize {
        self.strategies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &dyn Strategy> {
        self.strategies.iter().map(|s| s.as_ref())
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Box<dyn Strategy>> {
        self.strategies.iter_mut()
    }

    /// Candle intervals any member subscribes to.
    pub fn intervals(&self) -> Vec<vela_common::CandleInterval> {
        let mut intervals: Vec<_> = self.strategies.iter().map(|s| s.core().interval()).collect();
        intervals.sort();
        intervals.dedup();
        intervals
    }

    // ========================================================================
    // Event fan-out
    // ========================================================================

    pub fn on_tick(&mut self, trades: &[RawTrade]) {
        for strategy in &mut self.strategies {
            strategy.on_tick(trades);
        }
    }

    /// Deliver a completed candle to every member subscribed to its
    /// interval. Consulted directions are refreshed first so runners see
    /// this tick's state of the world.
    pub fn on_candle(&mut self, candle: &Candle) {
        let directions: Vec<(String, Option<vela_common::TradeAction>)> = self
            .strategies
            .iter()
            .map(|s| (s.name().to_string(), s.last_action()))
            .collect();

        for i in 0..self.strategies.len() {
            let consulted: Vec<String> = self.strategies[i].consulted().to_vec();
            for name in consulted {
                let action = directions
                    .iter()
                    .find(|(n, _)| *n == name)
                    .and_then(|(_, a)| *a);
                self.strategies[i].on_direction(&name, action);
            }
            if self.strategies[i].core().interval() == candle.interval {
                self.strategies[i].on_candle(candle);
            }
        }
    }

    /// Fan a confirmed execution out to every member.
    pub fn on_trade(&mut self, trade: &ExecutedTrade) {
        for strategy in &mut self.strategies {
            strategy.on_trade(trade);
        }
    }

    pub fn on_sync_portfolio(&mut self, sync: &PortfolioSync) {
        for strategy in &mut self.strategies {
            strategy.on_sync_portfolio(sync);
        }
    }

    /// Release the emission guard for an action kind that will never
    /// confirm, across every member. The pair's worker dispatches one
    /// action at a time, so nothing of that kind is still in flight when
    /// this runs.
    pub fn release_emission(&mut self, action: TradeAction) {
        for strategy in &mut self.strategies {
            strategy.core_mut().clear_emission(action);
        }
    }

    /// Drain emitted actions, routing opening actions through an enabled
    /// orderer when one exists. Returns what should go to the gateway.
    ///
    /// Deferred orders an orderer dropped this tick are drained first and
    /// their originators' guards released, so a deleted order never mutes
    /// the strategy that asked for it.
    pub fn collect_actions(&mut self) -> Vec<ActionRequest> {
        let cancelled: Vec<_> = self
            .strategies
            .iter_mut()
            .flat_map(|s| s.take_cancellations())
            .collect();
        for order in cancelled {
            if let Some(strategy) = self
                .strategies
                .iter_mut()
                .find(|s| s.name() == order.origin)
            {
                strategy.core_mut().clear_emission(order.action);
            }
        }

        let orderer_idx = self
            .strategies
            .iter()
            .position(|s| s.role() == StrategyRole::Orderer && s.core().is_enabled());

        let mut direct = Vec::new();
        let mut deferred = Vec::new();
        for (i, strategy) in self.strategies.iter_mut().enumerate() {
            for request in strategy.core_mut().take_actions() {
                let defer = request.action.opens_position()
                    && matches!(orderer_idx, Some(o) if o != i);
                if defer {
                    deferred.push(request);
                } else {
                    direct.push(request);
                }
            }
        }

        if let Some(idx) = orderer_idx {
            for request in deferred {
                if !self.strategies[idx].schedule(&request) {
                    direct.push(request);
                }
            }
        } else {
            direct.extend(deferred);
        }
        direct
    }
}

//! The trading engine: one worker task per pair.
//!
//! Each pair gets its own worker with its own strategy group and event
//! channel, so strategies of one pair always process events sequentially
//! while pairs run concurrently. Workers share only the [`EngineState`]
//! through the gateway.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use vela_common::{Candle, CandleInterval, CurrencyPair, RawTrade};

use crate::config::{BotConfig, TradingMode};
use crate::executor::{NoopExecutor, PaperExecutor, TradeExecutor};
use crate::gateway::{DispatchOutcome, TradeGateway};
use crate::group::StrategyGroup;
use crate::notify::{LogNotifier, Notifier};
use crate::snapshot::{self, SnapshotFile, StrategySnapshot};
use crate::state::EngineState;
use crate::strategy::build_strategy;
use crate::types::{ExecutedTrade, PortfolioSync};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Market input for one pair's worker.
#[derive(Debug, Clone)]
pub enum MarketEvent {
    /// A batch of live trades, oldest first.
    Trades(Vec<RawTrade>),
    /// A completed candle from an external source.
    Candle(Candle),
    /// Exchange-reported position state.
    PortfolioSync(PortfolioSync),
    /// A trade confirmed outside the gateway (e.g., placed manually).
    TradeConfirmed(ExecutedTrade),
}

/// Builds candles of one interval from a live trade stream.
///
/// Buckets are aligned to the epoch; a trade landing in a later bucket
/// completes the current one. Out-of-order trades into a past bucket are
/// dropped.
#[derive(Debug)]
pub struct CandleBuilder {
    pair: CurrencyPair,
    interval: CandleInterval,
    bucket_start: Option<DateTime<Utc>>,
    trades: Vec<RawTrade>,
}

impl CandleBuilder {
    pub fn new(pair: CurrencyPair, interval: CandleInterval) -> Self {
        Self {
            pair,
            interval,
            bucket_start: None,
            trades: Vec::new(),
        }
    }

    fn bucket_for(&self, at: DateTime<Utc>) -> DateTime<Utc> {
        let bucket_ms = self.interval.as_duration().num_milliseconds();
        let aligned = (at.timestamp_millis() / bucket_ms) * bucket_ms;
        Utc.timestamp_millis_opt(aligned)
            .single()
            .unwrap_or(at)
    }

    /// Feed one trade. Returns the completed candle when the trade opens
    /// a new bucket.
    pub fn push(&mut self, trade: &RawTrade) -> Option<Candle> {
        let bucket = self.bucket_for(trade.timestamp);
        match self.bucket_start {
            None => {
                self.bucket_start = Some(bucket);
                self.trades.push(trade.clone());
                None
            }
            Some(current) if bucket == current => {
                self.trades.push(trade.clone());
                None
            }
            Some(current) if bucket > current => {
                let candle = Candle::from_trades(
                    self.pair.clone(),
                    self.interval,
                    current,
                    &self.trades,
                );
                self.bucket_start = Some(bucket);
                self.trades.clear();
                self.trades.push(trade.clone());
                candle
            }
            Some(current) => {
                debug!(
                    pair = %self.pair,
                    interval = %self.interval,
                    trade_time = %trade.timestamp,
                    bucket = %current,
                    "Dropping out-of-order trade"
                );
                None
            }
        }
    }
}

/// Owns one pair's strategies and processes its events sequentially.
struct PairWorker {
    group: StrategyGroup,
    gateway: Arc<TradeGateway>,
    builders: Vec<CandleBuilder>,
    rx: mpsc::Receiver<MarketEvent>,
    snapshot_tx: mpsc::UnboundedSender<Vec<StrategySnapshot>>,
    snapshot_interval_secs: u64,
}

impl PairWorker {
    async fn run(mut self) {
        // 0 = snapshot on shutdown only.
        let period = if self.snapshot_interval_secs == 0 {
            Duration::from_secs(60 * 60 * 24 * 365)
        } else {
            Duration::from_secs(self.snapshot_interval_secs)
        };
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await; // the first tick completes immediately

        loop {
            tokio::select! {
                event = self.rx.recv() => match event {
                    Some(event) => self.handle(event).await,
                    None => break,
                },
                _ = ticker.tick() => self.publish_snapshot(),
            }
        }
        self.publish_snapshot();
        info!(pair = %self.group.pair(), "Pair worker stopped");
    }

    async fn handle(&mut self, event: MarketEvent) {
        self.gateway.state().metrics.inc_events();
        match event {
            MarketEvent::Trades(trades) => {
                let Some(last) = trades.last() else { return };
                self.gateway.state().control.note_market_data(last.timestamp);
                self.group.on_tick(&trades);

                let mut completed = Vec::new();
                for builder in &mut self.builders {
                    for trade in &trades {
                        if let Some(candle) = builder.push(trade) {
                            completed.push(candle);
                        }
                    }
                }
                for candle in completed {
                    self.handle_candle(&candle).await;
                }
            }
            MarketEvent::Candle(candle) => {
                self.gateway.state().control.note_market_data(candle.end());
                self.handle_candle(&candle).await;
            }
            MarketEvent::PortfolioSync(sync) => {
                self.gateway.state().control.note_market_data(sync.timestamp);
                self.group.on_sync_portfolio(&sync);
                self.drain_actions().await;
            }
            MarketEvent::TradeConfirmed(trade) => {
                self.gateway.state().control.note_market_data(trade.timestamp);
                self.group.on_trade(&trade);
            }
        }
    }

    async fn handle_candle(&mut self, candle: &Candle) {
        self.group.on_candle(candle);
        self.drain_actions().await;
    }

    /// Dispatch everything the group decided this event; confirmed trades
    /// fan back out to every strategy of the pair before the next action.
    /// An action a gate dropped or the backend refused will never confirm,
    /// so its emission guard is released and the strategies re-decide on a
    /// later candle.
    async fn drain_actions(&mut self) {
        for request in self.group.collect_actions() {
            let rate = self
                .group
                .get(&request.origin)
                .map(|s| s.core().rate())
                .unwrap_or(Decimal::ZERO);
            match self.gateway.dispatch(&request, rate).await {
                DispatchOutcome::Executed(trade) => self.group.on_trade(&trade),
                DispatchOutcome::Dropped(_) | DispatchOutcome::Failed => {
                    self.group.release_emission(request.action);
                }
            }
        }
    }

    fn publish_snapshot(&self) {
        let records = snapshot::capture(&[&self.group]).strategies;
        if self.snapshot_tx.send(records).is_err() {
            warn!(pair = %self.group.pair(), "Snapshot sink is gone");
        }
    }
}

/// The assembled engine: one running worker per configured pair.
pub struct Engine {
    senders: HashMap<CurrencyPair, mpsc::Sender<MarketEvent>>,
    workers: Vec<JoinHandle<()>>,
    snapshot_writer: JoinHandle<()>,
    state: Arc<EngineState>,
}

impl Engine {
    /// Build groups from the config, restore the snapshot and spawn one
    /// worker per pair.
    pub fn start(config: &BotConfig) -> anyhow::Result<Self> {
        config.validate()?;

        let state = Arc::new(EngineState::new());
        let notifier: Arc<dyn Notifier> = Arc::new(LogNotifier::new(config.notify_throttle_secs));
        let executor: Arc<dyn TradeExecutor> = match config.mode {
            TradingMode::Paper => Arc::new(PaperExecutor::new(config.paper_balance)),
            TradingMode::Shadow => Arc::new(NoopExecutor::new()),
        };
        info!(mode = ?config.mode, backend = executor.name(), "Starting engine");

        let gateway = Arc::new(TradeGateway::new(
            Arc::clone(&state),
            executor,
            Arc::clone(&notifier),
            config.warmup_secs,
            config.in_flight_timeout_secs,
        ));

        let mut groups = Self::build_groups(config, &notifier)?;
        let restored = snapshot::restore_into(&snapshot::load(&config.snapshot_path), &mut groups);
        if restored > 0 {
            info!(restored, "Resumed strategy state from snapshot");
        }

        let (snapshot_tx, snapshot_rx) = mpsc::unbounded_channel();
        let snapshot_writer = tokio::spawn(snapshot_writer(
            config.snapshot_path.clone(),
            snapshot_rx,
        ));

        let mut senders = HashMap::new();
        let mut workers = Vec::new();
        for group in groups {
            let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
            senders.insert(group.pair().clone(), tx);
            let builders = group
                .intervals()
                .into_iter()
                .map(|interval| CandleBuilder::new(group.pair().clone(), interval))
                .collect();
            let worker = PairWorker {
                group,
                gateway: Arc::clone(&gateway),
                builders,
                rx,
                snapshot_tx: snapshot_tx.clone(),
                snapshot_interval_secs: config.snapshot_interval_secs,
            };
            workers.push(tokio::spawn(worker.run()));
        }

        Ok(Self {
            senders,
            workers,
            snapshot_writer,
            state,
        })
    }

    fn build_groups(
        config: &BotConfig,
        notifier: &Arc<dyn Notifier>,
    ) -> anyhow::Result<Vec<StrategyGroup>> {
        let mut groups: Vec<StrategyGroup> = config
            .pairs
            .iter()
            .map(|pair| StrategyGroup::new(pair.clone()))
            .collect();
        for spec in &config.strategies {
            for pair in config.pairs_for(spec) {
                let Some(group) = groups.iter_mut().find(|g| *g.pair() == pair) else {
                    bail!("Strategy '{}' references unknown pair {}", spec.strategy, pair);
                };
                let mut strategy = build_strategy(&spec.strategy, pair, &spec.settings)
                    .with_context(|| format!("Failed to build strategy '{}'", spec.strategy))?;
                strategy.set_notifier(Arc::clone(notifier));
                group.add(strategy)?;
            }
        }
        Ok(groups)
    }

    pub fn state(&self) -> &Arc<EngineState> {
        &self.state
    }

    pub fn pairs(&self) -> impl Iterator<Item = &CurrencyPair> {
        self.senders.keys()
    }

    /// Queue an event for a pair's worker. Applies backpressure when the
    /// worker falls behind.
    pub async fn send(&self, pair: &CurrencyPair, event: MarketEvent) -> anyhow::Result<()> {
        let Some(sender) = self.senders.get(pair) else {
            bail!("No worker for pair {}", pair);
        };
        sender
            .send(event)
            .await
            .map_err(|_| anyhow::anyhow!("Worker for {} is gone", pair))
    }

    /// Stop all workers, letting each publish a final snapshot first.
    pub async fn shutdown(self) {
        drop(self.senders);
        for worker in self.workers {
            if let Err(err) = worker.await {
                error!(error = %err, "Pair worker panicked");
            }
        }
        // Workers are gone; the writer drains its queue and exits.
        if let Err(err) = self.snapshot_writer.await {
            error!(error = %err, "Snapshot writer panicked");
        }
        info!("Engine stopped");
    }
}

/// Receives per-pair snapshot batches and keeps the snapshot file current.
async fn snapshot_writer(
    path: std::path::PathBuf,
    mut rx: mpsc::UnboundedReceiver<Vec<StrategySnapshot>>,
) {
    let mut latest: HashMap<(CurrencyPair, String), StrategySnapshot> = HashMap::new();
    while let Some(batch) = rx.recv().await {
        for record in batch {
            latest.insert((record.pair.clone(), record.name.clone()), record);
        }
        let file = SnapshotFile {
            saved_at: Some(Utc::now()),
            strategies: latest.values().cloned().collect(),
        };
        if let Err(err) = snapshot::save(&path, &file) {
            error!(path = %path.display(), error = %err, "Snapshot write failed");
        }
    }
}

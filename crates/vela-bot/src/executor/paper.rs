//! Paper backend: immediate simulated fills against a running balance.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use tracing::info;
use uuid::Uuid;

use vela_common::{CurrencyPair, PositionState, TradeAction};

use crate::executor::{ExecutorError, TradeExecutor};
use crate::types::{ActionRequest, ExecutedTrade};

#[derive(Debug, Clone)]
struct PaperPosition {
    position: PositionState,
    amount: Decimal,
    entry: Decimal,
    /// Quote reserved when the position was opened.
    stake: Decimal,
}

/// Simulated executor with a quote-currency balance.
#[derive(Debug)]
pub struct PaperExecutor {
    balance: Mutex<Decimal>,
    /// Quote allocated per opening trade, scaled by the request weight.
    stake: Decimal,
    positions: DashMap<CurrencyPair, PaperPosition>,
}

impl PaperExecutor {
    /// Fraction of the starting balance staked per trade.
    const STAKE_FRACTION: Decimal = Decimal::from_parts(1, 0, 0, false, 1); // 0.1

    pub fn new(starting_balance: Decimal) -> Self {
        Self {
            balance: Mutex::new(starting_balance),
            stake: starting_balance * Self::STAKE_FRACTION,
            positions: DashMap::new(),
        }
    }

    pub fn balance(&self) -> Decimal {
        *self.balance.lock()
    }

    pub fn position(&self, pair: &CurrencyPair) -> Option<PositionState> {
        self.positions.get(pair).map(|p| p.position)
    }
}

#[async_trait]
impl TradeExecutor for PaperExecutor {
    fn name(&self) -> &'static str {
        "paper"
    }

    async fn execute(
        &self,
        request: &ActionRequest,
        rate: Decimal,
    ) -> Result<ExecutedTrade, ExecutorError> {
        if rate <= Decimal::ZERO {
            return Err(ExecutorError::Rejected("no market rate yet".to_string()));
        }

        let (fill_amount, fill_rate) = match request.action {
            TradeAction::Buy | TradeAction::Sell => {
                if self.positions.contains_key(&request.pair) {
                    return Err(ExecutorError::Rejected(format!(
                        "position already open for {}",
                        request.pair
                    )));
                }
                let stake = self.stake * request.weight.unwrap_or(Decimal::ONE);
                let mut balance = self.balance.lock();
                if *balance < stake {
                    return Err(ExecutorError::InsufficientFunds {
                        available: *balance,
                        required: stake,
                    });
                }
                *balance -= stake;
                let amount = stake / rate;
                self.positions.insert(
                    request.pair.clone(),
                    PaperPosition {
                        position: request.action.resulting_position(),
                        amount,
                        entry: rate,
                        stake,
                    },
                );
                (amount, rate)
            }
            TradeAction::Close => {
                let Some((_, held)) = self.positions.remove(&request.pair) else {
                    return Err(ExecutorError::Rejected(format!(
                        "no open position for {}",
                        request.pair
                    )));
                };
                let pnl = held.position.gain(held.entry, rate) * held.amount;
                let mut balance = self.balance.lock();
                *balance += held.stake + pnl;
                info!(
                    pair = %request.pair,
                    pnl = %pnl,
                    balance = %*balance,
                    "Paper position closed"
                );
                (held.amount, rate)
            }
        };

        Ok(ExecutedTrade {
            order_id: Uuid::new_v4().to_string(),
            pair: request.pair.clone(),
            action: request.action,
            rate: fill_rate,
            amount: fill_amount,
            timestamp: request.market_time,
        })
    }
}

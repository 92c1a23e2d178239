//! Order-execution backends.
//!
//! The gateway talks to a [`TradeExecutor`]; everything behind it is
//! swappable. Failures are logged and the in-flight slot is released;
//! there is no automatic retry.

pub mod noop;
pub mod paper;

use async_trait::async_trait;
use rust_decimal::Decimal;
use thiserror::Error;

use crate::types::{ActionRequest, ExecutedTrade};

pub use noop::NoopExecutor;
pub use paper::PaperExecutor;

/// Errors from an execution backend.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("Order rejected: {0}")]
    Rejected(String),

    #[error("Insufficient funds: available {available}, required {required}")]
    InsufficientFunds {
        available: Decimal,
        required: Decimal,
    },

    #[error("Execution disabled")]
    ExecutionDisabled,

    #[error("Backend unavailable: {0}")]
    Unavailable(String),
}

/// An order-execution backend.
#[async_trait]
pub trait TradeExecutor: Send + Sync {
    fn name(&self) -> &'static str;

    /// Execute an action at the current market rate. Returns the
    /// confirmed trade, which the gateway fans out to every strategy of
    /// the pair.
    async fn execute(
        &self,
        request: &ActionRequest,
        rate: Decimal,
    ) -> Result<ExecutedTrade, ExecutorError>;
}

//! Shadow-mode backend: logs every decision, executes nothing.

use async_trait::async_trait;
use rust_decimal::Decimal;
use tracing::info;

use crate::executor::{ExecutorError, TradeExecutor};
use crate::types::{ActionRequest, ExecutedTrade};

#[derive(Debug, Default)]
pub struct NoopExecutor;

impl NoopExecutor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl TradeExecutor for NoopExecutor {
    fn name(&self) -> &'static str {
        "noop"
    }

    async fn execute(
        &self,
        request: &ActionRequest,
        rate: Decimal,
    ) -> Result<ExecutedTrade, ExecutorError> {
        info!(
            pair = %request.pair,
            action = %request.action,
            origin = %request.origin,
            rate = %rate,
            reason = %request.reason,
            "Shadow mode: would execute"
        );
        Err(ExecutorError::ExecutionDisabled)
    }
}

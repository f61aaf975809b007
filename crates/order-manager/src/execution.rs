//! Order Execution Pipeline
//!
//! Submits exchange calls for an Action with bounded retry and compensating
//! rollback.
//!
//! ## Retry
//!
//! Up to `max_attempts` tries with linear backoff (`attempt × base_delay`).
//! Only retryable errors (timeouts, network, rate limits, unavailability)
//! consume budget; a fatal error aborts at once. A call that exceeds
//! `call_timeout` counts as a retryable timeout.
//!
//! ## Rollback
//!
//! Dependent steps (entry, stop, take-profits) run in order. If step N fails,
//! steps N-1..1 are compensated in reverse: resting orders are cancelled and
//! filled market orders are flattened with a reduce-only market order. If a
//! compensation fails too, the caller gets `ReconciliationRequired`.

use crate::error::ExecutionError;
use kestrel_core::{OrderAck, OrderRequest};
use kestrel_ports::{ExchangeError, ExchangePort, ExchangeResult};
use log::{error, info, warn};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Retry and deadline settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total tries per exchange call, first one included
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    /// Deadline for one exchange call
    pub call_timeout_ms: u64,
    /// Hard deadline for one Action, retries included
    pub action_timeout_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            call_timeout_ms: 5_000,
            action_timeout_ms: 30_000,
        }
    }
}

impl RetryPolicy {
    /// Wait after failed attempt `attempt` (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.base_delay_ms.saturating_mul(u64::from(attempt)))
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn action_timeout(&self) -> Duration {
        Duration::from_millis(self.action_timeout_ms)
    }

    /// Longest one exchange call can take with every retry spent:
    /// `max_attempts × call_timeout` plus the backoff between attempts
    pub fn call_budget(&self) -> Duration {
        let attempts = self.max_attempts.max(1);
        let backoff: Duration = (1..attempts).map(|attempt| self.backoff(attempt)).sum();
        self.call_timeout().saturating_mul(attempts) + backoff
    }
}

/// An order the exchange accepted as part of a multi-step execution
#[derive(Debug, Clone, PartialEq)]
pub struct PlacedOrder {
    pub request: OrderRequest,
    pub ack: OrderAck,
}

impl PlacedOrder {
    pub fn order_id(&self) -> &str {
        &self.ack.order_id
    }
}

/// Exchange calls with retry and rollback
#[derive(Clone)]
pub struct OrderExecutionPipeline {
    exchange: Arc<dyn ExchangePort>,
    policy: RetryPolicy,
}

impl OrderExecutionPipeline {
    pub fn new(exchange: Arc<dyn ExchangePort>, policy: RetryPolicy) -> Self {
        Self { exchange, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn exchange(&self) -> &Arc<dyn ExchangePort> {
        &self.exchange
    }

    /// Submit one order
    pub async fn submit(&self, request: &OrderRequest) -> Result<OrderAck, ExecutionError> {
        let label = format!("submit {} {:?}", request.symbol, request.kind);
        self.with_retry(&label, || self.exchange.submit_order(request))
            .await
    }

    /// Cancel a resting order; an order the exchange no longer knows counts as cancelled
    pub async fn cancel(&self, symbol: &str, order_id: &str) -> Result<(), ExecutionError> {
        let label = format!("cancel {} {}", symbol, order_id);
        match self
            .with_retry(&label, || self.exchange.cancel_order(symbol, order_id))
            .await
        {
            Err(ExecutionError::Fatal(ExchangeError::NotFound(_))) => {
                info!("[EXEC] {} already gone", order_id);
                Ok(())
            }
            other => other,
        }
    }

    pub async fn mark_price(&self, symbol: &str) -> Result<Decimal, ExecutionError> {
        self.with_retry("mark price", || self.exchange.mark_price(symbol))
            .await
    }

    pub async fn balance(&self) -> Result<Decimal, ExecutionError> {
        self.with_retry("balance", || self.exchange.balance()).await
    }

    /// Run dependent orders in sequence, rolling back on failure
    pub async fn execute_steps(
        &self,
        steps: Vec<OrderRequest>,
    ) -> Result<Vec<PlacedOrder>, ExecutionError> {
        self.extend_steps(Vec::with_capacity(steps.len()), steps)
            .await
    }

    /// Run more dependent orders after `placed`; a failure rolls back `placed` too
    pub async fn extend_steps(
        &self,
        mut placed: Vec<PlacedOrder>,
        steps: Vec<OrderRequest>,
    ) -> Result<Vec<PlacedOrder>, ExecutionError> {
        let offset = placed.len();
        for (idx, request) in steps.into_iter().enumerate() {
            let idx = idx + offset;
            match self.submit(&request).await {
                Ok(ack) => placed.push(PlacedOrder { request, ack }),
                Err(e) => {
                    warn!(
                        "[EXEC] step {} ({:?}) failed: {}, compensating {} prior step(s)",
                        idx + 1,
                        request.kind,
                        e,
                        placed.len()
                    );
                    self.compensate(&placed).await?;
                    return Err(e);
                }
            }
        }

        Ok(placed)
    }

    /// Undo placed orders in reverse order
    ///
    /// Every step is attempted even if an earlier compensation fails.
    pub async fn compensate(&self, placed: &[PlacedOrder]) -> Result<(), ExecutionError> {
        let mut failures = Vec::new();

        for step in placed.iter().rev() {
            let request = &step.request;
            let outcome = if request.kind.is_resting() {
                warn!("[EXEC] compensating: cancel {}", step.order_id());
                self.cancel(&request.symbol, step.order_id()).await
            } else if step.ack.filled_quantity > Decimal::ZERO {
                warn!(
                    "[EXEC] compensating: flatten {} {} of {}",
                    request.symbol,
                    step.ack.filled_quantity,
                    step.order_id()
                );
                let flatten = OrderRequest::reduce_only_market(
                    &request.symbol,
                    request.side.opposite(),
                    step.ack.filled_quantity,
                );
                self.submit(&flatten).await.map(|_| ())
            } else {
                Ok(())
            };

            if let Err(e) = outcome {
                error!(
                    "[EXEC] compensation of {} failed: {}",
                    step.order_id(),
                    e
                );
                failures.push(format!("{}: {}", step.order_id(), e));
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(ExecutionError::ReconciliationRequired(failures.join("; ")))
        }
    }

    async fn with_retry<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T, ExecutionError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ExchangeResult<T>>,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            let outcome = match tokio::time::timeout(self.policy.call_timeout(), op()).await {
                Ok(result) => result,
                Err(_) => Err(ExchangeError::Timeout),
            };

            match outcome {
                Ok(value) => {
                    if attempt > 1 {
                        info!("[EXEC] {} succeeded on attempt {}", label, attempt);
                    }
                    return Ok(value);
                }
                Err(e) if e.is_fatal() => {
                    warn!("[EXEC] {} failed fatally: {}", label, e);
                    return Err(ExecutionError::Fatal(e));
                }
                Err(e) if attempt >= max_attempts => {
                    error!(
                        "[EXEC] {} failed after {} attempts: {}",
                        label, attempt, e
                    );
                    return Err(ExecutionError::RetriesExhausted {
                        attempts: attempt,
                        last: e,
                    });
                }
                Err(e) => {
                    let delay = self.policy.backoff(attempt);
                    warn!(
                        "[EXEC] {} attempt {}/{} failed: {}, retrying in {:?}",
                        label, attempt, max_attempts, e, delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

//! Entry decision step
//!
//! Runs once per candle close: aggregates the analyzer signals and, when the
//! result is actionable, queues an OPEN_POSITION for the symbol. An accepted
//! decision against an already open position queues a full close instead;
//! the opposite entry is left for a later candle once the symbol is free.

use crate::aggregator::{AggregationResult, SignalAggregator};
use crate::dispatcher::ActionQueue;
use crate::error::Result;
use crate::position::PositionLifecycle;
use kestrel_core::{
    Action, ActionId, AnalyzerSignal, CandleClose, CloseReason, OpenPositionPayload,
};
use log::{debug, info};
use std::sync::Arc;

/// What one evaluation led to
#[derive(Debug, Clone)]
pub enum EntryDecision {
    /// OPEN_POSITION queued
    Open {
        action_id: ActionId,
        result: AggregationResult,
    },
    /// Opposing decision: full close queued
    Exit {
        action_id: ActionId,
        result: AggregationResult,
    },
    /// Aggregation produced no direction
    NoDecision(AggregationResult),
    /// Symbol busy with a position in the same direction or mid-transition
    PositionActive(AggregationResult),
    /// Shutdown has begun
    ShuttingDown,
}

impl EntryDecision {
    pub fn action_id(&self) -> Option<ActionId> {
        match self {
            EntryDecision::Open { action_id, .. } | EntryDecision::Exit { action_id, .. } => {
                Some(*action_id)
            }
            _ => None,
        }
    }
}

pub struct EntryEvaluator {
    aggregator: SignalAggregator,
    lifecycle: Arc<PositionLifecycle>,
    queue: ActionQueue,
}

impl EntryEvaluator {
    pub fn new(
        aggregator: SignalAggregator,
        lifecycle: Arc<PositionLifecycle>,
        queue: ActionQueue,
    ) -> Self {
        Self {
            aggregator,
            lifecycle,
            queue,
        }
    }

    pub async fn evaluate(
        &self,
        candle: &CandleClose,
        signals: &[AnalyzerSignal],
    ) -> Result<EntryDecision> {
        if !self.queue.is_accepting() {
            return Ok(EntryDecision::ShuttingDown);
        }

        let result = self.aggregator.aggregate(signals);
        let Some(direction) = result.direction else {
            debug!(
                "[AGG] {} no decision: {}",
                candle.symbol, result.conflict_analysis.reasoning
            );
            return Ok(EntryDecision::NoDecision(result));
        };

        if let Some(position) = self.lifecycle.position(&candle.symbol) {
            if position.is_open() && position.side == direction.opposite() {
                info!(
                    "[AGG] {} {} decision against open {}, closing",
                    candle.symbol, direction, position.side
                );
                let action_id = self
                    .queue
                    .enqueue(Action::close_all(candle.symbol.as_str(), CloseReason::Signal))
                    .await?;
                return Ok(EntryDecision::Exit { action_id, result });
            }
            return Ok(EntryDecision::PositionActive(result));
        }

        let payload = OpenPositionPayload {
            direction,
            reference_price: candle.close,
            confidence: result.confidence,
            total_score: result.total_score,
            signal_count: result.signal_count,
        };
        info!(
            "[AGG] {} {} accepted (score {} confidence {} penalty {})",
            candle.symbol, direction, result.total_score, result.confidence, result.applied_penalty
        );
        let action_id = self
            .queue
            .enqueue(Action::open_position(candle.symbol.as_str(), payload))
            .await?;
        Ok(EntryDecision::Open { action_id, result })
    }
}

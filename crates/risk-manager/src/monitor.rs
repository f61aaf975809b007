//! Real-Time Risk Monitor
//!
//! Follows open positions through the lifecycle event channel and scores
//! their health on candle closes:
//! - Re-evaluates every `evaluation_interval_candles`, serving the cached
//!   score in between
//! - Drops the cached score as soon as the position closes
//! - Reports health level changes to the monitoring sink
//! - Requests an emergency close through the same action queue as every
//!   other decision, one at a time per position. A request that fails for a
//!   transient reason (lock contention, timeout, exchange error) is re-armed
//!   and asked again on the next candle
//!
//! The monitor never touches position state itself.

use crate::error::Result;
use crate::health::{HealthConfig, HealthScore};
use chrono::Utc;
use kestrel_core::{
    Action, ActionErrorKind, ActionId, ActionResult, Alert, CandleClose, CloseReason, HealthLevel,
    HealthTransition, Position, PositionEvent,
};
use kestrel_order_manager::ActionQueue;
use kestrel_ports::MonitoringSink;
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};

/// Monitor state for one open position
#[derive(Debug, Clone)]
struct Tracked {
    position: Position,
    candles_held: u64,
    candles_since_eval: u64,
    cached: Option<HealthScore>,
    level: HealthLevel,
    /// Emergency close queued and not reported failed
    emergency: Option<ActionId>,
}

impl Tracked {
    fn new(position: Position) -> Self {
        Self {
            position,
            candles_held: 0,
            candles_since_eval: 0,
            cached: None,
            level: HealthLevel::Healthy,
            emergency: None,
        }
    }
}

pub struct RealTimeRiskMonitor {
    config: HealthConfig,
    queue: ActionQueue,
    monitor: Arc<dyn MonitoringSink>,
    tracked: HashMap<String, Tracked>,
}

impl RealTimeRiskMonitor {
    pub fn new(config: HealthConfig, queue: ActionQueue, monitor: Arc<dyn MonitoringSink>) -> Self {
        Self {
            config,
            queue,
            monitor,
            tracked: HashMap::new(),
        }
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    /// Last computed score, if the symbol has an open position
    pub fn cached_score(&self, symbol: &str) -> Option<&HealthScore> {
        self.tracked.get(symbol).and_then(|t| t.cached.as_ref())
    }

    pub fn is_tracking(&self, symbol: &str) -> bool {
        self.tracked.contains_key(symbol)
    }

    /// True while an emergency close for the symbol is queued or running
    pub fn emergency_pending(&self, symbol: &str) -> bool {
        self.tracked
            .get(symbol)
            .map(|t| t.emergency.is_some())
            .unwrap_or(false)
    }

    /// Re-arm the emergency close when the dispatcher could not carry it out
    ///
    /// Validation and reconciliation failures stay disarmed: the position is
    /// no longer closable by another request.
    pub fn on_action_result(&mut self, result: &ActionResult) {
        let Some(tracked) = self.tracked.get_mut(&result.symbol) else {
            return;
        };
        if result.success || tracked.emergency != Some(result.action_id) {
            return;
        }
        match result.error_kind() {
            Some(
                ActionErrorKind::LockContention
                | ActionErrorKind::Timeout
                | ActionErrorKind::Exchange
                | ActionErrorKind::Internal,
            ) => {
                tracked.emergency = None;
                warn!(
                    "[RISK] {} emergency close {} failed ({:?}), asking again next candle",
                    result.symbol,
                    result.action_id,
                    result.error_kind()
                );
            }
            _ => {
                debug!(
                    "[RISK] {} emergency close {} not retried ({:?})",
                    result.symbol,
                    result.action_id,
                    result.error_kind()
                );
            }
        }
    }

    pub fn on_position_event(&mut self, event: &PositionEvent) {
        match event {
            PositionEvent::Opened(position) => {
                debug!("[RISK] tracking {} {}", position.symbol, position.side);
                self.tracked
                    .insert(position.symbol.clone(), Tracked::new(position.clone()));
            }
            PositionEvent::Updated(position) => match self.tracked.get_mut(&position.symbol) {
                Some(tracked) if tracked.position.id == position.id => {
                    tracked.position = position.clone();
                }
                _ => {
                    self.tracked
                        .insert(position.symbol.clone(), Tracked::new(position.clone()));
                }
            },
            PositionEvent::Closed { position, .. } => {
                if self.tracked.remove(&position.symbol).is_some() {
                    debug!("[RISK] {} closed, health cache dropped", position.symbol);
                }
            }
        }
    }

    /// Score the symbol's position on a candle close
    ///
    /// Returns the current (possibly cached) score, or None when nothing is
    /// open for the symbol.
    pub async fn on_candle(&mut self, candle: &CandleClose) -> Result<Option<HealthScore>> {
        let interval = self.config.evaluation_interval_candles.max(1);
        let Some(tracked) = self.tracked.get_mut(&candle.symbol) else {
            return Ok(None);
        };

        tracked.candles_held += 1;
        tracked.candles_since_eval += 1;
        let health = match &tracked.cached {
            Some(cached) if tracked.candles_since_eval < interval => cached.clone(),
            _ => {
                let health = HealthScore::compute(
                    &self.config,
                    &tracked.position,
                    candle.close,
                    candle.range_pct(),
                    tracked.candles_held,
                );
                tracked.candles_since_eval = 0;
                tracked.cached = Some(health.clone());
                debug!(
                    "[RISK] {} health {} (drawdown -{} duration -{} volatility -{})",
                    candle.symbol,
                    health.score,
                    health.drawdown_penalty,
                    health.duration_penalty,
                    health.volatility_penalty
                );

                if health.level != tracked.level {
                    let transition = HealthTransition {
                        symbol: candle.symbol.clone(),
                        position_id: tracked.position.id,
                        from: tracked.level,
                        to: health.level,
                        score: health.score,
                        timestamp: Utc::now(),
                    };
                    if health.level == HealthLevel::Healthy {
                        info!(
                            "[RISK] {} health {:?} -> {:?} ({})",
                            candle.symbol, tracked.level, health.level, health.score
                        );
                    } else {
                        warn!(
                            "[RISK] {} health {:?} -> {:?} ({})",
                            candle.symbol, tracked.level, health.level, health.score
                        );
                    }
                    tracked.level = health.level;
                    self.monitor.on_health_transition(&transition);
                }
                health
            }
        };

        let wants_emergency = self.config.emergency_close_enabled
            && health.score < self.config.emergency_threshold
            && tracked.emergency.is_none()
            && tracked.position.is_open();
        if wants_emergency {
            let symbol = candle.symbol.clone();
            match self
                .queue
                .enqueue(Action::close_all(symbol.as_str(), CloseReason::Emergency))
                .await
            {
                Ok(action_id) => {
                    tracked.emergency = Some(action_id);
                    error!(
                        "[RISK] {} health {} below {}, emergency close queued ({})",
                        symbol, health.score, self.config.emergency_threshold, action_id
                    );
                    self.monitor.on_alert(&Alert::critical(
                        symbol.as_str(),
                        format!("emergency close requested at health {}", health.score),
                    ));
                }
                Err(e) => {
                    error!("[RISK] {} emergency close not queued: {}", symbol, e);
                    return Err(e.into());
                }
            }
        }

        Ok(Some(health))
    }

    /// Consume lifecycle events, action results and candle closes until the
    /// event and candle channels close
    ///
    /// Lifecycle events and results are drained first so a close (or a failed
    /// close request) is always seen before a later candle for the same symbol.
    pub async fn run(
        mut self,
        mut position_events: mpsc::UnboundedReceiver<PositionEvent>,
        mut results: broadcast::Receiver<ActionResult>,
        mut candles: mpsc::Receiver<CandleClose>,
    ) {
        info!("[RISK] risk monitor started");
        let mut events_open = true;
        let mut results_open = true;
        let mut candles_open = true;

        while events_open || candles_open {
            tokio::select! {
                biased;
                event = position_events.recv(), if events_open => match event {
                    Some(event) => self.on_position_event(&event),
                    None => events_open = false,
                },
                result = results.recv(), if results_open => match result {
                    Ok(result) => self.on_action_result(&result),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!("[RISK] {} action result(s) missed", missed);
                    }
                    Err(broadcast::error::RecvError::Closed) => results_open = false,
                },
                candle = candles.recv(), if candles_open => match candle {
                    Some(candle) => {
                        if let Err(e) = self.on_candle(&candle).await {
                            warn!("[RISK] {} evaluation failed: {}", candle.symbol, e);
                        }
                    }
                    None => candles_open = false,
                },
            }
        }
        info!("[RISK] risk monitor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_core::{ActionError, ActionKind, Direction, PositionStatus};
    use kestrel_gateway::CollectingMonitor;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn open_position() -> Position {
        let mut position = Position::opening(
            "BTCUSDT",
            Direction::Long,
            dec!(100),
            dec!(1),
            dec!(10),
            dec!(98),
            vec![],
        );
        position.transition(PositionStatus::Open).unwrap();
        position
    }

    fn candle(close: Decimal, range: Decimal) -> CandleClose {
        CandleClose {
            symbol: "BTCUSDT".to_string(),
            open_time: Utc::now(),
            open: close,
            high: close + range,
            low: close,
            close,
            volume: dec!(1),
        }
    }

    fn monitor(config: HealthConfig) -> (
        RealTimeRiskMonitor,
        kestrel_order_manager::ActionReceiver,
        CollectingMonitor,
    ) {
        let _ = env_logger::try_init();
        let sink = CollectingMonitor::new();
        let (queue, rx) = ActionQueue::new(8);
        (
            RealTimeRiskMonitor::new(config, queue, Arc::new(sink.clone())),
            rx,
            sink,
        )
    }

    #[tokio::test]
    async fn test_no_position_no_score() {
        let (mut risk, _rx, _sink) = monitor(HealthConfig::default());
        assert!(risk.on_candle(&candle(dec!(100), Decimal::ZERO)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_score_cached_between_intervals() {
        let (mut risk, _rx, _sink) = monitor(HealthConfig::default());
        risk.on_position_event(&PositionEvent::Opened(open_position()));

        let first = risk
            .on_candle(&candle(dec!(100), Decimal::ZERO))
            .await
            .unwrap()
            .unwrap();
        // Price drops but the interval has not elapsed
        let second = risk
            .on_candle(&candle(dec!(99), Decimal::ZERO))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first, second);

        let _ = risk.on_candle(&candle(dec!(99), Decimal::ZERO)).await.unwrap();
        let fourth = risk
            .on_candle(&candle(dec!(99), Decimal::ZERO))
            .await
            .unwrap()
            .unwrap();
        assert!(fourth.score < first.score);
    }

    #[tokio::test]
    async fn test_close_invalidates_cache() {
        let (mut risk, _rx, _sink) = monitor(HealthConfig::default());
        let position = open_position();
        risk.on_position_event(&PositionEvent::Opened(position.clone()));
        risk.on_candle(&candle(dec!(100), Decimal::ZERO)).await.unwrap();
        assert!(risk.cached_score("BTCUSDT").is_some());

        risk.on_position_event(&PositionEvent::Closed {
            position,
            exit_price: dec!(100),
            reason: CloseReason::Manual,
        });
        assert!(risk.cached_score("BTCUSDT").is_none());
        assert!(risk.on_candle(&candle(dec!(100), Decimal::ZERO)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_emergency_close_requested_once() {
        let config = HealthConfig {
            evaluation_interval_candles: 1,
            ..Default::default()
        };
        let (mut risk, mut rx, sink) = monitor(config);
        risk.on_position_event(&PositionEvent::Opened(open_position()));

        // 5% adverse × 10 → full drawdown penalty, 5% range → full volatility penalty
        let health = risk
            .on_candle(&candle(dec!(95), dec!(5)))
            .await
            .unwrap()
            .unwrap();
        assert!(health.score < dec!(30));
        assert_eq!(health.level, HealthLevel::Critical);

        let _ = risk.on_candle(&candle(dec!(95), dec!(5))).await.unwrap();

        let action = rx.try_recv().unwrap();
        match action.kind {
            ActionKind::ClosePercent { percent, reason } => {
                assert_eq!(percent, dec!(100));
                assert_eq!(reason, CloseReason::Emergency);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(rx.try_recv().is_none());

        let transitions = sink.health_transitions();
        assert_eq!(transitions.len(), 1);
        assert_eq!(transitions[0].to, HealthLevel::Critical);
        assert_eq!(sink.critical_alerts().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_emergency_close_is_requested_again() {
        let config = HealthConfig {
            evaluation_interval_candles: 3,
            ..Default::default()
        };
        let (mut risk, mut rx, sink) = monitor(config);
        risk.on_position_event(&PositionEvent::Opened(open_position()));

        risk.on_candle(&candle(dec!(95), dec!(5))).await.unwrap();
        let first = rx.try_recv().unwrap();
        assert!(risk.emergency_pending("BTCUSDT"));

        // Another action held the symbol lock
        risk.on_action_result(&ActionResult::failed(
            &first,
            ActionError::new(ActionErrorKind::LockContention, "BTCUSDT busy"),
        ));
        assert!(!risk.emergency_pending("BTCUSDT"));

        // Score is served from cache on this candle and still asks again
        let health = risk
            .on_candle(&candle(dec!(95), dec!(5)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(health.level, HealthLevel::Critical);
        let second = rx.try_recv().unwrap();
        assert_ne!(first.id, second.id);
        assert!(matches!(
            second.kind,
            ActionKind::ClosePercent { reason: CloseReason::Emergency, .. }
        ));
        assert_eq!(sink.critical_alerts().len(), 2);
    }

    #[tokio::test]
    async fn test_emergency_not_rearmed_on_reconciliation_or_foreign_result() {
        let config = HealthConfig {
            evaluation_interval_candles: 1,
            ..Default::default()
        };
        let (mut risk, mut rx, _sink) = monitor(config);
        risk.on_position_event(&PositionEvent::Opened(open_position()));

        risk.on_candle(&candle(dec!(95), dec!(5))).await.unwrap();
        let first = rx.try_recv().unwrap();

        // A failure of some other action on the same symbol
        let other = Action::close_all("BTCUSDT", CloseReason::Manual);
        risk.on_action_result(&ActionResult::failed(
            &other,
            ActionError::new(ActionErrorKind::Timeout, "deadline"),
        ));
        assert!(risk.emergency_pending("BTCUSDT"));

        risk.on_action_result(&ActionResult::failed(
            &first,
            ActionError::new(ActionErrorKind::ReconciliationRequired, "stop not cancelled"),
        ));
        assert!(risk.emergency_pending("BTCUSDT"));

        risk.on_candle(&candle(dec!(95), dec!(5))).await.unwrap();
        assert!(rx.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_emergency_disabled() {
        let config = HealthConfig {
            evaluation_interval_candles: 1,
            emergency_close_enabled: false,
            ..Default::default()
        };
        let (mut risk, mut rx, _sink) = monitor(config);
        risk.on_position_event(&PositionEvent::Opened(open_position()));

        risk.on_candle(&candle(dec!(95), dec!(5))).await.unwrap();
        assert!(rx.try_recv().is_none());
    }
}

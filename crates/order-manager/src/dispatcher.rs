//! Action Queue & Dispatcher
//!
//! All position mutations are funnelled through one FIFO queue with a single
//! consumer:
//!
//! ```text
//! EntryEvaluator ──┐
//!                  ├──► ActionQueue ──► ActionDispatcher ──► PositionLifecycle
//! RiskMonitor ─────┘      (mpsc)         (one at a time)          │
//!                                              │                   ▼
//!                                              └──► ActionResult ──► MonitoringSink
//! ```
//!
//! Each Action runs on its own task so that a panicking handler becomes a
//! failed result instead of killing the consumer. A per-Action deadline stops
//! a slow Action from starving the queue; the timed-out task keeps running in
//! the background under its symbol lock so no half-applied state is left
//! behind. The queue only counts as drained once every such task has ended
//! too.

use crate::error::{Error, Result};
use crate::position::PositionLifecycle;
use kestrel_core::{Action, ActionError, ActionErrorKind, ActionId, ActionKind, ActionResult};
use kestrel_ports::MonitoringSink;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Notify, broadcast, mpsc};

const RESULT_CHANNEL_CAPACITY: usize = 256;

/// Shared queue state
#[derive(Debug)]
struct QueueState {
    accepting: AtomicBool,
    /// Enqueued and not yet answered
    pending: AtomicUsize,
    /// Action tasks still running, answered or not
    running: AtomicUsize,
    drained: Notify,
}

impl QueueState {
    fn is_drained(&self) -> bool {
        self.pending.load(Ordering::SeqCst) == 0 && self.running.load(Ordering::SeqCst) == 0
    }

    fn notify_if_drained(&self) {
        if self.is_drained() {
            self.drained.notify_waiters();
        }
    }
}

/// Producer side of the action queue
///
/// Cheap to clone; every clone feeds the same dispatcher.
#[derive(Debug, Clone)]
pub struct ActionQueue {
    tx: mpsc::Sender<Action>,
    state: Arc<QueueState>,
}

/// Consumer side, handed to the dispatcher
pub struct ActionReceiver {
    rx: mpsc::Receiver<Action>,
    state: Arc<QueueState>,
}

impl ActionQueue {
    pub fn new(capacity: usize) -> (Self, ActionReceiver) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let state = Arc::new(QueueState {
            accepting: AtomicBool::new(true),
            pending: AtomicUsize::new(0),
            running: AtomicUsize::new(0),
            drained: Notify::new(),
        });
        (
            Self {
                tx,
                state: Arc::clone(&state),
            },
            ActionReceiver { rx, state },
        )
    }

    /// Append an action; refused once the queue is closed
    pub async fn enqueue(&self, action: Action) -> Result<ActionId> {
        if !self.is_accepting() {
            return Err(Error::QueueClosed);
        }

        let id = action.id;
        let action_type = action.action_type();
        let symbol = action.symbol.clone();
        self.state.pending.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(action).await.is_err() {
            self.finish_one();
            return Err(Error::QueueClosed);
        }
        debug!("[DISPATCH] queued {} {} ({})", action_type, symbol, id);
        Ok(id)
    }

    /// Stop accepting new actions; already queued ones still run
    pub fn close(&self) {
        if self.state.accepting.swap(false, Ordering::SeqCst) {
            info!(
                "[DISPATCH] queue closed with {} action(s) pending",
                self.pending()
            );
        }
    }

    pub fn is_accepting(&self) -> bool {
        self.state.accepting.load(Ordering::SeqCst)
    }

    pub fn pending(&self) -> usize {
        self.state.pending.load(Ordering::SeqCst)
    }

    /// Action tasks still executing, including ones already answered with a timeout
    pub fn in_flight(&self) -> usize {
        self.state.running.load(Ordering::SeqCst)
    }

    /// Resolve once every enqueued action has been answered and its task has ended
    pub async fn wait_drained(&self) {
        loop {
            let notified = self.state.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.state.is_drained() {
                return;
            }
            notified.await;
        }
    }

    fn finish_one(&self) {
        finish_one(&self.state);
    }
}

impl ActionReceiver {
    /// Next queued action; the caller owes it an answer
    pub async fn recv(&mut self) -> Option<Action> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Action> {
        self.rx.try_recv().ok()
    }

    /// Mark one received action as answered
    pub fn complete(&self) {
        finish_one(&self.state);
    }
}

fn finish_one(state: &QueueState) {
    state.pending.fetch_sub(1, Ordering::SeqCst);
    state.notify_if_drained();
}

/// Counts one action task as running until dropped
struct RunningGuard {
    state: Arc<QueueState>,
}

impl RunningGuard {
    fn new(state: &Arc<QueueState>) -> Self {
        state.running.fetch_add(1, Ordering::SeqCst);
        Self {
            state: Arc::clone(state),
        }
    }
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.state.running.fetch_sub(1, Ordering::SeqCst);
        self.state.notify_if_drained();
    }
}

/// Single consumer of the action queue
pub struct ActionDispatcher {
    receiver: ActionReceiver,
    lifecycle: Arc<PositionLifecycle>,
    monitor: Arc<dyn MonitoringSink>,
    action_timeout: Duration,
    results_tx: broadcast::Sender<ActionResult>,
}

impl ActionDispatcher {
    pub fn new(
        receiver: ActionReceiver,
        lifecycle: Arc<PositionLifecycle>,
        monitor: Arc<dyn MonitoringSink>,
        action_timeout: Duration,
    ) -> Self {
        let (results_tx, _) = broadcast::channel(RESULT_CHANNEL_CAPACITY);
        Self {
            receiver,
            lifecycle,
            monitor,
            action_timeout,
            results_tx,
        }
    }

    /// Stream of every ActionResult produced from now on
    pub fn subscribe_results(&self) -> broadcast::Receiver<ActionResult> {
        self.results_tx.subscribe()
    }

    /// Consume actions until every producer is gone
    pub async fn run(mut self) {
        info!("[DISPATCH] dispatcher started");
        while let Some(action) = self.receiver.recv().await {
            let result = self.dispatch(action).await;
            self.publish(&result);
            self.receiver.complete();
        }
        info!("[DISPATCH] all producers gone, dispatcher stopped");
    }

    /// Run one action to completion and answer it
    pub async fn dispatch(&self, action: Action) -> ActionResult {
        if let Err(e) = action.validate() {
            return ActionResult::failed(
                &action,
                ActionError::new(ActionErrorKind::Validation, e.to_string()),
            );
        }

        let lifecycle = Arc::clone(&self.lifecycle);
        let task_action = action.clone();
        let running = RunningGuard::new(&self.receiver.state);
        let handle = tokio::spawn(async move {
            let _running = running;
            execute(&lifecycle, &task_action).await
        });

        match tokio::time::timeout(self.action_timeout, handle).await {
            Ok(Ok(Ok(metadata))) => ActionResult::ok(&action, metadata),
            Ok(Ok(Err(e))) => ActionResult::failed(&action, e.to_action_error()),
            Ok(Err(join_error)) => ActionResult::failed(
                &action,
                ActionError::new(
                    ActionErrorKind::Internal,
                    format!("handler crashed: {}", join_error),
                ),
            ),
            Err(_) => {
                warn!(
                    "[DISPATCH] {} {} exceeded {:?}, left to finish in background",
                    action.action_type(),
                    action.symbol,
                    self.action_timeout
                );
                ActionResult::failed(
                    &action,
                    ActionError::new(
                        ActionErrorKind::Timeout,
                        format!("no result within {:?}", self.action_timeout),
                    ),
                )
            }
        }
    }

    fn publish(&self, result: &ActionResult) {
        match &result.error {
            None => info!(
                "[DISPATCH] {} {} ok {:?}",
                result.action_type, result.symbol, result.metadata
            ),
            Some(e) if e.kind == ActionErrorKind::LockContention => info!(
                "[DISPATCH] {} {} skipped: {}",
                result.action_type, result.symbol, e.message
            ),
            Some(e) => warn!(
                "[DISPATCH] {} {} failed: {}",
                result.action_type, result.symbol, e
            ),
        }
        self.monitor.on_action_result(result);
        // No subscribers is fine
        let _ = self.results_tx.send(result.clone());
    }
}

/// Route an action to the lifecycle operation for its type
async fn execute(
    lifecycle: &PositionLifecycle,
    action: &Action,
) -> Result<HashMap<String, String>> {
    let symbol = action.symbol.as_str();
    let mut metadata = HashMap::new();

    match &action.kind {
        ActionKind::OpenPosition(payload) => {
            let position = lifecycle.open(symbol, payload).await?;
            metadata.insert("position_id".to_string(), position.id.to_string());
            metadata.insert("side".to_string(), position.side.to_string());
            metadata.insert("entry_price".to_string(), position.entry_price.to_string());
            metadata.insert("quantity".to_string(), position.quantity.to_string());
            metadata.insert("stop_loss".to_string(), position.stop_loss.to_string());
        }
        ActionKind::UpdateStopLoss { stop_loss, reason } => {
            let position = lifecycle.update_stop_loss(symbol, *stop_loss, reason).await?;
            metadata.insert("stop_loss".to_string(), position.stop_loss.to_string());
            if let Some(order_id) = position.stop_order_id {
                metadata.insert("stop_order_id".to_string(), order_id);
            }
        }
        ActionKind::ActivateTrailing {
            activation_price,
            callback_rate,
        } => {
            let position = lifecycle
                .activate_trailing(symbol, *activation_price, *callback_rate)
                .await?;
            if let Some(order_id) = position.trailing.and_then(|t| t.order_id) {
                metadata.insert("trailing_order_id".to_string(), order_id);
            }
        }
        ActionKind::ClosePercent { percent, reason } => {
            let outcome = lifecycle.close(symbol, *percent, *reason).await?;
            metadata.insert("exit_price".to_string(), outcome.exit_price.to_string());
            metadata.insert(
                "closed_quantity".to_string(),
                outcome.closed_quantity.to_string(),
            );
            metadata.insert(
                "realized_pnl".to_string(),
                outcome.position.realized_pnl.to_string(),
            );
            metadata.insert(
                "fully_closed".to_string(),
                outcome.fully_closed.to_string(),
            );
        }
    }

    Ok(metadata)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::{OrderExecutionPipeline, RetryPolicy};
    use crate::risk::RiskConfig;
    use kestrel_core::{CloseReason, Direction, OpenPositionPayload, PositionStatus};
    use kestrel_gateway::{CollectingMonitor, InMemoryRepository, PaperExchange};
    use rust_decimal_macros::dec;

    async fn setup(
        latency: Option<Duration>,
    ) -> (Arc<PaperExchange>, Arc<PositionLifecycle>, CollectingMonitor) {
        let _ = env_logger::try_init();
        let exchange = Arc::new(PaperExchange::new(dec!(10000)));
        exchange.set_mark_price("BTCUSDT", dec!(100)).await;
        exchange.set_latency(latency).await;
        let monitor = CollectingMonitor::new();
        let lifecycle = Arc::new(PositionLifecycle::new(
            OrderExecutionPipeline::new(exchange.clone(), RetryPolicy::default()),
            Arc::new(InMemoryRepository::new()),
            Arc::new(monitor.clone()),
            RiskConfig::default(),
        ));
        (exchange, lifecycle, monitor)
    }

    fn open_action() -> Action {
        Action::open_position(
            "BTCUSDT",
            OpenPositionPayload {
                direction: Direction::Long,
                reference_price: dec!(100),
                confidence: dec!(0.8),
                total_score: dec!(0.8),
                signal_count: 2,
            },
        )
    }

    #[tokio::test]
    async fn test_enqueue_after_close_refused() {
        let (queue, _rx) = ActionQueue::new(8);
        queue.close();
        let result = queue.enqueue(open_action()).await;
        assert!(matches!(result, Err(Error::QueueClosed)));
        assert_eq!(queue.pending(), 0);
    }

    #[tokio::test]
    async fn test_invalid_action_fails_fast() {
        let (_exchange, lifecycle, monitor) = setup(None).await;
        let (_queue, rx) = ActionQueue::new(8);
        let dispatcher = ActionDispatcher::new(
            rx,
            lifecycle,
            Arc::new(monitor),
            Duration::from_secs(30),
        );

        let result = dispatcher
            .dispatch(Action::close_percent("BTCUSDT", dec!(150), CloseReason::Manual))
            .await;
        assert!(!result.success);
        assert_eq!(result.error_kind(), Some(ActionErrorKind::Validation));
    }

    #[tokio::test]
    async fn test_actions_processed_in_order() {
        let (_exchange, lifecycle, monitor) = setup(None).await;
        let (queue, rx) = ActionQueue::new(8);
        let dispatcher = ActionDispatcher::new(
            rx,
            lifecycle.clone(),
            Arc::new(monitor.clone()),
            Duration::from_secs(30),
        );
        let mut results = dispatcher.subscribe_results();
        let handle = tokio::spawn(dispatcher.run());

        let open_id = queue.enqueue(open_action()).await.unwrap();
        let close_id = queue
            .enqueue(Action::close_all("BTCUSDT", CloseReason::Manual))
            .await
            .unwrap();
        queue.wait_drained().await;

        let first = results.recv().await.unwrap();
        let second = results.recv().await.unwrap();
        assert_eq!(first.action_id, open_id);
        assert!(first.success);
        assert_eq!(second.action_id, close_id);
        assert!(second.success);
        assert_eq!(second.metadata.get("fully_closed").map(String::as_str), Some("true"));
        assert!(lifecycle.position("BTCUSDT").is_none());
        assert_eq!(monitor.results().len(), 2);

        drop(queue);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_failure_does_not_stop_queue() {
        let (_exchange, lifecycle, monitor) = setup(None).await;
        let (queue, rx) = ActionQueue::new(8);
        let dispatcher = ActionDispatcher::new(
            rx,
            lifecycle.clone(),
            Arc::new(monitor.clone()),
            Duration::from_secs(30),
        );
        tokio::spawn(dispatcher.run());

        // Nothing open yet: the stop update fails, the open still runs
        queue
            .enqueue(Action::update_stop_loss("BTCUSDT", dec!(99), "tighten"))
            .await
            .unwrap();
        queue.enqueue(open_action()).await.unwrap();
        queue.wait_drained().await;

        let results = monitor.results();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].error_kind(), Some(ActionErrorKind::Validation));
        assert!(results[1].success);
        assert_eq!(
            lifecycle.position("BTCUSDT").map(|p| p.status),
            Some(PositionStatus::Open)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_action_times_out() {
        let (_exchange, lifecycle, monitor) = setup(Some(Duration::from_secs(3))).await;
        let (_queue, rx) = ActionQueue::new(8);
        let dispatcher = ActionDispatcher::new(
            rx,
            lifecycle.clone(),
            Arc::new(monitor),
            Duration::from_secs(2),
        );

        let result = dispatcher.dispatch(open_action()).await;
        assert_eq!(result.error_kind(), Some(ActionErrorKind::Timeout));
        // Still running under the symbol lock
        assert!(lifecycle.locks().is_locked("BTCUSDT"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_waits_for_timed_out_task() {
        let (_exchange, lifecycle, monitor) = setup(Some(Duration::from_secs(3))).await;
        let (queue, rx) = ActionQueue::new(8);
        let dispatcher = ActionDispatcher::new(
            rx,
            lifecycle.clone(),
            Arc::new(monitor.clone()),
            Duration::from_secs(2),
        );
        tokio::spawn(dispatcher.run());

        queue.enqueue(open_action()).await.unwrap();
        queue.wait_drained().await;

        // Answered with a timeout, but drained only once the open finished
        let results = monitor.results();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].error_kind(), Some(ActionErrorKind::Timeout));
        assert_eq!(queue.in_flight(), 0);
        assert!(!lifecycle.locks().is_locked("BTCUSDT"));
        assert_eq!(
            lifecycle.position("BTCUSDT").map(|p| p.status),
            Some(PositionStatus::Open)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_close_reports_reconciliation_within_deadline() {
        let (exchange, lifecycle, monitor) = setup(None).await;
        let policy = RetryPolicy::default();
        let (_queue, rx) = ActionQueue::new(8);
        let dispatcher = ActionDispatcher::new(
            rx,
            lifecycle.clone(),
            Arc::new(monitor),
            policy.action_timeout(),
        );
        assert!(dispatcher.dispatch(open_action()).await.success);

        // Every closing call hangs past its own deadline
        exchange.set_latency(Some(Duration::from_secs(3600))).await;
        let result = dispatcher
            .dispatch(Action::close_all("BTCUSDT", CloseReason::Manual))
            .await;

        assert_eq!(
            result.error_kind(),
            Some(ActionErrorKind::ReconciliationRequired)
        );
        let position = lifecycle.position("BTCUSDT").unwrap();
        assert_eq!(position.status, PositionStatus::Closing);
        assert!(position.reconciliation_required);
    }
}

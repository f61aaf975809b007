//! Trading engine - wires the two producers to the core
//!
//! ```text
//!   candle closes ──► on_candle ──┬──► RiskMonitor ──┐
//!                                 │                  ├──► ActionQueue ──► Dispatcher ──► Lifecycle
//!                                 └──► EntryEvaluator┘                                     │
//!                                                                                          ▼
//!   exchange push ──► event listener ──► Lifecycle (sync close / fills)              Exchange
//! ```
//!
//! Both producers may target the same symbol at the same time; the lifecycle's
//! symbol locks decide who goes first. A candle-side loser retries on its next
//! tick; a push-side loser is parked and replayed, since the exchange will not
//! repeat a fill.

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::shutdown::{GracefulShutdownManager, ShutdownReport, ShutdownSignal};
use kestrel_core::{
    Action, ActionId, AnalyzerSignal, CandleClose, CloseReason, ExchangeEvent, PositionUpdate,
};
use kestrel_gateway::{InMemoryRepository, LogMonitor, PaperExchange};
use kestrel_order_manager::{
    ActionDispatcher, ActionQueue, EntryDecision, EntryEvaluator, Error as OrderError,
    OrderExecutionPipeline, PositionLifecycle, SignalAggregator,
};
use kestrel_ports::{ExchangePort, MonitoringSink, Repository};
use kestrel_risk_manager::RealTimeRiskMonitor;
use log::{debug, info, warn};
use rust_decimal::Decimal;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

const CANDLE_CHANNEL_CAPACITY: usize = 1024;
/// How often push events parked behind a held symbol lock are retried
const DEFERRED_REPLAY_INTERVAL: Duration = Duration::from_millis(20);

pub struct TradingEngine {
    config: EngineConfig,
    lifecycle: Arc<PositionLifecycle>,
    queue: ActionQueue,
    evaluator: EntryEvaluator,
    candle_tx: mpsc::Sender<CandleClose>,
    shutdown_manager: GracefulShutdownManager,
    signal: ShutdownSignal,
    tasks: Vec<JoinHandle<()>>,
}

impl TradingEngine {
    /// Validate the config and start the dispatcher, risk monitor and
    /// exchange listener tasks
    pub async fn start(
        config: EngineConfig,
        exchange: Arc<dyn ExchangePort>,
        repository: Arc<dyn Repository>,
        monitor: Arc<dyn MonitoringSink>,
    ) -> Result<Self> {
        config.validate()?;
        info!(
            "[ENGINE] starting on {} for {:?}",
            exchange.name(),
            config.symbols
        );

        let pipeline = OrderExecutionPipeline::new(Arc::clone(&exchange), config.retry.clone());
        let lifecycle = Arc::new(PositionLifecycle::new(
            pipeline,
            Arc::clone(&repository),
            Arc::clone(&monitor),
            config.risk.clone(),
        ));
        if let Err(e) = repository.save_session(&lifecycle.session()).await {
            warn!("[ENGINE] session record not saved: {}", e);
        }

        let (queue, receiver) = ActionQueue::new(config.queue_capacity);
        let dispatcher = ActionDispatcher::new(
            receiver,
            Arc::clone(&lifecycle),
            Arc::clone(&monitor),
            config.retry.action_timeout(),
        );

        let action_results = dispatcher.subscribe_results();
        let risk_monitor =
            RealTimeRiskMonitor::new(config.health.clone(), queue.clone(), Arc::clone(&monitor));
        let (candle_tx, candle_rx) = mpsc::channel(CANDLE_CHANNEL_CAPACITY);

        let evaluator = EntryEvaluator::new(
            SignalAggregator::new(config.aggregation.clone()),
            Arc::clone(&lifecycle),
            queue.clone(),
        );
        let shutdown_manager = GracefulShutdownManager::new(
            queue.clone(),
            Arc::clone(&lifecycle),
            repository,
            config.shutdown_timeout(),
        );
        let signal = ShutdownSignal::new();

        let tasks = vec![
            tokio::spawn(dispatcher.run()),
            tokio::spawn(risk_monitor.run(
                lifecycle.subscribe(),
                action_results,
                candle_rx,
            )),
            tokio::spawn(listen_exchange(
                exchange.subscribe(),
                Arc::clone(&lifecycle),
                signal.clone(),
            )),
        ];

        Ok(Self {
            config,
            lifecycle,
            queue,
            evaluator,
            candle_tx,
            shutdown_manager,
            signal,
            tasks,
        })
    }

    /// Engine on the in-process paper exchange with in-memory persistence
    pub async fn paper(config: EngineConfig, balance: Decimal) -> Result<(Self, Arc<PaperExchange>)> {
        let exchange = Arc::new(PaperExchange::new(balance));
        let engine = Self::start(
            config,
            exchange.clone(),
            Arc::new(InMemoryRepository::new()),
            Arc::new(LogMonitor),
        )
        .await?;
        Ok((engine, exchange))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn lifecycle(&self) -> &Arc<PositionLifecycle> {
        &self.lifecycle
    }

    pub fn queue(&self) -> &ActionQueue {
        &self.queue
    }

    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.signal.clone()
    }

    /// One candle close: feed the risk monitor, then evaluate an entry
    pub async fn on_candle(
        &self,
        candle: &CandleClose,
        signals: &[AnalyzerSignal],
    ) -> Result<EntryDecision> {
        if !self.config.symbols.iter().any(|s| *s == candle.symbol) {
            return Err(EngineError::UnknownSymbol(candle.symbol.clone()));
        }
        if self.candle_tx.send(candle.clone()).await.is_err() {
            warn!("[ENGINE] risk monitor gone, {} candle not scored", candle.symbol);
        }
        Ok(self.evaluator.evaluate(candle, signals).await?)
    }

    /// Queue an operator action
    pub async fn submit(&self, action: Action) -> Result<ActionId> {
        if !self.config.symbols.iter().any(|s| *s == action.symbol) {
            return Err(EngineError::UnknownSymbol(action.symbol.clone()));
        }
        Ok(self.queue.enqueue(action).await?)
    }

    /// Block until Ctrl-C (or a manual trigger), then shut down
    pub async fn run_until_shutdown(self) -> Result<ShutdownReport> {
        let ctrl_c = self.signal.listen_for_ctrl_c();
        self.signal.wait().await;
        ctrl_c.abort();
        self.shutdown().await
    }

    /// Drain, persist, release, then stop the background tasks
    pub async fn shutdown(self) -> Result<ShutdownReport> {
        self.signal.trigger();
        let outcome = self.shutdown_manager.shutdown().await;
        for task in &self.tasks {
            task.abort();
        }
        info!("[ENGINE] stopped");
        Ok(outcome?)
    }
}

/// Second producer: exchange push events
///
/// An event that finds its symbol locked is parked, in order, behind any
/// earlier parked events for that symbol and replayed once the lock frees.
async fn listen_exchange(
    mut events: broadcast::Receiver<ExchangeEvent>,
    lifecycle: Arc<PositionLifecycle>,
    signal: ShutdownSignal,
) {
    info!("[ENGINE] exchange listener started");
    let mut deferred = DeferredEvents::default();
    let mut replay = tokio::time::interval(DEFERRED_REPLAY_INTERVAL);
    replay.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let event = tokio::select! {
            _ = signal.wait() => break,
            _ = replay.tick(), if !deferred.is_empty() => {
                deferred.replay(&lifecycle).await;
                continue;
            }
            event = events.recv() => event,
        };

        match event {
            Ok(event) => deferred.apply(&lifecycle, event).await,
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!("[ENGINE] exchange listener lagged, {} event(s) missed", missed);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }

    if !deferred.is_empty() {
        warn!(
            "[ENGINE] exchange listener stopped with {} event(s) still deferred",
            deferred.len()
        );
    }
    info!("[ENGINE] exchange listener stopped");
}

/// Push events waiting for their symbol lock
#[derive(Default)]
struct DeferredEvents {
    by_symbol: HashMap<String, VecDeque<ExchangeEvent>>,
}

impl DeferredEvents {
    fn is_empty(&self) -> bool {
        self.by_symbol.is_empty()
    }

    fn len(&self) -> usize {
        self.by_symbol.values().map(VecDeque::len).sum()
    }

    /// Apply a fresh event, or queue it behind the symbol's parked ones
    async fn apply(&mut self, lifecycle: &PositionLifecycle, event: ExchangeEvent) {
        let symbol = event.symbol().to_string();
        self.by_symbol.entry(symbol.clone()).or_default().push_back(event);
        self.flush(lifecycle, &symbol).await;
    }

    async fn replay(&mut self, lifecycle: &PositionLifecycle) {
        let symbols: Vec<String> = self.by_symbol.keys().cloned().collect();
        for symbol in symbols {
            self.flush(lifecycle, &symbol).await;
        }
    }

    /// Apply the symbol's events in arrival order until one hits the lock
    async fn flush(&mut self, lifecycle: &PositionLifecycle, symbol: &str) {
        let Some(queue) = self.by_symbol.get_mut(symbol) else {
            return;
        };
        while let Some(event) = queue.front() {
            match handle_exchange_event(lifecycle, event).await {
                Err(OrderError::LockContention(_)) => {
                    debug!(
                        "[ENGINE] {} busy, {} event(s) deferred",
                        symbol,
                        queue.len()
                    );
                    return;
                }
                Err(e) => warn!("[ENGINE] {} exchange event not applied: {}", symbol, e),
                Ok(()) => {}
            }
            queue.pop_front();
        }
        self.by_symbol.remove(symbol);
    }
}

async fn handle_exchange_event(
    lifecycle: &PositionLifecycle,
    event: &ExchangeEvent,
) -> kestrel_order_manager::Result<()> {
    match event {
        ExchangeEvent::Execution(report) => lifecycle.apply_execution(report).await.map(|_| ()),
        ExchangeEvent::Position(update) => sync_position(lifecycle, update).await,
        ExchangeEvent::Order(update) => {
            debug!(
                "[ENGINE] {} order {} {:?}",
                update.symbol, update.order_id, update.status
            );
            Ok(())
        }
    }
}

/// Flat on the exchange while tracked OPEN: closed behind our back
async fn sync_position(
    lifecycle: &PositionLifecycle,
    update: &PositionUpdate,
) -> kestrel_order_manager::Result<()> {
    if update.size > Decimal::ZERO {
        return Ok(());
    }
    let tracked_open = lifecycle
        .position(&update.symbol)
        .map(|p| p.is_open())
        .unwrap_or(false);
    if tracked_open {
        lifecycle
            .sync_external_close(&update.symbol, update.mark_price, CloseReason::External)
            .await?;
    }
    Ok(())
}

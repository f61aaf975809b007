//! Position Lifecycle
//!
//! Owns the single position per symbol and every transition of it:
//!
//! ```text
//! NONE ──open──► OPENING ──orders placed──► OPEN ──close──► CLOSING ──filled──► CLOSED ──► NONE
//!                   │                        │ ▲                │
//!                   └──rolled back──► NONE   └─┘ stop / trailing / partial close
//!                                                               └─failed──► stays CLOSING (reconcile)
//! ```
//!
//! Every public mutation first takes the symbol lock without waiting; a held
//! lock fails with `LockContention`. Position state lives in a DashMap and is
//! cloned out before any exchange call, so no map guard is held across an
//! await.
//!
//! Lifecycle events are delivered over explicit channels to each subscriber
//! (the risk monitor, the engine) in emission order.

use crate::error::{Error, ExecutionError, Result};
use crate::execution::OrderExecutionPipeline;
use crate::lock::SymbolLocks;
use crate::risk::{RiskConfig, plan_entry, take_profit_ladder};
use chrono::Utc;
use dashmap::DashMap;
use kestrel_core::{
    Alert, CloseReason, Direction, ExecutionReport, OpenPositionPayload, OrderRequest, Position,
    PositionEvent, PositionStatus, SessionRecord, TradeRecord, TrailingState,
};
use kestrel_ports::{MonitoringSink, Repository};
use log::{debug, error, info, warn};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Result of a (partial or full) close
#[derive(Debug, Clone)]
pub struct CloseOutcome {
    pub position: Position,
    pub exit_price: Decimal,
    pub closed_quantity: Decimal,
    pub fully_closed: bool,
}

/// Owner of all positions
pub struct PositionLifecycle {
    locks: SymbolLocks,
    positions: DashMap<String, Position>,
    /// Open trade records by position id
    trades: DashMap<Uuid, TradeRecord>,
    pipeline: OrderExecutionPipeline,
    repository: Arc<dyn Repository>,
    monitor: Arc<dyn MonitoringSink>,
    risk: RiskConfig,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<PositionEvent>>>,
    session: Mutex<SessionRecord>,
}

impl PositionLifecycle {
    pub fn new(
        pipeline: OrderExecutionPipeline,
        repository: Arc<dyn Repository>,
        monitor: Arc<dyn MonitoringSink>,
        risk: RiskConfig,
    ) -> Self {
        Self {
            locks: SymbolLocks::new(),
            positions: DashMap::new(),
            trades: DashMap::new(),
            pipeline,
            repository,
            monitor,
            risk,
            subscribers: Mutex::new(Vec::new()),
            session: Mutex::new(SessionRecord::start()),
        }
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn locks(&self) -> &SymbolLocks {
        &self.locks
    }

    pub fn risk_config(&self) -> &RiskConfig {
        &self.risk
    }

    pub fn position(&self, symbol: &str) -> Option<Position> {
        self.positions.get(symbol).map(|p| p.value().clone())
    }

    /// True while the symbol holds a non-CLOSED position
    pub fn has_active_position(&self, symbol: &str) -> bool {
        self.positions
            .get(symbol)
            .map(|p| p.status.is_active())
            .unwrap_or(false)
    }

    /// All tracked positions
    pub fn snapshot(&self) -> Vec<Position> {
        let mut positions: Vec<Position> =
            self.positions.iter().map(|p| p.value().clone()).collect();
        positions.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        positions
    }

    /// Current session statistics
    pub fn session(&self) -> SessionRecord {
        lock_unpoisoned(&self.session).clone()
    }

    /// Receive every lifecycle event from now on
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<PositionEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        lock_unpoisoned(&self.subscribers).push(tx);
        rx
    }

    // ========================================================================
    // Open
    // ========================================================================

    /// Open a position: entry, stop-loss and take-profits as one rollback unit
    pub async fn open(&self, symbol: &str, decision: &OpenPositionPayload) -> Result<Position> {
        let _guard = self.locks.try_acquire(symbol)?;

        if self.has_active_position(symbol) {
            return Err(Error::AlreadyOpen(symbol.to_string()));
        }

        let balance = self.pipeline.balance().await?;
        let plan = plan_entry(
            &self.risk,
            decision.direction,
            decision.reference_price,
            balance,
        )?;

        let mut position = Position::opening(
            symbol,
            plan.direction,
            plan.entry_price,
            plan.quantity,
            self.risk.leverage,
            plan.stop_loss,
            plan.take_profits,
        );
        info!(
            "[LIFECYCLE] {} NONE -> OPENING {} qty={} ref={} stop={}",
            symbol, position.side, position.quantity, position.entry_price, position.stop_loss
        );
        self.store(&position);

        let entry = OrderRequest::market(symbol, position.side.entry_side(), position.quantity);
        let placed = match self.pipeline.execute_steps(vec![entry]).await {
            Ok(placed) => placed,
            Err(e) => return Err(self.abort_open(&mut position, e)),
        };

        let entry = &placed[0].ack;
        position.entry_order_id = Some(entry.order_id.clone());
        if let Some(price) = entry.average_price {
            position.entry_price = price;
        }
        // Protective orders cover what actually filled
        if entry.filled_quantity > Decimal::ZERO && entry.filled_quantity != position.quantity {
            warn!(
                "[LIFECYCLE] {} entry filled {} of {}",
                symbol, entry.filled_quantity, position.quantity
            );
            position.quantity = entry.filled_quantity;
            position.initial_quantity = entry.filled_quantity;
            position.take_profits =
                take_profit_ladder(&self.risk, position.side, plan.entry_price, position.quantity);
        }

        let exit_side = position.side.exit_side();
        let mut protective = vec![OrderRequest::stop_loss(
            symbol,
            exit_side,
            position.quantity,
            position.stop_loss,
        )];
        protective.extend(position.take_profits.iter().map(|tp| {
            OrderRequest::take_profit(symbol, exit_side, tp.quantity, tp.price)
        }));

        let placed = match self.pipeline.extend_steps(placed, protective).await {
            Ok(placed) => placed,
            Err(e) => return Err(self.abort_open(&mut position, e)),
        };

        // Steps are entry, stop, then one per take-profit
        position.stop_order_id = placed.get(1).map(|p| p.ack.order_id.clone());
        for (tp, placed_tp) in position.take_profits.iter_mut().zip(placed.iter().skip(2)) {
            tp.order_id = Some(placed_tp.ack.order_id.clone());
        }

        position.transition(PositionStatus::Open)?;
        self.store(&position);
        info!(
            "[LIFECYCLE] {} OPENING -> OPEN {} qty={} entry={} (score {} confidence {})",
            symbol,
            position.side,
            position.quantity,
            position.entry_price,
            decision.total_score,
            decision.confidence
        );

        let trade = TradeRecord::opened(&position);
        if let Err(e) = self.repository.save_trade(&trade).await {
            error!("[LIFECYCLE] {} failed to persist opened trade: {}", symbol, e);
            self.monitor
                .on_alert(&Alert::warning(symbol, format!("trade record not saved: {}", e)));
        }
        self.trades.insert(position.id, trade);

        self.emit(PositionEvent::Opened(position.clone()));
        Ok(position)
    }

    /// Settle an OPENING position whose order sequence failed
    ///
    /// A clean rollback returns the symbol to NONE. A failed rollback keeps
    /// the position OPENING and flagged for reconciliation.
    fn abort_open(&self, position: &mut Position, error: ExecutionError) -> Error {
        let symbol = position.symbol.clone();
        match error {
            ExecutionError::ReconciliationRequired(reason) => {
                position.reconciliation_required = true;
                self.store(position);
                self.raise_reconciliation(&symbol, &format!("open rollback failed: {}", reason));
                Error::ReconciliationRequired { symbol, reason }
            }
            e => {
                if let Err(invalid) = position.transition(PositionStatus::None) {
                    return invalid.into();
                }
                self.positions.remove(&symbol);
                warn!("[LIFECYCLE] {} OPENING -> NONE (rolled back): {}", symbol, e);
                Error::Exchange(e)
            }
        }
    }

    // ========================================================================
    // In-place updates
    // ========================================================================

    /// Replace the protective stop: place the new one, then cancel the old one
    pub async fn update_stop_loss(
        &self,
        symbol: &str,
        stop_loss: Decimal,
        reason: &str,
    ) -> Result<Position> {
        let _guard = self.locks.try_acquire(symbol)?;
        let mut position = self.open_position(symbol)?;

        let mark = self.pipeline.mark_price(symbol).await?;
        let valid = match position.side {
            Direction::Long => stop_loss < mark,
            Direction::Short => stop_loss > mark,
        };
        if !valid {
            return Err(Error::Validation(format!(
                "stop {} on wrong side of mark {} for {}",
                stop_loss, mark, position.side
            )));
        }

        self.replace_stop(&mut position, stop_loss).await?;
        info!(
            "[LIFECYCLE] {} stop -> {} ({})",
            symbol, position.stop_loss, reason
        );
        self.store(&position);
        self.sync_trade(&position);
        self.emit(PositionEvent::Updated(position.clone()));
        Ok(position)
    }

    /// Place a reduce-only trailing stop; only once per position
    pub async fn activate_trailing(
        &self,
        symbol: &str,
        activation_price: Decimal,
        callback_rate: Decimal,
    ) -> Result<Position> {
        let _guard = self.locks.try_acquire(symbol)?;
        let mut position = self.open_position(symbol)?;

        if position.trailing.is_some() {
            return Err(Error::Validation(format!(
                "trailing stop already active for {}",
                symbol
            )));
        }

        let request = OrderRequest::trailing_stop(
            symbol,
            position.side.exit_side(),
            position.quantity,
            activation_price,
            callback_rate,
        );
        let ack = self.pipeline.submit(&request).await?;

        position.trailing = Some(TrailingState {
            activation_price,
            callback_rate,
            order_id: Some(ack.order_id),
            activated_at: Utc::now(),
        });
        position.updated_at = Utc::now();
        info!(
            "[LIFECYCLE] {} trailing stop at {} callback {}",
            symbol, activation_price, callback_rate
        );
        self.store(&position);
        self.emit(PositionEvent::Updated(position.clone()));
        Ok(position)
    }

    // ========================================================================
    // Close
    // ========================================================================

    /// Close `percent` of the remaining quantity
    ///
    /// 100% moves the position OPEN -> CLOSING -> CLOSED. If the closing order
    /// cannot be placed the position stays CLOSING and is flagged for manual
    /// reconciliation; there is no automatic way back to OPEN.
    pub async fn close(
        &self,
        symbol: &str,
        percent: Decimal,
        reason: CloseReason,
    ) -> Result<CloseOutcome> {
        if percent <= Decimal::ZERO || percent > dec!(100) {
            return Err(Error::Validation(format!(
                "close percent must be within (0, 100], got {}",
                percent
            )));
        }

        let _guard = self.locks.try_acquire(symbol)?;
        let position = self.open_position(symbol)?;

        let quantity = if percent == dec!(100) {
            position.quantity
        } else {
            self.risk.floor_to_step(position.quantity * percent / dec!(100))
        };
        if quantity <= Decimal::ZERO {
            return Err(Error::Validation(format!(
                "{}% of {} rounds to nothing",
                percent, position.quantity
            )));
        }

        if quantity >= position.quantity {
            self.close_all(position, reason).await
        } else {
            self.close_partial(position, quantity, reason).await
        }
    }

    async fn close_all(&self, mut position: Position, reason: CloseReason) -> Result<CloseOutcome> {
        let symbol = position.symbol.clone();
        position.transition(PositionStatus::Closing)?;
        self.store(&position);
        info!("[LIFECYCLE] {} OPEN -> CLOSING ({:?})", symbol, reason);

        let request =
            OrderRequest::reduce_only_market(&symbol, position.side.exit_side(), position.quantity);
        let ack = match self.pipeline.submit(&request).await {
            Ok(ack) => ack,
            Err(e) => {
                position.reconciliation_required = true;
                self.store(&position);
                let reason = format!("closing order failed: {}", e);
                self.raise_reconciliation(&symbol, &reason);
                return Err(Error::ReconciliationRequired { symbol, reason });
            }
        };

        let exit_price = ack.average_price.unwrap_or_else(|| {
            warn!("[LIFECYCLE] {} close ack without price, using entry", symbol);
            position.entry_price
        });
        let closed_quantity = position.quantity;

        self.cancel_protective_orders(&position).await;
        position.realized_pnl += position.pnl_for(exit_price, closed_quantity);
        position.quantity = Decimal::ZERO;
        let position = self.finalize_close(position, exit_price, reason).await?;

        Ok(CloseOutcome {
            position,
            exit_price,
            closed_quantity,
            fully_closed: true,
        })
    }

    async fn close_partial(
        &self,
        mut position: Position,
        quantity: Decimal,
        reason: CloseReason,
    ) -> Result<CloseOutcome> {
        let symbol = position.symbol.clone();
        let request = OrderRequest::reduce_only_market(&symbol, position.side.exit_side(), quantity);
        let ack = self.pipeline.submit(&request).await?;

        let exit_price = ack.average_price.unwrap_or(position.entry_price);
        let closed_quantity = if ack.filled_quantity > Decimal::ZERO {
            ack.filled_quantity.min(position.quantity)
        } else {
            quantity
        };

        position.realized_pnl += position.pnl_for(exit_price, closed_quantity);
        position.quantity -= closed_quantity;
        position.updated_at = Utc::now();
        info!(
            "[LIFECYCLE] {} partial close {} @ {} ({:?}), {} left",
            symbol, closed_quantity, exit_price, reason, position.quantity
        );
        self.store(&position);
        self.persist_trade_update(&position).await;
        self.emit(PositionEvent::Updated(position.clone()));

        Ok(CloseOutcome {
            position,
            exit_price,
            closed_quantity,
            fully_closed: false,
        })
    }

    // ========================================================================
    // Exchange push events
    // ========================================================================

    /// The exchange reports the symbol flat while we still track it OPEN
    ///
    /// Returns the closed position, or None when nothing was tracked.
    pub async fn sync_external_close(
        &self,
        symbol: &str,
        exit_price: Decimal,
        reason: CloseReason,
    ) -> Result<Option<Position>> {
        let _guard = self.locks.try_acquire(symbol)?;
        let Some(mut position) = self.position(symbol).filter(|p| p.is_open()) else {
            return Ok(None);
        };

        warn!(
            "[LIFECYCLE] {} closed on the exchange at {} ({:?})",
            symbol, exit_price, reason
        );
        position.transition(PositionStatus::Closing)?;
        self.cancel_protective_orders(&position).await;
        position.realized_pnl += position.pnl_for(exit_price, position.quantity);
        position.quantity = Decimal::ZERO;
        self.finalize_close(position, exit_price, reason)
            .await
            .map(Some)
    }

    /// Apply a fill of one of our resting orders
    ///
    /// Take-profit fills reduce the position (and may move the stop to
    /// breakeven); a stop or trailing fill that covers the whole quantity
    /// closes it. Fills of unknown orders are ignored.
    pub async fn apply_execution(&self, report: &ExecutionReport) -> Result<Option<Position>> {
        let symbol = report.symbol.as_str();
        let _guard = self.locks.try_acquire(symbol)?;
        let Some(mut position) = self.position(symbol).filter(|p| p.is_open()) else {
            return Ok(None);
        };

        let order_id = Some(report.order_id.as_str());
        let tp_index = position
            .take_profits
            .iter()
            .position(|tp| !tp.hit && tp.order_id.as_deref() == order_id);
        let is_stop = position.stop_order_id.as_deref() == order_id
            || position
                .trailing
                .as_ref()
                .and_then(|t| t.order_id.as_deref())
                == order_id;

        if tp_index.is_none() && !is_stop {
            debug!("[LIFECYCLE] {} ignoring fill of {}", symbol, report.order_id);
            return Ok(None);
        }

        let filled = report.quantity.min(position.quantity);
        position.realized_pnl += position.pnl_for(report.price, filled);
        position.quantity -= filled;
        position.updated_at = Utc::now();

        let reason = match tp_index {
            Some(idx) => {
                position.take_profits[idx].hit = true;
                info!(
                    "[LIFECYCLE] {} take-profit {} filled {} @ {}",
                    symbol,
                    idx + 1,
                    filled,
                    report.price
                );
                CloseReason::TakeProfit
            }
            None => {
                info!("[LIFECYCLE] {} stop filled {} @ {}", symbol, filled, report.price);
                CloseReason::StopLoss
            }
        };

        if position.quantity <= Decimal::ZERO {
            position.transition(PositionStatus::Closing)?;
            self.cancel_protective_orders(&position).await;
            return self
                .finalize_close(position, report.price, reason)
                .await
                .map(Some);
        }

        let hits = position.take_profits.iter().filter(|tp| tp.hit).count();
        if tp_index.is_some() && hits == 1 && self.risk.breakeven_after_first_tp {
            let breakeven = position.entry_price;
            let improves = match position.side {
                Direction::Long => breakeven > position.stop_loss,
                Direction::Short => breakeven < position.stop_loss,
            };
            if improves {
                if let Err(e) = self.replace_stop(&mut position, breakeven).await {
                    warn!("[LIFECYCLE] {} breakeven stop failed: {}", symbol, e);
                } else {
                    info!("[LIFECYCLE] {} stop moved to breakeven {}", symbol, breakeven);
                }
            }
        }

        self.store(&position);
        self.persist_trade_update(&position).await;
        self.emit(PositionEvent::Updated(position.clone()));
        Ok(Some(position))
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn store(&self, position: &Position) {
        self.positions
            .insert(position.symbol.clone(), position.clone());
    }

    fn open_position(&self, symbol: &str) -> Result<Position> {
        let position = self
            .position(symbol)
            .ok_or_else(|| Error::NoPosition(symbol.to_string()))?;
        if position.status != PositionStatus::Open {
            return Err(Error::InvalidState {
                symbol: symbol.to_string(),
                status: position.status,
                expected: PositionStatus::Open,
            });
        }
        Ok(position)
    }

    /// Place the new stop, then cancel the old one (compensating the new one on failure)
    async fn replace_stop(&self, position: &mut Position, stop_loss: Decimal) -> Result<()> {
        let symbol = position.symbol.clone();
        let request =
            OrderRequest::stop_loss(&symbol, position.side.exit_side(), position.quantity, stop_loss);
        let ack = self.pipeline.submit(&request).await?;

        if let Some(old) = position.stop_order_id.clone() {
            if let Err(e) = self.pipeline.cancel(&symbol, &old).await {
                warn!(
                    "[LIFECYCLE] {} cancel of old stop {} failed: {}, withdrawing new stop",
                    symbol, old, e
                );
                if let Err(undo) = self.pipeline.cancel(&symbol, &ack.order_id).await {
                    position.reconciliation_required = true;
                    self.store(position);
                    let reason = format!(
                        "two stops resting ({} and {}): {}",
                        old, ack.order_id, undo
                    );
                    self.raise_reconciliation(&symbol, &reason);
                    return Err(Error::ReconciliationRequired { symbol, reason });
                }
                return Err(Error::Exchange(e));
            }
        }

        position.stop_loss = stop_loss;
        position.stop_order_id = Some(ack.order_id);
        position.updated_at = Utc::now();
        Ok(())
    }

    /// Best-effort cancel of everything still resting for a closed position
    async fn cancel_protective_orders(&self, position: &Position) {
        let mut order_ids: Vec<String> = position
            .take_profits
            .iter()
            .filter(|tp| !tp.hit)
            .filter_map(|tp| tp.order_id.clone())
            .collect();
        order_ids.extend(position.stop_order_id.clone());
        order_ids.extend(position.trailing.as_ref().and_then(|t| t.order_id.clone()));

        for order_id in order_ids {
            if let Err(e) = self.pipeline.cancel(&position.symbol, &order_id).await {
                warn!(
                    "[LIFECYCLE] {} left order {} resting: {}",
                    position.symbol, order_id, e
                );
                self.monitor.on_alert(&Alert::warning(
                    position.symbol.clone(),
                    format!("reduce-only order {} left resting: {}", order_id, e),
                ));
            }
        }
    }

    /// CLOSING -> CLOSED: persist, count, notify, free the symbol
    async fn finalize_close(
        &self,
        mut position: Position,
        exit_price: Decimal,
        reason: CloseReason,
    ) -> Result<Position> {
        position.transition(PositionStatus::Closed)?;
        let symbol = position.symbol.clone();
        info!(
            "[LIFECYCLE] {} CLOSING -> CLOSED at {} ({:?}) pnl={}",
            symbol, exit_price, reason, position.realized_pnl
        );

        let mut trade = self
            .trades
            .remove(&position.id)
            .map(|(_, t)| t)
            .unwrap_or_else(|| TradeRecord::opened(&position));
        trade.close(&position, exit_price, reason);
        if let Err(e) = self.repository.update_trade(&trade).await {
            // Record may never have been saved
            if let Err(e) = self.repository.save_trade(&trade).await {
                error!("[LIFECYCLE] {} failed to persist closed trade: {}", symbol, e);
                self.monitor
                    .on_alert(&Alert::warning(symbol.as_str(), format!("trade record lost: {}", e)));
            } else {
                debug!("[LIFECYCLE] {} trade saved after update failed: {}", symbol, e);
            }
        }
        lock_unpoisoned(&self.session).record_closed(&trade);

        self.positions.remove(&symbol);
        self.emit(PositionEvent::Closed {
            position: position.clone(),
            exit_price,
            reason,
        });
        Ok(position)
    }

    fn sync_trade(&self, position: &Position) {
        if let Some(mut trade) = self.trades.get_mut(&position.id) {
            trade.sync_from(position);
        }
    }

    async fn persist_trade_update(&self, position: &Position) {
        self.sync_trade(position);
        let trade = self.trades.get(&position.id).map(|t| t.value().clone());
        if let Some(trade) = trade {
            if let Err(e) = self.repository.update_trade(&trade).await {
                error!(
                    "[LIFECYCLE] {} failed to update trade record: {}",
                    position.symbol, e
                );
            }
        }
    }

    fn raise_reconciliation(&self, symbol: &str, reason: &str) {
        error!(
            "[LIFECYCLE] {} MANUAL RECONCILIATION REQUIRED: {}",
            symbol, reason
        );
        self.monitor.on_alert(&Alert::critical(
            symbol,
            format!("manual reconciliation required: {}", reason),
        ));
    }

    fn emit(&self, event: PositionEvent) {
        self.monitor.on_position_event(&event);
        lock_unpoisoned(&self.subscribers).retain(|tx| tx.send(event.clone()).is_ok());
    }
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::RetryPolicy;
    use kestrel_core::{OrderSide, TradeStatus};
    use kestrel_gateway::{CollectingMonitor, FaultTarget, InMemoryRepository, PaperExchange};
    use kestrel_ports::{ExchangeError, ExchangePort};

    struct Fixture {
        exchange: Arc<PaperExchange>,
        repository: InMemoryRepository,
        monitor: CollectingMonitor,
        lifecycle: Arc<PositionLifecycle>,
    }

    async fn fixture() -> Fixture {
        let _ = env_logger::try_init();
        let exchange = Arc::new(PaperExchange::new(dec!(10000)));
        exchange.set_mark_price("BTCUSDT", dec!(100)).await;
        let repository = InMemoryRepository::new();
        let monitor = CollectingMonitor::new();
        let pipeline = OrderExecutionPipeline::new(exchange.clone(), RetryPolicy::default());
        let lifecycle = Arc::new(PositionLifecycle::new(
            pipeline,
            Arc::new(repository.clone()),
            Arc::new(monitor.clone()),
            RiskConfig::default(),
        ));
        Fixture {
            exchange,
            repository,
            monitor,
            lifecycle,
        }
    }

    fn long_decision() -> OpenPositionPayload {
        OpenPositionPayload {
            direction: Direction::Long,
            reference_price: dec!(100),
            confidence: dec!(0.8),
            total_score: dec!(0.8),
            signal_count: 3,
        }
    }

    #[tokio::test]
    async fn test_open_places_entry_stop_and_take_profits() {
        let f = fixture().await;
        let mut events = f.lifecycle.subscribe();

        let position = f.lifecycle.open("BTCUSDT", &long_decision()).await.unwrap();

        assert_eq!(position.status, PositionStatus::Open);
        assert_eq!(position.quantity, dec!(20));
        assert!(position.stop_order_id.is_some());
        assert!(position.take_profits.iter().all(|tp| tp.order_id.is_some()));
        // Stop + 2 take-profits resting
        assert_eq!(f.exchange.resting_orders("BTCUSDT").await.len(), 3);
        assert_eq!(f.repository.trade_count(), 1);
        assert!(matches!(events.recv().await, Some(PositionEvent::Opened(_))));
    }

    #[tokio::test]
    async fn test_partial_entry_sizes_protective_orders_from_fill() {
        let f = fixture().await;
        f.exchange.fill_next_entry_partially(dec!(0.35)).await;

        let position = f.lifecycle.open("BTCUSDT", &long_decision()).await.unwrap();
        assert_eq!(position.quantity, dec!(7));
        assert_eq!(position.initial_quantity, dec!(7));
        let ladder: Vec<Decimal> = position.take_profits.iter().map(|tp| tp.quantity).collect();
        assert_eq!(ladder, vec![dec!(3.5), dec!(3.5)]);
        assert_eq!(position.take_profits[0].price, dec!(102));

        let resting = f.exchange.resting_orders("BTCUSDT").await;
        assert_eq!(resting.len(), 3);
        let stop = resting
            .iter()
            .find(|o| Some(&o.order_id) == position.stop_order_id.as_ref())
            .unwrap();
        assert_eq!(stop.request.quantity, dec!(7));
        let protected: Decimal = resting
            .iter()
            .filter(|o| o.order_id != stop.order_id)
            .map(|o| o.request.quantity)
            .sum();
        assert_eq!(protected, dec!(7));
        assert_eq!(f.exchange.position("BTCUSDT").await.unwrap().unwrap().size, dec!(7));
    }

    #[tokio::test]
    async fn test_partial_entry_rolled_back_when_stop_rejected() {
        let f = fixture().await;
        f.exchange.fill_next_entry_partially(dec!(0.5)).await;
        f.exchange
            .fail_next_submits(
                FaultTarget::StopLoss,
                ExchangeError::Rejected("bad trigger".into()),
                1,
            )
            .await;

        let result = f.lifecycle.open("BTCUSDT", &long_decision()).await;
        assert!(matches!(result, Err(Error::Exchange(ExecutionError::Fatal(_)))));
        assert!(f.lifecycle.position("BTCUSDT").is_none());
        assert!(f.exchange.position("BTCUSDT").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_second_open_rejected() {
        let f = fixture().await;
        f.lifecycle.open("BTCUSDT", &long_decision()).await.unwrap();

        let second = f.lifecycle.open("BTCUSDT", &long_decision()).await;
        assert!(matches!(second, Err(Error::AlreadyOpen(_))));
        assert_eq!(f.lifecycle.snapshot().len(), 1);
    }

    #[tokio::test]
    async fn test_held_lock_contends() {
        let f = fixture().await;
        let _guard = f.lifecycle.locks().try_acquire("BTCUSDT").unwrap();

        let result = f.lifecycle.open("BTCUSDT", &long_decision()).await;
        assert!(matches!(result, Err(Error::LockContention(_))));
        assert!(f.lifecycle.position("BTCUSDT").is_none());
    }

    #[tokio::test]
    async fn test_open_rolls_back_when_stop_rejected() {
        let f = fixture().await;
        f.exchange
            .fail_next_submits(
                FaultTarget::StopLoss,
                ExchangeError::Rejected("bad trigger".into()),
                1,
            )
            .await;

        let result = f.lifecycle.open("BTCUSDT", &long_decision()).await;
        assert!(matches!(result, Err(Error::Exchange(ExecutionError::Fatal(_)))));
        assert!(f.lifecycle.position("BTCUSDT").is_none());
        assert!(f.exchange.position("BTCUSDT").await.unwrap().is_none());
        assert!(!f.lifecycle.locks().is_locked("BTCUSDT"));
    }

    #[tokio::test]
    async fn test_open_rollback_failure_flags_reconciliation() {
        let f = fixture().await;
        f.exchange
            .fail_next_submits(FaultTarget::TakeProfit, ExchangeError::Rejected("no".into()), 1)
            .await;
        f.exchange
            .fail_next_cancels(ExchangeError::Rejected("busy".into()), 1)
            .await;

        let result = f.lifecycle.open("BTCUSDT", &long_decision()).await;
        assert!(matches!(result, Err(Error::ReconciliationRequired { .. })));

        let position = f.lifecycle.position("BTCUSDT").unwrap();
        assert!(position.reconciliation_required);
        assert_eq!(f.monitor.critical_alerts().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_failure_stays_closing() {
        let f = fixture().await;
        f.lifecycle.open("BTCUSDT", &long_decision()).await.unwrap();
        f.exchange
            .fail_next_submits(FaultTarget::ReduceOnlyMarket, ExchangeError::Timeout, 3)
            .await;

        let result = f
            .lifecycle
            .close("BTCUSDT", dec!(100), CloseReason::Signal)
            .await;

        let err = result.unwrap_err();
        assert_eq!(err.kind(), kestrel_core::ActionErrorKind::ReconciliationRequired);
        let position = f.lifecycle.position("BTCUSDT").unwrap();
        assert_eq!(position.status, PositionStatus::Closing);
        assert!(position.reconciliation_required);
        assert!(!f.monitor.critical_alerts().is_empty());

        // CLOSING is not OPEN: further closes are refused
        let again = f.lifecycle.close("BTCUSDT", dec!(100), CloseReason::Signal).await;
        assert!(matches!(again, Err(Error::InvalidState { .. })));
    }

    #[tokio::test]
    async fn test_full_close_persists_and_frees_symbol() {
        let f = fixture().await;
        let mut events = f.lifecycle.subscribe();
        f.lifecycle.open("BTCUSDT", &long_decision()).await.unwrap();
        f.exchange.set_mark_price("BTCUSDT", dec!(101)).await;

        let outcome = f
            .lifecycle
            .close("BTCUSDT", dec!(100), CloseReason::Manual)
            .await
            .unwrap();

        assert!(outcome.fully_closed);
        assert_eq!(outcome.position.status, PositionStatus::Closed);
        assert_eq!(outcome.position.realized_pnl, dec!(20));
        assert!(f.lifecycle.position("BTCUSDT").is_none());
        assert!(f.exchange.resting_orders("BTCUSDT").await.is_empty());

        let trade = &f.repository.trades()[0];
        assert_eq!(trade.status, TradeStatus::Closed);
        assert_eq!(trade.exit_price, Some(dec!(101)));
        assert_eq!(f.lifecycle.session().wins, 1);

        assert!(matches!(events.recv().await, Some(PositionEvent::Opened(_))));
        assert!(matches!(events.recv().await, Some(PositionEvent::Closed { .. })));

        // Symbol is free again
        assert!(f.lifecycle.open("BTCUSDT", &long_decision()).await.is_ok());
    }

    #[tokio::test]
    async fn test_partial_close_stays_open() {
        let f = fixture().await;
        f.lifecycle.open("BTCUSDT", &long_decision()).await.unwrap();

        let outcome = f
            .lifecycle
            .close("BTCUSDT", dec!(25), CloseReason::Signal)
            .await
            .unwrap();

        assert!(!outcome.fully_closed);
        assert_eq!(outcome.closed_quantity, dec!(5));
        let position = f.lifecycle.position("BTCUSDT").unwrap();
        assert_eq!(position.status, PositionStatus::Open);
        assert_eq!(position.quantity, dec!(15));
        let exchange_position = f.exchange.position("BTCUSDT").await.unwrap().unwrap();
        assert_eq!(exchange_position.size, dec!(15));
    }

    #[tokio::test]
    async fn test_update_stop_replaces_order() {
        let f = fixture().await;
        let opened = f.lifecycle.open("BTCUSDT", &long_decision()).await.unwrap();
        let old_stop = opened.stop_order_id.clone().unwrap();

        let updated = f
            .lifecycle
            .update_stop_loss("BTCUSDT", dec!(99), "tighten")
            .await
            .unwrap();

        assert_eq!(updated.stop_loss, dec!(99));
        assert_ne!(updated.stop_order_id.as_deref(), Some(old_stop.as_str()));
        assert!(f.exchange.cancelled_orders().await.contains(&old_stop));
        assert_eq!(updated.status, PositionStatus::Open);
    }

    #[tokio::test]
    async fn test_update_stop_on_wrong_side_rejected() {
        let f = fixture().await;
        f.lifecycle.open("BTCUSDT", &long_decision()).await.unwrap();

        let result = f
            .lifecycle
            .update_stop_loss("BTCUSDT", dec!(100.5), "bad")
            .await;
        assert!(matches!(result, Err(Error::Validation(_))));
    }

    #[tokio::test]
    async fn test_update_stop_without_position() {
        let f = fixture().await;
        let result = f
            .lifecycle
            .update_stop_loss("BTCUSDT", dec!(99), "none")
            .await;
        assert!(matches!(result, Err(Error::NoPosition(_))));
    }

    #[tokio::test]
    async fn test_trailing_only_once() {
        let f = fixture().await;
        f.lifecycle.open("BTCUSDT", &long_decision()).await.unwrap();

        let position = f
            .lifecycle
            .activate_trailing("BTCUSDT", dec!(103), dec!(0.01))
            .await
            .unwrap();
        assert!(position.trailing.is_some());

        let again = f
            .lifecycle
            .activate_trailing("BTCUSDT", dec!(103), dec!(0.01))
            .await;
        assert!(matches!(again, Err(Error::Validation(_))));
    }

    #[tokio::test]
    async fn test_take_profit_fill_moves_stop_to_breakeven() {
        let f = fixture().await;
        let opened = f.lifecycle.open("BTCUSDT", &long_decision()).await.unwrap();
        let tp1 = opened.take_profits[0].clone();

        let report = ExecutionReport {
            symbol: "BTCUSDT".to_string(),
            order_id: tp1.order_id.clone().unwrap(),
            side: OrderSide::Sell,
            price: tp1.price,
            quantity: tp1.quantity,
            timestamp: Utc::now(),
        };
        // Mirror the fill on the paper exchange so the new stop is valid
        f.exchange.set_mark_price("BTCUSDT", tp1.price).await;

        let position = f.lifecycle.apply_execution(&report).await.unwrap().unwrap();
        assert!(position.take_profits[0].hit);
        assert_eq!(position.quantity, dec!(10));
        assert_eq!(position.stop_loss, opened.entry_price);
        assert_eq!(position.realized_pnl, dec!(20));
    }

    #[tokio::test]
    async fn test_external_close() {
        let f = fixture().await;
        f.lifecycle.open("BTCUSDT", &long_decision()).await.unwrap();
        f.exchange.set_mark_price("BTCUSDT", dec!(99)).await;
        f.exchange.close_externally("BTCUSDT").await;

        let closed = f
            .lifecycle
            .sync_external_close("BTCUSDT", dec!(99), CloseReason::External)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(closed.status, PositionStatus::Closed);
        assert_eq!(closed.realized_pnl, dec!(-20));
        assert_eq!(f.lifecycle.session().losses, 1);

        // Nothing left to sync
        assert!(
            f.lifecycle
                .sync_external_close("BTCUSDT", dec!(99), CloseReason::External)
                .await
                .unwrap()
                .is_none()
        );
    }
}

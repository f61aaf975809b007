//! Paper exchange
//!
//! In-process `ExchangePort` that simulates a single-account derivatives
//! venue:
//! - market orders fill immediately at the symbol's mark price
//! - stop-market, limit and trailing-stop orders rest until `set_mark_price`
//!   moves the mark through them
//! - reduce-only orders are capped at the open size and cancelled once the
//!   position is flat
//! - every fill is pushed as execution, position and order events
//!
//! Faults are scripted per order class so callers can drive retry, rollback
//! and reconciliation paths deterministically.

use async_trait::async_trait;
use chrono::Utc;
use kestrel_core::{
    Direction, ExchangeEvent, ExecutionReport, OrderAck, OrderKind, OrderRequest, OrderSide,
    OrderUpdate, OrderUpdateStatus, PositionUpdate,
};
use kestrel_ports::{ExchangeError, ExchangePort, ExchangePosition, ExchangeResult};
use log::{debug, info};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, broadcast};

const EVENT_CAPACITY: usize = 1024;

/// Class of order a scripted fault applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultTarget {
    Any,
    /// Market order that may increase the position (entries)
    Market,
    /// Reduce-only market order (closes and compensations)
    ReduceOnlyMarket,
    StopLoss,
    TakeProfit,
    TrailingStop,
}

impl FaultTarget {
    fn matches(&self, request: &OrderRequest) -> bool {
        match self {
            FaultTarget::Any => true,
            FaultTarget::Market => request.kind == OrderKind::Market && !request.reduce_only,
            FaultTarget::ReduceOnlyMarket => {
                request.kind == OrderKind::Market && request.reduce_only
            }
            FaultTarget::StopLoss => matches!(request.kind, OrderKind::StopMarket { .. }),
            FaultTarget::TakeProfit => matches!(request.kind, OrderKind::Limit { .. }),
            FaultTarget::TrailingStop => matches!(request.kind, OrderKind::TrailingStop { .. }),
        }
    }
}

#[derive(Debug, Clone)]
struct FaultRule {
    target: FaultTarget,
    error: ExchangeError,
    remaining: u32,
}

/// Order resting on the paper book
#[derive(Debug, Clone, PartialEq)]
pub struct PaperOrder {
    pub order_id: String,
    pub request: OrderRequest,
    /// Trailing stops: best mark seen since activation
    extreme: Option<Decimal>,
}

#[derive(Debug, Clone)]
struct PaperPosition {
    side: Direction,
    size: Decimal,
    entry_price: Decimal,
}

#[derive(Debug, Default)]
struct PaperState {
    balance: Decimal,
    marks: HashMap<String, Decimal>,
    positions: HashMap<String, PaperPosition>,
    resting: Vec<PaperOrder>,
    submit_faults: Vec<FaultRule>,
    cancel_faults: Vec<FaultRule>,
    /// Fraction the next position-increasing fill is cut to
    partial_fill: Option<Decimal>,
    submitted: Vec<OrderRequest>,
    cancelled: Vec<String>,
    latency: Option<Duration>,
}

impl PaperState {
    fn take_submit_fault(&mut self, request: &OrderRequest) -> Option<ExchangeError> {
        let rule = self
            .submit_faults
            .iter_mut()
            .find(|r| r.remaining > 0 && r.target.matches(request))?;
        rule.remaining -= 1;
        Some(rule.error.clone())
    }

    fn take_cancel_fault(&mut self) -> Option<ExchangeError> {
        let rule = self.cancel_faults.iter_mut().find(|r| r.remaining > 0)?;
        rule.remaining -= 1;
        Some(rule.error.clone())
    }

    fn position_update(&self, symbol: &str) -> PositionUpdate {
        let mark_price = self.marks.get(symbol).copied().unwrap_or_default();
        match self.positions.get(symbol) {
            Some(p) => PositionUpdate {
                symbol: symbol.to_string(),
                side: Some(p.side),
                size: p.size,
                entry_price: p.entry_price,
                mark_price,
            },
            None => PositionUpdate {
                symbol: symbol.to_string(),
                side: None,
                size: Decimal::ZERO,
                entry_price: Decimal::ZERO,
                mark_price,
            },
        }
    }

    /// Quantity a reduce-only order may fill right now
    fn reducible(&self, symbol: &str, side: OrderSide) -> Decimal {
        match self.positions.get(symbol) {
            Some(p) if p.side.exit_side() == side => p.size,
            _ => Decimal::ZERO,
        }
    }

    /// Net a fill into the position and book realized PnL
    fn apply_fill(&mut self, symbol: &str, side: OrderSide, quantity: Decimal, price: Decimal) {
        let fill_direction = match side {
            OrderSide::Buy => Direction::Long,
            OrderSide::Sell => Direction::Short,
        };

        let Some(mut position) = self.positions.remove(symbol) else {
            self.positions.insert(
                symbol.to_string(),
                PaperPosition {
                    side: fill_direction,
                    size: quantity,
                    entry_price: price,
                },
            );
            return;
        };

        if position.side == fill_direction {
            let notional = position.entry_price * position.size + price * quantity;
            position.size += quantity;
            position.entry_price = notional / position.size;
            self.positions.insert(symbol.to_string(), position);
            return;
        }

        let closing = quantity.min(position.size);
        self.balance += (price - position.entry_price) * closing * position.side.sign();
        position.size -= closing;
        let flipped = quantity - closing;

        if position.size > Decimal::ZERO {
            self.positions.insert(symbol.to_string(), position);
        } else if flipped > Decimal::ZERO {
            self.positions.insert(
                symbol.to_string(),
                PaperPosition {
                    side: fill_direction,
                    size: flipped,
                    entry_price: price,
                },
            );
        }
    }
}

/// Simulated exchange for paper trading and tests
pub struct PaperExchange {
    state: Mutex<PaperState>,
    events_tx: broadcast::Sender<ExchangeEvent>,
    next_order_id: AtomicU64,
}

impl PaperExchange {
    pub fn new(balance: Decimal) -> Self {
        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            state: Mutex::new(PaperState {
                balance,
                ..Default::default()
            }),
            events_tx,
            next_order_id: AtomicU64::new(1),
        }
    }

    /// Move the mark price and trigger any resting orders it crosses
    pub async fn set_mark_price(&self, symbol: &str, price: Decimal) {
        let mut state = self.state.lock().await;
        state.marks.insert(symbol.to_string(), price);

        let candidates: Vec<String> = state
            .resting
            .iter()
            .filter(|o| o.request.symbol == symbol)
            .map(|o| o.order_id.clone())
            .collect();

        for order_id in candidates {
            let Some(idx) = state.resting.iter().position(|o| o.order_id == order_id) else {
                // Cancelled by an earlier fill that flattened the position
                continue;
            };
            let fill_price = {
                let order = &mut state.resting[idx];
                trigger_price(order, price)
            };
            if let Some(fill_price) = fill_price {
                let order = state.resting.remove(idx);
                debug!(
                    "[PAPER] {} {:?} triggered at mark {}",
                    order.order_id, order.request.kind, price
                );
                self.fill(&mut state, &order.order_id, &order.request, fill_price);
            }
        }
    }

    /// Flatten a position outside the engine's control (manual close, liquidation)
    pub async fn close_externally(&self, symbol: &str) {
        let mut state = self.state.lock().await;
        let Some(position) = state.positions.get(symbol).cloned() else {
            return;
        };
        let price = state
            .marks
            .get(symbol)
            .copied()
            .unwrap_or(position.entry_price);
        let request =
            OrderRequest::reduce_only_market(symbol, position.side.exit_side(), position.size);
        let order_id = self.order_id();
        info!("[PAPER] external close {} {} @ {}", symbol, position.size, price);
        self.fill(&mut state, &order_id, &request, price);
    }

    pub async fn set_balance(&self, balance: Decimal) {
        self.state.lock().await.balance = balance;
    }

    /// Delay every submit and cancel by `latency`
    pub async fn set_latency(&self, latency: Option<Duration>) {
        self.state.lock().await.latency = latency;
    }

    /// Fail the next `times` submissions matching `target` with `error`
    pub async fn fail_next_submits(&self, target: FaultTarget, error: ExchangeError, times: u32) {
        self.state.lock().await.submit_faults.push(FaultRule {
            target,
            error,
            remaining: times,
        });
    }

    /// Fail the next `times` cancellations with `error`
    pub async fn fail_next_cancels(&self, error: ExchangeError, times: u32) {
        self.state.lock().await.cancel_faults.push(FaultRule {
            target: FaultTarget::Any,
            error,
            remaining: times,
        });
    }

    /// Fill only `fraction` of the next order that opens or adds to a position
    pub async fn fill_next_entry_partially(&self, fraction: Decimal) {
        self.state.lock().await.partial_fill = Some(fraction);
    }

    pub async fn clear_faults(&self) {
        let mut state = self.state.lock().await;
        state.submit_faults.clear();
        state.cancel_faults.clear();
        state.partial_fill = None;
    }

    /// Every submission attempt, including failed ones
    pub async fn submitted_orders(&self) -> Vec<OrderRequest> {
        self.state.lock().await.submitted.clone()
    }

    pub async fn resting_orders(&self, symbol: &str) -> Vec<PaperOrder> {
        self.state
            .lock()
            .await
            .resting
            .iter()
            .filter(|o| o.request.symbol == symbol)
            .cloned()
            .collect()
    }

    pub async fn cancelled_orders(&self) -> Vec<String> {
        self.state.lock().await.cancelled.clone()
    }

    fn order_id(&self) -> String {
        format!("paper-{}", self.next_order_id.fetch_add(1, Ordering::SeqCst))
    }

    fn publish(&self, event: ExchangeEvent) {
        // No subscribers is fine
        let _ = self.events_tx.send(event);
    }

    fn publish_order(&self, symbol: &str, order_id: &str, status: OrderUpdateStatus) {
        self.publish(ExchangeEvent::Order(OrderUpdate {
            symbol: symbol.to_string(),
            order_id: order_id.to_string(),
            status,
        }));
    }

    /// Fill an order against the position; returns the filled quantity
    fn fill(
        &self,
        state: &mut PaperState,
        order_id: &str,
        request: &OrderRequest,
        price: Decimal,
    ) -> Decimal {
        let symbol = request.symbol.as_str();
        let quantity = if request.reduce_only {
            request.quantity.min(state.reducible(symbol, request.side))
        } else if let Some(fraction) = state.partial_fill.take() {
            debug!("[PAPER] {} filled partially ({})", order_id, fraction);
            request.quantity * fraction
        } else {
            request.quantity
        };

        if quantity <= Decimal::ZERO {
            state.cancelled.push(order_id.to_string());
            self.publish_order(symbol, order_id, OrderUpdateStatus::Cancelled);
            return Decimal::ZERO;
        }

        state.apply_fill(symbol, request.side, quantity, price);

        self.publish(ExchangeEvent::Execution(ExecutionReport {
            symbol: symbol.to_string(),
            order_id: order_id.to_string(),
            side: request.side,
            price,
            quantity,
            timestamp: Utc::now(),
        }));
        self.publish(ExchangeEvent::Position(state.position_update(symbol)));
        self.publish_order(symbol, order_id, OrderUpdateStatus::Filled);

        if !state.positions.contains_key(symbol) {
            self.cancel_reduce_only(state, symbol);
        }
        quantity
    }

    /// Drop reduce-only orders left behind by a flat position
    fn cancel_reduce_only(&self, state: &mut PaperState, symbol: &str) {
        let (stale, keep): (Vec<PaperOrder>, Vec<PaperOrder>) = state
            .resting
            .drain(..)
            .partition(|o| o.request.symbol == symbol && o.request.reduce_only);
        state.resting = keep;
        for order in stale {
            debug!("[PAPER] {} cancelled, {} is flat", order.order_id, symbol);
            state.cancelled.push(order.order_id.clone());
            self.publish_order(symbol, &order.order_id, OrderUpdateStatus::Cancelled);
        }
    }

    async fn simulate_latency(&self) {
        let latency = self.state.lock().await.latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }
}

impl Default for PaperExchange {
    fn default() -> Self {
        Self::new(Decimal::ZERO)
    }
}

/// Price a resting order fills at for `mark`, if it triggers
fn trigger_price(order: &mut PaperOrder, mark: Decimal) -> Option<Decimal> {
    let side = order.request.side;
    match order.request.kind {
        OrderKind::Market => Some(mark),
        OrderKind::Limit { price } => {
            let crossed = match side {
                OrderSide::Sell => mark >= price,
                OrderSide::Buy => mark <= price,
            };
            crossed.then_some(price)
        }
        OrderKind::StopMarket { trigger_price } => {
            let crossed = match side {
                OrderSide::Sell => mark <= trigger_price,
                OrderSide::Buy => mark >= trigger_price,
            };
            crossed.then_some(mark)
        }
        OrderKind::TrailingStop {
            activation_price,
            callback_rate,
        } => {
            let extreme = match (order.extreme, side) {
                // Sell trailing protects a long: activates on the way up
                (None, OrderSide::Sell) if mark >= activation_price => mark,
                (None, OrderSide::Buy) if mark <= activation_price => mark,
                (None, _) => return None,
                (Some(best), OrderSide::Sell) => best.max(mark),
                (Some(best), OrderSide::Buy) => best.min(mark),
            };
            order.extreme = Some(extreme);
            let triggered = match side {
                OrderSide::Sell => mark <= extreme * (Decimal::ONE - callback_rate),
                OrderSide::Buy => mark >= extreme * (Decimal::ONE + callback_rate),
            };
            triggered.then_some(mark)
        }
    }
}

#[async_trait]
impl ExchangePort for PaperExchange {
    async fn submit_order(&self, request: &OrderRequest) -> ExchangeResult<OrderAck> {
        self.simulate_latency().await;

        let mut state = self.state.lock().await;
        state.submitted.push(request.clone());

        if let Some(error) = state.take_submit_fault(request) {
            debug!("[PAPER] scripted fault for {}: {}", request.client_order_id, error);
            return Err(error);
        }

        if request.quantity <= Decimal::ZERO {
            return Err(ExchangeError::InvalidParameters(format!(
                "quantity must be positive, got {}",
                request.quantity
            )));
        }

        let mark = state
            .marks
            .get(&request.symbol)
            .copied()
            .ok_or_else(|| ExchangeError::Rejected(format!("no market for {}", request.symbol)))?;

        if request.reduce_only && state.reducible(&request.symbol, request.side).is_zero() {
            return Err(ExchangeError::Rejected(
                "reduce-only order would increase position".to_string(),
            ));
        }

        let order_id = self.order_id();

        match request.kind {
            OrderKind::Market => {
                let filled = self.fill(&mut state, &order_id, request, mark);
                Ok(OrderAck {
                    order_id,
                    client_order_id: request.client_order_id.clone(),
                    symbol: request.symbol.clone(),
                    filled_quantity: filled,
                    average_price: Some(mark),
                    timestamp: Utc::now(),
                })
            }
            OrderKind::StopMarket { trigger_price }
                if (request.side == OrderSide::Sell && trigger_price >= mark)
                    || (request.side == OrderSide::Buy && trigger_price <= mark) =>
            {
                Err(ExchangeError::Rejected(format!(
                    "stop {} would trigger immediately at mark {}",
                    trigger_price, mark
                )))
            }
            _ => {
                state.resting.push(PaperOrder {
                    order_id: order_id.clone(),
                    request: request.clone(),
                    extreme: None,
                });
                self.publish_order(&request.symbol, &order_id, OrderUpdateStatus::New);
                Ok(OrderAck {
                    order_id,
                    client_order_id: request.client_order_id.clone(),
                    symbol: request.symbol.clone(),
                    filled_quantity: Decimal::ZERO,
                    average_price: None,
                    timestamp: Utc::now(),
                })
            }
        }
    }

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> ExchangeResult<()> {
        self.simulate_latency().await;

        let mut state = self.state.lock().await;
        if let Some(error) = state.take_cancel_fault() {
            return Err(error);
        }

        let idx = state
            .resting
            .iter()
            .position(|o| o.order_id == order_id && o.request.symbol == symbol)
            .ok_or_else(|| ExchangeError::NotFound(format!("order {}", order_id)))?;
        state.resting.remove(idx);
        state.cancelled.push(order_id.to_string());
        self.publish_order(symbol, order_id, OrderUpdateStatus::Cancelled);
        Ok(())
    }

    async fn position(&self, symbol: &str) -> ExchangeResult<Option<ExchangePosition>> {
        let state = self.state.lock().await;
        let mark_price = state.marks.get(symbol).copied().unwrap_or_default();
        Ok(state.positions.get(symbol).map(|p| ExchangePosition {
            symbol: symbol.to_string(),
            side: p.side,
            size: p.size,
            entry_price: p.entry_price,
            mark_price,
        }))
    }

    async fn balance(&self) -> ExchangeResult<Decimal> {
        Ok(self.state.lock().await.balance)
    }

    async fn mark_price(&self, symbol: &str) -> ExchangeResult<Decimal> {
        self.state
            .lock()
            .await
            .marks
            .get(symbol)
            .copied()
            .ok_or_else(|| ExchangeError::NotFound(format!("mark price for {}", symbol)))
    }

    fn subscribe(&self) -> broadcast::Receiver<ExchangeEvent> {
        self.events_tx.subscribe()
    }

    fn name(&self) -> &str {
        "paper"
    }
}

//! Events flowing between producers, the lifecycle and the risk monitor

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::entities::{CloseReason, Direction, OrderSide, Position};

/// A closed candle for one symbol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandleClose {
    pub symbol: String,
    pub open_time: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

impl CandleClose {
    /// High-low range as a fraction of close
    pub fn range_pct(&self) -> Decimal {
        if self.close.is_zero() {
            Decimal::ZERO
        } else {
            (self.high - self.low).abs() / self.close
        }
    }
}

/// Position lifecycle notifications emitted by the lifecycle owner
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PositionEvent {
    Opened(Position),
    /// Stop, trailing, take-profit or quantity changed while OPEN
    Updated(Position),
    Closed {
        position: Position,
        exit_price: Decimal,
        reason: CloseReason,
    },
}

impl PositionEvent {
    pub fn symbol(&self) -> &str {
        match self {
            PositionEvent::Opened(p) | PositionEvent::Updated(p) => &p.symbol,
            PositionEvent::Closed { position, .. } => &position.symbol,
        }
    }

    pub fn position(&self) -> &Position {
        match self {
            PositionEvent::Opened(p) | PositionEvent::Updated(p) => p,
            PositionEvent::Closed { position, .. } => position,
        }
    }
}

/// Exchange-side position snapshot (position topic)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionUpdate {
    pub symbol: String,
    /// None when flat
    pub side: Option<Direction>,
    pub size: Decimal,
    pub entry_price: Decimal,
    pub mark_price: Decimal,
}

/// A fill (execution topic)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub symbol: String,
    pub order_id: String,
    pub side: OrderSide,
    pub price: Decimal,
    pub quantity: Decimal,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderUpdateStatus {
    New,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
}

/// Order state change (order topic)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderUpdate {
    pub symbol: String,
    pub order_id: String,
    pub status: OrderUpdateStatus,
}

/// Push notification from the exchange connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "topic", rename_all = "snake_case")]
pub enum ExchangeEvent {
    Position(PositionUpdate),
    Execution(ExecutionReport),
    Order(OrderUpdate),
}

impl ExchangeEvent {
    pub fn symbol(&self) -> &str {
        match self {
            ExchangeEvent::Position(p) => &p.symbol,
            ExchangeEvent::Execution(e) => &e.symbol,
            ExchangeEvent::Order(o) => &o.symbol,
        }
    }

    pub fn topic(&self) -> &'static str {
        match self {
            ExchangeEvent::Position(_) => "position",
            ExchangeEvent::Execution(_) => "execution",
            ExchangeEvent::Order(_) => "order",
        }
    }
}

//! Exchange-agnostic order types
//!
//! The core never speaks an exchange's wire format. Adapters translate these
//! requests into whatever the venue expects.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::side::OrderSide;

/// Order type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrderKind {
    /// Fill immediately at the best available price
    Market,
    /// Rest at `price` (used for take-profits)
    Limit { price: Decimal },
    /// Market order once `trigger_price` trades (used for stop-losses)
    StopMarket { trigger_price: Decimal },
    /// Stop that follows price by `callback_rate` once `activation_price` trades
    TrailingStop {
        activation_price: Decimal,
        callback_rate: Decimal,
    },
}

impl OrderKind {
    /// Orders that rest on the book instead of filling immediately
    pub fn is_resting(&self) -> bool {
        !matches!(self, OrderKind::Market)
    }
}

/// Order submission request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    /// Client-assigned order ID for correlation
    pub client_order_id: String,
    /// Symbol to trade
    pub symbol: String,
    /// Buy or sell
    pub side: OrderSide,
    /// Order type
    pub kind: OrderKind,
    /// Quantity to trade
    pub quantity: Decimal,
    /// May only reduce an existing position
    pub reduce_only: bool,
}

impl OrderRequest {
    fn new(
        symbol: impl Into<String>,
        side: OrderSide,
        kind: OrderKind,
        quantity: Decimal,
        reduce_only: bool,
    ) -> Self {
        Self {
            client_order_id: format!("kst-{}", Uuid::new_v4().simple()),
            symbol: symbol.into(),
            side,
            kind,
            quantity,
            reduce_only,
        }
    }

    /// Market order that opens or adds to a position
    pub fn market(symbol: impl Into<String>, side: OrderSide, quantity: Decimal) -> Self {
        Self::new(symbol, side, OrderKind::Market, quantity, false)
    }

    /// Market order that may only reduce a position
    pub fn reduce_only_market(symbol: impl Into<String>, side: OrderSide, quantity: Decimal) -> Self {
        Self::new(symbol, side, OrderKind::Market, quantity, true)
    }

    /// Protective stop-loss
    pub fn stop_loss(
        symbol: impl Into<String>,
        side: OrderSide,
        quantity: Decimal,
        trigger_price: Decimal,
    ) -> Self {
        Self::new(
            symbol,
            side,
            OrderKind::StopMarket { trigger_price },
            quantity,
            true,
        )
    }

    /// Reduce-only limit at a take-profit level
    pub fn take_profit(
        symbol: impl Into<String>,
        side: OrderSide,
        quantity: Decimal,
        price: Decimal,
    ) -> Self {
        Self::new(symbol, side, OrderKind::Limit { price }, quantity, true)
    }

    /// Reduce-only trailing stop
    pub fn trailing_stop(
        symbol: impl Into<String>,
        side: OrderSide,
        quantity: Decimal,
        activation_price: Decimal,
        callback_rate: Decimal,
    ) -> Self {
        Self::new(
            symbol,
            side,
            OrderKind::TrailingStop {
                activation_price,
                callback_rate,
            },
            quantity,
            true,
        )
    }
}

/// Exchange acknowledgement of a submitted order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderAck {
    /// Exchange-assigned order ID
    pub order_id: String,
    /// Echo of the client order ID
    pub client_order_id: String,
    pub symbol: String,
    /// Quantity filled on submission (zero for resting orders)
    pub filled_quantity: Decimal,
    /// Average fill price, if anything filled
    pub average_price: Option<Decimal>,
    pub timestamp: DateTime<Utc>,
}

impl OrderAck {
    pub fn is_filled(&self) -> bool {
        self.filled_quantity > Decimal::ZERO
    }
}

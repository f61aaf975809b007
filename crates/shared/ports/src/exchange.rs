use async_trait::async_trait;
use kestrel_core::{Direction, ExchangeEvent, OrderAck, OrderRequest};
use rust_decimal::Decimal;
use tokio::sync::broadcast;

use crate::error::ExchangeResult;

/// Exchange-side view of a position
#[derive(Debug, Clone, PartialEq)]
pub struct ExchangePosition {
    pub symbol: String,
    pub side: Direction,
    pub size: Decimal,
    pub entry_price: Decimal,
    pub mark_price: Decimal,
}

/// Port for the exchange connection
///
/// The execution pipeline and the position lifecycle depend only on this
/// contract, never on a venue's wire format.
#[async_trait]
pub trait ExchangePort: Send + Sync {
    /// Submit an order
    async fn submit_order(&self, request: &OrderRequest) -> ExchangeResult<OrderAck>;

    /// Cancel a resting order
    async fn cancel_order(&self, symbol: &str, order_id: &str) -> ExchangeResult<()>;

    /// Current exchange position for a symbol (None when flat)
    async fn position(&self, symbol: &str) -> ExchangeResult<Option<ExchangePosition>>;

    /// Available quote balance
    async fn balance(&self) -> ExchangeResult<Decimal>;

    /// Current mark price
    async fn mark_price(&self, symbol: &str) -> ExchangeResult<Decimal>;

    /// Push stream of position, execution and order events
    fn subscribe(&self) -> broadcast::Receiver<ExchangeEvent>;

    /// Adapter name for logging
    fn name(&self) -> &str {
        "exchange"
    }
}

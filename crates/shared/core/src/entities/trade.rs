//! Persistence records
//!
//! What the repository collaborator stores at open, partial close, close and
//! shutdown.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::action::CloseReason;
use super::position::Position;
use super::side::Direction;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeStatus {
    Open,
    Closed,
}

/// Journal entry for one position, from open to close
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub id: Uuid,
    pub position_id: Uuid,
    pub symbol: String,
    pub side: Direction,
    pub entry_price: Decimal,
    pub quantity: Decimal,
    pub leverage: Decimal,
    pub stop_loss: Decimal,
    pub exit_price: Option<Decimal>,
    pub realized_pnl: Decimal,
    pub close_reason: Option<CloseReason>,
    pub status: TradeStatus,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl TradeRecord {
    /// Record written when a position opens
    pub fn opened(position: &Position) -> Self {
        Self {
            id: position.trade_id,
            position_id: position.id,
            symbol: position.symbol.clone(),
            side: position.side,
            entry_price: position.entry_price,
            quantity: position.initial_quantity,
            leverage: position.leverage,
            stop_loss: position.stop_loss,
            exit_price: None,
            realized_pnl: Decimal::ZERO,
            close_reason: None,
            status: TradeStatus::Open,
            opened_at: position.opened_at,
            closed_at: None,
        }
    }

    /// Fold the position's current realized PnL and stop into the record
    pub fn sync_from(&mut self, position: &Position) {
        self.realized_pnl = position.realized_pnl;
        self.stop_loss = position.stop_loss;
    }

    /// Finalise the record
    pub fn close(&mut self, position: &Position, exit_price: Decimal, reason: CloseReason) {
        self.sync_from(position);
        self.exit_price = Some(exit_price);
        self.close_reason = Some(reason);
        self.status = TradeStatus::Closed;
        self.closed_at = Some(Utc::now());
    }

    pub fn is_win(&self) -> bool {
        self.realized_pnl > Decimal::ZERO
    }
}

/// Running statistics for one engine session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: Uuid,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub trades: u64,
    pub wins: u64,
    pub losses: u64,
    pub net_pnl: Decimal,
}

impl SessionRecord {
    pub fn start() -> Self {
        Self {
            id: Uuid::new_v4(),
            started_at: Utc::now(),
            ended_at: None,
            trades: 0,
            wins: 0,
            losses: 0,
            net_pnl: Decimal::ZERO,
        }
    }

    /// Count a finished trade
    pub fn record_closed(&mut self, trade: &TradeRecord) {
        self.trades += 1;
        if trade.is_win() {
            self.wins += 1;
        } else {
            self.losses += 1;
        }
        self.net_pnl += trade.realized_pnl;
    }

    pub fn finish(&mut self) {
        self.ended_at = Some(Utc::now());
    }

    pub fn win_rate(&self) -> Decimal {
        if self.trades == 0 {
            Decimal::ZERO
        } else {
            Decimal::from(self.wins) / Decimal::from(self.trades)
        }
    }
}

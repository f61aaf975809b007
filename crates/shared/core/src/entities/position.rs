use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use super::side::Direction;

/// Position lifecycle status
///
/// ```text
/// NONE ──► OPENING ──► OPEN ──► CLOSING ──► CLOSED ──► (NONE)
///             │
///             └──► NONE (entry rolled back)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PositionStatus {
    None,
    Opening,
    Open,
    Closing,
    Closed,
}

impl PositionStatus {
    /// Returns true while the position occupies its symbol slot
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            PositionStatus::Opening | PositionStatus::Open | PositionStatus::Closing
        )
    }

    /// Whether the state machine allows moving from `self` to `next`
    pub fn can_transition_to(&self, next: PositionStatus) -> bool {
        matches!(
            (self, next),
            (PositionStatus::None, PositionStatus::Opening)
                | (PositionStatus::Opening, PositionStatus::Open)
                | (PositionStatus::Opening, PositionStatus::None)
                | (PositionStatus::Open, PositionStatus::Closing)
                | (PositionStatus::Closing, PositionStatus::Closed)
                | (PositionStatus::Closed, PositionStatus::None)
        )
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid position transition {from:?} -> {to:?}")]
pub struct StatusTransitionError {
    pub from: PositionStatus,
    pub to: PositionStatus,
}

/// One take-profit target of a position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TakeProfitLevel {
    /// Limit price
    pub price: Decimal,
    /// Quantity closed at this level
    pub quantity: Decimal,
    /// Resting exchange order, once placed
    pub order_id: Option<String>,
    /// Whether the level has been filled
    pub hit: bool,
}

impl TakeProfitLevel {
    pub fn new(price: Decimal, quantity: Decimal) -> Self {
        Self {
            price,
            quantity,
            order_id: None,
            hit: false,
        }
    }
}

/// Trailing stop attached to a position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrailingState {
    /// Price at which trailing starts
    pub activation_price: Decimal,
    /// Callback distance as a fraction of price (0.01 = 1%)
    pub callback_rate: Decimal,
    /// Trailing-stop order on the exchange
    pub order_id: Option<String>,
    /// When trailing was activated
    pub activated_at: DateTime<Utc>,
}

/// The single position held for a symbol
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    /// Unique position identifier
    pub id: Uuid,

    /// Trade record tracking this position in the repository
    pub trade_id: Uuid,

    /// Traded symbol
    pub symbol: String,

    /// Position side (long/short)
    pub side: Direction,

    /// Average entry price
    pub entry_price: Decimal,

    /// Remaining position quantity (always positive)
    pub quantity: Decimal,

    /// Quantity at entry
    pub initial_quantity: Decimal,

    /// Leverage applied
    pub leverage: Decimal,

    /// Current stop-loss trigger price
    pub stop_loss: Decimal,

    /// Resting stop-loss order on the exchange
    pub stop_order_id: Option<String>,

    /// Entry order on the exchange
    pub entry_order_id: Option<String>,

    /// Take-profit targets, nearest first
    pub take_profits: Vec<TakeProfitLevel>,

    /// Trailing stop, if activated
    pub trailing: Option<TrailingState>,

    /// Lifecycle status
    pub status: PositionStatus,

    /// Realized profit/loss from closed portions
    pub realized_pnl: Decimal,

    /// Set when automated recovery failed and an operator must reconcile
    pub reconciliation_required: bool,

    /// When the position was opened
    pub opened_at: DateTime<Utc>,

    /// Last update time
    pub updated_at: DateTime<Utc>,
}

impl Position {
    /// Create a position in the OPENING state
    pub fn opening(
        symbol: impl Into<String>,
        side: Direction,
        entry_price: Decimal,
        quantity: Decimal,
        leverage: Decimal,
        stop_loss: Decimal,
        take_profits: Vec<TakeProfitLevel>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            trade_id: Uuid::new_v4(),
            symbol: symbol.into(),
            side,
            entry_price,
            quantity,
            initial_quantity: quantity,
            leverage,
            stop_loss,
            stop_order_id: None,
            entry_order_id: None,
            take_profits,
            trailing: None,
            status: PositionStatus::Opening,
            realized_pnl: Decimal::ZERO,
            reconciliation_required: false,
            opened_at: now,
            updated_at: now,
        }
    }

    /// Move to `next`, enforcing the lifecycle state machine
    pub fn transition(&mut self, next: PositionStatus) -> Result<(), StatusTransitionError> {
        if !self.status.can_transition_to(next) {
            return Err(StatusTransitionError {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// PnL of closing `quantity` at `exit_price`
    pub fn pnl_for(&self, exit_price: Decimal, quantity: Decimal) -> Decimal {
        (exit_price - self.entry_price) * quantity * self.side.sign()
    }

    /// Unrealized PnL of the remaining quantity at `mark_price`
    pub fn unrealized_pnl(&self, mark_price: Decimal) -> Decimal {
        self.pnl_for(mark_price, self.quantity)
    }

    /// Unfavourable price move from entry as a fraction of entry (0 when in profit)
    pub fn adverse_move_pct(&self, mark_price: Decimal) -> Decimal {
        if self.entry_price.is_zero() {
            return Decimal::ZERO;
        }
        let favourable = (mark_price - self.entry_price) * self.side.sign() / self.entry_price;
        if favourable < Decimal::ZERO {
            -favourable
        } else {
            Decimal::ZERO
        }
    }

    /// Notional value at entry of the remaining quantity
    pub fn notional(&self) -> Decimal {
        self.quantity * self.entry_price
    }

    /// Take-profit levels not yet filled
    pub fn pending_take_profits(&self) -> impl Iterator<Item = &TakeProfitLevel> {
        self.take_profits.iter().filter(|tp| !tp.hit)
    }

    pub fn is_open(&self) -> bool {
        self.status == PositionStatus::Open
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn long_position() -> Position {
        Position::opening(
            "BTCUSDT",
            Direction::Long,
            dec!(100),
            dec!(2),
            dec!(10),
            dec!(98),
            vec![TakeProfitLevel::new(dec!(103), dec!(1))],
        )
    }

    #[test]
    fn test_lifecycle_transitions() {
        let mut pos = long_position();
        assert_eq!(pos.status, PositionStatus::Opening);

        pos.transition(PositionStatus::Open).unwrap();
        pos.transition(PositionStatus::Closing).unwrap();
        pos.transition(PositionStatus::Closed).unwrap();
        assert!(!pos.status.is_active());
    }

    #[test]
    fn test_illegal_transition_rejected() {
        let mut pos = long_position();
        pos.transition(PositionStatus::Open).unwrap();

        let err = pos.transition(PositionStatus::Closed).unwrap_err();
        assert_eq!(err.from, PositionStatus::Open);
        assert_eq!(err.to, PositionStatus::Closed);
        assert_eq!(pos.status, PositionStatus::Open);

        // No way back out of CLOSING except CLOSED
        pos.transition(PositionStatus::Closing).unwrap();
        assert!(pos.transition(PositionStatus::Open).is_err());
    }

    #[test]
    fn test_pnl_long_and_short() {
        let long = long_position();
        assert_eq!(long.unrealized_pnl(dec!(105)), dec!(10));
        assert_eq!(long.pnl_for(dec!(95), dec!(1)), dec!(-5));

        let mut short = long_position();
        short.side = Direction::Short;
        assert_eq!(short.unrealized_pnl(dec!(105)), dec!(-10));
        assert_eq!(short.unrealized_pnl(dec!(90)), dec!(20));
    }

    #[test]
    fn test_adverse_move() {
        let long = long_position();
        assert_eq!(long.adverse_move_pct(dec!(95)), dec!(0.05));
        assert_eq!(long.adverse_move_pct(dec!(110)), Decimal::ZERO);

        let mut short = long_position();
        short.side = Direction::Short;
        assert_eq!(short.adverse_move_pct(dec!(102)), dec!(0.02));
    }
}

//! Actions - requested mutations to position state
//!
//! Every change to a position goes through an [`Action`]. Actions are created
//! by the decision pipeline or the risk monitor, queued, and consumed exactly
//! once by the dispatcher, which answers each with one [`ActionResult`].

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

use super::side::Direction;

/// Unique identifier for an action
pub type ActionId = Uuid;

/// Action type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionType {
    OpenPosition,
    UpdateStopLoss,
    ActivateTrailing,
    ClosePercent,
}

impl ActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::OpenPosition => "OPEN_POSITION",
            ActionType::UpdateStopLoss => "UPDATE_STOP_LOSS",
            ActionType::ActivateTrailing => "ACTIVATE_TRAILING",
            ActionType::ClosePercent => "CLOSE_PERCENT",
        }
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a position (or part of it) is being closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// Opposing decision from the signal pipeline
    Signal,
    /// Stop-loss triggered on the exchange
    StopLoss,
    /// Take-profit filled on the exchange
    TakeProfit,
    /// Health score fell below the emergency threshold
    Emergency,
    /// Operator request
    Manual,
    /// Exchange reports the position gone without a known trigger
    External,
}

/// Entry decision carried by OPEN_POSITION
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenPositionPayload {
    pub direction: Direction,
    /// Price the decision was made at (candle close)
    pub reference_price: Decimal,
    /// Penalty-adjusted confidence (0-1)
    pub confidence: Decimal,
    /// Winning side's weighted score
    pub total_score: Decimal,
    /// Signals that voted for the winning side
    pub signal_count: usize,
}

/// Payload specific to each action type
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionKind {
    OpenPosition(OpenPositionPayload),
    UpdateStopLoss {
        stop_loss: Decimal,
        reason: String,
    },
    ActivateTrailing {
        activation_price: Decimal,
        /// Fraction of price (0.01 = 1%)
        callback_rate: Decimal,
    },
    ClosePercent {
        /// Share of the remaining quantity to close, in (0, 100]
        percent: Decimal,
        reason: CloseReason,
    },
}

/// A single requested mutation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    pub id: ActionId,
    pub symbol: String,
    pub kind: ActionKind,
    pub timestamp: DateTime<Utc>,
}

/// Malformed action payload
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ActionValidationError {
    #[error("Symbol must not be empty")]
    EmptySymbol,

    #[error("Reference price must be positive, got {0}")]
    NonPositivePrice(Decimal),

    #[error("Confidence must be within [0, 1], got {0}")]
    ConfidenceOutOfRange(Decimal),

    #[error("Stop loss must be positive, got {0}")]
    NonPositiveStopLoss(Decimal),

    #[error("Callback rate must be within (0, 1), got {0}")]
    CallbackRateOutOfRange(Decimal),

    #[error("Close percent must be within (0, 100], got {0}")]
    PercentOutOfRange(Decimal),
}

impl Action {
    fn new(symbol: impl Into<String>, kind: ActionKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            symbol: symbol.into(),
            kind,
            timestamp: Utc::now(),
        }
    }

    pub fn open_position(symbol: impl Into<String>, payload: OpenPositionPayload) -> Self {
        Self::new(symbol, ActionKind::OpenPosition(payload))
    }

    pub fn update_stop_loss(
        symbol: impl Into<String>,
        stop_loss: Decimal,
        reason: impl Into<String>,
    ) -> Self {
        Self::new(
            symbol,
            ActionKind::UpdateStopLoss {
                stop_loss,
                reason: reason.into(),
            },
        )
    }

    pub fn activate_trailing(
        symbol: impl Into<String>,
        activation_price: Decimal,
        callback_rate: Decimal,
    ) -> Self {
        Self::new(
            symbol,
            ActionKind::ActivateTrailing {
                activation_price,
                callback_rate,
            },
        )
    }

    pub fn close_percent(symbol: impl Into<String>, percent: Decimal, reason: CloseReason) -> Self {
        Self::new(symbol, ActionKind::ClosePercent { percent, reason })
    }

    /// CLOSE_PERCENT(100)
    pub fn close_all(symbol: impl Into<String>, reason: CloseReason) -> Self {
        Self::close_percent(symbol, dec!(100), reason)
    }

    pub fn action_type(&self) -> ActionType {
        match self.kind {
            ActionKind::OpenPosition(_) => ActionType::OpenPosition,
            ActionKind::UpdateStopLoss { .. } => ActionType::UpdateStopLoss,
            ActionKind::ActivateTrailing { .. } => ActionType::ActivateTrailing,
            ActionKind::ClosePercent { .. } => ActionType::ClosePercent,
        }
    }

    /// Reject malformed payloads before any state is touched
    pub fn validate(&self) -> Result<(), ActionValidationError> {
        if self.symbol.trim().is_empty() {
            return Err(ActionValidationError::EmptySymbol);
        }

        match &self.kind {
            ActionKind::OpenPosition(payload) => {
                if payload.reference_price <= Decimal::ZERO {
                    return Err(ActionValidationError::NonPositivePrice(
                        payload.reference_price,
                    ));
                }
                if payload.confidence < Decimal::ZERO || payload.confidence > Decimal::ONE {
                    return Err(ActionValidationError::ConfidenceOutOfRange(
                        payload.confidence,
                    ));
                }
            }
            ActionKind::UpdateStopLoss { stop_loss, .. } => {
                if *stop_loss <= Decimal::ZERO {
                    return Err(ActionValidationError::NonPositiveStopLoss(*stop_loss));
                }
            }
            ActionKind::ActivateTrailing {
                activation_price,
                callback_rate,
            } => {
                if *activation_price <= Decimal::ZERO {
                    return Err(ActionValidationError::NonPositivePrice(*activation_price));
                }
                if *callback_rate <= Decimal::ZERO || *callback_rate >= Decimal::ONE {
                    return Err(ActionValidationError::CallbackRateOutOfRange(
                        *callback_rate,
                    ));
                }
            }
            ActionKind::ClosePercent { percent, .. } => {
                if *percent <= Decimal::ZERO || *percent > dec!(100) {
                    return Err(ActionValidationError::PercentOutOfRange(*percent));
                }
            }
        }

        Ok(())
    }
}

/// Failure category reported in an [`ActionResult`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionErrorKind {
    /// Malformed payload or business-rule violation
    Validation,
    /// Symbol lock held by another operation - retry next cycle
    LockContention,
    /// Exchange rejected the request or retries ran out
    Exchange,
    /// Automated recovery failed; operator must reconcile
    ReconciliationRequired,
    /// Per-action deadline exceeded
    Timeout,
    /// Unexpected handler failure
    Internal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionError {
    pub kind: ActionErrorKind,
    pub message: String,
}

impl ActionError {
    pub fn new(kind: ActionErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for ActionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

/// Outcome of one action; never mutated after creation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionResult {
    pub success: bool,
    pub action_id: ActionId,
    pub action_type: ActionType,
    pub symbol: String,
    pub error: Option<ActionError>,
    pub metadata: HashMap<String, String>,
    pub timestamp: DateTime<Utc>,
}

impl ActionResult {
    pub fn ok(action: &Action, metadata: HashMap<String, String>) -> Self {
        Self {
            success: true,
            action_id: action.id,
            action_type: action.action_type(),
            symbol: action.symbol.clone(),
            error: None,
            metadata,
            timestamp: Utc::now(),
        }
    }

    pub fn failed(action: &Action, error: ActionError) -> Self {
        Self {
            success: false,
            action_id: action.id,
            action_type: action.action_type(),
            symbol: action.symbol.clone(),
            error: Some(error),
            metadata: HashMap::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn error_kind(&self) -> Option<ActionErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }

    pub fn requires_reconciliation(&self) -> bool {
        self.error_kind() == Some(ActionErrorKind::ReconciliationRequired)
    }
}

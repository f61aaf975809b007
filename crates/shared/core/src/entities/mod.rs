mod action;
mod health;
mod order;
mod position;
mod side;
mod signal;
mod trade;

pub use action::{
    Action, ActionError, ActionErrorKind, ActionId, ActionKind, ActionResult, ActionType,
    ActionValidationError, CloseReason, OpenPositionPayload,
};
pub use health::{Alert, AlertSeverity, HealthLevel, HealthTransition};
pub use order::{OrderAck, OrderKind, OrderRequest};
pub use position::{
    Position, PositionStatus, StatusTransitionError, TakeProfitLevel, TrailingState,
};
pub use side::{Direction, OrderSide};
pub use signal::{AnalyzerSignal, SignalPriority};
pub use trade::{SessionRecord, TradeRecord, TradeStatus};

//! Kestrel Core Domain
//!
//! Pure domain types for the kestrel decision-and-execution core.
//! This crate contains no async, no I/O, and is 100% unit testable.
//!
//! - **Signals**: analyzer opinions fed into aggregation
//! - **Actions**: requested mutations to position state and their results
//! - **Positions**: the single-position-per-symbol state machine data
//! - **Orders**: exchange-agnostic order requests and acknowledgements
//! - **Events**: candle closes, exchange push events, position lifecycle events

pub mod entities;
pub mod events;

// Re-export commonly used types at crate root
pub use entities::{
    // Actions
    Action,
    ActionError,
    ActionErrorKind,
    ActionId,
    ActionKind,
    ActionResult,
    ActionType,
    ActionValidationError,
    // Monitoring
    Alert,
    AlertSeverity,
    // Signals
    AnalyzerSignal,
    CloseReason,
    Direction,
    HealthLevel,
    HealthTransition,
    OpenPositionPayload,
    // Orders
    OrderAck,
    OrderKind,
    OrderRequest,
    OrderSide,
    // Positions
    Position,
    PositionStatus,
    SessionRecord,
    SignalPriority,
    StatusTransitionError,
    TakeProfitLevel,
    // Persistence records
    TradeRecord,
    TradeStatus,
    TrailingState,
};
pub use events::{
    CandleClose, ExchangeEvent, ExecutionReport, OrderUpdate, OrderUpdateStatus, PositionEvent,
    PositionUpdate,
};

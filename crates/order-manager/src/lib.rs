//! Kestrel Order Manager
//!
//! The Order Manager sits between the analyzers and the exchange, responsible for:
//! - **Signal Aggregation**: Combines weighted analyzer signals into one directional decision
//! - **Entry Decisions**: Turns accepted decisions into queued actions
//! - **Action Dispatch**: Serializes every position mutation through one queue
//! - **Position Lifecycle**: Owns the single position per symbol and its state machine
//! - **Order Execution**: Submits orders with retry, backoff and compensating rollback
//!
//! ## Architecture
//!
//! ```text
//! Analyzers ──► Signals ──► ┌────────────────────────────────────────┐
//!                           │            Order Manager               │
//!                           │  ┌─────────────────────────────────┐   │
//!                           │  │   Signal Aggregator             │   │
//!                           │  │   - Weighted score per side     │   │
//!                           │  │   - Conflict / blind-zone       │   │
//!                           │  └───────────────┬─────────────────┘   │
//!                           │                  │ Entry decision      │
//!  Risk Monitor ──────────► │  ┌───────────────▼─────────────────┐   │
//!  (emergency close)        │  │   Action Queue ► Dispatcher     │   │
//!                           │  │   - FIFO, single consumer       │   │
//!                           │  │   - Per-action deadline         │   │
//!                           │  └───────────────┬─────────────────┘   │
//!                           │                  │ Actions             │
//!                           │  ┌───────────────▼─────────────────┐   │
//!                           │  │   Position Lifecycle            │   │
//!                           │  │   - Per-symbol try-lock         │   │
//!                           │  │   - NONE→OPENING→OPEN→CLOSING   │   │
//!                           │  └───────────────┬─────────────────┘   │
//!                           │                  │ Order steps         │
//!                           │  ┌───────────────▼─────────────────┐   │
//!                           │  │   Execution Pipeline            │   │
//!                           │  │   - Retry, linear backoff       │   │
//!                           │  │   - Compensating rollback       │   │
//!                           │  └───────────────┬─────────────────┘   │
//!                           └──────────────────┼─────────────────────┘
//!                                              │
//! Exchange ◄─────────────────  Order Requests ◄┘
//!
//! Exchange push events ─────► Position Lifecycle ─────► PositionEvents ──► Risk Monitor
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use kestrel_order_manager::{ActionQueue, ActionDispatcher, PositionLifecycle};
//!
//! let (queue, receiver) = ActionQueue::new(256);
//! let dispatcher = ActionDispatcher::new(receiver, lifecycle.clone(), monitor, timeout);
//! tokio::spawn(dispatcher.run());
//!
//! queue.enqueue(Action::close_all("BTCUSDT", CloseReason::Manual)).await?;
//! ```

pub mod aggregator;
pub mod decision;
pub mod dispatcher;
pub mod error;
pub mod execution;
pub mod lock;
pub mod position;
pub mod risk;

// Re-export main types
pub use aggregator::{
    AggregationConfig, AggregationResult, BlindZoneConfig, ConflictAnalysis, SignalAggregator,
    WeightedScore, aggregate,
};
pub use decision::{EntryDecision, EntryEvaluator};
pub use dispatcher::{ActionDispatcher, ActionQueue, ActionReceiver};
pub use error::{Error, ExecutionError, Result};
pub use execution::{OrderExecutionPipeline, PlacedOrder, RetryPolicy};
pub use lock::{LockToken, SymbolLockGuard, SymbolLocks};
pub use position::{CloseOutcome, PositionLifecycle};
pub use risk::{EntryPlan, RiskConfig, TakeProfitConfig, plan_entry, take_profit_ladder};

//! Kestrel Gateway
//!
//! In-process adapters for the collaborator ports:
//! - `PaperExchange`: fills market orders at the mark price, rests stops,
//!   take-profits and trailing stops, and broadcasts push events. Faults can be
//!   scripted to exercise retry and rollback paths.
//! - `InMemoryRepository`: trade, session and key-value storage
//! - `LogMonitor` / `CollectingMonitor`: monitoring sinks
//!
//! ## Architecture
//!
//! ```text
//!  Order Manager ──► ExchangePort ──► PaperExchange ──► ExchangeEvent stream
//!                                                            │
//!  Runner ◄──────────────────────────────────────────────────┘
//!
//!  Order Manager / Runner ──► Repository ──► InMemoryRepository
//!  Dispatcher / Lifecycle / Risk ──► MonitoringSink ──► LogMonitor | CollectingMonitor
//! ```

pub mod adapters;

// Re-export commonly used types
pub use adapters::{
    memory::InMemoryRepository,
    monitor::{CollectingMonitor, LogMonitor},
    paper::{FaultTarget, PaperExchange},
};

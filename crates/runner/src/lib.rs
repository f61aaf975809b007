//! Kestrel Runner - Engine Orchestration
//!
//! Assembles the decision-and-execution core into a running engine:
//!
//! - **Config**: One JSON config resolved and validated at startup
//! - **Engine**: Candle-close producer, exchange push listener, dispatcher and risk monitor
//! - **Shutdown**: Ctrl-C handling, queue drain, final snapshot, lock release
//!
//! ## Architecture
//!
//! ```text
//!                         ┌─────────────────┐
//!                         │  Candle closes  │
//!                         │  + signals      │
//!                         └────────┬────────┘
//!                                  │
//!                                  ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        TRADING ENGINE                           │
//! │                                                                 │
//! │  ┌──────────────────┐              ┌──────────────────┐        │
//! │  │  Entry           │              │  Risk            │        │
//! │  │  Evaluator       │              │  Monitor         │        │
//! │  └────────┬─────────┘              └────────┬─────────┘        │
//! │           │ actions                         │ actions          │
//! │           └──────────────┬──────────────────┘                  │
//! │                          ▼                                      │
//! │              ┌───────────────────────┐                         │
//! │              │  Queue ► Dispatcher   │                         │
//! │              └───────────┬───────────┘                         │
//! │                          ▼                                      │
//! │              ┌───────────────────────┐     push events         │
//! │              │  Position Lifecycle   │◄──────────────┐         │
//! │              └───────────┬───────────┘               │         │
//! └──────────────────────────┼───────────────────────────┼─────────┘
//!                            │ orders                    │
//!                            ▼                           │
//!               ┌───────────────────────┐                │
//!               │       Exchange        │────────────────┘
//!               └───────────────────────┘
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod shutdown;

// Re-export main types
pub use config::{EngineConfig, load_config, load_config_from_str};
pub use engine::TradingEngine;
pub use error::{ConfigError, EngineError, Result, ShutdownError};
pub use shutdown::{GracefulShutdownManager, ShutdownReport, ShutdownSignal};

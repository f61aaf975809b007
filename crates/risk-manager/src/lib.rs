//! Kestrel Risk Manager
//!
//! Live risk supervision of open positions. Entry sizing and stop placement
//! happen in the order manager before a position exists; this crate watches
//! positions once they are open:
//!
//! - **Health Scoring**: Drawdown, holding time and volatility folded into a 0-100 score
//! - **Health Levels**: Healthy / Warning / Critical transitions reported to monitoring
//! - **Emergency Close**: A Critical position is closed through the action queue
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  Real-Time Risk Monitor                      │
//! │                                                             │
//! │  PositionEvents ───► Tracked positions ───► Cache reset     │
//! │                                                             │
//! │  Candle closes ───► Health score (every N) ───► Level       │
//! │                                                             │
//! │  Critical + enabled ───► CLOSE_PERCENT(100) (once)          │
//! │                                                             │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//!                         ActionQueue
//!                              │
//!                              ▼
//!                       Order Manager
//! ```
//!
//! ## Separation from Entry Risk
//!
//! | Entry risk (order manager) | Live risk (this crate) |
//! |----------------------------|------------------------|
//! | Position sizing | Health scoring |
//! | Stop / take-profit levels | Emergency close |
//! | Before the position exists | While the position is open |
//! | Passive (plans orders) | Active (queues actions) |

pub mod error;
pub mod health;
pub mod monitor;

// Re-export main types
pub use error::{Result, RiskError};
pub use health::{HealthConfig, HealthScore};
pub use monitor::RealTimeRiskMonitor;

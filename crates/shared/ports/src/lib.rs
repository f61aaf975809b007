//! Kestrel Ports
//!
//! Port definitions (traits) for the collaborators the core depends on.
//! These define the boundaries between decision/consistency logic and
//! infrastructure: the core only ever talks to an exchange, a repository and
//! a monitoring sink through these contracts.

mod error;
mod exchange;
mod monitoring;
mod repository;

pub use error::{ExchangeError, ExchangeResult, RepositoryError, RepositoryResult};
pub use exchange::{ExchangePort, ExchangePosition};
pub use monitoring::{MonitoringSink, NullMonitor};
pub use repository::{Repository, keys};

//! Port adapters

pub mod memory;
pub mod monitor;
pub mod paper;

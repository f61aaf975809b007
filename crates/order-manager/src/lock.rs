//! Per-symbol exclusive locks
//!
//! Every position transition runs under its symbol's lock. Acquisition never
//! waits: a held lock fails immediately with `LockContention` and the caller
//! re-evaluates on its next tick.
//!
//! Each acquisition gets a fresh owner token. Releasing is tied to the token,
//! so a guard outliving a forced `release_all` (shutdown) cannot free a lock
//! someone else acquired afterwards.

use crate::error::{Error, Result};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use log::debug;
use std::sync::Arc;
use uuid::Uuid;

/// Identifies one acquisition of a symbol lock
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LockToken(Uuid);

/// Table of held symbol locks
///
/// Clones share the same table.
#[derive(Debug, Clone, Default)]
pub struct SymbolLocks {
    held: Arc<DashMap<String, LockToken>>,
}

impl SymbolLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to take the lock for `symbol` without waiting
    pub fn try_acquire(&self, symbol: &str) -> Result<SymbolLockGuard> {
        match self.held.entry(symbol.to_string()) {
            Entry::Occupied(_) => Err(Error::LockContention(symbol.to_string())),
            Entry::Vacant(slot) => {
                let token = LockToken(Uuid::new_v4());
                slot.insert(token);
                Ok(SymbolLockGuard {
                    held: Arc::clone(&self.held),
                    symbol: symbol.to_string(),
                    token,
                })
            }
        }
    }

    pub fn is_locked(&self, symbol: &str) -> bool {
        self.held.contains_key(symbol)
    }

    pub fn held_count(&self) -> usize {
        self.held.len()
    }

    /// Forcibly drop every lock; returns how many were held
    pub fn release_all(&self) -> usize {
        let count = self.held.len();
        self.held.clear();
        count
    }
}

/// Holds a symbol lock until dropped
#[derive(Debug)]
pub struct SymbolLockGuard {
    held: Arc<DashMap<String, LockToken>>,
    symbol: String,
    token: LockToken,
}

impl SymbolLockGuard {
    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn token(&self) -> LockToken {
        self.token
    }
}

impl Drop for SymbolLockGuard {
    fn drop(&mut self) {
        let token = self.token;
        if self
            .held
            .remove_if(&self.symbol, |_, held| *held == token)
            .is_none()
        {
            debug!("[LIFECYCLE] lock for {} already released", self.symbol);
        }
    }
}

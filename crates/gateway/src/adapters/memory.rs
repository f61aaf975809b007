use async_trait::async_trait;
use dashmap::DashMap;
use kestrel_core::{SessionRecord, TradeRecord};
use kestrel_ports::{Repository, RepositoryError, RepositoryResult};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use uuid::Uuid;

/// In-memory repository
///
/// Thread-safe storage for trades, sessions and key-value blobs using DashMap.
/// Suitable for paper trading and testing. Clones share the same storage.
pub struct InMemoryRepository {
    trades: Arc<DashMap<Uuid, TradeRecord>>,
    sessions: Arc<DashMap<Uuid, SessionRecord>>,
    values: Arc<DashMap<String, serde_json::Value>>,
    /// When set, every write fails with a storage error
    fail_writes: Arc<AtomicBool>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self {
            trades: Arc::new(DashMap::new()),
            sessions: Arc::new(DashMap::new()),
            values: Arc::new(DashMap::new()),
            fail_writes: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Make subsequent writes fail (reads keep working)
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn trade_count(&self) -> usize {
        self.trades.len()
    }

    /// All stored trades, oldest first
    pub fn trades(&self) -> Vec<TradeRecord> {
        let mut trades: Vec<TradeRecord> = self.trades.iter().map(|t| t.value().clone()).collect();
        trades.sort_by_key(|t| t.opened_at);
        trades
    }

    pub fn sessions(&self) -> Vec<SessionRecord> {
        self.sessions.iter().map(|s| s.value().clone()).collect()
    }

    fn check_writable(&self) -> RepositoryResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(RepositoryError::Storage("writes disabled".to_string()));
        }
        Ok(())
    }
}

impl Default for InMemoryRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for InMemoryRepository {
    fn clone(&self) -> Self {
        Self {
            trades: Arc::clone(&self.trades),
            sessions: Arc::clone(&self.sessions),
            values: Arc::clone(&self.values),
            fail_writes: Arc::clone(&self.fail_writes),
        }
    }
}

#[async_trait]
impl Repository for InMemoryRepository {
    async fn save_trade(&self, trade: &TradeRecord) -> RepositoryResult<()> {
        self.check_writable()?;
        self.trades.insert(trade.id, trade.clone());
        Ok(())
    }

    async fn get_trade(&self, id: Uuid) -> RepositoryResult<TradeRecord> {
        self.trades
            .get(&id)
            .map(|t| t.value().clone())
            .ok_or_else(|| RepositoryError::NotFound(format!("trade {}", id)))
    }

    async fn update_trade(&self, trade: &TradeRecord) -> RepositoryResult<()> {
        self.check_writable()?;
        match self.trades.get_mut(&trade.id) {
            Some(mut existing) => {
                *existing = trade.clone();
                Ok(())
            }
            None => Err(RepositoryError::NotFound(format!("trade {}", trade.id))),
        }
    }

    async fn delete_trade(&self, id: Uuid) -> RepositoryResult<()> {
        self.check_writable()?;
        self.trades
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| RepositoryError::NotFound(format!("trade {}", id)))
    }

    async fn save_session(&self, session: &SessionRecord) -> RepositoryResult<()> {
        self.check_writable()?;
        self.sessions.insert(session.id, session.clone());
        Ok(())
    }

    async fn get_session(&self, id: Uuid) -> RepositoryResult<SessionRecord> {
        self.sessions
            .get(&id)
            .map(|s| s.value().clone())
            .ok_or_else(|| RepositoryError::NotFound(format!("session {}", id)))
    }

    async fn update_session(&self, session: &SessionRecord) -> RepositoryResult<()> {
        self.check_writable()?;
        // Upsert: a session may be updated before its first explicit save
        self.sessions.insert(session.id, session.clone());
        Ok(())
    }

    async fn put_value(&self, key: &str, value: serde_json::Value) -> RepositoryResult<()> {
        self.check_writable()?;
        self.values.insert(key.to_string(), value);
        Ok(())
    }

    async fn get_value(&self, key: &str) -> RepositoryResult<Option<serde_json::Value>> {
        Ok(self.values.get(key).map(|v| v.value().clone()))
    }

    async fn delete_value(&self, key: &str) -> RepositoryResult<()> {
        self.check_writable()?;
        self.values.remove(key);
        Ok(())
    }
}

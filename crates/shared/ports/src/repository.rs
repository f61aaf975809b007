use async_trait::async_trait;
use kestrel_core::{SessionRecord, TradeRecord};
use uuid::Uuid;

use crate::error::RepositoryResult;

/// Well-known key-value keys
pub mod keys {
    /// Final position snapshot written at shutdown
    pub const POSITIONS_SNAPSHOT: &str = "positions.snapshot";
}

/// Port for trade, session and generic key-value persistence
///
/// The core calls this only at well-defined transition points: open success,
/// partial/full close success and the shutdown snapshot.
#[async_trait]
pub trait Repository: Send + Sync {
    async fn save_trade(&self, trade: &TradeRecord) -> RepositoryResult<()>;

    async fn get_trade(&self, id: Uuid) -> RepositoryResult<TradeRecord>;

    async fn update_trade(&self, trade: &TradeRecord) -> RepositoryResult<()>;

    async fn delete_trade(&self, id: Uuid) -> RepositoryResult<()>;

    async fn save_session(&self, session: &SessionRecord) -> RepositoryResult<()>;

    async fn get_session(&self, id: Uuid) -> RepositoryResult<SessionRecord>;

    async fn update_session(&self, session: &SessionRecord) -> RepositoryResult<()>;

    async fn put_value(&self, key: &str, value: serde_json::Value) -> RepositoryResult<()>;

    async fn get_value(&self, key: &str) -> RepositoryResult<Option<serde_json::Value>>;

    async fn delete_value(&self, key: &str) -> RepositoryResult<()>;
}

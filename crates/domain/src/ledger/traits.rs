use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::model::NotificationEvent;

/// Common result alias for ledger state storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(String),
}

impl StorageError {
    pub fn from_source(err: impl std::fmt::Display) -> Self {
        Self::Database(err.to_string())
    }
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("rpc error: {0}")]
    Rpc(String),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("a notify handler is already registered")]
    HandlerAlreadyRegistered,
}

/// Summary of one persistence step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PersistOutcome {
    pub blocks: u64,
    pub notifications: u64,
}

/// Callback invoked by the ledger once the block carrying a notification has
/// been accepted. Implementations must return quickly: the ledger calls it
/// from its own persistence path.
pub trait NotifyHandler: Send + Sync {
    fn on_notify(&self, event: NotificationEvent);
}

#[async_trait]
pub trait Ledger: Send + Sync {
    /// Persists the next pending block(s) and fires the registered handler
    /// for every monitored notification they carry.
    async fn persist_blocks(&self) -> Result<PersistOutcome, LedgerError>;

    /// Last block persisted locally.
    fn height(&self) -> Option<u64>;

    /// Last block the node has announced.
    fn header_height(&self) -> Option<u64>;

    /// Installs the notification callback. Succeeds exactly once.
    fn register_notify_handler(&self, handler: Arc<dyn NotifyHandler>) -> Result<(), LedgerError>;
}

#[async_trait]
pub trait LedgerStateStore: Send + Sync {
    async fn last_persisted_height(&self) -> StorageResult<Option<u64>>;
    async fn upsert_last_persisted_height(&self, height: u64) -> StorageResult<()>;
}

//! SeaORM-backed ledger state store that satisfies the domain
//! `LedgerStateStore` trait while keeping the database backend swappable
//! (SQLite by default, PostgreSQL via feature flag).

mod entity;
mod errors;
mod ledger_state_store;
mod migration;

use std::sync::Arc;

use errors::StorageError;
use migration::run_migrations;
use notify_relay_domain::ledger::StorageResult;
use sea_orm::{Database, DatabaseConnection};

/// Shared storage handle used by the ledger adapter.
#[derive(Clone)]
pub struct SeaOrmStorage {
    db: Arc<DatabaseConnection>,
}

impl SeaOrmStorage {
    /// Connects to the provided database URL and ensures the schema is present.
    pub async fn connect(database_url: &str) -> StorageResult<Self> {
        let db = Database::connect(database_url)
            .await
            .map_err(StorageError::from_source)?;
        prepare_connection(&db).await?;
        Ok(Self { db: Arc::new(db) })
    }

    pub fn connection(&self) -> &DatabaseConnection {
        self.db.as_ref()
    }
}

pub(crate) async fn prepare_connection(db: &DatabaseConnection) -> StorageResult<()> {
    run_migrations(db).await
}

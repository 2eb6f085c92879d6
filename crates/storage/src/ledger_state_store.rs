use chrono::Utc;
use notify_relay_domain::ledger::{LedgerStateStore, StorageResult};
use sea_orm::{sea_query::OnConflict, EntityTrait, Set};

use crate::entity::ledger_state;
use crate::errors::StorageError;
use crate::SeaOrmStorage;

const LAST_HEIGHT_KEY: &str = "last_persisted_height";

#[async_trait::async_trait]
impl LedgerStateStore for SeaOrmStorage {
    async fn last_persisted_height(&self) -> StorageResult<Option<u64>> {
        let maybe = ledger_state::Entity::find_by_id(LAST_HEIGHT_KEY.to_string())
            .one(self.connection())
            .await
            .map_err(StorageError::from_source)?;
        maybe
            .map(|model| u64::try_from(model.value_int).map_err(StorageError::from_source))
            .transpose()
    }

    async fn upsert_last_persisted_height(&self, height: u64) -> StorageResult<()> {
        let value_int = i64::try_from(height).map_err(StorageError::from_source)?;
        let active = ledger_state::ActiveModel {
            key: Set(LAST_HEIGHT_KEY.to_string()),
            value_int: Set(value_int),
            updated_at: Set(Utc::now()),
        };
        ledger_state::Entity::insert(active)
            .on_conflict(
                OnConflict::column(ledger_state::Column::Key)
                    .update_columns([
                        ledger_state::Column::ValueInt,
                        ledger_state::Column::UpdatedAt,
                    ])
                    .to_owned(),
            )
            .exec(self.connection())
            .await
            .map_err(StorageError::from_source)?;
        Ok(())
    }
}

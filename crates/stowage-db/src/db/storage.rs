use chrono::{DateTime, Utc};
use sqlx::{Sqlite, SqliteConnection, SqlitePool};
use stowage_core::models::{EncryptionMode, StorageConfig};
use stowage_core::{AppError, StorageId};

#[derive(sqlx::FromRow)]
struct StorageRow {
    id: StorageId,
    name: String,
    provider: String,
    encryption_mode: EncryptionMode,
    created_at: DateTime<Utc>,
}

impl TryFrom<StorageRow> for StorageConfig {
    type Error = AppError;

    fn try_from(row: StorageRow) -> Result<Self, Self::Error> {
        let provider = serde_json::from_str(&row.provider).map_err(|e| {
            AppError::Internal(format!("storage {} has an unreadable provider: {}", row.id, e))
        })?;
        Ok(StorageConfig {
            id: row.id,
            name: row.name,
            provider,
            encryption_mode: row.encryption_mode,
            created_at: row.created_at,
        })
    }
}

/// Persisted storage backend configurations.
#[derive(Clone)]
pub struct StorageRepository {
    pool: SqlitePool,
}

impl StorageRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    #[tracing::instrument(skip(self), fields(db.table = "storages", db.operation = "select"))]
    pub async fn list(&self) -> Result<Vec<StorageConfig>, AppError> {
        let rows = sqlx::query_as::<Sqlite, StorageRow>(
            "SELECT id, name, provider, encryption_mode, created_at FROM storages ORDER BY created_at, id",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(StorageConfig::try_from).collect()
    }

    #[tracing::instrument(skip(self), fields(db.table = "storages", db.operation = "select", db.record_id = %id))]
    pub async fn get(&self, id: &StorageId) -> Result<Option<StorageConfig>, AppError> {
        let row = sqlx::query_as::<Sqlite, StorageRow>(
            "SELECT id, name, provider, encryption_mode, created_at FROM storages WHERE id = ?1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(StorageConfig::try_from).transpose()
    }

    pub async fn insert(
        conn: &mut SqliteConnection,
        storage: &StorageConfig,
    ) -> Result<(), AppError> {
        let provider = serde_json::to_string(&storage.provider)
            .map_err(|e| AppError::Internal(format!("failed to serialize provider: {}", e)))?;

        sqlx::query(
            "INSERT INTO storages (id, name, provider, encryption_mode, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(&storage.id)
        .bind(&storage.name)
        .bind(provider)
        .bind(storage.encryption_mode)
        .bind(storage.created_at)
        .execute(&mut *conn)
        .await?;

        tracing::info!(storage_id = %storage.id, kind = storage.provider.kind(), "Storage configuration saved");
        Ok(())
    }

    pub async fn delete(conn: &mut SqliteConnection, id: &StorageId) -> Result<bool, AppError> {
        let result = sqlx::query("DELETE FROM storages WHERE id = ?1")
            .bind(id)
            .execute(&mut *conn)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

use sqlx::{QueryBuilder, Sqlite, SqliteConnection, SqlitePool};
use stowage_core::models::FileRecord;
use stowage_core::{AppError, FileId, FolderId, WorkspaceId};

const FILE_COLUMNS: &str = r#"
    id, workspace_id, folder_id, name, extension, content_type, size_bytes, storage_id,
    bucket_name, storage_key, encryption_mode, owner_user_id, owner_integration_id, created_at
"#;

/// Keeps IN lists well below SQLite's bound-parameter limit.
const IN_LIST_CHUNK: usize = 500;

/// Repository for completed files
#[derive(Clone)]
pub struct FileRepository {
    pool: SqlitePool,
}

impl FileRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    #[tracing::instrument(skip(self), fields(db.table = "files", db.operation = "select", db.record_id = %id))]
    pub async fn get(
        &self,
        workspace_id: &WorkspaceId,
        id: &FileId,
    ) -> Result<Option<FileRecord>, AppError> {
        let file = sqlx::query_as::<Sqlite, FileRecord>(&format!(
            "SELECT {} FROM files WHERE workspace_id = ?1 AND id = ?2",
            FILE_COLUMNS
        ))
        .bind(workspace_id)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(file)
    }

    /// Files directly inside any of `folder_ids`.
    #[tracing::instrument(skip(self, folder_ids), fields(db.table = "files", db.operation = "select", folders = folder_ids.len()))]
    pub async fn list_in_folders(
        &self,
        workspace_id: &WorkspaceId,
        folder_ids: &[FolderId],
    ) -> Result<Vec<FileRecord>, AppError> {
        let mut files = Vec::new();
        for chunk in folder_ids.chunks(IN_LIST_CHUNK) {
            let mut query = QueryBuilder::<Sqlite>::new(format!(
                "SELECT {} FROM files WHERE workspace_id = ",
                FILE_COLUMNS
            ));
            query.push_bind(workspace_id).push(" AND folder_id IN (");
            let mut separated = query.separated(", ");
            for id in chunk {
                separated.push_bind(id);
            }
            separated.push_unseparated(")");

            files.extend(
                query
                    .build_query_as::<FileRecord>()
                    .fetch_all(&self.pool)
                    .await?,
            );
        }
        Ok(files)
    }

    /// Files of the workspace among `ids`. Unknown ids are skipped.
    #[tracing::instrument(skip(self, ids), fields(db.table = "files", db.operation = "select", count = ids.len()))]
    pub async fn list_by_ids(
        &self,
        workspace_id: &WorkspaceId,
        ids: &[FileId],
    ) -> Result<Vec<FileRecord>, AppError> {
        let mut files = Vec::new();
        for chunk in ids.chunks(IN_LIST_CHUNK) {
            let mut query = QueryBuilder::<Sqlite>::new(format!(
                "SELECT {} FROM files WHERE workspace_id = ",
                FILE_COLUMNS
            ));
            query.push_bind(workspace_id).push(" AND id IN (");
            let mut separated = query.separated(", ");
            for id in chunk {
                separated.push_bind(id);
            }
            separated.push_unseparated(")");

            files.extend(
                query
                    .build_query_as::<FileRecord>()
                    .fetch_all(&self.pool)
                    .await?,
            );
        }
        Ok(files)
    }

    pub async fn insert(conn: &mut SqliteConnection, file: &FileRecord) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO files (
                id, workspace_id, folder_id, name, extension, content_type, size_bytes, storage_id,
                bucket_name, storage_key, encryption_mode, owner_user_id, owner_integration_id, created_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
            "#,
        )
        .bind(&file.id)
        .bind(&file.workspace_id)
        .bind(&file.folder_id)
        .bind(&file.name)
        .bind(&file.extension)
        .bind(&file.content_type)
        .bind(file.size_bytes)
        .bind(&file.storage_id)
        .bind(&file.bucket_name)
        .bind(&file.storage_key)
        .bind(file.encryption_mode)
        .bind(&file.owner_user_id)
        .bind(&file.owner_integration_id)
        .bind(file.created_at)
        .execute(&mut *conn)
        .await?;

        tracing::debug!(file_id = %file.id, workspace_id = %file.workspace_id, "File record created");
        Ok(())
    }

    pub async fn exists(conn: &mut SqliteConnection, id: &FileId) -> Result<bool, AppError> {
        let exists =
            sqlx::query_scalar::<Sqlite, bool>("SELECT EXISTS(SELECT 1 FROM files WHERE id = ?1)")
                .bind(id)
                .fetch_one(&mut *conn)
                .await?;
        Ok(exists)
    }

    pub async fn delete_many(
        conn: &mut SqliteConnection,
        workspace_id: &WorkspaceId,
        ids: &[FileId],
    ) -> Result<u64, AppError> {
        let mut deleted = 0;
        for chunk in ids.chunks(IN_LIST_CHUNK) {
            let mut query = QueryBuilder::<Sqlite>::new("DELETE FROM files WHERE workspace_id = ");
            query.push_bind(workspace_id).push(" AND id IN (");
            let mut separated = query.separated(", ");
            for id in chunk {
                separated.push_bind(id);
            }
            separated.push_unseparated(")");
            deleted += query.build().execute(&mut *conn).await?.rows_affected();
        }
        Ok(deleted)
    }

    /// Move files into `folder_id` (`None` = workspace root).
    pub async fn move_many(
        conn: &mut SqliteConnection,
        workspace_id: &WorkspaceId,
        ids: &[FileId],
        folder_id: Option<&FolderId>,
    ) -> Result<u64, AppError> {
        let mut moved = 0;
        for chunk in ids.chunks(IN_LIST_CHUNK) {
            let mut query = QueryBuilder::<Sqlite>::new("UPDATE files SET folder_id = ");
            query
                .push_bind(folder_id.cloned())
                .push(" WHERE workspace_id = ")
                .push_bind(workspace_id)
                .push(" AND id IN (");
            let mut separated = query.separated(", ");
            for id in chunk {
                separated.push_bind(id);
            }
            separated.push_unseparated(")");
            moved += query.build().execute(&mut *conn).await?.rows_affected();
        }
        Ok(moved)
    }
}

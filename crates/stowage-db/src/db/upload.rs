use chrono::{DateTime, Utc};
use sqlx::{Sqlite, SqliteConnection, SqlitePool};
use stowage_core::models::{FileUpload, UploadPart, UploadStatus};
use stowage_core::{AppError, FileUploadId, WorkspaceId};

const UPLOAD_COLUMNS: &str = r#"
    id, workspace_id, folder_id, file_id, storage_id, bucket_name, storage_key, name,
    extension, content_type, size_bytes, algorithm, part_size_bytes, expected_parts,
    multipart_upload_id, reported_etag, status, encryption_mode, owner_user_id,
    owner_integration_id, created_at, last_activity_at
"#;

/// Repository for in-progress upload sessions and their acknowledged parts
#[derive(Clone)]
pub struct UploadRepository {
    pool: SqlitePool,
}

impl UploadRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    #[tracing::instrument(skip(self), fields(db.table = "file_uploads", db.operation = "select", db.record_id = %id))]
    pub async fn get(&self, id: &FileUploadId) -> Result<Option<FileUpload>, AppError> {
        let upload = sqlx::query_as::<Sqlite, FileUpload>(&format!(
            "SELECT {} FROM file_uploads WHERE id = ?1",
            UPLOAD_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(upload)
    }

    /// Fetch an upload that must belong to `workspace_id`. Uploads of other workspaces
    /// are reported as not found.
    pub async fn get_in_workspace(
        &self,
        workspace_id: &WorkspaceId,
        id: &FileUploadId,
    ) -> Result<FileUpload, AppError> {
        self.get(id)
            .await?
            .filter(|upload| &upload.workspace_id == workspace_id)
            .ok_or_else(|| AppError::NotFound(format!("upload {}", id)))
    }

    #[tracing::instrument(skip(self), fields(db.table = "file_upload_parts", db.operation = "select"))]
    pub async fn list_parts(&self, id: &FileUploadId) -> Result<Vec<UploadPart>, AppError> {
        let parts = sqlx::query_as::<Sqlite, UploadPart>(
            "SELECT upload_id, part_number, etag, acknowledged_at FROM file_upload_parts WHERE upload_id = ?1 ORDER BY part_number ASC",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        Ok(parts)
    }

    /// Uploads that are still open and have seen no activity since `inactive_since`.
    #[tracing::instrument(skip(self), fields(db.table = "file_uploads", db.operation = "select"))]
    pub async fn list_inactive(
        &self,
        inactive_since: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<FileUpload>, AppError> {
        let uploads = sqlx::query_as::<Sqlite, FileUpload>(&format!(
            "SELECT {} FROM file_uploads WHERE status <> 'abandoned' AND last_activity_at < ?1 ORDER BY last_activity_at ASC LIMIT ?2",
            UPLOAD_COLUMNS
        ))
        .bind(inactive_since)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(uploads)
    }

    // Writes. These run on the writer connection inside its transaction.

    pub async fn insert(conn: &mut SqliteConnection, upload: &FileUpload) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO file_uploads (
                id, workspace_id, folder_id, file_id, storage_id, bucket_name, storage_key, name,
                extension, content_type, size_bytes, algorithm, part_size_bytes, expected_parts,
                multipart_upload_id, reported_etag, status, encryption_mode, owner_user_id,
                owner_integration_id, created_at, last_activity_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22)
            "#,
        )
        .bind(&upload.id)
        .bind(&upload.workspace_id)
        .bind(&upload.folder_id)
        .bind(&upload.file_id)
        .bind(&upload.storage_id)
        .bind(&upload.bucket_name)
        .bind(&upload.storage_key)
        .bind(&upload.name)
        .bind(&upload.extension)
        .bind(&upload.content_type)
        .bind(upload.size_bytes)
        .bind(upload.algorithm)
        .bind(upload.part_size_bytes)
        .bind(upload.expected_parts)
        .bind(&upload.multipart_upload_id)
        .bind(&upload.reported_etag)
        .bind(upload.status)
        .bind(upload.encryption_mode)
        .bind(&upload.owner_user_id)
        .bind(&upload.owner_integration_id)
        .bind(upload.created_at)
        .bind(upload.last_activity_at)
        .execute(&mut *conn)
        .await?;

        tracing::debug!(upload_id = %upload.id, algorithm = %upload.algorithm, "Upload session created");
        Ok(())
    }

    /// Re-read an upload inside the writer transaction.
    pub async fn find(
        conn: &mut SqliteConnection,
        id: &FileUploadId,
    ) -> Result<Option<FileUpload>, AppError> {
        let upload = sqlx::query_as::<Sqlite, FileUpload>(&format!(
            "SELECT {} FROM file_uploads WHERE id = ?1",
            UPLOAD_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;

        Ok(upload)
    }

    /// Ids of the workspace's uploads that are not abandoned yet.
    pub async fn open_in_workspace(
        conn: &mut SqliteConnection,
        workspace_id: &WorkspaceId,
    ) -> Result<Vec<FileUploadId>, AppError> {
        let ids = sqlx::query_scalar::<Sqlite, FileUploadId>(
            "SELECT id FROM file_uploads WHERE workspace_id = ?1 AND status <> 'abandoned'",
        )
        .bind(workspace_id)
        .fetch_all(&mut *conn)
        .await?;

        Ok(ids)
    }

    pub async fn parts(
        conn: &mut SqliteConnection,
        id: &FileUploadId,
    ) -> Result<Vec<UploadPart>, AppError> {
        let parts = sqlx::query_as::<Sqlite, UploadPart>(
            "SELECT upload_id, part_number, etag, acknowledged_at FROM file_upload_parts WHERE upload_id = ?1 ORDER BY part_number ASC",
        )
        .bind(id)
        .fetch_all(&mut *conn)
        .await?;

        Ok(parts)
    }

    /// Record a part's ETag. Acknowledging the same part again replaces the ETag.
    pub async fn upsert_part(
        conn: &mut SqliteConnection,
        id: &FileUploadId,
        part_number: u32,
        etag: &str,
        now: DateTime<Utc>,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO file_upload_parts (upload_id, part_number, etag, acknowledged_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT (upload_id, part_number)
            DO UPDATE SET etag = excluded.etag, acknowledged_at = excluded.acknowledged_at
            "#,
        )
        .bind(id)
        .bind(part_number as i64)
        .bind(etag)
        .bind(now)
        .execute(&mut *conn)
        .await?;

        Ok(())
    }

    /// Move the upload to `status`, refreshing its activity time.
    pub async fn set_status(
        conn: &mut SqliteConnection,
        id: &FileUploadId,
        status: UploadStatus,
        now: DateTime<Utc>,
    ) -> Result<(), AppError> {
        let result = sqlx::query(
            "UPDATE file_uploads SET status = ?2, last_activity_at = ?3 WHERE id = ?1",
        )
        .bind(id)
        .bind(status)
        .bind(now)
        .execute(&mut *conn)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("upload {}", id)));
        }
        Ok(())
    }

    pub async fn set_reported_etag(
        conn: &mut SqliteConnection,
        id: &FileUploadId,
        etag: &str,
        now: DateTime<Utc>,
    ) -> Result<(), AppError> {
        sqlx::query(
            "UPDATE file_uploads SET reported_etag = ?2, status = 'awaiting_completion', last_activity_at = ?3 WHERE id = ?1",
        )
        .bind(id)
        .bind(etag)
        .bind(now)
        .execute(&mut *conn)
        .await?;

        Ok(())
    }

    /// Remove the session and, by cascade, its parts.
    pub async fn delete(conn: &mut SqliteConnection, id: &FileUploadId) -> Result<bool, AppError> {
        let result = sqlx::query("DELETE FROM file_uploads WHERE id = ?1")
            .bind(id)
            .execute(&mut *conn)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::db::pool::test_support::open_temp;
    use crate::db::workspace::tests::insert_workspace;
    use stowage_core::models::{EncryptionMode, UploadAlgorithm};
    use stowage_core::{FileId, StorageId, UserId};

    pub(crate) fn sample_upload(workspace_id: &WorkspaceId) -> FileUpload {
        let now = Utc::now();
        let file_id = FileId::new();
        FileUpload {
            id: FileUploadId::new(),
            workspace_id: workspace_id.clone(),
            folder_id: None,
            storage_key: format!("{}_secret", file_id),
            file_id,
            storage_id: StorageId::new(),
            bucket_name: "bucket".to_string(),
            name: "video.mp4".to_string(),
            extension: Some("mp4".to_string()),
            content_type: "video/mp4".to_string(),
            size_bytes: 500 * 1024 * 1024,
            algorithm: UploadAlgorithm::MultiStep,
            part_size_bytes: Some(50 * 1024 * 1024),
            expected_parts: 10,
            multipart_upload_id: Some("mp-1".to_string()),
            reported_etag: None,
            status: UploadStatus::Initiated,
            encryption_mode: EncryptionMode::None,
            owner_user_id: Some(UserId::new()),
            owner_integration_id: None,
            created_at: now,
            last_activity_at: now,
        }
    }

    #[tokio::test]
    async fn parts_upsert_keeps_latest_etag() {
        let (_dir, db) = open_temp().await;
        let workspace_id = insert_workspace(&db).await;
        let upload = sample_upload(&workspace_id);
        let id = upload.id.clone();

        db.writer
            .execute(move |conn| {
                Box::pin(async move {
                    UploadRepository::insert(conn, &upload).await?;
                    let now = Utc::now();
                    UploadRepository::upsert_part(conn, &upload.id, 2, "etag-a", now).await?;
                    UploadRepository::upsert_part(conn, &upload.id, 1, "etag-b", now).await?;
                    UploadRepository::upsert_part(conn, &upload.id, 2, "etag-c", now).await?;
                    Ok(())
                })
            })
            .await
            .unwrap();

        let repo = UploadRepository::new(db.pool.clone());
        let parts = repo.list_parts(&id).await.unwrap();
        let summary: Vec<(i64, &str)> = parts
            .iter()
            .map(|p| (p.part_number, p.etag.as_str()))
            .collect();
        assert_eq!(summary, vec![(1, "etag-b"), (2, "etag-c")]);

        let stored = repo.get(&id).await.unwrap().unwrap();
        assert_eq!(stored.algorithm, UploadAlgorithm::MultiStep);
        assert_eq!(stored.expected_parts, 10);
        assert!(stored.owner().is_some());
    }

    #[tokio::test]
    async fn other_workspaces_cannot_see_an_upload() {
        let (_dir, db) = open_temp().await;
        let workspace_id = insert_workspace(&db).await;
        let upload = sample_upload(&workspace_id);
        let id = upload.id.clone();
        db.writer
            .execute(move |conn| Box::pin(async move { UploadRepository::insert(conn, &upload).await }))
            .await
            .unwrap();

        let repo = UploadRepository::new(db.pool.clone());
        assert!(repo.get_in_workspace(&workspace_id, &id).await.is_ok());
        assert!(matches!(
            repo.get_in_workspace(&WorkspaceId::new(), &id).await,
            Err(AppError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn inactive_uploads_are_listed_and_deletion_cascades() {
        let (_dir, db) = open_temp().await;
        let workspace_id = insert_workspace(&db).await;
        let mut stale = sample_upload(&workspace_id);
        stale.last_activity_at = Utc::now() - chrono::Duration::hours(30);
        let fresh = sample_upload(&workspace_id);
        let stale_id = stale.id.clone();

        db.writer
            .execute(move |conn| {
                Box::pin(async move {
                    UploadRepository::insert(conn, &stale).await?;
                    UploadRepository::insert(conn, &fresh).await?;
                    UploadRepository::upsert_part(conn, &stale.id, 1, "e", Utc::now()).await
                })
            })
            .await
            .unwrap();

        let repo = UploadRepository::new(db.pool.clone());
        let inactive = repo
            .list_inactive(Utc::now() - chrono::Duration::hours(24), 100)
            .await
            .unwrap();
        assert_eq!(inactive.len(), 1);
        assert_eq!(inactive[0].id, stale_id);

        let id = stale_id.clone();
        let deleted = db
            .writer
            .execute(move |conn| Box::pin(async move { UploadRepository::delete(conn, &id).await }))
            .await
            .unwrap();
        assert!(deleted);
        assert!(repo.list_parts(&stale_id).await.unwrap().is_empty());
    }
}

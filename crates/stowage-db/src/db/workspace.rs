use sqlx::{Sqlite, SqliteConnection, SqlitePool};
use stowage_core::models::Workspace;
use stowage_core::{AppError, WorkspaceId};

const WORKSPACE_COLUMNS: &str =
    "id, name, storage_id, bucket_name, current_size_bytes, max_size_bytes, created_at";

/// Read access to workspaces plus the size bookkeeping the ingestion pipeline owns.
#[derive(Clone)]
pub struct WorkspaceRepository {
    pool: SqlitePool,
}

impl WorkspaceRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    #[tracing::instrument(skip(self), fields(db.table = "workspaces", db.operation = "select", db.record_id = %id))]
    pub async fn get(&self, id: &WorkspaceId) -> Result<Option<Workspace>, AppError> {
        let workspace = sqlx::query_as::<Sqlite, Workspace>(&format!(
            "SELECT {} FROM workspaces WHERE id = ?1",
            WORKSPACE_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(workspace)
    }

    pub async fn require(&self, id: &WorkspaceId) -> Result<Workspace, AppError> {
        self.get(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("workspace {}", id)))
    }

    /// Workspace owning `bucket_name`. Bucket names derive from workspace ids, so at
    /// most one row matches.
    #[tracing::instrument(skip(self), fields(db.table = "workspaces", db.operation = "select"))]
    pub async fn get_by_bucket(&self, bucket_name: &str) -> Result<Option<Workspace>, AppError> {
        let workspace = sqlx::query_as::<Sqlite, Workspace>(&format!(
            "SELECT {} FROM workspaces WHERE bucket_name = ?1",
            WORKSPACE_COLUMNS
        ))
        .bind(bucket_name)
        .fetch_optional(&self.pool)
        .await?;

        Ok(workspace)
    }

    pub async fn insert(conn: &mut SqliteConnection, workspace: &Workspace) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO workspaces (id, name, storage_id, bucket_name, current_size_bytes, max_size_bytes, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(&workspace.id)
        .bind(&workspace.name)
        .bind(&workspace.storage_id)
        .bind(&workspace.bucket_name)
        .bind(workspace.current_size_bytes)
        .bind(workspace.max_size_bytes)
        .bind(workspace.created_at)
        .execute(&mut *conn)
        .await?;

        Ok(())
    }

    pub async fn find(
        conn: &mut SqliteConnection,
        id: &WorkspaceId,
    ) -> Result<Option<Workspace>, AppError> {
        let workspace = sqlx::query_as::<Sqlite, Workspace>(&format!(
            "SELECT {} FROM workspaces WHERE id = ?1",
            WORKSPACE_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;

        Ok(workspace)
    }

    /// Recompute the stored byte total from the workspace's files.
    ///
    /// Returns the new total, or `None` if the workspace no longer exists.
    pub async fn recompute_size(
        conn: &mut SqliteConnection,
        id: &WorkspaceId,
    ) -> Result<Option<i64>, AppError> {
        let size = sqlx::query_scalar::<Sqlite, i64>(
            r#"
            UPDATE workspaces
            SET current_size_bytes = (
                SELECT COALESCE(SUM(size_bytes), 0) FROM files WHERE workspace_id = ?1
            )
            WHERE id = ?1
            RETURNING current_size_bytes
            "#,
        )
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;

        Ok(size)
    }

    /// Delete the workspace row. Folders, files and uploads go with it by cascade; the
    /// caller is responsible for the backing bucket.
    pub async fn delete(conn: &mut SqliteConnection, id: &WorkspaceId) -> Result<bool, AppError> {
        let result = sqlx::query("DELETE FROM workspaces WHERE id = ?1")
            .bind(id)
            .execute(&mut *conn)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}

use sqlx::{QueryBuilder, Sqlite, SqliteConnection, SqlitePool};
use stowage_core::models::Folder;
use stowage_core::{AppError, FolderId, WorkspaceId};

const FOLDER_COLUMNS: &str = "id, workspace_id, parent_id, name, created_at";

#[derive(Clone)]
pub struct FolderRepository {
    pool: SqlitePool,
}

impl FolderRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Every folder of the workspace. Selection resolution walks the tree in memory.
    #[tracing::instrument(skip(self), fields(db.table = "folders", db.operation = "select"))]
    pub async fn list_for_workspace(
        &self,
        workspace_id: &WorkspaceId,
    ) -> Result<Vec<Folder>, AppError> {
        let folders = sqlx::query_as::<Sqlite, Folder>(&format!(
            "SELECT {} FROM folders WHERE workspace_id = ?1 ORDER BY created_at, id",
            FOLDER_COLUMNS
        ))
        .bind(workspace_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(folders)
    }

    #[tracing::instrument(skip(self), fields(db.table = "folders", db.operation = "select", db.record_id = %id))]
    pub async fn get(
        &self,
        workspace_id: &WorkspaceId,
        id: &FolderId,
    ) -> Result<Option<Folder>, AppError> {
        let folder = sqlx::query_as::<Sqlite, Folder>(&format!(
            "SELECT {} FROM folders WHERE workspace_id = ?1 AND id = ?2",
            FOLDER_COLUMNS
        ))
        .bind(workspace_id)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(folder)
    }

    pub async fn insert(conn: &mut SqliteConnection, folder: &Folder) -> Result<(), AppError> {
        sqlx::query(
            "INSERT INTO folders (id, workspace_id, parent_id, name, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(&folder.id)
        .bind(&folder.workspace_id)
        .bind(&folder.parent_id)
        .bind(&folder.name)
        .bind(folder.created_at)
        .execute(&mut *conn)
        .await?;

        Ok(())
    }

    /// Delete the folders of `ids` that hold no files and no subfolders, in order.
    ///
    /// Callers order `ids` children first and remove contained files beforehand.
    /// Returns the ids that were left in place.
    pub async fn delete_many(
        conn: &mut SqliteConnection,
        workspace_id: &WorkspaceId,
        ids: &[FolderId],
    ) -> Result<Vec<FolderId>, AppError> {
        let mut kept = Vec::new();
        for id in ids {
            let deleted = sqlx::query(
                r#"
                DELETE FROM folders
                WHERE workspace_id = ?1 AND id = ?2
                  AND NOT EXISTS (SELECT 1 FROM files WHERE folder_id = ?2)
                  AND NOT EXISTS (SELECT 1 FROM folders c WHERE c.parent_id = ?2)
                "#,
            )
            .bind(workspace_id)
            .bind(id)
            .execute(&mut *conn)
            .await?
            .rows_affected();
            if deleted == 0 {
                kept.push(id.clone());
            }
        }
        Ok(kept)
    }

    /// Re-parent folders under `parent_id` (`None` = workspace root).
    ///
    /// Rejects a move that would place a folder inside itself or one of its descendants.
    pub async fn move_many(
        conn: &mut SqliteConnection,
        workspace_id: &WorkspaceId,
        ids: &[FolderId],
        parent_id: Option<&FolderId>,
    ) -> Result<u64, AppError> {
        if ids.is_empty() {
            return Ok(0);
        }

        if let Some(parent_id) = parent_id {
            let parent_exists = sqlx::query_scalar::<Sqlite, bool>(
                "SELECT EXISTS(SELECT 1 FROM folders WHERE workspace_id = ?1 AND id = ?2)",
            )
            .bind(workspace_id)
            .bind(parent_id)
            .fetch_one(&mut *conn)
            .await?;
            if !parent_exists {
                return Err(AppError::NotFound(format!("folder {}", parent_id)));
            }

            // Ancestors of the destination, the destination included.
            let ancestors = sqlx::query_scalar::<Sqlite, FolderId>(
                r#"
                WITH RECURSIVE ancestors(id, parent_id) AS (
                    SELECT id, parent_id FROM folders WHERE id = ?1
                    UNION ALL
                    SELECT f.id, f.parent_id FROM folders f JOIN ancestors a ON f.id = a.parent_id
                )
                SELECT id FROM ancestors
                "#,
            )
            .bind(parent_id)
            .fetch_all(&mut *conn)
            .await?;

            if let Some(cycle) = ids.iter().find(|id| ancestors.contains(id)) {
                return Err(AppError::InvalidInput(format!(
                    "folder {} cannot be moved into itself or one of its subfolders",
                    cycle
                )));
            }
        }

        let mut query = QueryBuilder::<Sqlite>::new("UPDATE folders SET parent_id = ");
        query
            .push_bind(parent_id.cloned())
            .push(" WHERE workspace_id = ")
            .push_bind(workspace_id)
            .push(" AND id IN (");
        let mut separated = query.separated(", ");
        for id in ids {
            separated.push_bind(id);
        }
        separated.push_unseparated(")");

        Ok(query.build().execute(&mut *conn).await?.rows_affected())
    }
}

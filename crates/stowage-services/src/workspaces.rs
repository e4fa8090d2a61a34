//! Workspace provisioning and teardown.

use chrono::Utc;
use std::sync::Arc;
use uuid::Uuid;

use stowage_core::models::{DeleteBucketJob, Identity, JobDefinition, Workspace};
use stowage_core::{AppError, StorageId, WorkspaceAccessProvider, WorkspaceId, WorkspaceOperation};
use stowage_db::{Database, JobRepository, UploadRepository, WorkspaceRepository};
use stowage_storage::StorageRegistry;
use stowage_worker::JobNotifier;

use crate::retry::with_storage_retry;
use crate::upload::abandon_upload;

const MAX_NAME_LENGTH: usize = 255;

#[derive(Debug, Clone)]
pub struct NewWorkspace {
    pub name: String,
    pub storage_id: StorageId,
    pub max_size_bytes: Option<i64>,
}

/// Bucket names must be lowercase for S3, so the id's random part is folded.
fn bucket_name_for(id: &WorkspaceId) -> String {
    let body = id.as_str().trim_start_matches(WorkspaceId::PREFIX);
    format!("stowage-{}", body.to_ascii_lowercase())
}

#[derive(Clone)]
pub struct WorkspaceService {
    db: Database,
    storages: StorageRegistry,
    access: Arc<dyn WorkspaceAccessProvider>,
    notifier: JobNotifier,
    storage_retry_attempts: u32,
}

impl WorkspaceService {
    pub fn new(
        db: Database,
        storages: StorageRegistry,
        access: Arc<dyn WorkspaceAccessProvider>,
        notifier: JobNotifier,
        storage_retry_attempts: u32,
    ) -> Self {
        Self {
            db,
            storages,
            access,
            notifier,
            storage_retry_attempts,
        }
    }

    /// Create the workspace's bucket on its backend, then the workspace row.
    #[tracing::instrument(skip(self, request), fields(storage_id = %request.storage_id))]
    pub async fn create(&self, request: NewWorkspace) -> Result<Workspace, AppError> {
        let name = request.name.trim().to_string();
        if name.is_empty() || name.len() > MAX_NAME_LENGTH {
            return Err(AppError::InvalidInput(
                "Workspace name must be between 1 and 255 characters".to_string(),
            ));
        }
        if request.max_size_bytes.is_some_and(|max| max < 0) {
            return Err(AppError::InvalidInput(
                "Workspace quota must not be negative".to_string(),
            ));
        }

        let backend = self.storages.get(&request.storage_id).await.ok_or_else(|| {
            AppError::StorageUnavailable(format!(
                "storage {} has no registered backend",
                request.storage_id
            ))
        })?;

        let id = WorkspaceId::new();
        let bucket_name = bucket_name_for(&id);
        with_storage_retry(self.storage_retry_attempts, "create_bucket", || {
            backend.create_bucket(&bucket_name)
        })
        .await?;

        let workspace = Workspace {
            id,
            name,
            storage_id: request.storage_id,
            bucket_name,
            current_size_bytes: 0,
            max_size_bytes: request.max_size_bytes,
            created_at: Utc::now(),
        };
        let to_insert = workspace.clone();
        let inserted = self
            .db
            .writer
            .execute(move |conn| {
                Box::pin(async move { WorkspaceRepository::insert(conn, &to_insert).await })
            })
            .await;

        if let Err(e) = inserted {
            if let Err(cleanup) = backend.delete_bucket(&workspace.bucket_name).await {
                tracing::warn!(
                    bucket = %workspace.bucket_name,
                    error = %cleanup,
                    "Failed to remove bucket of a workspace that was never saved"
                );
            }
            return Err(e);
        }

        tracing::info!(workspace_id = %workspace.id, bucket = %workspace.bucket_name, "Workspace created");
        Ok(workspace)
    }

    pub async fn get(
        &self,
        identity: &Identity,
        workspace_id: &WorkspaceId,
    ) -> Result<Workspace, AppError> {
        self.access
            .access(identity, workspace_id)
            .await?
            .require(WorkspaceOperation::Read)?;
        WorkspaceRepository::new(self.db.pool.clone())
            .require(workspace_id)
            .await
    }

    /// Delete the workspace with its folders, files and uploads, and enqueue the
    /// teardown of its bucket.
    #[tracing::instrument(skip(self, identity), fields(workspace_id = %workspace_id))]
    pub async fn delete(
        &self,
        identity: &Identity,
        workspace_id: &WorkspaceId,
    ) -> Result<(), AppError> {
        self.access
            .access(identity, workspace_id)
            .await?
            .require(WorkspaceOperation::Delete)?;

        let ws = workspace_id.clone();
        let correlation_id = Uuid::new_v4();
        let workspace = self
            .db
            .writer
            .execute(move |conn| {
                Box::pin(async move {
                    let workspace = WorkspaceRepository::find(conn, &ws)
                        .await?
                        .ok_or_else(|| AppError::NotFound(format!("workspace {}", ws)))?;

                    // Multipart uploads in flight must be aborted on the backend too.
                    let now = Utc::now();
                    for upload_id in UploadRepository::open_in_workspace(conn, &ws).await? {
                        abandon_upload(conn, &upload_id, now, None).await?;
                    }

                    WorkspaceRepository::delete(conn, &ws).await?;
                    let job = DeleteBucketJob {
                        storage_id: workspace.storage_id.clone(),
                        bucket_name: workspace.bucket_name.clone(),
                    };
                    JobRepository::insert(conn, &job.to_new_job(correlation_id)?).await?;
                    Ok(workspace)
                })
            })
            .await?;
        self.notifier.notify();

        tracing::info!(
            correlation_id = %correlation_id,
            bucket = %workspace.bucket_name,
            "Workspace deleted, bucket teardown enqueued"
        );
        Ok(())
    }
}

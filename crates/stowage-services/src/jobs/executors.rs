//! Executors for the storage jobs enqueued by the upload and bulk services.
//!
//! A job whose storage backend is no longer registered, or whose workspace is gone,
//! succeeds with a warning: its effect is moot and retrying it would only clog the queue.
//! Transient storage failures are retried by the queue; anything else fails the job.

use anyhow::Context;
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use stowage_core::models::{
    BulkDeleteObjectsJob, DeleteBucketJob, DeleteObjectJob, JobDefinition, QueueJob,
    ReclaimFileUploadJob, UpdateWorkspaceSizeJob, UploadStatus,
};
use stowage_core::{AppError, ErrorMetadata, JobError, JobResultExt, StorageId};
use stowage_db::{Database, UploadRepository, WorkspaceRepository};
use stowage_storage::{BatchDeleteOutcome, Storage, StorageError, StorageRegistry, StorageResult};
use stowage_worker::JobExecutor;

fn parse<D: JobDefinition>(job: &QueueJob) -> Result<D, JobError> {
    job.payload_as::<D>()
        .with_context(|| format!("Malformed {} payload for job {}", D::JOB_TYPE, job.id))
        .unrecoverable()
}

fn storage_failure(error: StorageError) -> JobError {
    if error.is_transient() {
        JobError::recoverable(error)
    } else {
        JobError::unrecoverable(error)
    }
}

fn write_failure(error: AppError) -> JobError {
    if error.is_recoverable() {
        JobError::recoverable(error)
    } else {
        JobError::unrecoverable(error)
    }
}

/// Deleting something that is already gone is a success.
fn ignore_not_found(result: StorageResult<()>) -> StorageResult<()> {
    match result {
        Err(e) if e.is_not_found() => Ok(()),
        other => other,
    }
}

async fn resolve(
    storages: &StorageRegistry,
    storage_id: &StorageId,
    job: &QueueJob,
) -> Option<Arc<dyn Storage>> {
    let backend = storages.get(storage_id).await;
    if backend.is_none() {
        tracing::warn!(
            job_id = job.id,
            job_type = %job.job_type,
            storage_id = %storage_id,
            "Storage backend no longer registered, skipping job"
        );
    }
    backend
}

pub struct UpdateWorkspaceSizeExecutor {
    db: Database,
}

impl UpdateWorkspaceSizeExecutor {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait]
impl JobExecutor for UpdateWorkspaceSizeExecutor {
    fn job_type(&self) -> &'static str {
        UpdateWorkspaceSizeJob::JOB_TYPE
    }

    #[tracing::instrument(skip(self, job, cancel), fields(job.id = job.id, correlation_id = %job.correlation_id))]
    async fn execute(&self, job: &QueueJob, cancel: CancellationToken) -> Result<(), JobError> {
        let payload: UpdateWorkspaceSizeJob = parse(job)?;
        let workspace_id = payload.workspace_id.clone();

        let size = self
            .db
            .writer
            .execute_or_cancel(&cancel, move |conn| {
                Box::pin(async move { WorkspaceRepository::recompute_size(conn, &workspace_id).await })
            })
            .await
            .map_err(write_failure)?;

        match size {
            Some(size_bytes) => tracing::info!(
                workspace_id = %payload.workspace_id,
                size_bytes = size_bytes,
                "Workspace size updated"
            ),
            None => tracing::warn!(
                workspace_id = %payload.workspace_id,
                "Workspace no longer exists, skipping size update"
            ),
        }
        Ok(())
    }
}

pub struct DeleteObjectExecutor {
    storages: StorageRegistry,
}

impl DeleteObjectExecutor {
    pub fn new(storages: StorageRegistry) -> Self {
        Self { storages }
    }
}

#[async_trait]
impl JobExecutor for DeleteObjectExecutor {
    fn job_type(&self) -> &'static str {
        DeleteObjectJob::JOB_TYPE
    }

    #[tracing::instrument(skip(self, job, _cancel), fields(job.id = job.id, correlation_id = %job.correlation_id))]
    async fn execute(&self, job: &QueueJob, _cancel: CancellationToken) -> Result<(), JobError> {
        let payload: DeleteObjectJob = parse(job)?;
        let Some(backend) = resolve(&self.storages, &payload.storage_id, job).await else {
            return Ok(());
        };

        ignore_not_found(backend.delete_object(&payload.bucket_name, &payload.key).await)
            .map_err(storage_failure)?;

        tracing::info!(bucket = %payload.bucket_name, key = %payload.key, "Object deleted");
        Ok(())
    }
}

pub struct BulkDeleteObjectsExecutor {
    storages: StorageRegistry,
}

impl BulkDeleteObjectsExecutor {
    pub fn new(storages: StorageRegistry) -> Self {
        Self { storages }
    }
}

#[async_trait]
impl JobExecutor for BulkDeleteObjectsExecutor {
    fn job_type(&self) -> &'static str {
        BulkDeleteObjectsJob::JOB_TYPE
    }

    #[tracing::instrument(skip(self, job, cancel), fields(job.id = job.id, correlation_id = %job.correlation_id))]
    async fn execute(&self, job: &QueueJob, cancel: CancellationToken) -> Result<(), JobError> {
        let payload: BulkDeleteObjectsJob = parse(job)?;
        let Some(backend) = resolve(&self.storages, &payload.storage_id, job).await else {
            return Ok(());
        };

        let mut outcome = BatchDeleteOutcome::default();
        for chunk in payload.keys.chunks(BulkDeleteObjectsJob::MAX_KEYS) {
            if cancel.is_cancelled() {
                return Err(JobError::recoverable(anyhow::anyhow!(
                    "Bulk delete interrupted after {} keys",
                    outcome.deleted
                )));
            }
            outcome.merge(
                backend
                    .delete_objects(&payload.bucket_name, chunk)
                    .await
                    .map_err(storage_failure)?,
            );
        }

        if !outcome.failed.is_empty() {
            for (key, reason) in outcome.failed.iter().take(10) {
                tracing::warn!(key = %key, reason = %reason, "Object could not be deleted");
            }
            // Deletes are idempotent, so the retry repeats the keys that did succeed too.
            return Err(JobError::recoverable(anyhow::anyhow!(
                "{} of {} objects could not be deleted",
                outcome.failed.len(),
                payload.keys.len()
            )));
        }

        tracing::info!(
            bucket = %payload.bucket_name,
            deleted = outcome.deleted,
            "Objects deleted"
        );
        Ok(())
    }
}

pub struct ReclaimFileUploadExecutor {
    db: Database,
    storages: StorageRegistry,
}

impl ReclaimFileUploadExecutor {
    pub fn new(db: Database, storages: StorageRegistry) -> Self {
        Self { db, storages }
    }
}

#[async_trait]
impl JobExecutor for ReclaimFileUploadExecutor {
    fn job_type(&self) -> &'static str {
        ReclaimFileUploadJob::JOB_TYPE
    }

    #[tracing::instrument(skip(self, job, cancel), fields(job.id = job.id, correlation_id = %job.correlation_id))]
    async fn execute(&self, job: &QueueJob, cancel: CancellationToken) -> Result<(), JobError> {
        let payload: ReclaimFileUploadJob = parse(job)?;

        if let Some(backend) = resolve(&self.storages, &payload.storage_id, job).await {
            if let Some(multipart_upload_id) = &payload.multipart_upload_id {
                ignore_not_found(
                    backend
                        .abort_multipart(&payload.bucket_name, &payload.key, multipart_upload_id)
                        .await,
                )
                .map_err(storage_failure)?;
            }
            // A direct or single-chunk transfer may have left a complete object behind.
            ignore_not_found(backend.delete_object(&payload.bucket_name, &payload.key).await)
                .map_err(storage_failure)?;
        }

        let upload_id = payload.upload_id.clone();
        let removed = self
            .db
            .writer
            .execute_or_cancel(&cancel, move |conn| {
                Box::pin(async move {
                    match UploadRepository::find(conn, &upload_id).await? {
                        Some(upload) if upload.status == UploadStatus::Abandoned => {
                            UploadRepository::delete(conn, &upload_id).await
                        }
                        _ => Ok(false),
                    }
                })
            })
            .await
            .map_err(write_failure)?;

        tracing::info!(
            upload_id = %payload.upload_id,
            session_removed = removed,
            "Abandoned upload reclaimed"
        );
        Ok(())
    }
}

pub struct DeleteBucketExecutor {
    storages: StorageRegistry,
}

impl DeleteBucketExecutor {
    pub fn new(storages: StorageRegistry) -> Self {
        Self { storages }
    }
}

#[async_trait]
impl JobExecutor for DeleteBucketExecutor {
    fn job_type(&self) -> &'static str {
        DeleteBucketJob::JOB_TYPE
    }

    #[tracing::instrument(skip(self, job, _cancel), fields(job.id = job.id, correlation_id = %job.correlation_id))]
    async fn execute(&self, job: &QueueJob, _cancel: CancellationToken) -> Result<(), JobError> {
        let payload: DeleteBucketJob = parse(job)?;
        let Some(backend) = resolve(&self.storages, &payload.storage_id, job).await else {
            return Ok(());
        };

        ignore_not_found(backend.delete_bucket(&payload.bucket_name).await)
            .map_err(storage_failure)?;

        tracing::info!(bucket = %payload.bucket_name, "Bucket deleted");
        Ok(())
    }
}

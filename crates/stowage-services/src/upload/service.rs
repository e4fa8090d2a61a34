//! Upload orchestration
//!
//! Picks the transfer algorithm at initiation, hands out transfer URLs, tracks
//! acknowledged parts and turns a finished [`FileUpload`] into a [`FileRecord`].
//!
//! Completion is one writer transaction: insert the file record, delete the upload
//! session and enqueue the workspace size job. A crash on either side of that commit
//! leaves either a resumable upload or a finished file, never both.

use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

use stowage_core::models::{
    FileRecord, FileUpload, Identity, JobDefinition, JobLane, ReclaimFileUploadJob, S3FileKey,
    UpdateWorkspaceSizeJob, UploadAlgorithm, UploadPart, UploadPlan, UploadStatus,
};
use stowage_core::{
    AppError, FileId, FileUploadId, StorageId, WorkspaceAccessProvider, WorkspaceId,
    WorkspaceOperation,
};
use stowage_db::{
    Database, FileRepository, FolderRepository, JobRepository, StorageRepository,
    UploadRepository, WorkspaceRepository,
};
use stowage_storage::{
    normalize_etag, CompletedUploadPart, PresignedOperation, PresignedRequest, Storage,
    StorageRegistry, UploadReader,
};
use stowage_worker::JobNotifier;

use super::types::{
    ContentOutcome, InitiateUpload, PartTicket, UploadPayload, UploadSettings, UploadTicket,
    UploadedParts,
};
use super::validation::{file_extension, sanitize_filename, validate_content_type};
use crate::retry::with_storage_retry;

#[derive(Clone)]
pub struct UploadOrchestrator {
    db: Database,
    uploads: UploadRepository,
    workspaces: WorkspaceRepository,
    folders: FolderRepository,
    storage_configs: StorageRepository,
    storages: StorageRegistry,
    access: Arc<dyn WorkspaceAccessProvider>,
    notifier: JobNotifier,
    settings: UploadSettings,
}

impl UploadOrchestrator {
    pub fn new(
        db: Database,
        storages: StorageRegistry,
        access: Arc<dyn WorkspaceAccessProvider>,
        notifier: JobNotifier,
        settings: UploadSettings,
    ) -> Self {
        Self {
            uploads: UploadRepository::new(db.pool.clone()),
            workspaces: WorkspaceRepository::new(db.pool.clone()),
            folders: FolderRepository::new(db.pool.clone()),
            storage_configs: StorageRepository::new(db.pool.clone()),
            db,
            storages,
            access,
            notifier,
            settings,
        }
    }

    pub fn settings(&self) -> &UploadSettings {
        &self.settings
    }

    /// Create an upload session and return what the client needs to send the bytes.
    #[tracing::instrument(skip(self, identity, request), fields(workspace_id = %workspace_id, size_bytes = request.size_bytes))]
    pub async fn initiate(
        &self,
        identity: &Identity,
        workspace_id: &WorkspaceId,
        request: InitiateUpload,
    ) -> Result<UploadTicket, AppError> {
        let name = sanitize_filename(&request.name)?;
        validate_content_type(&request.content_type)?;
        let size_bytes = i64::try_from(request.size_bytes)
            .map_err(|_| AppError::InvalidInput("Declared size is too large".to_string()))?;

        let access = self.access.access(identity, workspace_id).await?;
        access.require(WorkspaceOperation::Upload)?;
        access.ensure_capacity(size_bytes)?;

        let workspace = self.workspaces.require(workspace_id).await?;
        if let Some(folder_id) = &request.folder_id {
            self.folders
                .get(workspace_id, folder_id)
                .await?
                .ok_or_else(|| AppError::NotFound(format!("folder {}", folder_id)))?;
        }

        let backend = self.backend(&workspace.storage_id).await?;
        let capabilities = backend.capabilities();
        let plan = self
            .settings
            .thresholds
            .plan(request.size_bytes, capabilities.min_part_size);
        let encryption_mode = self
            .storage_configs
            .get(&workspace.storage_id)
            .await?
            .map(|config| config.encryption_mode)
            .unwrap_or_default();

        let upload_id = FileUploadId::new();
        let file_id = FileId::new();
        let storage_key = S3FileKey::generate(file_id.clone()).object_key();

        let payload = match plan {
            UploadPlan::Direct => UploadPayload::Direct {
                upload_url: self.content_url(workspace_id, &upload_id),
            },
            UploadPlan::SingleChunk if capabilities.native_presigned_urls => {
                let operation = PresignedOperation::Put {
                    content_type: request.content_type.clone(),
                };
                let presigned = with_storage_retry(
                    self.settings.storage_retry_attempts,
                    "presigned_url",
                    || {
                        backend.presigned_url(
                            &workspace.bucket_name,
                            &storage_key,
                            &operation,
                            self.settings.presigned_url_ttl,
                        )
                    },
                )
                .await?;
                UploadPayload::SingleChunk {
                    upload_url: presigned.url,
                    upload_headers: presigned.headers,
                    requires_completion_callback: true,
                }
            }
            UploadPlan::SingleChunk => UploadPayload::SingleChunk {
                upload_url: self.content_url(workspace_id, &upload_id),
                upload_headers: BTreeMap::new(),
                requires_completion_callback: false,
            },
            UploadPlan::MultiStep {
                part_size_bytes,
                expected_parts,
            } => UploadPayload::MultiStep {
                expected_parts_count: expected_parts,
                part_size_bytes,
            },
        };

        let multipart_upload_id = match plan {
            UploadPlan::MultiStep { .. } => Some(
                with_storage_retry(
                    self.settings.storage_retry_attempts,
                    "initiate_multipart",
                    || {
                        backend.initiate_multipart(
                            &workspace.bucket_name,
                            &storage_key,
                            &request.content_type,
                        )
                    },
                )
                .await?,
            ),
            _ => None,
        };

        let now = Utc::now();
        let upload = FileUpload {
            id: upload_id.clone(),
            workspace_id: workspace.id.clone(),
            folder_id: request.folder_id.clone(),
            file_id: file_id.clone(),
            storage_id: workspace.storage_id.clone(),
            bucket_name: workspace.bucket_name.clone(),
            storage_key,
            extension: file_extension(&name),
            name,
            content_type: request.content_type,
            size_bytes,
            algorithm: plan.algorithm(),
            part_size_bytes: match plan {
                UploadPlan::MultiStep {
                    part_size_bytes, ..
                } => Some(part_size_bytes as i64),
                _ => None,
            },
            expected_parts: i64::from(plan.expected_parts()),
            multipart_upload_id,
            reported_etag: None,
            status: UploadStatus::Initiated,
            encryption_mode,
            owner_user_id: identity.user_id().cloned(),
            owner_integration_id: identity.integration_id().cloned(),
            created_at: now,
            last_activity_at: now,
        };

        let row = upload.clone();
        let inserted = self
            .db
            .writer
            .execute(move |conn| Box::pin(async move { UploadRepository::insert(conn, &row).await }))
            .await;
        if let Err(e) = inserted {
            if let Some(multipart_upload_id) = &upload.multipart_upload_id {
                if let Err(abort_error) = backend
                    .abort_multipart(&upload.bucket_name, &upload.storage_key, multipart_upload_id)
                    .await
                {
                    tracing::warn!(
                        error = %abort_error,
                        multipart_upload_id = %multipart_upload_id,
                        "Failed to abort multipart upload after session insert failed"
                    );
                }
            }
            return Err(e);
        }

        tracing::info!(
            upload_id = %upload.id,
            file_id = %upload.file_id,
            algorithm = %upload.algorithm,
            expected_parts = upload.expected_parts,
            "Upload initiated"
        );

        Ok(UploadTicket {
            upload_id,
            file_id,
            algorithm: upload.algorithm,
            payload,
        })
    }

    /// Issue the transfer URL and byte range of one part of a multi-step upload.
    #[tracing::instrument(skip(self, identity), fields(workspace_id = %workspace_id, upload_id = %upload_id))]
    pub async fn initiate_part(
        &self,
        identity: &Identity,
        workspace_id: &WorkspaceId,
        upload_id: &FileUploadId,
        part_number: u32,
    ) -> Result<PartTicket, AppError> {
        let upload = self.load(identity, workspace_id, upload_id).await?;
        require_algorithm(&upload, UploadAlgorithm::MultiStep)?;
        upload.check_part_number(part_number)?;

        let backend = self.backend(&upload.storage_id).await?;
        let (presigned, requires_completion_callback) =
            if backend.capabilities().native_presigned_urls {
                let operation = PresignedOperation::UploadPart {
                    upload_id: multipart_upload_id(&upload)?.to_string(),
                    part_number,
                };
                let presigned = with_storage_retry(
                    self.settings.storage_retry_attempts,
                    "presigned_url",
                    || {
                        backend.presigned_url(
                            &upload.bucket_name,
                            &upload.storage_key,
                            &operation,
                            self.settings.presigned_url_ttl,
                        )
                    },
                )
                .await?;
                (presigned, true)
            } else {
                (
                    PresignedRequest::new(self.part_content_url(
                        workspace_id,
                        upload_id,
                        part_number,
                    )),
                    false,
                )
            };

        self.touch(&upload.id, UploadStatus::PartsPending).await?;

        Ok(PartTicket {
            upload_url: presigned.url,
            upload_headers: presigned.headers,
            range: upload.part_range(part_number),
            requires_completion_callback,
        })
    }

    /// Record the ETag of an uploaded part. Acknowledging a part again replaces its ETag.
    #[tracing::instrument(skip(self, identity, etag), fields(workspace_id = %workspace_id, upload_id = %upload_id))]
    pub async fn acknowledge_part(
        &self,
        identity: &Identity,
        workspace_id: &WorkspaceId,
        upload_id: &FileUploadId,
        part_number: u32,
        etag: &str,
    ) -> Result<(), AppError> {
        let upload = self.load(identity, workspace_id, upload_id).await?;
        require_algorithm(&upload, UploadAlgorithm::MultiStep)?;
        upload.check_part_number(part_number)?;
        self.record_part(&upload.id, part_number, required_etag(etag)?)
            .await
    }

    /// Part numbers acknowledged so far, for resuming from the first gap.
    pub async fn uploaded_parts(
        &self,
        identity: &Identity,
        workspace_id: &WorkspaceId,
        upload_id: &FileUploadId,
    ) -> Result<UploadedParts, AppError> {
        let upload = self.load(identity, workspace_id, upload_id).await?;
        let part_numbers = self
            .uploads
            .list_parts(&upload.id)
            .await?
            .iter()
            .map(|part| part.part_number as u32)
            .collect();

        Ok(UploadedParts {
            part_numbers,
            expected_parts_count: upload.expected_parts(),
        })
    }

    /// Completion callback of a single-chunk upload: the ETag the backend returned.
    #[tracing::instrument(skip(self, identity, etag), fields(workspace_id = %workspace_id, upload_id = %upload_id))]
    pub async fn report_single_chunk_etag(
        &self,
        identity: &Identity,
        workspace_id: &WorkspaceId,
        upload_id: &FileUploadId,
        etag: &str,
    ) -> Result<(), AppError> {
        let upload = self.load(identity, workspace_id, upload_id).await?;
        require_algorithm(&upload, UploadAlgorithm::SingleChunk)?;
        self.record_reported_etag(&upload.id, required_etag(etag)?)
            .await
    }

    /// Verify the stored object and commit the file record.
    ///
    /// `parts` lets a multi-step client acknowledge its parts in the same call; for a
    /// single-chunk upload a first entry stands in for the completion callback.
    #[tracing::instrument(skip(self, identity, parts), fields(workspace_id = %workspace_id, upload_id = %upload_id))]
    pub async fn finalize(
        &self,
        identity: &Identity,
        workspace_id: &WorkspaceId,
        upload_id: &FileUploadId,
        parts: Option<Vec<(u32, String)>>,
    ) -> Result<FileId, AppError> {
        let upload = self.load(identity, workspace_id, upload_id).await?;
        let backend = self.backend(&upload.storage_id).await?;

        match upload.algorithm {
            UploadAlgorithm::Direct => {
                let exists = with_storage_retry(
                    self.settings.storage_retry_attempts,
                    "object_exists",
                    || backend.object_exists(&upload.bucket_name, &upload.storage_key),
                )
                .await?;
                if !exists {
                    return Err(AppError::IncompleteUpload { missing: vec![1] });
                }
            }
            UploadAlgorithm::SingleChunk => {
                let reported = match parts.as_deref().and_then(|parts| parts.first()) {
                    Some((_, etag)) => Some(required_etag(etag)?.to_string()),
                    None => upload.reported_etag.clone(),
                };
                self.verify_single_chunk(&upload, backend.as_ref(), reported)
                    .await?;
            }
            UploadAlgorithm::MultiStep => {
                self.complete_multi_step(&upload, backend.as_ref(), parts.unwrap_or_default())
                    .await?;
            }
        }

        self.commit(&upload).await
    }

    /// Server-brokered body of a direct upload, or of a single-chunk upload on a backend
    /// that cannot pre-sign.
    #[tracing::instrument(skip(self, identity, body), fields(workspace_id = %workspace_id, upload_id = %upload_id))]
    pub async fn upload_content(
        &self,
        identity: &Identity,
        workspace_id: &WorkspaceId,
        upload_id: &FileUploadId,
        content_length: Option<u64>,
        body: UploadReader,
    ) -> Result<ContentOutcome, AppError> {
        let upload = self.load(identity, workspace_id, upload_id).await?;
        let backend = self.backend(&upload.storage_id).await?;
        let brokered = match upload.algorithm {
            UploadAlgorithm::Direct => true,
            UploadAlgorithm::SingleChunk => !backend.capabilities().native_presigned_urls,
            UploadAlgorithm::MultiStep => false,
        };
        if !brokered {
            return Err(AppError::InvalidInput(format!(
                "Upload {} does not accept content through this endpoint",
                upload.id
            )));
        }

        let size = upload.size_bytes as u64;
        check_content_length(content_length, size)?;

        // The body stream is consumed by the first attempt, so there is no retry here.
        let etag = backend
            .put_object(
                &upload.bucket_name,
                &upload.storage_key,
                &upload.content_type,
                size,
                body,
            )
            .await?;

        match upload.algorithm {
            UploadAlgorithm::Direct => {
                let file_id = self.commit(&upload).await?;
                Ok(ContentOutcome::Completed { file_id })
            }
            _ => {
                self.record_reported_etag(&upload.id, &etag).await?;
                Ok(ContentOutcome::Stored { etag })
            }
        }
    }

    /// Server-brokered body of one part, for backends that cannot pre-sign.
    #[tracing::instrument(skip(self, identity, body), fields(workspace_id = %workspace_id, upload_id = %upload_id))]
    pub async fn upload_part_content(
        &self,
        identity: &Identity,
        workspace_id: &WorkspaceId,
        upload_id: &FileUploadId,
        part_number: u32,
        content_length: Option<u64>,
        body: UploadReader,
    ) -> Result<String, AppError> {
        let upload = self.load(identity, workspace_id, upload_id).await?;
        require_algorithm(&upload, UploadAlgorithm::MultiStep)?;
        upload.check_part_number(part_number)?;

        let backend = self.backend(&upload.storage_id).await?;
        if backend.capabilities().native_presigned_urls {
            return Err(AppError::InvalidInput(format!(
                "Upload {} parts must be sent to their pre-signed URLs",
                upload.id
            )));
        }

        let size = upload.part_range(part_number).size();
        check_content_length(content_length, size)?;

        let etag = backend
            .upload_part(
                &upload.bucket_name,
                &upload.storage_key,
                multipart_upload_id(&upload)?,
                part_number,
                size,
                body,
            )
            .await?;
        self.record_part(&upload.id, part_number, &etag).await?;

        Ok(etag)
    }

    /// Abort an upload. The backend side is released by a reclaim job.
    #[tracing::instrument(skip(self, identity), fields(workspace_id = %workspace_id, upload_id = %upload_id))]
    pub async fn abandon(
        &self,
        identity: &Identity,
        workspace_id: &WorkspaceId,
        upload_id: &FileUploadId,
    ) -> Result<(), AppError> {
        let upload = self.load(identity, workspace_id, upload_id).await?;
        let id = upload.id.clone();
        let abandoned = self
            .db
            .writer
            .execute(move |conn| {
                Box::pin(async move { abandon_upload(conn, &id, Utc::now(), None).await })
            })
            .await?;
        if abandoned {
            self.notifier.notify_lane(JobLane::Normal);
            tracing::info!(upload_id = %upload.id, "Upload aborted by client");
        }
        Ok(())
    }

    async fn backend(&self, storage_id: &StorageId) -> Result<Arc<dyn Storage>, AppError> {
        self.storages.get(storage_id).await.ok_or_else(|| {
            tracing::error!(storage_id = %storage_id, "No storage backend registered");
            AppError::StorageUnavailable(format!(
                "storage {} has no registered backend",
                storage_id
            ))
        })
    }

    /// Permission check plus lookup. Abandoned sessions are gone as far as clients care.
    async fn load(
        &self,
        identity: &Identity,
        workspace_id: &WorkspaceId,
        upload_id: &FileUploadId,
    ) -> Result<FileUpload, AppError> {
        self.access
            .access(identity, workspace_id)
            .await?
            .require(WorkspaceOperation::Upload)?;

        let upload = self.uploads.get_in_workspace(workspace_id, upload_id).await?;
        if upload.status.is_terminal() {
            return Err(AppError::NotFound(format!("upload {}", upload_id)));
        }
        Ok(upload)
    }

    async fn touch(&self, id: &FileUploadId, status: UploadStatus) -> Result<(), AppError> {
        let id = id.clone();
        self.db
            .writer
            .execute(move |conn| {
                Box::pin(async move {
                    let current = find_open(conn, &id).await?;
                    UploadRepository::set_status(
                        conn,
                        &id,
                        next_status(current.status, status),
                        Utc::now(),
                    )
                    .await
                })
            })
            .await
    }

    async fn record_part(
        &self,
        id: &FileUploadId,
        part_number: u32,
        etag: &str,
    ) -> Result<(), AppError> {
        let upload_id = id.clone();
        let etag = normalize_etag(etag).to_string();
        self.db
            .writer
            .execute(move |conn| {
                Box::pin(async move {
                    let id = upload_id;
                    let current = find_open(conn, &id).await?;
                    let now = Utc::now();
                    UploadRepository::upsert_part(conn, &id, part_number, &etag, now).await?;
                    UploadRepository::set_status(
                        conn,
                        &id,
                        next_status(current.status, UploadStatus::PartsPending),
                        now,
                    )
                    .await
                })
            })
            .await?;

        tracing::debug!(upload_id = %id, part_number = part_number, "Part acknowledged");
        Ok(())
    }

    async fn record_reported_etag(&self, id: &FileUploadId, etag: &str) -> Result<(), AppError> {
        let id = id.clone();
        let etag = normalize_etag(etag).to_string();
        self.db
            .writer
            .execute(move |conn| {
                Box::pin(async move {
                    find_open(conn, &id).await?;
                    UploadRepository::set_reported_etag(conn, &id, &etag, Utc::now()).await
                })
            })
            .await
    }

    async fn verify_single_chunk(
        &self,
        upload: &FileUpload,
        backend: &dyn Storage,
        reported: Option<String>,
    ) -> Result<(), AppError> {
        let Some(reported) = reported else {
            return Err(AppError::IncompleteUpload { missing: vec![1] });
        };

        let metadata = match with_storage_retry(
            self.settings.storage_retry_attempts,
            "head_object",
            || backend.head_object(&upload.bucket_name, &upload.storage_key),
        )
        .await
        {
            Ok(metadata) => metadata,
            Err(e) if e.is_not_found() => {
                return Err(AppError::IncompleteUpload { missing: vec![1] })
            }
            Err(e) => return Err(e.into()),
        };

        if normalize_etag(&metadata.etag) != normalize_etag(&reported) {
            return Err(AppError::StorageCompletionFailed(format!(
                "reported ETag {} does not match the stored object",
                reported
            )));
        }
        if metadata.size != upload.size_bytes as u64 {
            return Err(AppError::StorageCompletionFailed(format!(
                "stored object has {} bytes, {} were declared",
                metadata.size, upload.size_bytes
            )));
        }
        Ok(())
    }

    async fn complete_multi_step(
        &self,
        upload: &FileUpload,
        backend: &dyn Storage,
        provided: Vec<(u32, String)>,
    ) -> Result<(), AppError> {
        let multipart_upload_id = multipart_upload_id(upload)?;
        for (part_number, etag) in &provided {
            upload.check_part_number(*part_number)?;
            required_etag(etag)?;
        }

        // Newly supplied parts are kept even when others are still missing.
        let id = upload.id.clone();
        let acknowledged: Result<Vec<UploadPart>, Vec<u32>> = self
            .db
            .writer
            .execute(move |conn| {
                Box::pin(async move {
                    let current = find_open(conn, &id).await?;
                    let now = Utc::now();
                    for (part_number, etag) in &provided {
                        UploadRepository::upsert_part(
                            conn,
                            &id,
                            *part_number,
                            normalize_etag(etag),
                            now,
                        )
                        .await?;
                    }

                    let parts = UploadRepository::parts(conn, &id).await?;
                    let numbers: Vec<u32> =
                        parts.iter().map(|part| part.part_number as u32).collect();
                    let missing = current.missing_parts(&numbers);
                    if !missing.is_empty() {
                        return Ok(Err(missing));
                    }

                    UploadRepository::set_status(conn, &id, UploadStatus::AwaitingCompletion, now)
                        .await?;
                    Ok(Ok(parts))
                })
            })
            .await?;
        let parts = acknowledged.map_err(|missing| AppError::IncompleteUpload { missing })?;

        let completed: Vec<CompletedUploadPart> = parts
            .iter()
            .filter(|part| part.part_number <= i64::from(upload.expected_parts()))
            .map(|part| CompletedUploadPart {
                part_number: part.part_number as u32,
                etag: part.etag.clone(),
            })
            .collect();

        let result = with_storage_retry(
            self.settings.storage_retry_attempts,
            "complete_multipart",
            || {
                backend.complete_multipart(
                    &upload.bucket_name,
                    &upload.storage_key,
                    multipart_upload_id,
                    &completed,
                )
            },
        )
        .await;

        let Err(e) = result else {
            return Ok(());
        };

        // An earlier finalize may have completed the object and crashed before its commit.
        if let Ok(true) = backend
            .object_exists(&upload.bucket_name, &upload.storage_key)
            .await
        {
            tracing::warn!(
                upload_id = %upload.id,
                error = %e,
                "Multipart completion failed but the object exists, committing"
            );
            return Ok(());
        }

        tracing::warn!(upload_id = %upload.id, error = %e, "Multipart completion failed");
        if e.is_transient() {
            Err(AppError::StorageUnavailable(e.to_string()))
        } else {
            Err(AppError::StorageCompletionFailed(e.to_string()))
        }
    }

    /// Replace the upload session with its file record and enqueue the size update.
    async fn commit(&self, upload: &FileUpload) -> Result<FileId, AppError> {
        let upload_id = upload.id.clone();
        let file_id = upload.file_id.clone();
        let committed = self
            .db
            .writer
            .execute(move |conn| {
                Box::pin(async move { commit_upload(conn, &upload_id, &file_id).await })
            })
            .await?;

        if committed {
            self.notifier.notify_lane(JobLane::Normal);
            tracing::info!(
                upload_id = %upload.id,
                file_id = %upload.file_id,
                workspace_id = %upload.workspace_id,
                size_bytes = upload.size_bytes,
                "Upload completed"
            );
        }
        Ok(upload.file_id.clone())
    }

    fn content_url(&self, workspace_id: &WorkspaceId, upload_id: &FileUploadId) -> String {
        format!(
            "{}/api/workspaces/{}/uploads/{}/content",
            self.settings.public_base_url, workspace_id, upload_id
        )
    }

    fn part_content_url(
        &self,
        workspace_id: &WorkspaceId,
        upload_id: &FileUploadId,
        part_number: u32,
    ) -> String {
        format!(
            "{}/api/workspaces/{}/uploads/{}/parts/{}/content",
            self.settings.public_base_url, workspace_id, upload_id, part_number
        )
    }
}

/// Insert the file record, drop the session and enqueue the size job in one transaction.
///
/// Returns `false` when an earlier commit already produced the file.
async fn commit_upload(
    conn: &mut SqliteConnection,
    upload_id: &FileUploadId,
    file_id: &FileId,
) -> Result<bool, AppError> {
    let Some(upload) = UploadRepository::find(conn, upload_id).await? else {
        if FileRepository::exists(conn, file_id).await? {
            return Ok(false);
        }
        return Err(AppError::NotFound(format!("upload {}", upload_id)));
    };
    if upload.status.is_terminal() {
        return Err(AppError::NotFound(format!("upload {}", upload_id)));
    }

    let record = FileRecord {
        id: upload.file_id.clone(),
        workspace_id: upload.workspace_id.clone(),
        folder_id: upload.folder_id.clone(),
        name: upload.name.clone(),
        extension: upload.extension.clone(),
        content_type: upload.content_type.clone(),
        size_bytes: upload.size_bytes,
        storage_id: upload.storage_id.clone(),
        bucket_name: upload.bucket_name.clone(),
        storage_key: upload.storage_key.clone(),
        encryption_mode: upload.encryption_mode,
        owner_user_id: upload.owner_user_id.clone(),
        owner_integration_id: upload.owner_integration_id.clone(),
        created_at: Utc::now(),
    };
    FileRepository::insert(conn, &record).await?;
    UploadRepository::delete(conn, &upload.id).await?;

    let job = UpdateWorkspaceSizeJob {
        workspace_id: upload.workspace_id.clone(),
    }
    .to_new_job(Uuid::new_v4())?;
    JobRepository::insert(conn, &job).await?;

    Ok(true)
}

/// Mark an open upload abandoned and enqueue its reclaim job in the same transaction.
///
/// With `idle_before` set, the upload is only abandoned if its last activity is still
/// older than that instant when the write runs.
///
/// Returns `false` if the upload is already gone, abandoned, or active again.
pub(crate) async fn abandon_upload(
    conn: &mut SqliteConnection,
    id: &FileUploadId,
    now: DateTime<Utc>,
    idle_before: Option<DateTime<Utc>>,
) -> Result<bool, AppError> {
    let Some(upload) = UploadRepository::find(conn, id).await? else {
        return Ok(false);
    };
    if upload.status.is_terminal() {
        return Ok(false);
    }
    if idle_before.is_some_and(|cutoff| upload.last_activity_at >= cutoff) {
        tracing::debug!(upload_id = %upload.id, "Upload became active again, not abandoning");
        return Ok(false);
    }

    UploadRepository::set_status(conn, id, UploadStatus::Abandoned, now).await?;
    let job = ReclaimFileUploadJob {
        upload_id: upload.id.clone(),
        storage_id: upload.storage_id.clone(),
        bucket_name: upload.bucket_name.clone(),
        key: upload.storage_key.clone(),
        multipart_upload_id: upload.multipart_upload_id.clone(),
    }
    .to_new_job(Uuid::new_v4())?;
    JobRepository::insert(conn, &job).await?;

    Ok(true)
}

async fn find_open(conn: &mut SqliteConnection, id: &FileUploadId) -> Result<FileUpload, AppError> {
    UploadRepository::find(conn, id)
        .await?
        .filter(|upload| !upload.status.is_terminal())
        .ok_or_else(|| AppError::NotFound(format!("upload {}", id)))
}

/// `wanted` if the state machine allows it, otherwise stay put.
fn next_status(current: UploadStatus, wanted: UploadStatus) -> UploadStatus {
    if current.can_transition_to(wanted) {
        wanted
    } else {
        current
    }
}

fn require_algorithm(upload: &FileUpload, algorithm: UploadAlgorithm) -> Result<(), AppError> {
    if upload.algorithm != algorithm {
        return Err(AppError::InvalidInput(format!(
            "Upload {} uses the {} algorithm, not {}",
            upload.id, upload.algorithm, algorithm
        )));
    }
    Ok(())
}

fn multipart_upload_id(upload: &FileUpload) -> Result<&str, AppError> {
    upload.multipart_upload_id.as_deref().ok_or_else(|| {
        AppError::Internal(format!("upload {} has no multipart upload id", upload.id))
    })
}

fn required_etag(etag: &str) -> Result<&str, AppError> {
    let etag = normalize_etag(etag);
    if etag.is_empty() {
        return Err(AppError::InvalidInput("ETag must not be empty".to_string()));
    }
    Ok(etag)
}

fn check_content_length(content_length: Option<u64>, expected: u64) -> Result<(), AppError> {
    match content_length {
        Some(length) if length != expected => Err(AppError::InvalidInput(format!(
            "Expected {} bytes, request declares {}",
            expected, length
        ))),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Fixture, MB};
    use std::io::Cursor;
    use stowage_core::models::JobStatus;
    use stowage_core::UploadThresholds;

    fn request(name: &str, size_bytes: u64) -> InitiateUpload {
        InitiateUpload {
            folder_id: None,
            name: name.to_string(),
            content_type: "application/octet-stream".to_string(),
            size_bytes,
        }
    }

    fn body(bytes: Vec<u8>) -> UploadReader {
        Box::pin(Cursor::new(bytes))
    }

    async fn session(fx: &Fixture, id: &FileUploadId) -> Option<FileUpload> {
        UploadRepository::new(fx.db.pool.clone()).get(id).await.unwrap()
    }

    async fn pending_jobs(fx: &Fixture) -> i64 {
        JobRepository::new(fx.db.pool.clone())
            .count_by_status(JobStatus::Pending)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn five_megabyte_file_uses_a_single_chunk() {
        let fx = Fixture::new(true).await;
        let orchestrator = fx.orchestrator();
        let ws = fx.workspace.id.clone();

        let ticket = orchestrator
            .initiate(&fx.identity, &ws, request("clip.mov", 5 * MB))
            .await
            .unwrap();
        assert_eq!(ticket.algorithm, UploadAlgorithm::SingleChunk);
        match &ticket.payload {
            UploadPayload::SingleChunk {
                upload_headers,
                requires_completion_callback,
                ..
            } => {
                assert!(*requires_completion_callback);
                assert_eq!(
                    upload_headers.get("content-type").map(String::as_str),
                    Some("application/octet-stream")
                );
            }
            other => panic!("expected a single-chunk payload, got {:?}", other),
        }

        let upload = session(&fx, &ticket.upload_id).await.unwrap();
        let etag = fx.storage.client_put(
            &upload.bucket_name,
            &upload.storage_key,
            vec![7u8; (5 * MB) as usize],
        );
        orchestrator
            .report_single_chunk_etag(&fx.identity, &ws, &ticket.upload_id, &etag)
            .await
            .unwrap();

        let file_id = orchestrator
            .finalize(&fx.identity, &ws, &ticket.upload_id, None)
            .await
            .unwrap();
        assert_eq!(file_id, ticket.file_id);

        let file = FileRepository::new(fx.db.pool.clone())
            .get(&ws, &file_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(file.size_bytes, (5 * MB) as i64);
        assert_eq!(file.extension.as_deref(), Some("mov"));
        assert!(session(&fx, &ticket.upload_id).await.is_none());
        assert_eq!(pending_jobs(&fx).await, 1);
    }

    #[tokio::test]
    async fn finalize_requires_every_part() {
        let fx = Fixture::new(true).await;
        let orchestrator = fx.orchestrator();
        let ws = fx.workspace.id.clone();

        let ticket = orchestrator
            .initiate(&fx.identity, &ws, request("backup.tar", 500 * MB))
            .await
            .unwrap();
        assert_eq!(
            ticket.payload,
            UploadPayload::MultiStep {
                expected_parts_count: 10,
                part_size_bytes: 50 * MB
            }
        );
        let upload = session(&fx, &ticket.upload_id).await.unwrap();
        let multipart_upload_id = upload.multipart_upload_id.clone().unwrap();

        for part_number in 1..=9u32 {
            let part = orchestrator
                .initiate_part(&fx.identity, &ws, &ticket.upload_id, part_number)
                .await
                .unwrap();
            assert!(part.requires_completion_callback);
            assert_eq!(part.range.start, u64::from(part_number - 1) * 50 * MB);
            let etag = fx.storage.client_put_part(
                &multipart_upload_id,
                part_number,
                vec![part_number as u8; 16],
            );
            orchestrator
                .acknowledge_part(&fx.identity, &ws, &ticket.upload_id, part_number, &etag)
                .await
                .unwrap();
        }

        let incomplete = orchestrator
            .finalize(&fx.identity, &ws, &ticket.upload_id, None)
            .await;
        assert!(matches!(
            incomplete,
            Err(AppError::IncompleteUpload { ref missing }) if missing == &vec![10]
        ));
        assert!(session(&fx, &ticket.upload_id).await.is_some());

        let etag = fx
            .storage
            .client_put_part(&multipart_upload_id, 10, vec![10u8; 16]);
        orchestrator
            .acknowledge_part(&fx.identity, &ws, &ticket.upload_id, 10, &etag)
            .await
            .unwrap();
        let file_id = orchestrator
            .finalize(&fx.identity, &ws, &ticket.upload_id, None)
            .await
            .unwrap();

        assert_eq!(file_id, ticket.file_id);
        let object = fx
            .storage
            .object(&upload.bucket_name, &upload.storage_key)
            .unwrap();
        assert_eq!(object.len(), 160);
        assert_eq!(object[0], 1);
        assert_eq!(object[159], 10);
    }

    #[tokio::test]
    async fn reacknowledging_a_part_replaces_its_etag() {
        let fx = Fixture::new(true).await;
        let orchestrator = fx.orchestrator();
        let ws = fx.workspace.id.clone();
        let ticket = orchestrator
            .initiate(&fx.identity, &ws, request("disk.img", 500 * MB))
            .await
            .unwrap();

        orchestrator
            .acknowledge_part(&fx.identity, &ws, &ticket.upload_id, 3, "\"first\"")
            .await
            .unwrap();
        orchestrator
            .acknowledge_part(&fx.identity, &ws, &ticket.upload_id, 3, "second")
            .await
            .unwrap();

        let parts = orchestrator
            .uploaded_parts(&fx.identity, &ws, &ticket.upload_id)
            .await
            .unwrap();
        assert_eq!(parts.part_numbers, vec![3]);
        assert_eq!(parts.expected_parts_count, 10);

        let stored = UploadRepository::new(fx.db.pool.clone())
            .list_parts(&ticket.upload_id)
            .await
            .unwrap();
        assert_eq!(stored[0].etag, "second");
        let upload = session(&fx, &ticket.upload_id).await.unwrap();
        assert_eq!(upload.status, UploadStatus::PartsPending);
    }

    #[tokio::test]
    async fn part_numbers_outside_the_plan_are_rejected() {
        let fx = Fixture::new(true).await;
        let orchestrator = fx.orchestrator();
        let ws = fx.workspace.id.clone();
        let ticket = orchestrator
            .initiate(&fx.identity, &ws, request("disk.img", 500 * MB))
            .await
            .unwrap();

        for part_number in [0, 11] {
            let result = orchestrator
                .initiate_part(&fx.identity, &ws, &ticket.upload_id, part_number)
                .await;
            assert!(matches!(result, Err(AppError::InvalidPart { .. })));
        }

        let unknown = orchestrator
            .initiate_part(&fx.identity, &ws, &FileUploadId::new(), 1)
            .await;
        assert!(matches!(unknown, Err(AppError::NotFound(_))));
    }

    #[tokio::test]
    async fn etag_mismatch_keeps_the_upload_resumable() {
        let fx = Fixture::new(true).await;
        let orchestrator = fx.orchestrator();
        let ws = fx.workspace.id.clone();
        let ticket = orchestrator
            .initiate(&fx.identity, &ws, request("movie.mkv", 120 * MB))
            .await
            .unwrap();
        let upload = session(&fx, &ticket.upload_id).await.unwrap();
        let multipart_upload_id = upload.multipart_upload_id.clone().unwrap();

        let mut etags = Vec::new();
        for part_number in 1..=3u32 {
            etags.push(fx.storage.client_put_part(
                &multipart_upload_id,
                part_number,
                vec![part_number as u8; 8],
            ));
        }

        let wrong = vec![
            (1, etags[0].clone()),
            (2, "not-the-etag".to_string()),
            (3, etags[2].clone()),
        ];
        let failed = orchestrator
            .finalize(&fx.identity, &ws, &ticket.upload_id, Some(wrong))
            .await;
        assert!(matches!(failed, Err(AppError::StorageCompletionFailed(_))));
        let upload = session(&fx, &ticket.upload_id).await.unwrap();
        assert_eq!(upload.status, UploadStatus::AwaitingCompletion);

        orchestrator
            .acknowledge_part(&fx.identity, &ws, &ticket.upload_id, 2, &etags[1])
            .await
            .unwrap();
        orchestrator
            .finalize(&fx.identity, &ws, &ticket.upload_id, None)
            .await
            .unwrap();
        assert!(session(&fx, &ticket.upload_id).await.is_none());
    }

    #[tokio::test]
    async fn finalize_after_lost_commit_succeeds() {
        let fx = Fixture::new(true).await;
        let orchestrator = fx.orchestrator();
        let ws = fx.workspace.id.clone();
        let ticket = orchestrator
            .initiate(&fx.identity, &ws, request("movie.mkv", 120 * MB))
            .await
            .unwrap();
        let upload = session(&fx, &ticket.upload_id).await.unwrap();
        let multipart_upload_id = upload.multipart_upload_id.clone().unwrap();

        let mut parts = Vec::new();
        for part_number in 1..=3u32 {
            let etag = fx
                .storage
                .client_put_part(&multipart_upload_id, part_number, vec![1; 4]);
            parts.push(CompletedUploadPart { part_number, etag });
        }
        // The backend completed, then the process died before the metadata commit.
        fx.storage
            .complete_multipart(
                &upload.bucket_name,
                &upload.storage_key,
                &multipart_upload_id,
                &parts,
            )
            .await
            .unwrap();

        let provided = parts
            .iter()
            .map(|part| (part.part_number, part.etag.clone()))
            .collect();
        let file_id = orchestrator
            .finalize(&fx.identity, &ws, &ticket.upload_id, Some(provided))
            .await
            .unwrap();
        assert_eq!(file_id, ticket.file_id);
    }

    #[tokio::test]
    async fn direct_uploads_complete_with_the_content_request() {
        let fx = Fixture::new(false).await;
        let orchestrator = fx.orchestrator();
        let ws = fx.workspace.id.clone();
        let ticket = orchestrator
            .initiate(&fx.identity, &ws, request("notes.txt", 11))
            .await
            .unwrap();
        match &ticket.payload {
            UploadPayload::Direct { upload_url } => assert!(upload_url.ends_with(&format!(
                "/api/workspaces/{}/uploads/{}/content",
                ws, ticket.upload_id
            ))),
            other => panic!("unexpected payload {:?}", other),
        }

        let outcome = orchestrator
            .upload_content(
                &fx.identity,
                &ws,
                &ticket.upload_id,
                Some(11),
                body(b"hello world".to_vec()),
            )
            .await
            .unwrap();
        assert_eq!(
            outcome,
            ContentOutcome::Completed {
                file_id: ticket.file_id.clone()
            }
        );
        assert!(session(&fx, &ticket.upload_id).await.is_none());
    }

    #[tokio::test]
    async fn brokered_single_chunk_and_parts_on_backends_without_presigning() {
        let fx = Fixture::new(false).await;
        let orchestrator = fx.orchestrator_with(UploadThresholds {
            direct_max_bytes: 4,
            single_chunk_max_bytes: 8,
            part_size_bytes: 5,
        });
        let ws = fx.workspace.id.clone();

        let single = orchestrator
            .initiate(&fx.identity, &ws, request("small.bin", 6))
            .await
            .unwrap();
        assert!(matches!(
            single.payload,
            UploadPayload::SingleChunk {
                requires_completion_callback: false,
                ..
            }
        ));
        let outcome = orchestrator
            .upload_content(&fx.identity, &ws, &single.upload_id, None, body(vec![1; 6]))
            .await
            .unwrap();
        assert!(matches!(outcome, ContentOutcome::Stored { .. }));
        orchestrator
            .finalize(&fx.identity, &ws, &single.upload_id, None)
            .await
            .unwrap();

        let multi = orchestrator
            .initiate(&fx.identity, &ws, request("large.bin", 12))
            .await
            .unwrap();
        let content: Vec<u8> = (0u8..12).collect();
        for part_number in 1..=3u32 {
            let part = orchestrator
                .initiate_part(&fx.identity, &ws, &multi.upload_id, part_number)
                .await
                .unwrap();
            assert!(!part.requires_completion_callback);
            let bytes = content[part.range.start as usize..=part.range.end as usize].to_vec();
            orchestrator
                .upload_part_content(
                    &fx.identity,
                    &ws,
                    &multi.upload_id,
                    part_number,
                    Some(bytes.len() as u64),
                    body(bytes),
                )
                .await
                .unwrap();
        }
        let upload = session(&fx, &multi.upload_id).await.unwrap();
        orchestrator
            .finalize(&fx.identity, &ws, &multi.upload_id, None)
            .await
            .unwrap();
        assert_eq!(
            fx.storage.object(&upload.bucket_name, &upload.storage_key),
            Some(content)
        );
    }

    #[tokio::test]
    async fn quota_is_checked_at_initiation() {
        let fx = Fixture::with_quota(true, Some(MB as i64)).await;
        let result = fx
            .orchestrator()
            .initiate(&fx.identity, &fx.workspace.id, request("big.iso", 5 * MB))
            .await;
        assert!(matches!(result, Err(AppError::QuotaExceeded { .. })));
    }

    #[tokio::test]
    async fn abandoned_uploads_are_reclaimed_by_a_job() {
        let fx = Fixture::new(true).await;
        let orchestrator = fx.orchestrator();
        let ws = fx.workspace.id.clone();
        let ticket = orchestrator
            .initiate(&fx.identity, &ws, request("disk.img", 500 * MB))
            .await
            .unwrap();

        orchestrator
            .abandon(&fx.identity, &ws, &ticket.upload_id)
            .await
            .unwrap();

        let upload = session(&fx, &ticket.upload_id).await.unwrap();
        assert_eq!(upload.status, UploadStatus::Abandoned);
        assert_eq!(pending_jobs(&fx).await, 1);

        let ack = orchestrator
            .acknowledge_part(&fx.identity, &ws, &ticket.upload_id, 1, "etag")
            .await;
        assert!(matches!(ack, Err(AppError::NotFound(_))));
    }
}

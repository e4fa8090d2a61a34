//! In-memory storage backend and database fixture shared by the service tests.

use async_trait::async_trait;
use chrono::Utc;
use futures::stream;
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncReadExt;

use stowage_core::models::{Identity, Workspace};
use stowage_core::{StorageId, UploadThresholds, UserId, WorkspaceId};
use stowage_db::{Database, DatabaseSettings, WorkspaceRepository};
use stowage_storage::{
    BatchDeleteOutcome, CompletedUploadPart, DownloadStream, ObjectMetadata, PresignedOperation,
    PresignedRequest, Storage, StorageBackend, StorageCapabilities, StorageError, StorageRegistry,
    StorageResult, UploadReader,
};
use stowage_worker::JobNotifier;

use crate::access::WorkspaceStoreAccess;
use crate::upload::{UploadOrchestrator, UploadSettings};

pub(crate) const MB: u64 = 1024 * 1024;

fn etag_of(bytes: &[u8]) -> String {
    let mut hasher = DefaultHasher::new();
    bytes.hash(&mut hasher);
    format!("\"{:016x}\"", hasher.finish())
}

struct PendingMultipart {
    bucket: String,
    key: String,
    parts: BTreeMap<u32, Vec<u8>>,
}

#[derive(Default)]
struct MockState {
    objects: HashMap<(String, String), Vec<u8>>,
    multipart: HashMap<String, PendingMultipart>,
    aborted: Vec<String>,
    deleted: Vec<String>,
    deleted_buckets: Vec<String>,
    next_upload: u32,
}

/// Storage that keeps everything in memory. `native` toggles pre-signed URL support.
pub(crate) struct MockStorage {
    native: bool,
    state: Mutex<MockState>,
    /// Number of upcoming calls that fail with a transient error.
    transient_failures: AtomicU32,
}

impl MockStorage {
    pub(crate) fn new(native: bool) -> Self {
        Self {
            native,
            state: Mutex::new(MockState::default()),
            transient_failures: AtomicU32::new(0),
        }
    }

    pub(crate) fn fail_next(&self, times: u32) {
        self.transient_failures.store(times, Ordering::SeqCst);
    }

    fn check_transient(&self) -> StorageResult<()> {
        let remaining = self.transient_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.transient_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(StorageError::Transient("SlowDown".to_string()));
        }
        Ok(())
    }

    /// Simulate a client upload straight to the backend through a pre-signed URL.
    pub(crate) fn client_put(&self, bucket: &str, key: &str, bytes: Vec<u8>) -> String {
        let etag = etag_of(&bytes);
        self.state
            .lock()
            .unwrap()
            .objects
            .insert((bucket.to_string(), key.to_string()), bytes);
        etag
    }

    pub(crate) fn client_put_part(&self, upload_id: &str, part_number: u32, bytes: Vec<u8>) -> String {
        let etag = etag_of(&bytes);
        let mut state = self.state.lock().unwrap();
        let upload = state.multipart.get_mut(upload_id).unwrap();
        upload.parts.insert(part_number, bytes);
        etag
    }

    pub(crate) fn object(&self, bucket: &str, key: &str) -> Option<Vec<u8>> {
        self.state
            .lock()
            .unwrap()
            .objects
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
    }

    pub(crate) fn aborted(&self) -> Vec<String> {
        self.state.lock().unwrap().aborted.clone()
    }

    pub(crate) fn deleted(&self) -> Vec<String> {
        self.state.lock().unwrap().deleted.clone()
    }

    pub(crate) fn deleted_buckets(&self) -> Vec<String> {
        self.state.lock().unwrap().deleted_buckets.clone()
    }
}

#[async_trait]
impl Storage for MockStorage {
    fn backend_type(&self) -> StorageBackend {
        if self.native {
            StorageBackend::S3
        } else {
            StorageBackend::Local
        }
    }

    fn capabilities(&self) -> StorageCapabilities {
        StorageCapabilities {
            native_presigned_urls: self.native,
            min_part_size: if self.native { 5 * MB } else { 1 },
        }
    }

    async fn create_bucket(&self, _bucket: &str) -> StorageResult<()> {
        Ok(())
    }

    async fn delete_bucket(&self, bucket: &str) -> StorageResult<()> {
        self.check_transient()?;
        let mut state = self.state.lock().unwrap();
        state.objects.retain(|(b, _), _| b != bucket);
        state.deleted_buckets.push(bucket.to_string());
        Ok(())
    }

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        _content_type: &str,
        size: u64,
        mut reader: UploadReader,
    ) -> StorageResult<String> {
        let mut bytes = Vec::new();
        reader.read_to_end(&mut bytes).await?;
        if bytes.len() as u64 != size {
            return Err(StorageError::SizeMismatch {
                expected: size,
                actual: bytes.len() as u64,
            });
        }
        Ok(self.client_put(bucket, key, bytes))
    }

    async fn initiate_multipart(
        &self,
        bucket: &str,
        key: &str,
        _content_type: &str,
    ) -> StorageResult<String> {
        self.check_transient()?;
        let mut state = self.state.lock().unwrap();
        state.next_upload += 1;
        let upload_id = format!("mpu-{}", state.next_upload);
        state.multipart.insert(
            upload_id.clone(),
            PendingMultipart {
                bucket: bucket.to_string(),
                key: key.to_string(),
                parts: BTreeMap::new(),
            },
        );
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        _bucket: &str,
        _key: &str,
        upload_id: &str,
        part_number: u32,
        size: u64,
        mut reader: UploadReader,
    ) -> StorageResult<String> {
        let mut bytes = Vec::new();
        reader.read_to_end(&mut bytes).await?;
        if bytes.len() as u64 != size {
            return Err(StorageError::SizeMismatch {
                expected: size,
                actual: bytes.len() as u64,
            });
        }
        if !self.state.lock().unwrap().multipart.contains_key(upload_id) {
            return Err(StorageError::NotFound(format!("upload {}", upload_id)));
        }
        Ok(self.client_put_part(upload_id, part_number, bytes))
    }

    async fn complete_multipart(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[CompletedUploadPart],
    ) -> StorageResult<()> {
        self.check_transient()?;
        let mut state = self.state.lock().unwrap();
        let upload = state
            .multipart
            .get(upload_id)
            .ok_or_else(|| StorageError::NotFound(format!("upload {}", upload_id)))?;
        if upload.bucket != bucket || upload.key != key {
            return Err(StorageError::NotFound(format!("upload {}", upload_id)));
        }

        let mut assembled = Vec::new();
        for part in parts {
            let bytes = upload.parts.get(&part.part_number).ok_or_else(|| {
                StorageError::IntegrityMismatch(format!("part {} missing", part.part_number))
            })?;
            if etag_of(bytes).trim_matches('"') != part.etag.trim_matches('"') {
                return Err(StorageError::IntegrityMismatch(format!(
                    "part {} etag mismatch",
                    part.part_number
                )));
            }
            assembled.extend_from_slice(bytes);
        }

        state.multipart.remove(upload_id);
        state
            .objects
            .insert((bucket.to_string(), key.to_string()), assembled);
        Ok(())
    }

    async fn abort_multipart(&self, _bucket: &str, _key: &str, upload_id: &str) -> StorageResult<()> {
        let mut state = self.state.lock().unwrap();
        state.multipart.remove(upload_id);
        state.aborted.push(upload_id.to_string());
        Ok(())
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> StorageResult<()> {
        self.check_transient()?;
        let mut state = self.state.lock().unwrap();
        state.objects.remove(&(bucket.to_string(), key.to_string()));
        state.deleted.push(key.to_string());
        Ok(())
    }

    async fn delete_objects(&self, bucket: &str, keys: &[String]) -> StorageResult<BatchDeleteOutcome> {
        self.check_transient()?;
        let mut state = self.state.lock().unwrap();
        for key in keys {
            state.objects.remove(&(bucket.to_string(), key.clone()));
            state.deleted.push(key.clone());
        }
        Ok(BatchDeleteOutcome {
            deleted: keys.len(),
            failed: Vec::new(),
        })
    }

    async fn object_exists(&self, bucket: &str, key: &str) -> StorageResult<bool> {
        Ok(self.object(bucket, key).is_some())
    }

    async fn head_object(&self, bucket: &str, key: &str) -> StorageResult<ObjectMetadata> {
        self.check_transient()?;
        let bytes = self
            .object(bucket, key)
            .ok_or_else(|| StorageError::NotFound(format!("{}/{}", bucket, key)))?;
        Ok(ObjectMetadata {
            size: bytes.len() as u64,
            etag: etag_of(&bytes),
        })
    }

    async fn presigned_url(
        &self,
        bucket: &str,
        key: &str,
        operation: &PresignedOperation,
        expires_in: Duration,
    ) -> StorageResult<PresignedRequest> {
        let op = match operation {
            PresignedOperation::Get => "get".to_string(),
            PresignedOperation::Put { .. } => "put".to_string(),
            PresignedOperation::UploadPart {
                upload_id,
                part_number,
            } => format!("part&uploadId={}&partNumber={}", upload_id, part_number),
        };
        let mut request = PresignedRequest::new(format!(
            "https://objects.example/{}/{}?op={}&expires={}",
            bucket,
            key,
            op,
            expires_in.as_secs()
        ));
        if let PresignedOperation::Put { content_type } = operation {
            request
                .headers
                .insert("content-type".to_string(), content_type.clone());
        }
        Ok(request)
    }

    async fn download_stream(&self, bucket: &str, key: &str) -> StorageResult<DownloadStream> {
        let bytes = self
            .object(bucket, key)
            .ok_or_else(|| StorageError::NotFound(format!("{}/{}", bucket, key)))?;
        Ok(Box::pin(stream::once(async move { Ok(bytes.into()) })))
    }
}

/// Database, registry and one workspace on a mock backend.
pub(crate) struct Fixture {
    _dir: tempfile::TempDir,
    pub db: Database,
    pub storages: StorageRegistry,
    pub storage: Arc<MockStorage>,
    pub workspace: Workspace,
    pub identity: Identity,
    pub notifier: JobNotifier,
}

impl Fixture {
    pub(crate) async fn new(native: bool) -> Self {
        Self::with_quota(native, None).await
    }

    pub(crate) async fn with_quota(native: bool, max_size_bytes: Option<i64>) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(&DatabaseSettings::for_path(dir.path().join("stowage.db")))
            .await
            .unwrap();

        let storage = Arc::new(MockStorage::new(native));
        let storage_id = StorageId::new();
        let storages = StorageRegistry::new();
        storages.register(storage_id.clone(), storage.clone()).await;

        let workspace = Workspace {
            id: WorkspaceId::new(),
            name: "Design".to_string(),
            storage_id,
            bucket_name: "ws-design".to_string(),
            current_size_bytes: 0,
            max_size_bytes,
            created_at: Utc::now(),
        };
        let to_insert = workspace.clone();
        db.writer
            .execute(move |conn| {
                Box::pin(async move { WorkspaceRepository::insert(conn, &to_insert).await })
            })
            .await
            .unwrap();

        Self {
            _dir: dir,
            db,
            storages,
            storage,
            workspace,
            identity: Identity::User(UserId::new()),
            notifier: JobNotifier::new(),
        }
    }

    pub(crate) fn orchestrator(&self) -> UploadOrchestrator {
        self.orchestrator_with(UploadThresholds {
            direct_max_bytes: MB,
            single_chunk_max_bytes: 100 * MB,
            part_size_bytes: 50 * MB,
        })
    }

    pub(crate) fn orchestrator_with(&self, thresholds: UploadThresholds) -> UploadOrchestrator {
        UploadOrchestrator::new(
            self.db.clone(),
            self.storages.clone(),
            Arc::new(WorkspaceStoreAccess::new(self.db.clone())),
            self.notifier.clone(),
            UploadSettings {
                thresholds,
                presigned_url_ttl: Duration::from_secs(900),
                storage_retry_attempts: 3,
                public_base_url: "http://localhost:4000".to_string(),
            },
        )
    }
}

use crate::signing::{LocalUrlSigner, SignedOperation};
use crate::traits::{
    normalize_etag, BatchDeleteOutcome, CompletedUploadPart, DownloadStream, ObjectMetadata,
    PresignedOperation, PresignedRequest, Storage, StorageBackend, StorageCapabilities,
    StorageError, StorageResult, UploadReader,
};
use async_trait::async_trait;
use futures::StreamExt;
use sha2::{Digest, Sha256};
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio_util::io::ReaderStream;
use uuid::Uuid;

/// Staging area for multipart uploads, relative to the storage root.
const MULTIPART_DIR: &str = ".multipart";
/// Marker file recording which bucket/key a staged upload belongs to.
const TARGET_FILE: &str = "target";
const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// Local filesystem storage implementation
///
/// Buckets are directories under the root and objects are files. ETags are the hex
/// SHA-256 of the content. Multipart uploads stage each part under
/// `{root}/.multipart/{upload_id}/` and concatenate them on completion.
#[derive(Clone)]
pub struct LocalStorage {
    base_path: PathBuf,
    signer: LocalUrlSigner,
}

impl LocalStorage {
    /// Create a new LocalStorage instance
    ///
    /// # Arguments
    /// * `base_path` - Root directory for all buckets (e.g., "/var/lib/stowage")
    /// * `signer` - Signs the URLs served by the application's local-storage route
    pub async fn new(base_path: impl Into<PathBuf>, signer: LocalUrlSigner) -> StorageResult<Self> {
        let base_path = base_path.into();

        fs::create_dir_all(base_path.join(MULTIPART_DIR))
            .await
            .map_err(|e| {
                StorageError::ConfigError(format!(
                    "Failed to create storage directory {}: {}",
                    base_path.display(),
                    e
                ))
            })?;

        Ok(LocalStorage { base_path, signer })
    }

    fn validate_segment(kind: &str, value: &str) -> StorageResult<()> {
        if value.is_empty()
            || value.starts_with('.')
            || value.contains(['/', '\\'])
            || value.contains("..")
        {
            return Err(StorageError::InvalidKey(format!(
                "{} `{}` contains invalid characters",
                kind, value
            )));
        }
        Ok(())
    }

    fn bucket_path(&self, bucket: &str) -> StorageResult<PathBuf> {
        Self::validate_segment("bucket", bucket)?;
        Ok(self.base_path.join(bucket))
    }

    /// Convert bucket and key to a filesystem path with traversal validation.
    ///
    /// Keys may contain `/` separators but every component must be a plain name, so the
    /// result always stays inside the bucket directory.
    fn key_to_path(&self, bucket: &str, key: &str) -> StorageResult<PathBuf> {
        if key.is_empty() || key.contains("..") || key.starts_with('/') || key.contains('\\') {
            return Err(StorageError::InvalidKey(
                "Storage key contains invalid characters".to_string(),
            ));
        }
        let relative = Path::new(key);
        if !relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
        {
            return Err(StorageError::InvalidKey(
                "Storage key resolves outside storage directory".to_string(),
            ));
        }
        Ok(self.bucket_path(bucket)?.join(relative))
    }

    fn staging_dir(&self, upload_id: &str) -> StorageResult<PathBuf> {
        if upload_id.is_empty() || !upload_id.bytes().all(|b| b.is_ascii_hexdigit() || b == b'-')
        {
            return Err(StorageError::InvalidKey(format!(
                "invalid multipart upload id `{}`",
                upload_id
            )));
        }
        Ok(self.base_path.join(MULTIPART_DIR).join(upload_id))
    }

    fn part_file_name(part_number: u32) -> String {
        format!("{:05}", part_number)
    }

    fn target_marker(bucket: &str, key: &str) -> String {
        format!("{}\n{}", bucket, key)
    }

    /// Load the staging directory of `upload_id` and check it belongs to `bucket`/`key`.
    async fn staged_upload(&self, bucket: &str, key: &str, upload_id: &str) -> StorageResult<PathBuf> {
        let dir = self.staging_dir(upload_id)?;
        let marker = match fs::read_to_string(dir.join(TARGET_FILE)).await {
            Ok(marker) => marker,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageError::NotFound(format!(
                    "multipart upload {}",
                    upload_id
                )))
            }
            Err(e) => return Err(e.into()),
        };
        if marker != Self::target_marker(bucket, key) {
            return Err(StorageError::InvalidKey(format!(
                "multipart upload {} belongs to a different object",
                upload_id
            )));
        }
        Ok(dir)
    }

    async fn ensure_parent_dir(path: &Path) -> StorageResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    fn temp_path_for(path: &Path) -> PathBuf {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        path.with_file_name(format!(".{}.{}.tmp", name, Uuid::new_v4().simple()))
    }

    /// Stream exactly `size` bytes from `reader` into `path` atomically, returning the
    /// SHA-256 of what was written.
    async fn write_stream(path: &Path, size: u64, reader: UploadReader) -> StorageResult<String> {
        Self::ensure_parent_dir(path).await?;
        let temp_path = Self::temp_path_for(path);

        let result = async {
            let mut file = fs::File::create(&temp_path).await.map_err(|e| {
                StorageError::UploadFailed(format!(
                    "Failed to create file {}: {}",
                    temp_path.display(),
                    e
                ))
            })?;
            // One byte of slack so oversized bodies are detected without reading them fully.
            let mut limited = reader.take(size + 1);
            let mut hasher = Sha256::new();
            let mut buffer = vec![0u8; COPY_BUFFER_SIZE];
            let mut written = 0u64;
            loop {
                let n = limited.read(&mut buffer).await.map_err(|e| {
                    StorageError::UploadFailed(format!("Failed to read from stream: {}", e))
                })?;
                if n == 0 {
                    break;
                }
                written += n as u64;
                if written > size {
                    return Err(StorageError::SizeMismatch {
                        expected: size,
                        actual: written,
                    });
                }
                hasher.update(&buffer[..n]);
                file.write_all(&buffer[..n]).await.map_err(|e| {
                    StorageError::UploadFailed(format!(
                        "Failed to write file {}: {}",
                        temp_path.display(),
                        e
                    ))
                })?;
            }
            if written != size {
                return Err(StorageError::SizeMismatch {
                    expected: size,
                    actual: written,
                });
            }
            file.sync_all().await.map_err(|e| {
                StorageError::UploadFailed(format!(
                    "Failed to sync file {}: {}",
                    temp_path.display(),
                    e
                ))
            })?;
            Ok(hex::encode(hasher.finalize()))
        }
        .await;

        match result {
            Ok(etag) => {
                fs::rename(&temp_path, path).await?;
                Ok(etag)
            }
            Err(e) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(e)
            }
        }
    }

    async fn hash_file(path: &Path) -> StorageResult<(u64, String)> {
        let file = fs::File::open(path).await?;
        Self::hash_reader(file).await
    }

    async fn hash_reader(mut reader: impl AsyncRead + Unpin) -> StorageResult<(u64, String)> {
        let mut hasher = Sha256::new();
        let mut buffer = vec![0u8; COPY_BUFFER_SIZE];
        let mut total = 0u64;
        loop {
            let n = reader.read(&mut buffer).await?;
            if n == 0 {
                break;
            }
            total += n as u64;
            hasher.update(&buffer[..n]);
        }
        Ok((total, hex::encode(hasher.finalize())))
    }
}

#[async_trait]
impl Storage for LocalStorage {
    fn backend_type(&self) -> StorageBackend {
        StorageBackend::Local
    }

    fn capabilities(&self) -> StorageCapabilities {
        StorageCapabilities {
            native_presigned_urls: true,
            min_part_size: 1,
        }
    }

    async fn create_bucket(&self, bucket: &str) -> StorageResult<()> {
        let path = self.bucket_path(bucket)?;
        fs::create_dir_all(&path).await?;
        tracing::info!(bucket = %bucket, path = %path.display(), "Local bucket created");
        Ok(())
    }

    async fn delete_bucket(&self, bucket: &str) -> StorageResult<()> {
        let path = self.bucket_path(bucket)?;
        match fs::remove_dir_all(&path).await {
            Ok(()) => {
                tracing::info!(bucket = %bucket, "Local bucket deleted");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::DeleteFailed(format!(
                "Failed to delete bucket {}: {}",
                bucket, e
            ))),
        }
    }

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        _content_type: &str,
        size: u64,
        reader: UploadReader,
    ) -> StorageResult<String> {
        let path = self.key_to_path(bucket, key)?;
        let start = std::time::Instant::now();

        let etag = Self::write_stream(&path, size, reader).await?;

        tracing::info!(
            bucket = %bucket,
            key = %key,
            size_bytes = size,
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "Local storage upload successful"
        );

        Ok(etag)
    }

    async fn initiate_multipart(
        &self,
        bucket: &str,
        key: &str,
        _content_type: &str,
    ) -> StorageResult<String> {
        self.key_to_path(bucket, key)?;
        let upload_id = Uuid::new_v4().to_string();
        let dir = self.staging_dir(&upload_id)?;
        fs::create_dir_all(&dir).await?;
        fs::write(dir.join(TARGET_FILE), Self::target_marker(bucket, key)).await?;

        tracing::debug!(bucket = %bucket, key = %key, upload_id = %upload_id, "Local multipart upload initiated");
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: u32,
        size: u64,
        reader: UploadReader,
    ) -> StorageResult<String> {
        if part_number == 0 {
            return Err(StorageError::InvalidKey("part numbers start at 1".to_string()));
        }
        let dir = self.staged_upload(bucket, key, upload_id).await?;
        let path = dir.join(Self::part_file_name(part_number));
        let start = std::time::Instant::now();

        let etag = Self::write_stream(&path, size, reader).await?;

        tracing::info!(
            bucket = %bucket,
            key = %key,
            upload_id = %upload_id,
            part_number = part_number,
            size_bytes = size,
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "Local storage part upload successful"
        );

        Ok(etag)
    }

    async fn complete_multipart(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[CompletedUploadPart],
    ) -> StorageResult<()> {
        let dir = self.staged_upload(bucket, key, upload_id).await?;
        let target = self.key_to_path(bucket, key)?;
        if parts.is_empty() {
            return Err(StorageError::IntegrityMismatch(
                "multipart upload has no parts".to_string(),
            ));
        }
        if parts.windows(2).any(|w| w[0].part_number >= w[1].part_number) {
            return Err(StorageError::IntegrityMismatch(
                "parts must be listed in ascending order".to_string(),
            ));
        }

        let start = std::time::Instant::now();
        Self::ensure_parent_dir(&target).await?;
        let temp_path = Self::temp_path_for(&target);

        let assembled = async {
            let mut output = fs::File::create(&temp_path).await?;
            let mut total = 0u64;
            let mut buffer = vec![0u8; COPY_BUFFER_SIZE];
            for part in parts {
                let part_path = dir.join(Self::part_file_name(part.part_number));
                let mut input = match fs::File::open(&part_path).await {
                    Ok(file) => file,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        return Err(StorageError::IntegrityMismatch(format!(
                            "part {} was never uploaded",
                            part.part_number
                        )))
                    }
                    Err(e) => return Err(e.into()),
                };
                let mut hasher = Sha256::new();
                loop {
                    let n = input.read(&mut buffer).await?;
                    if n == 0 {
                        break;
                    }
                    hasher.update(&buffer[..n]);
                    output.write_all(&buffer[..n]).await?;
                    total += n as u64;
                }
                let actual = hex::encode(hasher.finalize());
                if actual != normalize_etag(&part.etag) {
                    return Err(StorageError::IntegrityMismatch(format!(
                        "ETag mismatch for part {}",
                        part.part_number
                    )));
                }
            }
            output.sync_all().await?;
            Ok(total)
        }
        .await;

        let total = match assembled {
            Ok(total) => total,
            Err(e) => {
                let _ = fs::remove_file(&temp_path).await;
                return Err(e);
            }
        };

        fs::rename(&temp_path, &target).await?;
        if let Err(e) = fs::remove_dir_all(&dir).await {
            tracing::warn!(error = %e, upload_id = %upload_id, "Failed to remove multipart staging directory");
        }

        tracing::info!(
            bucket = %bucket,
            key = %key,
            upload_id = %upload_id,
            parts = parts.len(),
            size_bytes = total,
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "Local multipart upload completed"
        );

        Ok(())
    }

    async fn abort_multipart(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> StorageResult<()> {
        let dir = match self.staged_upload(bucket, key, upload_id).await {
            Ok(dir) => dir,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e),
        };
        match fs::remove_dir_all(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        tracing::debug!(bucket = %bucket, key = %key, upload_id = %upload_id, "Local multipart upload aborted");
        Ok(())
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> StorageResult<()> {
        let path = self.key_to_path(bucket, key)?;
        let start = std::time::Instant::now();

        match fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => {
                return Err(StorageError::DeleteFailed(format!(
                    "Failed to delete file {}: {}",
                    path.display(),
                    e
                )))
            }
        }

        tracing::info!(
            bucket = %bucket,
            key = %key,
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "Local storage delete successful"
        );

        Ok(())
    }

    async fn delete_objects(
        &self,
        bucket: &str,
        keys: &[String],
    ) -> StorageResult<BatchDeleteOutcome> {
        let mut outcome = BatchDeleteOutcome::default();
        for key in keys {
            match self.delete_object(bucket, key).await {
                Ok(()) => outcome.deleted += 1,
                Err(e) => outcome.failed.push((key.clone(), e.to_string())),
            }
        }
        Ok(outcome)
    }

    async fn object_exists(&self, bucket: &str, key: &str) -> StorageResult<bool> {
        let path = self.key_to_path(bucket, key)?;
        Ok(fs::try_exists(&path).await?)
    }

    async fn head_object(&self, bucket: &str, key: &str) -> StorageResult<ObjectMetadata> {
        let path = self.key_to_path(bucket, key)?;
        match Self::hash_file(&path).await {
            Ok((size, etag)) => Ok(ObjectMetadata { size, etag }),
            Err(e) if e.is_not_found() => Err(StorageError::NotFound(format!("{}/{}", bucket, key))),
            Err(e) => Err(e),
        }
    }

    async fn presigned_url(
        &self,
        bucket: &str,
        key: &str,
        operation: &PresignedOperation,
        expires_in: Duration,
    ) -> StorageResult<PresignedRequest> {
        self.key_to_path(bucket, key)?;
        let signed = match operation {
            PresignedOperation::Get => SignedOperation::Get,
            PresignedOperation::Put { .. } => SignedOperation::Put,
            PresignedOperation::UploadPart {
                upload_id,
                part_number,
            } => SignedOperation::UploadPart {
                upload_id: upload_id.clone(),
                part_number: *part_number,
            },
        };
        let ttl = chrono::Duration::from_std(expires_in)
            .map_err(|e| StorageError::ConfigError(format!("invalid URL lifetime: {}", e)))?;
        let url = self
            .signer
            .sign(&signed, bucket, key, chrono::Utc::now() + ttl)?;
        Ok(PresignedRequest::new(url))
    }

    async fn download_stream(&self, bucket: &str, key: &str) -> StorageResult<DownloadStream> {
        let path = self.key_to_path(bucket, key)?;
        let file = match fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageError::NotFound(format!("{}/{}", bucket, key)))
            }
            Err(e) => return Err(e.into()),
        };
        let stream = ReaderStream::new(file)
            .map(|result| result.map_err(|e| StorageError::DownloadFailed(e.to_string())));
        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;
    use std::io::Cursor;

    async fn storage() -> (tempfile::TempDir, LocalStorage) {
        let dir = tempfile::tempdir().unwrap();
        let signer = LocalUrlSigner::new("test-secret", "http://localhost:4000");
        let storage = LocalStorage::new(dir.path(), signer).await.unwrap();
        storage.create_bucket("bucket").await.unwrap();
        (dir, storage)
    }

    fn body(data: &[u8]) -> UploadReader {
        Box::pin(Cursor::new(data.to_vec()))
    }

    fn sha256_hex(data: &[u8]) -> String {
        hex::encode(Sha256::digest(data))
    }

    #[tokio::test]
    async fn put_returns_content_hash_and_head_agrees() {
        let (_dir, storage) = storage().await;
        let etag = storage
            .put_object("bucket", "fi_a_s", "text/plain", 5, body(b"hello"))
            .await
            .unwrap();
        assert_eq!(etag, sha256_hex(b"hello"));

        let head = storage.head_object("bucket", "fi_a_s").await.unwrap();
        assert_eq!(head, ObjectMetadata { size: 5, etag });
        assert!(storage.object_exists("bucket", "fi_a_s").await.unwrap());
    }

    #[tokio::test]
    async fn put_rejects_size_mismatch_and_leaves_nothing_behind() {
        let (_dir, storage) = storage().await;
        let err = storage
            .put_object("bucket", "k", "text/plain", 10, body(b"short"))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::SizeMismatch { expected: 10, actual: 5 }));

        let err = storage
            .put_object("bucket", "k", "text/plain", 2, body(b"too long"))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::SizeMismatch { expected: 2, .. }));
        assert!(!storage.object_exists("bucket", "k").await.unwrap());
    }

    #[tokio::test]
    async fn multipart_concatenates_parts_in_order() {
        let (_dir, storage) = storage().await;
        let upload_id = storage
            .initiate_multipart("bucket", "big", "application/octet-stream")
            .await
            .unwrap();

        // Upload out of order; completion orders by part number.
        let e2 = storage
            .upload_part("bucket", "big", &upload_id, 2, 5, body(b"world"))
            .await
            .unwrap();
        let e1 = storage
            .upload_part("bucket", "big", &upload_id, 1, 6, body(b"hello "))
            .await
            .unwrap();

        storage
            .complete_multipart(
                "bucket",
                "big",
                &upload_id,
                &[
                    CompletedUploadPart { part_number: 1, etag: e1 },
                    CompletedUploadPart { part_number: 2, etag: format!("\"{}\"", e2) },
                ],
            )
            .await
            .unwrap();

        let content: Vec<u8> = storage
            .download_stream("bucket", "big")
            .await
            .unwrap()
            .try_fold(Vec::new(), |mut acc, chunk| async move {
                acc.extend_from_slice(&chunk);
                Ok(acc)
            })
            .await
            .unwrap();
        assert_eq!(content, b"hello world");

        // Staging area is gone, so aborting afterwards is a no-op.
        storage.abort_multipart("bucket", "big", &upload_id).await.unwrap();
    }

    #[tokio::test]
    async fn multipart_completion_verifies_etags() {
        let (_dir, storage) = storage().await;
        let upload_id = storage
            .initiate_multipart("bucket", "obj", "text/plain")
            .await
            .unwrap();
        storage
            .upload_part("bucket", "obj", &upload_id, 1, 3, body(b"abc"))
            .await
            .unwrap();

        let err = storage
            .complete_multipart(
                "bucket",
                "obj",
                &upload_id,
                &[CompletedUploadPart { part_number: 1, etag: "bogus".into() }],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::IntegrityMismatch(_)));
        assert!(!storage.object_exists("bucket", "obj").await.unwrap());

        let err = storage
            .complete_multipart(
                "bucket",
                "obj",
                &upload_id,
                &[
                    CompletedUploadPart { part_number: 1, etag: sha256_hex(b"abc") },
                    CompletedUploadPart { part_number: 2, etag: "x".into() },
                ],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::IntegrityMismatch(_)));
    }

    #[tokio::test]
    async fn upload_ids_are_bound_to_their_object() {
        let (_dir, storage) = storage().await;
        let upload_id = storage
            .initiate_multipart("bucket", "a", "text/plain")
            .await
            .unwrap();
        let err = storage
            .upload_part("bucket", "b", &upload_id, 1, 1, body(b"x"))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::InvalidKey(_)));
    }

    #[tokio::test]
    async fn deletes_are_idempotent() {
        let (_dir, storage) = storage().await;
        storage.delete_object("bucket", "missing").await.unwrap();
        storage
            .put_object("bucket", "present", "text/plain", 1, body(b"x"))
            .await
            .unwrap();

        let outcome = storage
            .delete_objects("bucket", &["present".to_string(), "missing".to_string()])
            .await
            .unwrap();
        assert_eq!(outcome.deleted, 2);
        assert!(outcome.failed.is_empty());

        storage.delete_bucket("bucket").await.unwrap();
        storage.delete_bucket("bucket").await.unwrap();
        storage.abort_multipart("bucket", "k", &Uuid::new_v4().to_string()).await.unwrap();
    }

    #[tokio::test]
    async fn traversal_is_rejected() {
        let (_dir, storage) = storage().await;
        for key in ["../escape", "/etc/passwd", "a/../../b", "a\\b"] {
            let err = storage.object_exists("bucket", key).await.unwrap_err();
            assert!(matches!(err, StorageError::InvalidKey(_)), "{}", key);
        }
        assert!(storage.create_bucket(".multipart").await.is_err());
        assert!(storage.create_bucket("a/b").await.is_err());
    }

    #[tokio::test]
    async fn head_of_missing_object_is_not_found() {
        let (_dir, storage) = storage().await;
        let err = storage.head_object("bucket", "nope").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn presigned_urls_point_at_the_application() {
        let (_dir, storage) = storage().await;
        let request = storage
            .presigned_url(
                "bucket",
                "fi_x_y",
                &PresignedOperation::UploadPart {
                    upload_id: "abc".into(),
                    part_number: 3,
                },
                Duration::from_secs(60),
            )
            .await
            .unwrap();
        let url = request.url;
        assert!(url.starts_with("http://localhost:4000/api/local-storage/bucket/fi_x_y?op=part"));
        assert!(url.contains("&part=3"));
        assert!(url.contains("&signature="));
        assert!(request.headers.is_empty());
        assert!(storage.capabilities().native_presigned_urls);
    }
}

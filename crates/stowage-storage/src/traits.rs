//! Storage abstraction trait
//!
//! This module defines the Storage trait that all storage backends must implement.

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncRead;

use stowage_core::AppError;

/// Storage operation errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Upload failed: {0}")]
    UploadFailed(String),

    #[error("Download failed: {0}")]
    DownloadFailed(String),

    #[error("Delete failed: {0}")]
    DeleteFailed(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid storage key: {0}")]
    InvalidKey(String),

    #[error("Expected {expected} bytes, received {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("Integrity check failed: {0}")]
    IntegrityMismatch(String),

    /// Timeouts, throttling and provider-side 5xx. Safe to retry with backoff.
    #[error("Transient storage error: {0}")]
    Transient(String),

    #[error("Storage backend error: {0}")]
    BackendError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl StorageError {
    pub fn is_transient(&self) -> bool {
        match self {
            StorageError::Transient(_) => true,
            StorageError::IoError(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut | std::io::ErrorKind::Interrupted
            ),
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            StorageError::NotFound(_) => true,
            StorageError::IoError(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

impl From<StorageError> for AppError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound(what) => AppError::NotFound(what),
            StorageError::InvalidKey(msg) => AppError::InvalidInput(msg),
            StorageError::SizeMismatch { .. } => AppError::InvalidInput(err.to_string()),
            StorageError::IntegrityMismatch(msg) => AppError::StorageCompletionFailed(msg),
            e if e.is_transient() => AppError::StorageUnavailable(e.to_string()),
            other => AppError::Storage(other.to_string()),
        }
    }
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Body of an upload, consumed until EOF.
pub type UploadReader = Pin<Box<dyn AsyncRead + Send + Unpin>>;

/// Streaming download body.
pub type DownloadStream = Pin<Box<dyn Stream<Item = Result<Bytes, StorageError>> + Send>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageBackend {
    S3,
    Local,
}

impl Display for StorageBackend {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            StorageBackend::S3 => write!(f, "s3"),
            StorageBackend::Local => write!(f, "local"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageCapabilities {
    /// Whether clients can transfer bytes straight to the backend with a signed URL.
    /// Without it, uploads are streamed through the application.
    pub native_presigned_urls: bool,
    /// Smallest allowed size of every multipart part except the last.
    pub min_part_size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMetadata {
    pub size: u64,
    pub etag: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedUploadPart {
    pub part_number: u32,
    pub etag: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresignedOperation {
    Get,
    Put { content_type: String },
    UploadPart { upload_id: String, part_number: u32 },
}

/// A signed URL plus the headers the client must send with it. Signed headers that are
/// missing or changed invalidate the signature.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PresignedRequest {
    pub url: String,
    pub headers: BTreeMap<String, String>,
}

impl PresignedRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: BTreeMap::new(),
        }
    }
}

/// Result of a batched delete. Keys that were already gone count as deleted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchDeleteOutcome {
    pub deleted: usize,
    /// `(key, reason)` for every key the backend refused to delete.
    pub failed: Vec<(String, String)>,
}

impl BatchDeleteOutcome {
    pub fn merge(&mut self, other: BatchDeleteOutcome) {
        self.deleted += other.deleted;
        self.failed.extend(other.failed);
    }
}

/// Strip the surrounding quotes S3 puts around ETags.
pub fn normalize_etag(etag: &str) -> &str {
    etag.trim().trim_matches('"')
}

/// Storage abstraction trait
///
/// All storage backends (S3, local filesystem) implement this trait. Callers retry
/// [`StorageError::is_transient`] failures; backends never retry internally beyond what
/// their client library does.
#[async_trait]
pub trait Storage: Send + Sync {
    fn backend_type(&self) -> StorageBackend;

    fn capabilities(&self) -> StorageCapabilities;

    /// Create a bucket. Creating a bucket that already exists succeeds.
    async fn create_bucket(&self, bucket: &str) -> StorageResult<()>;

    /// Empty and remove a bucket. A missing bucket is success.
    async fn delete_bucket(&self, bucket: &str) -> StorageResult<()>;

    /// Single-shot write of exactly `size` bytes. Returns the object's ETag.
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        content_type: &str,
        size: u64,
        reader: UploadReader,
    ) -> StorageResult<String>;

    /// Start a multipart upload and return its upload id.
    async fn initiate_multipart(
        &self,
        bucket: &str,
        key: &str,
        content_type: &str,
    ) -> StorageResult<String>;

    /// Write one part of a multipart upload. Returns the part's ETag.
    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: u32,
        size: u64,
        reader: UploadReader,
    ) -> StorageResult<String>;

    /// Assemble the object from `parts`, which must be ordered by part number.
    /// A part whose ETag does not match what was stored fails with `IntegrityMismatch`.
    async fn complete_multipart(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[CompletedUploadPart],
    ) -> StorageResult<()>;

    /// Abort a multipart upload. Aborting an unknown upload succeeds.
    async fn abort_multipart(&self, bucket: &str, key: &str, upload_id: &str)
        -> StorageResult<()>;

    /// Delete an object. Deleting a missing object succeeds.
    async fn delete_object(&self, bucket: &str, key: &str) -> StorageResult<()>;

    /// Delete many objects, batching provider calls.
    async fn delete_objects(&self, bucket: &str, keys: &[String])
        -> StorageResult<BatchDeleteOutcome>;

    async fn object_exists(&self, bucket: &str, key: &str) -> StorageResult<bool>;

    async fn head_object(&self, bucket: &str, key: &str) -> StorageResult<ObjectMetadata>;

    /// Time-limited URL that authorizes `operation` on `key` without other credentials.
    async fn presigned_url(
        &self,
        bucket: &str,
        key: &str,
        operation: &PresignedOperation,
        expires_in: Duration,
    ) -> StorageResult<PresignedRequest>;

    async fn download_stream(&self, bucket: &str, key: &str) -> StorageResult<DownloadStream>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn etags_compare_without_quotes() {
        assert_eq!(normalize_etag("\"abc123\""), "abc123");
        assert_eq!(normalize_etag("abc123"), "abc123");
    }

    #[test]
    fn transient_errors_map_to_unavailable() {
        let err: AppError = StorageError::Transient("SlowDown".into()).into();
        assert!(matches!(err, AppError::StorageUnavailable(_)));
        let err: AppError = StorageError::IntegrityMismatch("part 3".into()).into();
        assert!(matches!(err, AppError::StorageCompletionFailed(_)));
        let err: AppError = StorageError::NotFound("k".into()).into();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[test]
    fn io_not_found_counts_as_not_found() {
        let err = StorageError::IoError(std::io::Error::from(std::io::ErrorKind::NotFound));
        assert!(err.is_not_found());
        assert!(!err.is_transient());
    }
}

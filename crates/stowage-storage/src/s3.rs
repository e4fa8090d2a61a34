use crate::traits::{
    BatchDeleteOutcome, CompletedUploadPart, DownloadStream, ObjectMetadata, PresignedOperation,
    PresignedRequest, Storage, StorageBackend, StorageCapabilities, StorageError, StorageResult,
    UploadReader,
};
use async_trait::async_trait;
use aws_config::meta::region::RegionProviderChain;
use aws_config::retry::RetryConfig;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::config::Credentials;
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{
    BucketLocationConstraint, CompletedMultipartUpload, CompletedPart, CreateBucketConfiguration,
    Delete, ObjectIdentifier, ServerSideEncryption,
};
use aws_sdk_s3::Client;
use bytes::Bytes;
use futures::StreamExt;
use std::time::Duration;
use stowage_core::models::EncryptionMode;
use tokio::io::AsyncReadExt;
use tokio_util::io::ReaderStream;

/// Smallest part size S3 accepts for every part but the last.
const S3_MIN_PART_SIZE: u64 = 5 * 1024 * 1024;
/// DeleteObjects accepts at most this many keys per request.
const DELETE_BATCH_SIZE: usize = 1000;
/// Upfront buffer for single-request bodies.
const READ_BODY_INITIAL_CAPACITY: u64 = 8 * 1024 * 1024;

const TRANSIENT_CODES: &[&str] = &[
    "SlowDown",
    "Throttling",
    "ThrottlingException",
    "RequestTimeout",
    "RequestTimeTooSkewed",
    "InternalError",
    "ServiceUnavailable",
];
const NOT_FOUND_CODES: &[&str] = &["NoSuchKey", "NotFound", "NoSuchUpload", "NoSuchBucket"];
const INTEGRITY_CODES: &[&str] = &["InvalidPart", "InvalidPartOrder", "EntityTooSmall"];

/// Classify an SDK failure so callers can tell retryable conditions from permanent ones.
fn map_sdk_error<E>(err: SdkError<E, HttpResponse>, operation: &str) -> StorageError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    let code = err.code().map(str::to_string);
    let status = err.raw_response().map(|r| r.status().as_u16());
    let message = format!("{}: {}", operation, DisplayErrorContext(&err));

    if matches!(
        err,
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_)
    ) {
        return StorageError::Transient(message);
    }
    if let Some(code) = code.as_deref() {
        if TRANSIENT_CODES.contains(&code) {
            return StorageError::Transient(message);
        }
        if NOT_FOUND_CODES.contains(&code) {
            return StorageError::NotFound(message);
        }
        if INTEGRITY_CODES.contains(&code) {
            return StorageError::IntegrityMismatch(message);
        }
    }
    match status {
        Some(404) => StorageError::NotFound(message),
        Some(s) if s >= 500 || s == 429 => StorageError::Transient(message),
        _ => StorageError::BackendError(message),
    }
}

fn error_code<E>(err: &SdkError<E, HttpResponse>) -> Option<&str>
where
    E: ProvideErrorMetadata,
{
    err.code()
}

/// SDK-level retries stay off. Transient failures surface as `StorageError::Transient` and
/// the orchestrator or the job queue decides whether to try again.
fn sdk_retry_config() -> RetryConfig {
    RetryConfig::disabled()
}

/// S3 storage implementation
///
/// One client serves every bucket on the configured account or endpoint.
#[derive(Clone)]
pub struct S3Storage {
    client: Client,
    region: String,
    encryption: EncryptionMode,
}

impl S3Storage {
    /// Create a new S3Storage instance
    ///
    /// # Arguments
    /// * `region` - AWS region (or region identifier for S3-compatible providers)
    /// * `endpoint_url` - Optional custom endpoint URL for S3-compatible providers
    ///   (e.g., "http://localhost:9000" for MinIO, "https://nyc3.digitaloceanspaces.com" for DigitalOcean Spaces)
    /// * `credentials` - Explicit access key pair; the default provider chain is used otherwise
    /// * `encryption` - Server-side encryption applied to objects written through this client
    pub async fn new(
        region: String,
        endpoint_url: Option<String>,
        credentials: Option<(String, String)>,
        encryption: EncryptionMode,
    ) -> StorageResult<Self> {
        let region_provider =
            RegionProviderChain::first_try(aws_config::Region::new(region.clone()));

        let retry_config = sdk_retry_config();

        let mut config_builder = aws_config::defaults(BehaviorVersion::latest())
            .region(region_provider)
            .retry_config(retry_config.clone());

        if let Some((access_key_id, secret_access_key)) = credentials {
            config_builder = config_builder.credentials_provider(Credentials::new(
                access_key_id,
                secret_access_key,
                None,
                None,
                "stowage",
            ));
        }

        let config = config_builder.load().await;

        let client = if let Some(ref endpoint) = endpoint_url {
            // S3-compatible providers (MinIO and friends) need path-style addressing.
            let mut s3_config_builder = aws_sdk_s3::Config::builder()
                .behavior_version(BehaviorVersion::latest())
                .endpoint_url(endpoint)
                .region(config.region().cloned())
                .retry_config(retry_config)
                .force_path_style(true);
            if let Some(provider) = config.credentials_provider() {
                s3_config_builder = s3_config_builder.credentials_provider(provider);
            }
            Client::from_conf(s3_config_builder.build())
        } else {
            Client::new(&config)
        };

        tracing::info!(
            region = %region,
            endpoint = ?endpoint_url,
            encryption = %encryption,
            "S3 storage client initialized"
        );

        Ok(S3Storage {
            client,
            region,
            encryption,
        })
    }

    fn sse(&self) -> Option<ServerSideEncryption> {
        match self.encryption {
            EncryptionMode::ServerSide => Some(ServerSideEncryption::Aes256),
            EncryptionMode::None => None,
        }
    }

    fn presigning_config(expires_in: Duration) -> StorageResult<PresigningConfig> {
        PresigningConfig::builder()
            .expires_in(expires_in)
            .build()
            .map_err(|e| StorageError::BackendError(e.to_string()))
    }

    /// Buffer exactly `size` bytes of the body. Larger payloads go through multipart.
    async fn read_body(size: u64, reader: UploadReader) -> StorageResult<Bytes> {
        // The declared size is client input; grow past this only as bytes arrive.
        let capacity = size.min(READ_BODY_INITIAL_CAPACITY) as usize;
        let mut buffer = Vec::with_capacity(capacity);
        let mut limited = reader.take(size.saturating_add(1));
        limited.read_to_end(&mut buffer).await.map_err(|e| {
            StorageError::UploadFailed(format!("Failed to read from stream: {}", e))
        })?;
        if buffer.len() as u64 != size {
            return Err(StorageError::SizeMismatch {
                expected: size,
                actual: buffer.len() as u64,
            });
        }
        Ok(Bytes::from(buffer))
    }

    async fn delete_batch(&self, bucket: &str, keys: &[String]) -> StorageResult<BatchDeleteOutcome> {
        let objects = keys
            .iter()
            .map(|key| ObjectIdentifier::builder().key(key).build())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| StorageError::InvalidKey(e.to_string()))?;
        let delete = Delete::builder()
            .set_objects(Some(objects))
            .quiet(true)
            .build()
            .map_err(|e| StorageError::BackendError(e.to_string()))?;

        let output = self
            .client
            .delete_objects()
            .bucket(bucket)
            .delete(delete)
            .send()
            .await
            .map_err(|e| map_sdk_error(e, "DeleteObjects"))?;

        let mut outcome = BatchDeleteOutcome::default();
        for error in output.errors() {
            if error.code() == Some("NoSuchKey") {
                continue;
            }
            outcome.failed.push((
                error.key().unwrap_or_default().to_string(),
                format!(
                    "{}: {}",
                    error.code().unwrap_or("Unknown"),
                    error.message().unwrap_or_default()
                ),
            ));
        }
        outcome.deleted = keys.len() - outcome.failed.len();
        Ok(outcome)
    }

    async fn abort_pending_uploads(&self, bucket: &str) -> StorageResult<()> {
        let mut key_marker: Option<String> = None;
        let mut upload_id_marker: Option<String> = None;
        loop {
            let page = self
                .client
                .list_multipart_uploads()
                .bucket(bucket)
                .set_key_marker(key_marker.take())
                .set_upload_id_marker(upload_id_marker.take())
                .send()
                .await
                .map_err(|e| map_sdk_error(e, "ListMultipartUploads"))?;

            for upload in page.uploads() {
                if let (Some(key), Some(upload_id)) = (upload.key(), upload.upload_id()) {
                    self.abort_multipart(bucket, key, upload_id).await?;
                }
            }

            if !page.is_truncated().unwrap_or(false) {
                return Ok(());
            }
            key_marker = page.next_key_marker().map(str::to_string);
            upload_id_marker = page.next_upload_id_marker().map(str::to_string);
        }
    }
}

#[async_trait]
impl Storage for S3Storage {
    fn backend_type(&self) -> StorageBackend {
        StorageBackend::S3
    }

    fn capabilities(&self) -> StorageCapabilities {
        StorageCapabilities {
            native_presigned_urls: true,
            min_part_size: S3_MIN_PART_SIZE,
        }
    }

    async fn create_bucket(&self, bucket: &str) -> StorageResult<()> {
        let mut request = self.client.create_bucket().bucket(bucket);
        // us-east-1 rejects an explicit location constraint.
        if self.region != "us-east-1" {
            request = request.create_bucket_configuration(
                CreateBucketConfiguration::builder()
                    .location_constraint(BucketLocationConstraint::from(self.region.as_str()))
                    .build(),
            );
        }

        match request.send().await {
            Ok(_) => {}
            Err(e) if matches!(error_code(&e), Some("BucketAlreadyOwnedByYou")) => {}
            Err(e) => return Err(map_sdk_error(e, "CreateBucket")),
        }

        tracing::info!(bucket = %bucket, region = %self.region, "S3 bucket created");
        Ok(())
    }

    async fn delete_bucket(&self, bucket: &str) -> StorageResult<()> {
        let start = std::time::Instant::now();
        let mut continuation: Option<String> = None;
        let mut removed = 0usize;

        loop {
            let page = match self
                .client
                .list_objects_v2()
                .bucket(bucket)
                .set_continuation_token(continuation.take())
                .send()
                .await
            {
                Ok(page) => page,
                Err(e) if matches!(error_code(&e), Some("NoSuchBucket")) => return Ok(()),
                Err(e) => return Err(map_sdk_error(e, "ListObjectsV2")),
            };

            let keys: Vec<String> = page
                .contents()
                .iter()
                .filter_map(|object| object.key().map(str::to_string))
                .collect();
            if !keys.is_empty() {
                let outcome = self.delete_batch(bucket, &keys).await?;
                if let Some((key, reason)) = outcome.failed.first() {
                    return Err(StorageError::DeleteFailed(format!(
                        "could not empty bucket {}: {} ({})",
                        bucket, key, reason
                    )));
                }
                removed += outcome.deleted;
            }

            if !page.is_truncated().unwrap_or(false) {
                break;
            }
            continuation = page.next_continuation_token().map(str::to_string);
        }

        self.abort_pending_uploads(bucket).await?;

        match self.client.delete_bucket().bucket(bucket).send().await {
            Ok(_) => {}
            Err(e) if matches!(error_code(&e), Some("NoSuchBucket")) => {}
            Err(e) => return Err(map_sdk_error(e, "DeleteBucket")),
        }

        tracing::info!(
            bucket = %bucket,
            objects_removed = removed,
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "S3 bucket deleted"
        );
        Ok(())
    }

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        content_type: &str,
        size: u64,
        reader: UploadReader,
    ) -> StorageResult<String> {
        let body = Self::read_body(size, reader).await?;
        let start = std::time::Instant::now();

        let output = self
            .client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(ByteStream::from(body))
            .content_type(content_type)
            .set_server_side_encryption(self.sse())
            .send()
            .await
            .map_err(|e| {
                tracing::error!(
                    error = %DisplayErrorContext(&e),
                    bucket = %bucket,
                    key = %key,
                    size_bytes = size,
                    duration_ms = start.elapsed().as_secs_f64() * 1000.0,
                    "S3 upload failed"
                );
                map_sdk_error(e, "PutObject")
            })?;

        tracing::info!(
            bucket = %bucket,
            key = %key,
            size_bytes = size,
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "S3 upload successful"
        );

        output
            .e_tag()
            .map(str::to_string)
            .ok_or_else(|| StorageError::UploadFailed("No ETag returned from S3".to_string()))
    }

    async fn initiate_multipart(
        &self,
        bucket: &str,
        key: &str,
        content_type: &str,
    ) -> StorageResult<String> {
        let output = self
            .client
            .create_multipart_upload()
            .bucket(bucket)
            .key(key)
            .content_type(content_type)
            .set_server_side_encryption(self.sse())
            .send()
            .await
            .map_err(|e| {
                tracing::error!(
                    error = %DisplayErrorContext(&e),
                    bucket = %bucket,
                    key = %key,
                    "Failed to create multipart upload"
                );
                map_sdk_error(e, "CreateMultipartUpload")
            })?;

        output
            .upload_id()
            .map(str::to_string)
            .ok_or_else(|| StorageError::UploadFailed("No upload ID returned from S3".to_string()))
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
        let body = Self::read_body(size, reader).await?;
        let start = std::time::Instant::now();

        let output = self
            .client
            .upload_part()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number as i32)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| {
                tracing::error!(
                    error = %DisplayErrorContext(&e),
                    bucket = %bucket,
                    key = %key,
                    part_number = part_number,
                    "Failed to upload part"
                );
                map_sdk_error(e, "UploadPart")
            })?;

        tracing::debug!(
            bucket = %bucket,
            key = %key,
            part_number = part_number,
            size_bytes = size,
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "S3 part upload successful"
        );

        output.e_tag().map(str::to_string).ok_or_else(|| {
            StorageError::UploadFailed(format!("No ETag returned for part {}", part_number))
        })
    }

    async fn complete_multipart(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[CompletedUploadPart],
    ) -> StorageResult<()> {
        let start = std::time::Instant::now();
        let completed: Vec<CompletedPart> = parts
            .iter()
            .map(|part| {
                CompletedPart::builder()
                    .part_number(part.part_number as i32)
                    .e_tag(&part.etag)
                    .build()
            })
            .collect();

        self.client
            .complete_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(completed))
                    .build(),
            )
            .send()
            .await
            .map_err(|e| {
                tracing::error!(
                    error = %DisplayErrorContext(&e),
                    bucket = %bucket,
                    key = %key,
                    upload_id = %upload_id,
                    "Failed to complete multipart upload"
                );
                map_sdk_error(e, "CompleteMultipartUpload")
            })?;

        tracing::info!(
            bucket = %bucket,
            key = %key,
            parts = parts.len(),
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "S3 multipart upload completed"
        );
        Ok(())
    }

    async fn abort_multipart(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> StorageResult<()> {
        match self
            .client
            .abort_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
        {
            Ok(_) => {
                tracing::debug!(bucket = %bucket, key = %key, upload_id = %upload_id, "S3 multipart upload aborted");
                Ok(())
            }
            Err(e) => match map_sdk_error(e, "AbortMultipartUpload") {
                err if err.is_not_found() => Ok(()),
                err => Err(err),
            },
        }
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> StorageResult<()> {
        let start = std::time::Instant::now();

        match self
            .client
            .delete_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
        {
            Ok(_) => {}
            Err(e) => match map_sdk_error(e, "DeleteObject") {
                err if err.is_not_found() => return Ok(()),
                err => {
                    tracing::error!(
                        error = %err,
                        bucket = %bucket,
                        key = %key,
                        duration_ms = start.elapsed().as_secs_f64() * 1000.0,
                        "S3 delete failed"
                    );
                    return Err(err);
                }
            },
        }

        tracing::info!(
            bucket = %bucket,
            key = %key,
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "S3 delete successful"
        );
        Ok(())
    }

    async fn delete_objects(
        &self,
        bucket: &str,
        keys: &[String],
    ) -> StorageResult<BatchDeleteOutcome> {
        let mut outcome = BatchDeleteOutcome::default();
        for batch in keys.chunks(DELETE_BATCH_SIZE) {
            outcome.merge(self.delete_batch(bucket, batch).await?);
        }
        Ok(outcome)
    }

    async fn object_exists(&self, bucket: &str, key: &str) -> StorageResult<bool> {
        match self.head_object(bucket, key).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn head_object(&self, bucket: &str, key: &str) -> StorageResult<ObjectMetadata> {
        let output = self
            .client
            .head_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| map_sdk_error(e, "HeadObject"))?;

        Ok(ObjectMetadata {
            size: output.content_length().unwrap_or_default().max(0) as u64,
            etag: output.e_tag().unwrap_or_default().to_string(),
        })
    }

    async fn presigned_url(
        &self,
        bucket: &str,
        key: &str,
        operation: &PresignedOperation,
        expires_in: Duration,
    ) -> StorageResult<PresignedRequest> {
        let presigning_config = Self::presigning_config(expires_in)?;

        let request = match operation {
            PresignedOperation::Get => self
                .client
                .get_object()
                .bucket(bucket)
                .key(key)
                .presigned(presigning_config)
                .await
                .map_err(|e| StorageError::BackendError(e.to_string()))?,
            PresignedOperation::Put { content_type } => self
                .client
                .put_object()
                .bucket(bucket)
                .key(key)
                .content_type(content_type)
                .set_server_side_encryption(self.sse())
                .presigned(presigning_config)
                .await
                .map_err(|e| StorageError::BackendError(e.to_string()))?,
            PresignedOperation::UploadPart {
                upload_id,
                part_number,
            } => self
                .client
                .upload_part()
                .bucket(bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(*part_number as i32)
                .presigned(presigning_config)
                .await
                .map_err(|e| StorageError::BackendError(e.to_string()))?,
        };

        let headers = request
            .headers()
            .map(|(name, value)| (name.to_ascii_lowercase(), value.to_string()))
            .collect();
        Ok(PresignedRequest {
            url: request.uri().to_string(),
            headers,
        })
    }

    async fn download_stream(&self, bucket: &str, key: &str) -> StorageResult<DownloadStream> {
        let start = std::time::Instant::now();

        let response = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| map_sdk_error(e, "GetObject"))?;

        let stream = ReaderStream::new(response.body.into_async_read())
            .map(|result| result.map_err(|e| StorageError::DownloadFailed(e.to_string())));

        let bucket = bucket.to_string();
        let key = key.to_string();
        let logged_stream = stream.map(move |item| {
            if item.is_err() {
                tracing::error!(
                    bucket = %bucket,
                    key = %key,
                    duration_ms = start.elapsed().as_secs_f64() * 1000.0,
                    "S3 stream download error"
                );
            }
            item
        });

        Ok(Box::pin(logged_stream))
    }
}

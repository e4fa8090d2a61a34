//! Signed transfers against local filesystem backends.
//!
//! Local backends hand out URLs pointing here instead of at an object store. The
//! signature authorizes exactly one operation on one key until it expires.

use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, HeaderMap},
    response::IntoResponse,
    Json,
};
use chrono::Utc;
use serde::Deserialize;
use std::sync::Arc;
use utoipa::IntoParams;

use stowage_core::AppError;
use stowage_storage::{SignedOperation, Storage};

use super::upload_content::PartContentResponse;
use super::{body_reader, content_length};
use crate::error::{ErrorResponse, HttpAppError};
use crate::state::AppState;

const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct SignedQuery {
    /// `get`, `put` or `part`
    pub op: String,
    /// Unix timestamp after which the URL is rejected
    pub expires: i64,
    pub upload_id: Option<String>,
    pub part: Option<u32>,
    pub signature: String,
}

impl SignedQuery {
    fn operation(&self) -> Result<SignedOperation, AppError> {
        Ok(SignedOperation::from_query(
            &self.op,
            self.upload_id.as_deref(),
            self.part,
        )?)
    }
}

/// Check the signature and find the backend that owns `bucket`.
async fn authorize(
    state: &AppState,
    bucket: &str,
    key: &str,
    query: &SignedQuery,
) -> Result<(SignedOperation, Arc<dyn Storage>), AppError> {
    let operation = query.operation()?;
    state
        .local_signer
        .verify(
            &operation,
            bucket,
            key,
            query.expires,
            &query.signature,
            Utc::now(),
        )
        .map_err(|e| AppError::Forbidden(e.to_string()))?;

    let workspace = state
        .workspace_repository
        .get_by_bucket(bucket)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("bucket {}", bucket)))?;
    let backend = state
        .storages
        .registry()
        .get(&workspace.storage_id)
        .await
        .ok_or_else(|| {
            AppError::StorageUnavailable(format!(
                "storage {} has no registered backend",
                workspace.storage_id
            ))
        })?;

    Ok((operation, backend))
}

/// Write an object or one multipart part through a signed URL.
#[utoipa::path(
    put,
    path = "/api/local-storage/{bucket}/{key}",
    tag = "local-storage",
    params(
        ("bucket" = String, Path, description = "Bucket name"),
        ("key" = String, Path, description = "Object key"),
        SignedQuery
    ),
    request_body(content = Vec<u8>, content_type = "application/octet-stream"),
    responses(
        (status = 200, description = "Stored; the ETag is also in the ETag header", body = PartContentResponse),
        (status = 400, description = "Missing Content-Length or wrong size", body = ErrorResponse),
        (status = 403, description = "Signature invalid or expired", body = ErrorResponse)
    )
)]
#[tracing::instrument(skip_all, fields(bucket = %bucket, op = %query.op))]
pub async fn signed_put(
    State(state): State<Arc<AppState>>,
    Path((bucket, key)): Path<(String, String)>,
    Query(query): Query<SignedQuery>,
    headers: HeaderMap,
    body: Body,
) -> Result<impl IntoResponse, HttpAppError> {
    let (operation, backend) = authorize(&state, &bucket, &key, &query).await?;
    let size = content_length(&headers).ok_or_else(|| {
        AppError::InvalidInput("Content-Length is required for signed uploads".to_string())
    })?;

    let etag = match operation {
        SignedOperation::Put => {
            let content_type = headers
                .get(header::CONTENT_TYPE)
                .and_then(|value| value.to_str().ok())
                .unwrap_or(DEFAULT_CONTENT_TYPE);
            backend
                .put_object(&bucket, &key, content_type, size, body_reader(body))
                .await?
        }
        SignedOperation::UploadPart {
            upload_id,
            part_number,
        } => {
            backend
                .upload_part(&bucket, &key, &upload_id, part_number, size, body_reader(body))
                .await?
        }
        SignedOperation::Get => {
            return Err(AppError::Forbidden(
                "URL is signed for downloads, not uploads".to_string(),
            )
            .into())
        }
    };

    Ok((
        [(header::ETAG, format!("\"{}\"", etag))],
        Json(PartContentResponse { e_tag: etag }),
    ))
}

/// Stream an object through a signed URL.
#[utoipa::path(
    get,
    path = "/api/local-storage/{bucket}/{key}",
    tag = "local-storage",
    params(
        ("bucket" = String, Path, description = "Bucket name"),
        ("key" = String, Path, description = "Object key"),
        SignedQuery
    ),
    responses(
        (status = 200, description = "Object content", content_type = "application/octet-stream"),
        (status = 403, description = "Signature invalid or expired", body = ErrorResponse),
        (status = 404, description = "Object not found", body = ErrorResponse)
    )
)]
#[tracing::instrument(skip_all, fields(bucket = %bucket))]
pub async fn signed_get(
    State(state): State<Arc<AppState>>,
    Path((bucket, key)): Path<(String, String)>,
    Query(query): Query<SignedQuery>,
) -> Result<impl IntoResponse, HttpAppError> {
    let (operation, backend) = authorize(&state, &bucket, &key, &query).await?;
    if operation != SignedOperation::Get {
        return Err(AppError::Forbidden("URL is signed for uploads, not downloads".to_string()).into());
    }

    let metadata = backend.head_object(&bucket, &key).await?;
    let stream = backend.download_stream(&bucket, &key).await?;

    Ok((
        [
            (header::CONTENT_TYPE, DEFAULT_CONTENT_TYPE.to_string()),
            (header::CONTENT_LENGTH, metadata.size.to_string()),
            (header::ETAG, format!("\"{}\"", metadata.etag)),
        ],
        Body::from_stream(stream),
    ))
}

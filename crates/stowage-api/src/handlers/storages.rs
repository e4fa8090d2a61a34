//! Storage backend configuration. Credentials are accepted but never returned.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use utoipa::ToSchema;
use validator::Validate;

use stowage_core::models::{EncryptionMode, StorageConfig, StorageProvider};
use stowage_core::StorageId;

use crate::error::{ErrorResponse, HttpAppError, ValidatedJson};
use crate::identity::CallerIdentity;
use crate::state::AppState;

// No Debug: the S3 variant carries credentials.
#[derive(Deserialize, ToSchema)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ProviderRequest {
    #[serde(rename_all = "camelCase")]
    Local { root_path: String },
    #[serde(rename_all = "camelCase")]
    S3 {
        region: String,
        #[serde(default)]
        endpoint: Option<String>,
        #[serde(default)]
        access_key_id: Option<String>,
        #[serde(default)]
        secret_access_key: Option<String>,
    },
}

impl ProviderRequest {
    fn into_provider(self, public_base_url: &str) -> StorageProvider {
        match self {
            ProviderRequest::Local { root_path } => StorageProvider::Local {
                root_path,
                public_base_url: public_base_url.to_string(),
            },
            ProviderRequest::S3 {
                region,
                endpoint,
                access_key_id,
                secret_access_key,
            } => StorageProvider::S3 {
                region,
                endpoint,
                access_key_id,
                secret_access_key,
            },
        }
    }
}

#[derive(Deserialize, Validate, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct StorageRequest {
    #[validate(length(min = 1, max = 255))]
    pub name: String,
    pub provider: ProviderRequest,
    #[serde(default)]
    pub encryption_mode: EncryptionMode,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct StorageResponse {
    pub id: String,
    pub name: String,
    /// `local` or `s3`
    pub kind: String,
    pub encryption_mode: EncryptionMode,
    pub registered: bool,
    pub created_at: DateTime<Utc>,
}

async fn to_response(state: &AppState, config: StorageConfig) -> StorageResponse {
    StorageResponse {
        registered: state.storages.registry().contains(&config.id).await,
        id: config.id.to_string(),
        name: config.name,
        kind: config.provider.kind().to_string(),
        encryption_mode: config.encryption_mode,
        created_at: config.created_at,
    }
}

#[utoipa::path(
    get,
    path = "/api/storages",
    tag = "storages",
    responses(
        (status = 200, description = "Configured storages", body = Vec<StorageResponse>)
    )
)]
pub async fn list_storages(
    CallerIdentity(_identity): CallerIdentity,
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, HttpAppError> {
    let mut storages = Vec::new();
    for config in state.storages.list().await? {
        storages.push(to_response(&state, config).await);
    }
    Ok(Json(storages))
}

/// Configure a new storage backend. The backend is built before anything is saved.
#[utoipa::path(
    post,
    path = "/api/storages",
    tag = "storages",
    request_body = StorageRequest,
    responses(
        (status = 201, description = "Storage configured", body = StorageResponse),
        (status = 400, description = "Invalid input", body = ErrorResponse),
        (status = 502, description = "Backend could not be built", body = ErrorResponse)
    )
)]
#[tracing::instrument(skip_all, fields(identity = %identity))]
pub async fn create_storage(
    CallerIdentity(identity): CallerIdentity,
    State(state): State<Arc<AppState>>,
    ValidatedJson(request): ValidatedJson<StorageRequest>,
) -> Result<impl IntoResponse, HttpAppError> {
    let provider = request
        .provider
        .into_provider(&state.config.public_base_url);
    let config = state
        .storages
        .add(&request.name, provider, request.encryption_mode)
        .await?;
    Ok((StatusCode::CREATED, Json(to_response(&state, config).await)))
}

/// Replace a storage configuration as a whole.
#[utoipa::path(
    put,
    path = "/api/storages/{storage_id}",
    tag = "storages",
    params(("storage_id" = String, Path, description = "Storage ID")),
    request_body = StorageRequest,
    responses(
        (status = 200, description = "Storage replaced", body = StorageResponse),
        (status = 404, description = "Storage not found", body = ErrorResponse)
    )
)]
#[tracing::instrument(skip_all, fields(identity = %identity, storage_id = %storage_id))]
pub async fn replace_storage(
    CallerIdentity(identity): CallerIdentity,
    State(state): State<Arc<AppState>>,
    Path(storage_id): Path<StorageId>,
    ValidatedJson(request): ValidatedJson<StorageRequest>,
) -> Result<impl IntoResponse, HttpAppError> {
    let provider = request
        .provider
        .into_provider(&state.config.public_base_url);
    let config = state
        .storages
        .replace(&storage_id, &request.name, provider, request.encryption_mode)
        .await?;
    Ok(Json(to_response(&state, config).await))
}

#[utoipa::path(
    delete,
    path = "/api/storages/{storage_id}",
    tag = "storages",
    params(("storage_id" = String, Path, description = "Storage ID")),
    responses(
        (status = 204, description = "Storage removed"),
        (status = 404, description = "Storage not found", body = ErrorResponse)
    )
)]
#[tracing::instrument(skip_all, fields(identity = %identity, storage_id = %storage_id))]
pub async fn delete_storage(
    CallerIdentity(identity): CallerIdentity,
    State(state): State<Arc<AppState>>,
    Path(storage_id): Path<StorageId>,
) -> Result<impl IntoResponse, HttpAppError> {
    state.storages.remove(&storage_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

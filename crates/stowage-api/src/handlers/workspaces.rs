//! Workspace provisioning and teardown.

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

use stowage_core::models::Workspace;
use stowage_core::{StorageId, WorkspaceId};
use stowage_services::NewWorkspace;

use crate::error::{ErrorResponse, HttpAppError, ValidatedJson};
use crate::identity::CallerIdentity;
use crate::state::AppState;

#[derive(Debug, Deserialize, Validate, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateWorkspaceRequest {
    #[validate(length(min = 1, max = 255))]
    pub name: String,
    #[schema(value_type = String)]
    pub storage_id: StorageId,
    /// Quota in bytes; omitted for unlimited
    #[validate(range(min = 0))]
    pub max_size_in_bytes: Option<i64>,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceResponse {
    pub id: String,
    pub name: String,
    pub storage_id: String,
    pub bucket_name: String,
    pub current_size_in_bytes: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_size_in_bytes: Option<i64>,
    pub created_at: DateTime<Utc>,
}

impl From<Workspace> for WorkspaceResponse {
    fn from(workspace: Workspace) -> Self {
        Self {
            id: workspace.id.to_string(),
            name: workspace.name,
            storage_id: workspace.storage_id.to_string(),
            bucket_name: workspace.bucket_name,
            current_size_in_bytes: workspace.current_size_bytes,
            max_size_in_bytes: workspace.max_size_bytes,
            created_at: workspace.created_at,
        }
    }
}

/// Create a workspace and its bucket on the chosen storage.
#[utoipa::path(
    post,
    path = "/api/workspaces",
    tag = "workspaces",
    request_body = CreateWorkspaceRequest,
    responses(
        (status = 201, description = "Workspace created", body = WorkspaceResponse),
        (status = 400, description = "Invalid input", body = ErrorResponse),
        (status = 503, description = "Storage backend unavailable", body = ErrorResponse)
    )
)]
#[tracing::instrument(skip_all, fields(identity = %identity))]
pub async fn create_workspace(
    CallerIdentity(identity): CallerIdentity,
    State(state): State<Arc<AppState>>,
    ValidatedJson(request): ValidatedJson<CreateWorkspaceRequest>,
) -> Result<impl IntoResponse, HttpAppError> {
    let workspace = state
        .workspaces
        .create(NewWorkspace {
            name: request.name,
            storage_id: request.storage_id,
            max_size_bytes: request.max_size_in_bytes,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(WorkspaceResponse::from(workspace))))
}

#[utoipa::path(
    get,
    path = "/api/workspaces/{workspace_id}",
    tag = "workspaces",
    params(("workspace_id" = String, Path, description = "Workspace ID")),
    responses(
        (status = 200, description = "Workspace", body = WorkspaceResponse),
        (status = 404, description = "Workspace not found", body = ErrorResponse)
    )
)]
pub async fn get_workspace(
    CallerIdentity(identity): CallerIdentity,
    State(state): State<Arc<AppState>>,
    Path(workspace_id): Path<WorkspaceId>,
) -> Result<impl IntoResponse, HttpAppError> {
    let workspace = state.workspaces.get(&identity, &workspace_id).await?;
    Ok(Json(WorkspaceResponse::from(workspace)))
}

/// Delete a workspace. Its bucket is emptied and removed in the background.
#[utoipa::path(
    delete,
    path = "/api/workspaces/{workspace_id}",
    tag = "workspaces",
    params(("workspace_id" = String, Path, description = "Workspace ID")),
    responses(
        (status = 202, description = "Workspace deleted, bucket teardown queued"),
        (status = 403, description = "Delete not allowed", body = ErrorResponse),
        (status = 404, description = "Workspace not found", body = ErrorResponse)
    )
)]
pub async fn delete_workspace(
    CallerIdentity(identity): CallerIdentity,
    State(state): State<Arc<AppState>>,
    Path(workspace_id): Path<WorkspaceId>,
) -> Result<impl IntoResponse, HttpAppError> {
    state.workspaces.delete(&identity, &workspace_id).await?;
    Ok(StatusCode::ACCEPTED)
}

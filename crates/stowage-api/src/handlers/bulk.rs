//! Bulk delete, move and size-count over a selection of folders and files.

use axum::{
    extract::{Path, State},
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use utoipa::ToSchema;
use validator::{Validate, ValidationError};

use stowage_core::models::Selection;
use stowage_core::{FileId, FolderId, WorkspaceId};
use stowage_services::{BulkOutcome, ItemFailure, ItemKind, SelectionSize};

use crate::error::{ErrorResponse, HttpAppError, ValidatedJson};
use crate::identity::CallerIdentity;
use crate::state::AppState;

/// Upper bound on ids per list in one request.
const MAX_SELECTION_ITEMS: usize = 10_000;

#[allow(clippy::ptr_arg)]
fn within_limit<T>(items: &Vec<T>) -> Result<(), ValidationError> {
    if items.len() > MAX_SELECTION_ITEMS {
        return Err(ValidationError::new("too_many_items"));
    }
    Ok(())
}

/// Folders and files to act on. A selected folder includes its descendants except
/// excluded folders (and their subtrees) and excluded files.
#[derive(Debug, Default, Deserialize, Validate, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SelectionRequest {
    #[serde(default)]
    #[schema(value_type = Vec<String>)]
    #[validate(custom(function = "within_limit"))]
    pub selected_folders: Vec<FolderId>,
    #[serde(default)]
    #[schema(value_type = Vec<String>)]
    #[validate(custom(function = "within_limit"))]
    pub excluded_folders: Vec<FolderId>,
    #[serde(default)]
    #[schema(value_type = Vec<String>)]
    #[validate(custom(function = "within_limit"))]
    pub selected_files: Vec<FileId>,
    #[serde(default)]
    #[schema(value_type = Vec<String>)]
    #[validate(custom(function = "within_limit"))]
    pub excluded_files: Vec<FileId>,
}

impl From<SelectionRequest> for Selection {
    fn from(request: SelectionRequest) -> Self {
        Selection {
            selected_folders: request.selected_folders,
            excluded_folders: request.excluded_folders,
            selected_files: request.selected_files,
            excluded_files: request.excluded_files,
        }
    }
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct BulkMoveRequest {
    #[serde(flatten)]
    #[validate(nested)]
    pub selection: SelectionRequest,
    /// Destination folder; omitted for the workspace root
    #[schema(value_type = Option<String>)]
    pub destination_folder_id: Option<FolderId>,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ItemFailureResponse {
    pub id: String,
    /// `file` or `folder`
    pub kind: String,
    pub reason: String,
}

impl From<ItemFailure> for ItemFailureResponse {
    fn from(failure: ItemFailure) -> Self {
        Self {
            id: failure.id,
            kind: match failure.kind {
                ItemKind::File => "file".to_string(),
                ItemKind::Folder => "folder".to_string(),
            },
            reason: failure.reason,
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct BulkOutcomeResponse {
    pub files: u64,
    pub folders: u64,
    pub failures: Vec<ItemFailureResponse>,
}

impl From<BulkOutcome> for BulkOutcomeResponse {
    fn from(outcome: BulkOutcome) -> Self {
        Self {
            files: outcome.files,
            folders: outcome.folders,
            failures: outcome.failures.into_iter().map(Into::into).collect(),
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SizeCountResponse {
    pub files: u64,
    pub folders: u64,
    pub size_in_bytes: i64,
    pub failures: Vec<ItemFailureResponse>,
}

impl From<SelectionSize> for SizeCountResponse {
    fn from(size: SelectionSize) -> Self {
        Self {
            files: size.files,
            folders: size.folders,
            size_in_bytes: size.size_bytes,
            failures: size.failures.into_iter().map(Into::into).collect(),
        }
    }
}

/// Delete the selection. Stored objects are removed in the background.
#[utoipa::path(
    post,
    path = "/api/workspaces/{workspace_id}/bulk-delete",
    tag = "bulk",
    params(("workspace_id" = String, Path, description = "Workspace ID")),
    request_body = SelectionRequest,
    responses(
        (status = 200, description = "Deleted, with per-item failures", body = BulkOutcomeResponse),
        (status = 403, description = "Delete not allowed", body = ErrorResponse),
        (status = 404, description = "Workspace not found", body = ErrorResponse)
    )
)]
pub async fn bulk_delete(
    CallerIdentity(identity): CallerIdentity,
    State(state): State<Arc<AppState>>,
    Path(workspace_id): Path<WorkspaceId>,
    ValidatedJson(request): ValidatedJson<SelectionRequest>,
) -> Result<impl IntoResponse, HttpAppError> {
    let outcome = state
        .bulk
        .delete(&identity, &workspace_id, &request.into())
        .await?;
    Ok(Json(BulkOutcomeResponse::from(outcome)))
}

/// Move the selection under another folder.
#[utoipa::path(
    post,
    path = "/api/workspaces/{workspace_id}/bulk-move",
    tag = "bulk",
    params(("workspace_id" = String, Path, description = "Workspace ID")),
    request_body = BulkMoveRequest,
    responses(
        (status = 200, description = "Moved, with per-item failures", body = BulkOutcomeResponse),
        (status = 403, description = "Move not allowed", body = ErrorResponse),
        (status = 404, description = "Workspace or destination not found", body = ErrorResponse)
    )
)]
pub async fn bulk_move(
    CallerIdentity(identity): CallerIdentity,
    State(state): State<Arc<AppState>>,
    Path(workspace_id): Path<WorkspaceId>,
    ValidatedJson(request): ValidatedJson<BulkMoveRequest>,
) -> Result<impl IntoResponse, HttpAppError> {
    let outcome = state
        .bulk
        .move_to(
            &identity,
            &workspace_id,
            &request.selection.into(),
            request.destination_folder_id,
        )
        .await?;
    Ok(Json(BulkOutcomeResponse::from(outcome)))
}

/// Count files and folders in the selection and total their size.
#[utoipa::path(
    post,
    path = "/api/workspaces/{workspace_id}/size-count",
    tag = "bulk",
    params(("workspace_id" = String, Path, description = "Workspace ID")),
    request_body = SelectionRequest,
    responses(
        (status = 200, description = "Selection totals", body = SizeCountResponse),
        (status = 403, description = "Read not allowed", body = ErrorResponse),
        (status = 404, description = "Workspace not found", body = ErrorResponse)
    )
)]
pub async fn size_count(
    CallerIdentity(identity): CallerIdentity,
    State(state): State<Arc<AppState>>,
    Path(workspace_id): Path<WorkspaceId>,
    ValidatedJson(request): ValidatedJson<SelectionRequest>,
) -> Result<impl IntoResponse, HttpAppError> {
    let size = state
        .bulk
        .size_count(&identity, &workspace_id, &request.into())
        .await?;
    Ok(Json(SizeCountResponse::from(size)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn move_request_flattens_the_selection() {
        let request: BulkMoveRequest = serde_json::from_str(
            r#"{"selectedFiles":["fi_abc"],"destinationFolderId":"fo_dest"}"#,
        )
        .unwrap();
        assert_eq!(request.selection.selected_files.len(), 1);
        assert!(request.selection.selected_folders.is_empty());
        assert_eq!(
            request.destination_folder_id,
            Some(FolderId::parse("fo_dest").unwrap())
        );
    }

    #[test]
    fn oversized_selections_are_rejected() {
        let request = SelectionRequest {
            selected_files: (0..=MAX_SELECTION_ITEMS).map(|_| FileId::new()).collect(),
            ..Default::default()
        };
        assert!(request.validate().is_err());
    }
}

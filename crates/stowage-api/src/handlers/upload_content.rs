//! Server-brokered transfers for direct uploads and for backends that cannot pre-sign.

use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, HeaderMap},
    response::IntoResponse,
    Json,
};
use serde::Serialize;
use std::sync::Arc;
use utoipa::ToSchema;

use stowage_core::{FileUploadId, WorkspaceId};
use stowage_services::ContentOutcome;

use super::{body_reader, content_length};
use crate::error::{ErrorResponse, HttpAppError};
use crate::identity::CallerIdentity;
use crate::state::AppState;

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UploadContentResponse {
    /// Set when the transfer completed the upload
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_id: Option<String>,
    /// Set when the upload still has to be finalized
    #[serde(skip_serializing_if = "Option::is_none")]
    pub e_tag: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PartContentResponse {
    pub e_tag: String,
}

/// Stream the whole object through the service.
#[utoipa::path(
    put,
    path = "/api/workspaces/{workspace_id}/uploads/{upload_id}/content",
    tag = "uploads",
    params(
        ("workspace_id" = String, Path, description = "Workspace ID"),
        ("upload_id" = String, Path, description = "Upload ID")
    ),
    request_body(content = Vec<u8>, content_type = "application/octet-stream"),
    responses(
        (status = 200, description = "Content stored", body = UploadContentResponse),
        (status = 400, description = "Body size does not match the declared size", body = ErrorResponse),
        (status = 404, description = "Upload not found", body = ErrorResponse)
    )
)]
pub async fn upload_content(
    CallerIdentity(identity): CallerIdentity,
    State(state): State<Arc<AppState>>,
    Path((workspace_id, upload_id)): Path<(WorkspaceId, FileUploadId)>,
    headers: HeaderMap,
    body: Body,
) -> Result<impl IntoResponse, HttpAppError> {
    let outcome = state
        .uploads
        .upload_content(
            &identity,
            &workspace_id,
            &upload_id,
            content_length(&headers),
            body_reader(body),
        )
        .await?;

    let response = match outcome {
        ContentOutcome::Completed { file_id } => UploadContentResponse {
            file_id: Some(file_id.to_string()),
            e_tag: None,
        },
        ContentOutcome::Stored { etag } => UploadContentResponse {
            file_id: None,
            e_tag: Some(etag),
        },
    };
    Ok(Json(response))
}

/// Stream one part of a multi-step upload through the service. The part is
/// acknowledged as soon as it is stored.
#[utoipa::path(
    put,
    path = "/api/workspaces/{workspace_id}/uploads/{upload_id}/parts/{part_number}/content",
    tag = "uploads",
    params(
        ("workspace_id" = String, Path, description = "Workspace ID"),
        ("upload_id" = String, Path, description = "Upload ID"),
        ("part_number" = u32, Path, description = "1-based part number")
    ),
    request_body(content = Vec<u8>, content_type = "application/octet-stream"),
    responses(
        (status = 200, description = "Part stored", body = PartContentResponse),
        (status = 400, description = "Part out of range or wrong size", body = ErrorResponse),
        (status = 404, description = "Upload not found", body = ErrorResponse)
    )
)]
pub async fn upload_part_content(
    CallerIdentity(identity): CallerIdentity,
    State(state): State<Arc<AppState>>,
    Path((workspace_id, upload_id, part_number)): Path<(WorkspaceId, FileUploadId, u32)>,
    headers: HeaderMap,
    body: Body,
) -> Result<impl IntoResponse, HttpAppError> {
    let etag = state
        .uploads
        .upload_part_content(
            &identity,
            &workspace_id,
            &upload_id,
            part_number,
            content_length(&headers),
            body_reader(body),
        )
        .await?;

    Ok((
        [(header::ETAG, format!("\"{}\"", etag))],
        Json(PartContentResponse { e_tag: etag }),
    ))
}

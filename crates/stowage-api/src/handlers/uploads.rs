//! Upload session endpoints: initiation, per-part URLs, acknowledgements,
//! finalization and abort.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use utoipa::ToSchema;
use validator::Validate;

use stowage_core::models::UploadAlgorithm;
use stowage_core::{FileUploadId, FolderId, WorkspaceId};
use stowage_services::{InitiateUpload, PartTicket, UploadPayload, UploadTicket, UploadedParts};

use crate::error::{ErrorResponse, HttpAppError, ValidatedJson};
use crate::identity::CallerIdentity;
use crate::state::AppState;

#[derive(Debug, Deserialize, Validate, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct InitiateUploadRequest {
    /// Target folder; omitted for the workspace root
    #[schema(value_type = Option<String>)]
    pub folder_id: Option<FolderId>,
    #[validate(length(min = 1, max = 255))]
    pub name: String,
    #[validate(length(min = 1, max = 255))]
    pub content_type: String,
    pub size_in_bytes: u64,
}

/// Transfer instructions for the chosen algorithm.
#[derive(Debug, Serialize, ToSchema)]
#[serde(tag = "kind")]
pub enum UploadPayloadResponse {
    #[serde(rename = "direct", rename_all = "camelCase")]
    Direct { upload_url: String },
    #[serde(rename = "singleChunk", rename_all = "camelCase")]
    SingleChunk {
        upload_url: String,
        /// Headers to send with the upload request, unchanged
        upload_headers: BTreeMap<String, String>,
        requires_completion_callback: bool,
    },
    #[serde(rename = "multiStep", rename_all = "camelCase")]
    MultiStep {
        expected_parts_count: u32,
        part_size_in_bytes: u64,
    },
}

impl From<UploadPayload> for UploadPayloadResponse {
    fn from(payload: UploadPayload) -> Self {
        match payload {
            UploadPayload::Direct { upload_url } => UploadPayloadResponse::Direct { upload_url },
            UploadPayload::SingleChunk {
                upload_url,
                upload_headers,
                requires_completion_callback,
            } => UploadPayloadResponse::SingleChunk {
                upload_url,
                upload_headers,
                requires_completion_callback,
            },
            UploadPayload::MultiStep {
                expected_parts_count,
                part_size_bytes,
            } => UploadPayloadResponse::MultiStep {
                expected_parts_count,
                part_size_in_bytes: part_size_bytes,
            },
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct InitiateUploadResponse {
    pub upload_id: String,
    pub file_id: String,
    pub algorithm: UploadAlgorithm,
    pub payload: UploadPayloadResponse,
}

impl From<UploadTicket> for InitiateUploadResponse {
    fn from(ticket: UploadTicket) -> Self {
        Self {
            upload_id: ticket.upload_id.to_string(),
            file_id: ticket.file_id.to_string(),
            algorithm: ticket.algorithm,
            payload: ticket.payload.into(),
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PartUrlResponse {
    pub upload_url: String,
    /// Headers to send with the part upload, unchanged
    pub upload_headers: BTreeMap<String, String>,
    /// First byte of the part, inclusive
    pub starts_at_byte: u64,
    /// Last byte of the part, inclusive
    pub ends_at_byte: u64,
    pub requires_completion_callback: bool,
}

impl From<PartTicket> for PartUrlResponse {
    fn from(ticket: PartTicket) -> Self {
        Self {
            upload_url: ticket.upload_url,
            upload_headers: ticket.upload_headers,
            starts_at_byte: ticket.range.start,
            ends_at_byte: ticket.range.end,
            requires_completion_callback: ticket.requires_completion_callback,
        }
    }
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ETagRequest {
    #[validate(length(min = 1, max = 1024))]
    pub e_tag: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct AcceptedResponse {
    pub accepted: bool,
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct FinalizePart {
    pub part_number: u32,
    #[validate(length(min = 1, max = 1024))]
    pub e_tag: String,
}

#[derive(Debug, Default, Deserialize, Validate, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct FinalizeUploadRequest {
    /// Client-side list of parts. When present it must match the acknowledged parts.
    #[serde(default)]
    #[validate(nested)]
    pub parts: Option<Vec<FinalizePart>>,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct FinalizeUploadResponse {
    pub file_id: String,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UploadedPartsResponse {
    pub part_numbers: Vec<u32>,
    pub expected_parts_count: u32,
}

impl From<UploadedParts> for UploadedPartsResponse {
    fn from(parts: UploadedParts) -> Self {
        Self {
            part_numbers: parts.part_numbers,
            expected_parts_count: parts.expected_parts_count,
        }
    }
}

/// Start an upload. The algorithm is chosen from the declared size.
#[utoipa::path(
    post,
    path = "/api/workspaces/{workspace_id}/uploads",
    tag = "uploads",
    params(("workspace_id" = String, Path, description = "Workspace ID")),
    request_body = InitiateUploadRequest,
    responses(
        (status = 201, description = "Upload session created", body = InitiateUploadResponse),
        (status = 400, description = "Invalid input", body = ErrorResponse),
        (status = 403, description = "Upload not allowed", body = ErrorResponse),
        (status = 413, description = "Workspace quota exceeded", body = ErrorResponse),
        (status = 503, description = "Storage backend unavailable", body = ErrorResponse)
    )
)]
pub async fn initiate_upload(
    CallerIdentity(identity): CallerIdentity,
    State(state): State<Arc<AppState>>,
    Path(workspace_id): Path<WorkspaceId>,
    ValidatedJson(request): ValidatedJson<InitiateUploadRequest>,
) -> Result<impl IntoResponse, HttpAppError> {
    let ticket = state
        .uploads
        .initiate(
            &identity,
            &workspace_id,
            InitiateUpload {
                folder_id: request.folder_id,
                name: request.name,
                content_type: request.content_type,
                size_bytes: request.size_in_bytes,
            },
        )
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(InitiateUploadResponse::from(ticket)),
    ))
}

/// Issue the transfer URL for one part of a multi-step upload.
#[utoipa::path(
    post,
    path = "/api/workspaces/{workspace_id}/uploads/{upload_id}/parts/{part_number}",
    tag = "uploads",
    params(
        ("workspace_id" = String, Path, description = "Workspace ID"),
        ("upload_id" = String, Path, description = "Upload ID"),
        ("part_number" = u32, Path, description = "1-based part number")
    ),
    responses(
        (status = 200, description = "Part URL issued", body = PartUrlResponse),
        (status = 400, description = "Part number out of range", body = ErrorResponse),
        (status = 404, description = "Upload not found", body = ErrorResponse)
    )
)]
pub async fn initiate_part(
    CallerIdentity(identity): CallerIdentity,
    State(state): State<Arc<AppState>>,
    Path((workspace_id, upload_id, part_number)): Path<(WorkspaceId, FileUploadId, u32)>,
) -> Result<impl IntoResponse, HttpAppError> {
    let ticket = state
        .uploads
        .initiate_part(&identity, &workspace_id, &upload_id, part_number)
        .await?;
    Ok(Json(PartUrlResponse::from(ticket)))
}

/// Acknowledge an uploaded part with the ETag the backend returned.
#[utoipa::path(
    post,
    path = "/api/workspaces/{workspace_id}/uploads/{upload_id}/parts/{part_number}/complete",
    tag = "uploads",
    params(
        ("workspace_id" = String, Path, description = "Workspace ID"),
        ("upload_id" = String, Path, description = "Upload ID"),
        ("part_number" = u32, Path, description = "1-based part number")
    ),
    request_body = ETagRequest,
    responses(
        (status = 200, description = "Part recorded", body = AcceptedResponse),
        (status = 400, description = "Part number out of range", body = ErrorResponse),
        (status = 404, description = "Upload not found", body = ErrorResponse)
    )
)]
pub async fn complete_part(
    CallerIdentity(identity): CallerIdentity,
    State(state): State<Arc<AppState>>,
    Path((workspace_id, upload_id, part_number)): Path<(WorkspaceId, FileUploadId, u32)>,
    ValidatedJson(request): ValidatedJson<ETagRequest>,
) -> Result<impl IntoResponse, HttpAppError> {
    state
        .uploads
        .acknowledge_part(&identity, &workspace_id, &upload_id, part_number, &request.e_tag)
        .await?;
    Ok(Json(AcceptedResponse { accepted: true }))
}

/// Report the ETag of a single-chunk upload sent to a pre-signed URL.
#[utoipa::path(
    post,
    path = "/api/workspaces/{workspace_id}/uploads/{upload_id}/complete",
    tag = "uploads",
    params(
        ("workspace_id" = String, Path, description = "Workspace ID"),
        ("upload_id" = String, Path, description = "Upload ID")
    ),
    request_body = ETagRequest,
    responses(
        (status = 200, description = "ETag recorded", body = AcceptedResponse),
        (status = 400, description = "Not a single-chunk upload", body = ErrorResponse),
        (status = 404, description = "Upload not found", body = ErrorResponse)
    )
)]
pub async fn complete_single_chunk(
    CallerIdentity(identity): CallerIdentity,
    State(state): State<Arc<AppState>>,
    Path((workspace_id, upload_id)): Path<(WorkspaceId, FileUploadId)>,
    ValidatedJson(request): ValidatedJson<ETagRequest>,
) -> Result<impl IntoResponse, HttpAppError> {
    state
        .uploads
        .report_single_chunk_etag(&identity, &workspace_id, &upload_id, &request.e_tag)
        .await?;
    Ok(Json(AcceptedResponse { accepted: true }))
}

/// Turn a finished upload into a file.
#[utoipa::path(
    post,
    path = "/api/workspaces/{workspace_id}/uploads/{upload_id}/finalize",
    tag = "uploads",
    params(
        ("workspace_id" = String, Path, description = "Workspace ID"),
        ("upload_id" = String, Path, description = "Upload ID")
    ),
    request_body = FinalizeUploadRequest,
    responses(
        (status = 200, description = "File created", body = FinalizeUploadResponse),
        (status = 404, description = "Upload not found", body = ErrorResponse),
        (status = 409, description = "Parts missing or rejected by storage", body = ErrorResponse)
    )
)]
pub async fn finalize_upload(
    CallerIdentity(identity): CallerIdentity,
    State(state): State<Arc<AppState>>,
    Path((workspace_id, upload_id)): Path<(WorkspaceId, FileUploadId)>,
    ValidatedJson(request): ValidatedJson<FinalizeUploadRequest>,
) -> Result<impl IntoResponse, HttpAppError> {
    let parts = request.parts.map(|parts| {
        parts
            .into_iter()
            .map(|part| (part.part_number, part.e_tag))
            .collect()
    });
    let file_id = state
        .uploads
        .finalize(&identity, &workspace_id, &upload_id, parts)
        .await?;
    Ok(Json(FinalizeUploadResponse {
        file_id: file_id.to_string(),
    }))
}

/// List the parts acknowledged so far, for resuming an interrupted upload.
#[utoipa::path(
    get,
    path = "/api/workspaces/{workspace_id}/uploads/{upload_id}/parts",
    tag = "uploads",
    params(
        ("workspace_id" = String, Path, description = "Workspace ID"),
        ("upload_id" = String, Path, description = "Upload ID")
    ),
    responses(
        (status = 200, description = "Acknowledged parts", body = UploadedPartsResponse),
        (status = 404, description = "Upload not found", body = ErrorResponse)
    )
)]
pub async fn list_parts(
    CallerIdentity(identity): CallerIdentity,
    State(state): State<Arc<AppState>>,
    Path((workspace_id, upload_id)): Path<(WorkspaceId, FileUploadId)>,
) -> Result<impl IntoResponse, HttpAppError> {
    let parts = state
        .uploads
        .uploaded_parts(&identity, &workspace_id, &upload_id)
        .await?;
    Ok(Json(UploadedPartsResponse::from(parts)))
}

/// Abort an upload. Stored bytes are released in the background.
#[utoipa::path(
    delete,
    path = "/api/workspaces/{workspace_id}/uploads/{upload_id}",
    tag = "uploads",
    params(
        ("workspace_id" = String, Path, description = "Workspace ID"),
        ("upload_id" = String, Path, description = "Upload ID")
    ),
    responses(
        (status = 204, description = "Upload aborted"),
        (status = 404, description = "Upload not found", body = ErrorResponse)
    )
)]
pub async fn abort_upload(
    CallerIdentity(identity): CallerIdentity,
    State(state): State<Arc<AppState>>,
    Path((workspace_id, upload_id)): Path<(WorkspaceId, FileUploadId)>,
) -> Result<impl IntoResponse, HttpAppError> {
    state
        .uploads
        .abandon(&identity, &workspace_id, &upload_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

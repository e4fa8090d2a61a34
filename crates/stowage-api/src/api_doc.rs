//! OpenAPI documentation, served at `/api/openapi.json`.

use utoipa::OpenApi;

use crate::error;
use crate::handlers;
use stowage_core::models;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Stowage API",
        version = "0.1.0",
        description = "Multi-tenant file ingestion: resumable uploads that pick their transfer algorithm from the file size, bulk operations over folder selections, and workspace and storage administration."
    ),
    paths(
        // Uploads
        handlers::uploads::initiate_upload,
        handlers::uploads::initiate_part,
        handlers::uploads::complete_part,
        handlers::uploads::complete_single_chunk,
        handlers::uploads::finalize_upload,
        handlers::uploads::list_parts,
        handlers::uploads::abort_upload,
        handlers::upload_content::upload_content,
        handlers::upload_content::upload_part_content,
        // Local storage
        handlers::local_storage::signed_put,
        handlers::local_storage::signed_get,
        // Bulk
        handlers::bulk::bulk_delete,
        handlers::bulk::bulk_move,
        handlers::bulk::size_count,
        // Administration
        handlers::workspaces::create_workspace,
        handlers::workspaces::get_workspace,
        handlers::workspaces::delete_workspace,
        handlers::storages::list_storages,
        handlers::storages::create_storage,
        handlers::storages::replace_storage,
        handlers::storages::delete_storage,
        // Health
        handlers::health::health_check,
    ),
    components(
        schemas(
            error::ErrorResponse,
            models::UploadAlgorithm,
            models::EncryptionMode,
            handlers::uploads::InitiateUploadRequest,
            handlers::uploads::InitiateUploadResponse,
            handlers::uploads::UploadPayloadResponse,
            handlers::uploads::PartUrlResponse,
            handlers::uploads::ETagRequest,
            handlers::uploads::AcceptedResponse,
            handlers::uploads::FinalizePart,
            handlers::uploads::FinalizeUploadRequest,
            handlers::uploads::FinalizeUploadResponse,
            handlers::uploads::UploadedPartsResponse,
            handlers::upload_content::UploadContentResponse,
            handlers::upload_content::PartContentResponse,
            handlers::bulk::SelectionRequest,
            handlers::bulk::BulkMoveRequest,
            handlers::bulk::ItemFailureResponse,
            handlers::bulk::BulkOutcomeResponse,
            handlers::bulk::SizeCountResponse,
            handlers::workspaces::CreateWorkspaceRequest,
            handlers::workspaces::WorkspaceResponse,
            handlers::storages::ProviderRequest,
            handlers::storages::StorageRequest,
            handlers::storages::StorageResponse,
            handlers::health::HealthResponse,
        )
    ),
    tags(
        (name = "uploads", description = "Resumable upload sessions"),
        (name = "local-storage", description = "Signed transfers for local filesystem backends"),
        (name = "bulk", description = "Bulk operations over folder and file selections"),
        (name = "workspaces", description = "Workspace provisioning"),
        (name = "storages", description = "Storage backend configuration"),
        (name = "health", description = "Service health")
    )
)]
pub struct ApiDoc;

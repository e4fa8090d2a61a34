//! Stowage Services
//!
//! Business logic over the metadata store and the storage backends: the upload
//! orchestrator, bulk selection operations, workspace and storage administration,
//! the background job executors and the abandoned-upload reclaimer.

pub mod access;
pub mod bulk;
pub mod cleanup;
pub mod jobs;
pub mod retry;
pub mod storages;
pub mod upload;
pub mod workspaces;

#[cfg(test)]
pub(crate) mod testing;

pub use access::WorkspaceStoreAccess;
pub use bulk::{BulkOperations, BulkOutcome, ItemFailure, ItemKind, SelectionSize};
pub use cleanup::AbandonedUploadReclaimer;
pub use jobs::register_executors;
pub use storages::StorageService;
pub use upload::{
    ContentOutcome, InitiateUpload, PartTicket, UploadOrchestrator, UploadPayload,
    UploadSettings, UploadTicket, UploadedParts,
};
pub use workspaces::{NewWorkspace, WorkspaceService};

//! Shared application state handed to every handler.

use stowage_core::Config;
use stowage_db::{Database, WorkspaceRepository};
use stowage_services::{BulkOperations, StorageService, UploadOrchestrator, WorkspaceService};
use stowage_storage::LocalUrlSigner;

pub struct AppState {
    pub config: Config,
    pub db: Database,
    pub uploads: UploadOrchestrator,
    pub bulk: BulkOperations,
    pub workspaces: WorkspaceService,
    pub storages: StorageService,
    pub workspace_repository: WorkspaceRepository,
    /// Verifies URLs served by the local-storage route. Uses the same secret every
    /// local backend signs with.
    pub local_signer: LocalUrlSigner,
}

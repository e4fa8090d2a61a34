//! Background job executors.

pub mod executors;

use std::sync::Arc;

use stowage_db::Database;
use stowage_storage::StorageRegistry;
use stowage_worker::ExecutorRegistry;

pub use executors::{
    BulkDeleteObjectsExecutor, DeleteBucketExecutor, DeleteObjectExecutor,
    ReclaimFileUploadExecutor, UpdateWorkspaceSizeExecutor,
};

/// Register an executor for every job type the services enqueue.
pub fn register_executors(registry: &mut ExecutorRegistry, db: Database, storages: StorageRegistry) {
    registry
        .register(Arc::new(UpdateWorkspaceSizeExecutor::new(db.clone())))
        .register(Arc::new(DeleteObjectExecutor::new(storages.clone())))
        .register(Arc::new(BulkDeleteObjectsExecutor::new(storages.clone())))
        .register(Arc::new(ReclaimFileUploadExecutor::new(db, storages.clone())))
        .register(Arc::new(DeleteBucketExecutor::new(storages)));
}

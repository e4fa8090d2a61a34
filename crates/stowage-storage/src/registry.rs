//! Registry of live storage backends keyed by storage id

use std::collections::HashMap;
use std::sync::Arc;
use stowage_core::StorageId;
use tokio::sync::RwLock;

use crate::traits::{Storage, StorageError, StorageResult};

/// Maps a logical storage id to the backend that serves it.
///
/// Backends are registered at startup and whenever a storage is configured through the
/// API. Lookups are concurrent; registration is serialized by the write lock.
#[derive(Clone, Default)]
pub struct StorageRegistry {
    backends: Arc<RwLock<HashMap<StorageId, Arc<dyn Storage>>>>,
}

impl StorageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a backend, replacing any previous backend under the same id.
    pub async fn register(&self, id: StorageId, backend: Arc<dyn Storage>) {
        tracing::info!(storage_id = %id, backend = %backend.backend_type(), "Storage backend registered");
        self.backends.write().await.insert(id, backend);
    }

    pub async fn remove(&self, id: &StorageId) -> Option<Arc<dyn Storage>> {
        self.backends.write().await.remove(id)
    }

    /// Look up a backend. `None` means the storage was never configured or has been removed.
    pub async fn get(&self, id: &StorageId) -> Option<Arc<dyn Storage>> {
        self.backends.read().await.get(id).cloned()
    }

    /// Like [`get`](Self::get) but a missing backend is an error.
    pub async fn resolve(&self, id: &StorageId) -> StorageResult<Arc<dyn Storage>> {
        self.get(id)
            .await
            .ok_or_else(|| StorageError::NotFound(format!("storage {}", id)))
    }

    pub async fn contains(&self, id: &StorageId) -> bool {
        self.backends.read().await.contains_key(id)
    }

    pub async fn ids(&self) -> Vec<StorageId> {
        self.backends.read().await.keys().cloned().collect()
    }
}

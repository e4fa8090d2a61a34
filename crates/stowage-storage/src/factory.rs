#[cfg(feature = "storage-local")]
use crate::{LocalStorage, LocalUrlSigner};
#[cfg(feature = "storage-s3")]
use crate::S3Storage;
use crate::{Storage, StorageError, StorageResult};
use std::sync::Arc;
use stowage_core::models::{StorageConfig, StorageProvider};

/// Create a storage backend from a persisted storage configuration
///
/// `local_signing_secret` signs the transfer URLs of local backends; S3 backends ignore it.
pub async fn create_storage(
    config: &StorageConfig,
    local_signing_secret: &str,
) -> StorageResult<Arc<dyn Storage>> {
    match &config.provider {
        #[cfg(feature = "storage-s3")]
        StorageProvider::S3 {
            region,
            endpoint,
            access_key_id,
            secret_access_key,
        } => {
            let credentials = match (access_key_id, secret_access_key) {
                (Some(key), Some(secret)) => Some((key.clone(), secret.clone())),
                (None, None) => None,
                _ => {
                    return Err(StorageError::ConfigError(
                        "S3 access key id and secret must be provided together".to_string(),
                    ))
                }
            };
            let storage = S3Storage::new(
                region.clone(),
                endpoint.clone(),
                credentials,
                config.encryption_mode,
            )
            .await?;
            Ok(Arc::new(storage))
        }

        #[cfg(not(feature = "storage-s3"))]
        StorageProvider::S3 { .. } => Err(StorageError::ConfigError(
            "S3 storage backend not available (storage-s3 feature not enabled)".to_string(),
        )),

        #[cfg(feature = "storage-local")]
        StorageProvider::Local {
            root_path,
            public_base_url,
        } => {
            if local_signing_secret.is_empty() {
                return Err(StorageError::ConfigError(
                    "LOCAL_STORAGE_SIGNING_SECRET not configured".to_string(),
                ));
            }
            let signer = LocalUrlSigner::new(local_signing_secret, public_base_url.clone());
            let storage = LocalStorage::new(root_path.clone(), signer).await?;
            Ok(Arc::new(storage))
        }

        #[cfg(not(feature = "storage-local"))]
        StorageProvider::Local { .. } => Err(StorageError::ConfigError(
            "Local storage backend not available (storage-local feature not enabled)".to_string(),
        )),
    }
}

#[cfg(all(test, feature = "storage-local"))]
mod tests {
    use super::*;
    use crate::StorageBackend;
    use stowage_core::models::EncryptionMode;
    use stowage_core::StorageId;

    fn local_config(root: &std::path::Path) -> StorageConfig {
        StorageConfig {
            id: StorageId::new(),
            name: "local".to_string(),
            provider: StorageProvider::Local {
                root_path: root.display().to_string(),
                public_base_url: "http://localhost:4000".to_string(),
            },
            encryption_mode: EncryptionMode::None,
            created_at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn builds_local_backend() {
        let dir = tempfile::tempdir().unwrap();
        let storage = create_storage(&local_config(dir.path()), "secret")
            .await
            .unwrap();
        assert_eq!(storage.backend_type(), StorageBackend::Local);
    }

    #[tokio::test]
    async fn local_backend_needs_signing_secret() {
        let dir = tempfile::tempdir().unwrap();
        assert!(create_storage(&local_config(dir.path()), "").await.is_err());
    }
}

//! Persisted storage backend configurations and the live registry built from them.

use chrono::Utc;

use stowage_core::models::{EncryptionMode, StorageConfig, StorageProvider};
use stowage_core::{AppError, BootstrapStorage, Config, StorageId};
use stowage_db::{Database, StorageRepository};
use stowage_storage::{create_storage, StorageRegistry};

const BOOTSTRAP_STORAGE_NAME: &str = "default";

#[derive(Clone)]
pub struct StorageService {
    db: Database,
    repo: StorageRepository,
    storages: StorageRegistry,
    signing_secret: String,
    public_base_url: String,
}

impl StorageService {
    pub fn new(
        db: Database,
        storages: StorageRegistry,
        signing_secret: impl Into<String>,
        public_base_url: impl Into<String>,
    ) -> Self {
        Self {
            repo: StorageRepository::new(db.pool.clone()),
            db,
            storages,
            signing_secret: signing_secret.into(),
            public_base_url: public_base_url.into(),
        }
    }

    pub fn from_config(db: Database, storages: StorageRegistry, config: &Config) -> Self {
        Self::new(
            db,
            storages,
            config.local_storage_signing_secret.clone(),
            config.public_base_url.clone(),
        )
    }

    pub fn registry(&self) -> &StorageRegistry {
        &self.storages
    }

    pub async fn list(&self) -> Result<Vec<StorageConfig>, AppError> {
        self.repo.list().await
    }

    /// Build a backend for every persisted configuration. A configuration that fails
    /// to build is logged and skipped; jobs that need it complete as no-ops.
    #[tracing::instrument(skip(self))]
    pub async fn load_all(&self) -> Result<usize, AppError> {
        let mut loaded = 0;
        for config in self.repo.list().await? {
            match create_storage(&config, &self.signing_secret).await {
                Ok(backend) => {
                    self.storages.register(config.id.clone(), backend).await;
                    loaded += 1;
                }
                Err(e) => tracing::error!(
                    storage_id = %config.id,
                    kind = config.provider.kind(),
                    error = %e,
                    "Failed to initialize storage backend"
                ),
            }
        }

        tracing::info!(loaded = loaded, "Storage backends loaded");
        Ok(loaded)
    }

    /// Save `bootstrap` as the first storage configuration if none exists yet.
    pub async fn bootstrap(
        &self,
        bootstrap: &BootstrapStorage,
    ) -> Result<Option<StorageConfig>, AppError> {
        if !self.repo.list().await?.is_empty() {
            return Ok(None);
        }

        let provider = match bootstrap {
            BootstrapStorage::Local { path } => StorageProvider::Local {
                root_path: path.clone(),
                public_base_url: self.public_base_url.clone(),
            },
            BootstrapStorage::S3 {
                region,
                endpoint,
                access_key_id,
                secret_access_key,
            } => StorageProvider::S3 {
                region: region.clone(),
                endpoint: endpoint.clone(),
                access_key_id: access_key_id.clone(),
                secret_access_key: secret_access_key.clone(),
            },
        };

        let config = self
            .add(BOOTSTRAP_STORAGE_NAME, provider, EncryptionMode::default())
            .await?;
        tracing::info!(storage_id = %config.id, "Bootstrap storage configured");
        Ok(Some(config))
    }

    /// Save a new configuration and register its backend. The backend is built first
    /// so an unusable configuration is never persisted.
    #[tracing::instrument(skip(self, provider), fields(kind = provider.kind()))]
    pub async fn add(
        &self,
        name: &str,
        provider: StorageProvider,
        encryption_mode: EncryptionMode,
    ) -> Result<StorageConfig, AppError> {
        let config = StorageConfig {
            id: StorageId::new(),
            name: validated_name(name)?,
            provider,
            encryption_mode,
            created_at: Utc::now(),
        };
        let backend = create_storage(&config, &self.signing_secret).await?;

        let to_insert = config.clone();
        self.db
            .writer
            .execute(move |conn| {
                Box::pin(async move { StorageRepository::insert(conn, &to_insert).await })
            })
            .await?;
        self.storages.register(config.id.clone(), backend).await;

        Ok(config)
    }

    /// Swap the provider settings of an existing storage. The row is replaced as a
    /// whole and the live backend is rebuilt.
    #[tracing::instrument(skip(self, provider), fields(storage_id = %id, kind = provider.kind()))]
    pub async fn replace(
        &self,
        id: &StorageId,
        name: &str,
        provider: StorageProvider,
        encryption_mode: EncryptionMode,
    ) -> Result<StorageConfig, AppError> {
        let config = StorageConfig {
            id: id.clone(),
            name: validated_name(name)?,
            provider,
            encryption_mode,
            created_at: Utc::now(),
        };
        let backend = create_storage(&config, &self.signing_secret).await?;

        let to_insert = config.clone();
        self.db
            .writer
            .execute(move |conn| {
                Box::pin(async move {
                    if !StorageRepository::delete(conn, &to_insert.id).await? {
                        return Err(AppError::NotFound(format!("storage {}", to_insert.id)));
                    }
                    StorageRepository::insert(conn, &to_insert).await
                })
            })
            .await?;
        self.storages.register(config.id.clone(), backend).await;

        Ok(config)
    }

    /// Forget a storage. Objects on it are left alone; pending jobs that target it
    /// complete without effect.
    #[tracing::instrument(skip(self), fields(storage_id = %id))]
    pub async fn remove(&self, id: &StorageId) -> Result<(), AppError> {
        let to_delete = id.clone();
        let deleted = self
            .db
            .writer
            .execute(move |conn| {
                Box::pin(async move { StorageRepository::delete(conn, &to_delete).await })
            })
            .await?;
        if !deleted {
            return Err(AppError::NotFound(format!("storage {}", id)));
        }

        self.storages.remove(id).await;
        tracing::info!("Storage removed");
        Ok(())
    }
}

fn validated_name(name: &str) -> Result<String, AppError> {
    let name = name.trim();
    if name.is_empty() || name.len() > 255 {
        return Err(AppError::InvalidInput(
            "Storage name must be between 1 and 255 characters".to_string(),
        ));
    }
    Ok(name.to_string())
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{FileId, FolderId, IntegrationId, StorageId, UserId, WorkspaceId};
use crate::models::identity::Identity;
use crate::models::storage::EncryptionMode;

/// A completed file. Only ever created together with its fully written object.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct FileRecord {
    pub id: FileId,
    pub workspace_id: WorkspaceId,
    pub folder_id: Option<FolderId>,
    pub name: String,
    pub extension: Option<String>,
    pub content_type: String,
    pub size_bytes: i64,
    pub storage_id: StorageId,
    pub bucket_name: String,
    pub storage_key: String,
    pub encryption_mode: EncryptionMode,
    pub owner_user_id: Option<UserId>,
    pub owner_integration_id: Option<IntegrationId>,
    pub created_at: DateTime<Utc>,
}

impl FileRecord {
    pub fn owner(&self) -> Option<Identity> {
        Identity::from_columns(
            self.owner_user_id.clone(),
            self.owner_integration_id.clone(),
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct Folder {
    pub id: FolderId,
    pub workspace_id: WorkspaceId,
    pub parent_id: Option<FolderId>,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

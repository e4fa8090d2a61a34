use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{FileId, FolderId, StorageId, WorkspaceId};

/// Workspace row as read by the ingestion pipeline. Owned by the workspace service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct Workspace {
    pub id: WorkspaceId,
    pub name: String,
    pub storage_id: StorageId,
    pub bucket_name: String,
    pub current_size_bytes: i64,
    pub max_size_bytes: Option<i64>,
    pub created_at: DateTime<Utc>,
}

/// Selection of folders and files for bulk operations.
///
/// A selected folder includes all of its descendants except excluded folders (and
/// their subtrees) and excluded files.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Selection {
    #[serde(default)]
    pub selected_folders: Vec<FolderId>,
    #[serde(default)]
    pub excluded_folders: Vec<FolderId>,
    #[serde(default)]
    pub selected_files: Vec<FileId>,
    #[serde(default)]
    pub excluded_files: Vec<FileId>,
}

impl Selection {
    pub fn is_empty(&self) -> bool {
        self.selected_folders.is_empty() && self.selected_files.is_empty()
    }
}

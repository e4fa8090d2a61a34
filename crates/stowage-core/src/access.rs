//! Workspace permission lookup.
//!
//! Permission checks belong to the workspace service; the ingestion pipeline only asks
//! what an identity may do in a workspace and how much room is left.

use async_trait::async_trait;
use std::collections::HashSet;

use crate::error::AppError;
use crate::ids::WorkspaceId;
use crate::models::Identity;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkspaceOperation {
    Read,
    Upload,
    Delete,
    Move,
}

#[derive(Debug, Clone)]
pub struct WorkspaceAccess {
    pub allowed: HashSet<WorkspaceOperation>,
    pub current_size_bytes: i64,
    pub max_size_bytes: Option<i64>,
}

impl WorkspaceAccess {
    pub fn allows(&self, operation: WorkspaceOperation) -> bool {
        self.allowed.contains(&operation)
    }

    pub fn require(&self, operation: WorkspaceOperation) -> Result<(), AppError> {
        if self.allows(operation) {
            Ok(())
        } else {
            Err(AppError::Forbidden(format!(
                "operation {:?} is not allowed in this workspace",
                operation
            )))
        }
    }

    /// Fails with `QuotaExceeded` if `additional_bytes` would not fit.
    pub fn ensure_capacity(&self, additional_bytes: i64) -> Result<(), AppError> {
        let Some(max) = self.max_size_bytes else {
            return Ok(());
        };
        let remaining = (max - self.current_size_bytes).max(0);
        if additional_bytes > remaining {
            return Err(AppError::QuotaExceeded {
                required: additional_bytes,
                remaining,
            });
        }
        Ok(())
    }
}

#[async_trait]
pub trait WorkspaceAccessProvider: Send + Sync {
    async fn access(
        &self,
        identity: &Identity,
        workspace_id: &WorkspaceId,
    ) -> Result<WorkspaceAccess, AppError>;
}

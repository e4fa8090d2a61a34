//! Workspace access backed by the local workspace table.

use async_trait::async_trait;

use stowage_core::models::Identity;
use stowage_core::{
    AppError, WorkspaceAccess, WorkspaceAccessProvider, WorkspaceId, WorkspaceOperation,
};
use stowage_db::{Database, WorkspaceRepository};

/// Grants every operation on existing workspaces and reports their size and quota.
///
/// Used when permissions are enforced upstream of this service. Deployments with a
/// separate workspace service plug in their own [`WorkspaceAccessProvider`].
#[derive(Clone)]
pub struct WorkspaceStoreAccess {
    workspaces: WorkspaceRepository,
}

impl WorkspaceStoreAccess {
    pub fn new(db: Database) -> Self {
        Self {
            workspaces: WorkspaceRepository::new(db.pool),
        }
    }
}

#[async_trait]
impl WorkspaceAccessProvider for WorkspaceStoreAccess {
    async fn access(
        &self,
        identity: &Identity,
        workspace_id: &WorkspaceId,
    ) -> Result<WorkspaceAccess, AppError> {
        let workspace = self.workspaces.require(workspace_id).await?;
        tracing::trace!(identity = %identity, workspace_id = %workspace_id, "Workspace access granted");

        Ok(WorkspaceAccess {
            allowed: [
                WorkspaceOperation::Read,
                WorkspaceOperation::Upload,
                WorkspaceOperation::Delete,
                WorkspaceOperation::Move,
            ]
            .into_iter()
            .collect(),
            current_size_bytes: workspace.current_size_bytes,
            max_size_bytes: workspace.max_size_bytes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Fixture;

    #[tokio::test]
    async fn reports_quota_of_existing_workspaces() {
        let fx = Fixture::with_quota(true, Some(2048)).await;
        let provider = WorkspaceStoreAccess::new(fx.db.clone());

        let access = provider.access(&fx.identity, &fx.workspace.id).await.unwrap();
        assert!(access.allows(WorkspaceOperation::Delete));
        assert_eq!(access.max_size_bytes, Some(2048));

        let missing = provider.access(&fx.identity, &WorkspaceId::new()).await;
        assert!(matches!(missing, Err(AppError::NotFound(_))));
    }
}

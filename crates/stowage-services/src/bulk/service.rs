use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use uuid::Uuid;

use stowage_core::models::{
    BulkDeleteObjectsJob, FileRecord, Folder, Identity, JobDefinition, Selection,
    UpdateWorkspaceSizeJob,
};
use stowage_core::{
    AppError, FileId, FolderId, StorageId, WorkspaceAccessProvider, WorkspaceId,
    WorkspaceOperation,
};
use stowage_db::{Database, FileRepository, FolderRepository, JobRepository};
use stowage_worker::JobNotifier;

use super::selection::{FolderTree, ResolvedFolders};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    File,
    Folder,
}

/// One selected item the operation could not apply to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemFailure {
    pub id: String,
    pub kind: ItemKind,
    pub reason: String,
}

impl ItemFailure {
    fn file(id: &FileId, reason: &str) -> Self {
        Self {
            id: id.to_string(),
            kind: ItemKind::File,
            reason: reason.to_string(),
        }
    }

    fn folder(id: &FolderId, reason: &str) -> Self {
        Self {
            id: id.to_string(),
            kind: ItemKind::Folder,
            reason: reason.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkOutcome {
    pub files: u64,
    pub folders: u64,
    pub failures: Vec<ItemFailure>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectionSize {
    pub files: u64,
    pub folders: u64,
    pub size_bytes: i64,
    pub failures: Vec<ItemFailure>,
}

struct Resolved {
    all_folders: Vec<Folder>,
    folders: ResolvedFolders,
    files: Vec<FileRecord>,
    failures: Vec<ItemFailure>,
}

/// Delete, move and measure selections of folders and files.
#[derive(Clone)]
pub struct BulkOperations {
    db: Database,
    files: FileRepository,
    folders: FolderRepository,
    access: Arc<dyn WorkspaceAccessProvider>,
    notifier: JobNotifier,
}

impl BulkOperations {
    pub fn new(
        db: Database,
        access: Arc<dyn WorkspaceAccessProvider>,
        notifier: JobNotifier,
    ) -> Self {
        Self {
            files: FileRepository::new(db.pool.clone()),
            folders: FolderRepository::new(db.pool.clone()),
            db,
            access,
            notifier,
        }
    }

    async fn resolve(
        &self,
        workspace_id: &WorkspaceId,
        selection: &Selection,
    ) -> Result<Resolved, AppError> {
        let all_folders = self.folders.list_for_workspace(workspace_id).await?;
        let excluded_files: HashSet<&FileId> = selection.excluded_files.iter().collect();
        let excluded_file_folders: Vec<FolderId> = self
            .files
            .list_by_ids(workspace_id, &selection.excluded_files)
            .await?
            .into_iter()
            .filter_map(|file| file.folder_id)
            .collect();

        let folders = FolderTree::new(&all_folders).resolve(selection, &excluded_file_folders);
        let mut failures: Vec<ItemFailure> = folders
            .unknown
            .iter()
            .map(|id| ItemFailure::folder(id, "folder not found"))
            .collect();

        let mut seen = HashSet::new();
        let mut files = Vec::new();
        for file in self.files.list_in_folders(workspace_id, &folders.included).await? {
            if !excluded_files.contains(&file.id) && seen.insert(file.id.clone()) {
                files.push(file);
            }
        }

        let selected = self
            .files
            .list_by_ids(workspace_id, &selection.selected_files)
            .await?;
        let found: HashSet<&FileId> = selected.iter().map(|file| &file.id).collect();
        failures.extend(
            selection
                .selected_files
                .iter()
                .filter(|id| !found.contains(id))
                .map(|id| ItemFailure::file(id, "file not found")),
        );
        for file in selected {
            if !excluded_files.contains(&file.id) && seen.insert(file.id.clone()) {
                files.push(file);
            }
        }

        Ok(Resolved {
            all_folders,
            folders,
            files,
            failures,
        })
    }

    /// Delete the selected files and every selected folder left empty by it.
    ///
    /// File records go in one transaction with the jobs that delete their objects, so
    /// storage is released even if the process stops right after.
    #[tracing::instrument(skip(self, identity, selection), fields(workspace_id = %workspace_id))]
    pub async fn delete(
        &self,
        identity: &Identity,
        workspace_id: &WorkspaceId,
        selection: &Selection,
    ) -> Result<BulkOutcome, AppError> {
        self.access
            .access(identity, workspace_id)
            .await?
            .require(WorkspaceOperation::Delete)?;
        if selection.is_empty() {
            return Ok(BulkOutcome::default());
        }

        let Resolved {
            folders,
            files,
            mut failures,
            ..
        } = self.resolve(workspace_id, selection).await?;

        let file_ids: Vec<FileId> = files.iter().map(|file| file.id.clone()).collect();
        let mut keys: BTreeMap<(StorageId, String), Vec<String>> = BTreeMap::new();
        for file in files {
            keys.entry((file.storage_id, file.bucket_name))
                .or_default()
                .push(file.storage_key);
        }

        let correlation_id = Uuid::new_v4();
        let ws = workspace_id.clone();
        let removable = folders.removable.clone();
        let (deleted_files, kept_folders) = self
            .db
            .writer
            .execute(move |conn| {
                Box::pin(async move {
                    let deleted = FileRepository::delete_many(conn, &ws, &file_ids).await?;
                    let kept = FolderRepository::delete_many(conn, &ws, &removable).await?;

                    for ((storage_id, bucket_name), keys) in keys {
                        for job in BulkDeleteObjectsJob::chunked(&storage_id, &bucket_name, keys) {
                            JobRepository::insert(conn, &job.to_new_job(correlation_id)?).await?;
                        }
                    }
                    if deleted > 0 {
                        let job = UpdateWorkspaceSizeJob {
                            workspace_id: ws.clone(),
                        };
                        JobRepository::insert(conn, &job.to_new_job(correlation_id)?).await?;
                    }
                    Ok((deleted, kept))
                })
            })
            .await?;
        self.notifier.notify();

        failures.extend(
            kept_folders
                .iter()
                .map(|id| ItemFailure::folder(id, "folder is not empty")),
        );
        let outcome = BulkOutcome {
            files: deleted_files,
            folders: (folders.removable.len() - kept_folders.len()) as u64,
            failures,
        };

        tracing::info!(
            correlation_id = %correlation_id,
            files = outcome.files,
            folders = outcome.folders,
            failures = outcome.failures.len(),
            "Bulk delete completed"
        );
        Ok(outcome)
    }

    /// Move the selection under `destination` (`None` = workspace root).
    ///
    /// Folders move with their whole subtree. A selected folder holding an excluded
    /// item stays where it is and its included children move on their own.
    #[tracing::instrument(skip(self, identity, selection), fields(workspace_id = %workspace_id))]
    pub async fn move_to(
        &self,
        identity: &Identity,
        workspace_id: &WorkspaceId,
        selection: &Selection,
        destination: Option<FolderId>,
    ) -> Result<BulkOutcome, AppError> {
        self.access
            .access(identity, workspace_id)
            .await?
            .require(WorkspaceOperation::Move)?;
        if selection.is_empty() {
            return Ok(BulkOutcome::default());
        }

        let Resolved {
            all_folders,
            folders,
            files,
            mut failures,
        } = self.resolve(workspace_id, selection).await?;

        let tree = FolderTree::new(&all_folders);
        let blocked: HashSet<&FolderId> = match &destination {
            Some(destination) if !tree.contains(destination) => {
                return Err(AppError::NotFound(format!("folder {}", destination)));
            }
            Some(destination) => tree.ancestors_and_self(destination).into_iter().collect(),
            None => HashSet::new(),
        };

        let mut roots = Vec::new();
        for root in &folders.move_roots {
            if blocked.contains(root) {
                failures.push(ItemFailure::folder(
                    root,
                    "cannot move a folder into itself or one of its subfolders",
                ));
            } else {
                roots.push(root.clone());
            }
        }

        let included: HashSet<&FolderId> = folders.included.iter().collect();
        let split: HashSet<&FolderId> = folders.split.iter().collect();
        let file_ids: Vec<FileId> = files
            .iter()
            .filter(|file| match &file.folder_id {
                Some(folder) => split.contains(folder) || !included.contains(folder),
                None => true,
            })
            .map(|file| file.id.clone())
            .collect();

        let ws = workspace_id.clone();
        let (moved_files, moved_folders) = self
            .db
            .writer
            .execute(move |conn| {
                Box::pin(async move {
                    let files =
                        FileRepository::move_many(conn, &ws, &file_ids, destination.as_ref())
                            .await?;
                    let folders =
                        FolderRepository::move_many(conn, &ws, &roots, destination.as_ref())
                            .await?;
                    Ok((files, folders))
                })
            })
            .await?;

        let outcome = BulkOutcome {
            files: moved_files,
            folders: moved_folders,
            failures,
        };
        tracing::info!(
            files = outcome.files,
            folders = outcome.folders,
            failures = outcome.failures.len(),
            "Bulk move completed"
        );
        Ok(outcome)
    }

    /// Number of files and folders in the selection and their total size.
    #[tracing::instrument(skip(self, identity, selection), fields(workspace_id = %workspace_id))]
    pub async fn size_count(
        &self,
        identity: &Identity,
        workspace_id: &WorkspaceId,
        selection: &Selection,
    ) -> Result<SelectionSize, AppError> {
        self.access
            .access(identity, workspace_id)
            .await?
            .require(WorkspaceOperation::Read)?;
        if selection.is_empty() {
            return Ok(SelectionSize::default());
        }

        let resolved = self.resolve(workspace_id, selection).await?;
        Ok(SelectionSize {
            files: resolved.files.len() as u64,
            folders: resolved.folders.included.len() as u64,
            size_bytes: resolved.files.iter().map(|file| file.size_bytes).sum(),
            failures: resolved.failures,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::WorkspaceStoreAccess;
    use crate::testing::Fixture;
    use chrono::Utc;
    use stowage_core::models::{EncryptionMode, JobStatus};
    use stowage_core::WorkspaceAccess;

    struct Tree {
        a: Folder,
        b: Folder,
        c: Folder,
        in_a: FileRecord,
        in_b: FileRecord,
        in_c: FileRecord,
        loose: FileRecord,
    }

    fn folder(fx: &Fixture, parent: Option<&Folder>, name: &str) -> Folder {
        Folder {
            id: FolderId::new(),
            workspace_id: fx.workspace.id.clone(),
            parent_id: parent.map(|p| p.id.clone()),
            name: name.to_string(),
            created_at: Utc::now(),
        }
    }

    fn file(fx: &Fixture, folder: Option<&Folder>, size_bytes: i64) -> FileRecord {
        let id = FileId::new();
        FileRecord {
            storage_key: format!("{}_secret", id),
            id,
            workspace_id: fx.workspace.id.clone(),
            folder_id: folder.map(|f| f.id.clone()),
            name: "f.bin".to_string(),
            extension: Some("bin".to_string()),
            content_type: "application/octet-stream".to_string(),
            size_bytes,
            storage_id: fx.workspace.storage_id.clone(),
            bucket_name: fx.workspace.bucket_name.clone(),
            encryption_mode: EncryptionMode::None,
            owner_user_id: None,
            owner_integration_id: None,
            created_at: Utc::now(),
        }
    }

    /// a/in_a, a/b/in_b, a/b/c/in_c, loose at the root.
    async fn seed(fx: &Fixture) -> Tree {
        let a = folder(fx, None, "a");
        let b = folder(fx, Some(&a), "b");
        let c = folder(fx, Some(&b), "c");
        let tree = Tree {
            in_a: file(fx, Some(&a), 10),
            in_b: file(fx, Some(&b), 20),
            in_c: file(fx, Some(&c), 30),
            loose: file(fx, None, 40),
            a,
            b,
            c,
        };

        let folders = vec![tree.a.clone(), tree.b.clone(), tree.c.clone()];
        let files = vec![
            tree.in_a.clone(),
            tree.in_b.clone(),
            tree.in_c.clone(),
            tree.loose.clone(),
        ];
        fx.db
            .writer
            .execute(move |conn| {
                Box::pin(async move {
                    for folder in &folders {
                        FolderRepository::insert(conn, folder).await?;
                    }
                    for file in &files {
                        FileRepository::insert(conn, file).await?;
                    }
                    Ok(())
                })
            })
            .await
            .unwrap();
        tree
    }

    fn operations(fx: &Fixture) -> BulkOperations {
        BulkOperations::new(
            fx.db.clone(),
            Arc::new(WorkspaceStoreAccess::new(fx.db.clone())),
            fx.notifier.clone(),
        )
    }

    #[tokio::test]
    async fn size_count_honours_exclusions() {
        let fx = Fixture::new(true).await;
        let tree = seed(&fx).await;
        let bulk = operations(&fx);

        let size = bulk
            .size_count(
                &fx.identity,
                &fx.workspace.id,
                &Selection {
                    selected_folders: vec![tree.a.id.clone()],
                    excluded_folders: vec![tree.c.id.clone()],
                    selected_files: vec![tree.loose.id.clone()],
                    excluded_files: vec![tree.in_b.id.clone()],
                },
            )
            .await
            .unwrap();

        assert_eq!(size.files, 2);
        assert_eq!(size.size_bytes, 10 + 40);
        assert_eq!(size.folders, 2);
        assert!(size.failures.is_empty());
    }

    #[tokio::test]
    async fn delete_removes_records_and_enqueues_object_deletes() {
        let fx = Fixture::new(true).await;
        let tree = seed(&fx).await;
        let bulk = operations(&fx);
        let stranger = FileId::new();

        let outcome = bulk
            .delete(
                &fx.identity,
                &fx.workspace.id,
                &Selection {
                    selected_folders: vec![tree.a.id.clone()],
                    excluded_folders: vec![tree.c.id.clone()],
                    selected_files: vec![stranger.clone()],
                    excluded_files: vec![],
                },
            )
            .await
            .unwrap();

        assert_eq!(outcome.files, 2);
        // `a` and `b` still hold the excluded `c`.
        assert_eq!(outcome.folders, 0);
        assert_eq!(outcome.failures, vec![ItemFailure::file(&stranger, "file not found")]);

        let files = FileRepository::new(fx.db.pool.clone());
        assert!(files.get(&fx.workspace.id, &tree.in_a.id).await.unwrap().is_none());
        assert!(files.get(&fx.workspace.id, &tree.in_c.id).await.unwrap().is_some());
        let folders = FolderRepository::new(fx.db.pool.clone());
        assert!(folders.get(&fx.workspace.id, &tree.b.id).await.unwrap().is_some());

        // One object batch and one size recalculation.
        let jobs = JobRepository::new(fx.db.pool.clone());
        assert_eq!(jobs.count_by_status(JobStatus::Pending).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn deleting_a_clean_subtree_removes_its_folders() {
        let fx = Fixture::new(true).await;
        let tree = seed(&fx).await;
        let bulk = operations(&fx);

        let outcome = bulk
            .delete(
                &fx.identity,
                &fx.workspace.id,
                &Selection {
                    selected_folders: vec![tree.a.id.clone()],
                    ..Selection::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(outcome.files, 3);
        assert_eq!(outcome.folders, 3);
        assert!(outcome.failures.is_empty());
        let folders = FolderRepository::new(fx.db.pool.clone());
        assert!(folders
            .list_for_workspace(&fx.workspace.id)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn move_keeps_excluded_items_in_place() {
        let fx = Fixture::new(true).await;
        let tree = seed(&fx).await;
        let target = folder(&fx, None, "target");
        let to_insert = target.clone();
        fx.db
            .writer
            .execute(move |conn| {
                Box::pin(async move { FolderRepository::insert(conn, &to_insert).await })
            })
            .await
            .unwrap();
        let bulk = operations(&fx);

        let outcome = bulk
            .move_to(
                &fx.identity,
                &fx.workspace.id,
                &Selection {
                    selected_folders: vec![tree.a.id.clone()],
                    excluded_files: vec![tree.in_c.id.clone()],
                    ..Selection::default()
                },
                Some(target.id.clone()),
            )
            .await
            .unwrap();

        // a, b and c all hold the excluded file; their own files move individually.
        assert_eq!(outcome.files, 2);
        assert_eq!(outcome.folders, 0);

        let files = FileRepository::new(fx.db.pool.clone());
        let moved = files.get(&fx.workspace.id, &tree.in_b.id).await.unwrap().unwrap();
        assert_eq!(moved.folder_id, Some(target.id.clone()));
        let pinned = files.get(&fx.workspace.id, &tree.in_c.id).await.unwrap().unwrap();
        assert_eq!(pinned.folder_id, Some(tree.c.id.clone()));
    }

    #[tokio::test]
    async fn moving_a_folder_into_its_subtree_is_reported() {
        let fx = Fixture::new(true).await;
        let tree = seed(&fx).await;
        let bulk = operations(&fx);

        let outcome = bulk
            .move_to(
                &fx.identity,
                &fx.workspace.id,
                &Selection {
                    selected_folders: vec![tree.b.id.clone()],
                    selected_files: vec![tree.loose.id.clone()],
                    ..Selection::default()
                },
                Some(tree.c.id.clone()),
            )
            .await
            .unwrap();

        assert_eq!(outcome.files, 1);
        assert_eq!(outcome.folders, 0);
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].kind, ItemKind::Folder);

        let missing = bulk
            .move_to(
                &fx.identity,
                &fx.workspace.id,
                &Selection {
                    selected_files: vec![tree.loose.id.clone()],
                    ..Selection::default()
                },
                Some(FolderId::new()),
            )
            .await;
        assert!(matches!(missing, Err(AppError::NotFound(_))));
    }

    struct ReadOnly;

    #[async_trait::async_trait]
    impl WorkspaceAccessProvider for ReadOnly {
        async fn access(
            &self,
            _identity: &Identity,
            _workspace_id: &WorkspaceId,
        ) -> Result<WorkspaceAccess, AppError> {
            Ok(WorkspaceAccess {
                allowed: [WorkspaceOperation::Read].into_iter().collect(),
                current_size_bytes: 0,
                max_size_bytes: None,
            })
        }
    }

    #[tokio::test]
    async fn delete_requires_permission() {
        let fx = Fixture::new(true).await;
        let tree = seed(&fx).await;
        let bulk = BulkOperations::new(fx.db.clone(), Arc::new(ReadOnly), fx.notifier.clone());

        let result = bulk
            .delete(
                &fx.identity,
                &fx.workspace.id,
                &Selection {
                    selected_files: vec![tree.loose.id.clone()],
                    ..Selection::default()
                },
            )
            .await;
        assert!(matches!(result, Err(AppError::Forbidden(_))));
    }
}

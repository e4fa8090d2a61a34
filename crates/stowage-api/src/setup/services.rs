//! Service construction and background task startup.

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use stowage_core::{Config, WorkspaceAccessProvider};
use stowage_db::{Database, WorkspaceRepository};
use stowage_services::{
    register_executors, AbandonedUploadReclaimer, BulkOperations, StorageService,
    UploadOrchestrator, UploadSettings, WorkspaceService, WorkspaceStoreAccess,
};
use stowage_storage::{LocalUrlSigner, StorageRegistry};
use stowage_worker::{ExecutorRegistry, JobNotifier, JobQueue, JobQueueHandle};

use crate::state::AppState;

/// Job queue lanes and the abandoned-upload reclaimer.
pub struct BackgroundTasks {
    job_queue: JobQueueHandle,
    reclaimer: JoinHandle<()>,
    shutdown: CancellationToken,
}

impl BackgroundTasks {
    /// Stop the reclaimer, then drain the job queue.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        if let Err(e) = self.reclaimer.await {
            tracing::error!(error = %e, "Abandoned upload reclaimer panicked");
        }
        self.job_queue.shutdown().await;
    }
}

/// Load storage backends, build the services and start the background workers.
pub async fn initialize_services(
    config: &Config,
    db: Database,
) -> Result<(Arc<AppState>, BackgroundTasks)> {
    let registry = StorageRegistry::new();
    let storages = StorageService::from_config(db.clone(), registry.clone(), config);
    storages
        .load_all()
        .await
        .context("Failed to load storage configurations")?;
    if let Some(bootstrap) = &config.bootstrap_storage {
        storages
            .bootstrap(bootstrap)
            .await
            .context("Failed to configure bootstrap storage")?;
    }

    let notifier = JobNotifier::new();
    let access: Arc<dyn WorkspaceAccessProvider> = Arc::new(WorkspaceStoreAccess::new(db.clone()));

    let uploads = UploadOrchestrator::new(
        db.clone(),
        registry.clone(),
        access.clone(),
        notifier.clone(),
        UploadSettings::from_config(config),
    );
    let bulk = BulkOperations::new(db.clone(), access.clone(), notifier.clone());
    let workspaces = WorkspaceService::new(
        db.clone(),
        registry.clone(),
        access,
        notifier.clone(),
        config.storage_retry_attempts,
    );

    let mut executors = ExecutorRegistry::new();
    register_executors(&mut executors, db.clone(), registry);
    let job_queue = JobQueue::new(
        db.clone(),
        executors,
        config.job_queue.clone(),
        notifier.clone(),
    )
    .start()
    .await
    .context("Failed to start job queue")?;

    let shutdown = CancellationToken::new();
    let reclaimer = Arc::new(AbandonedUploadReclaimer::from_config(
        db.clone(),
        notifier,
        config,
    ))
    .start(shutdown.clone());

    let state = Arc::new(AppState {
        config: config.clone(),
        workspace_repository: WorkspaceRepository::new(db.pool.clone()),
        local_signer: LocalUrlSigner::new(
            &config.local_storage_signing_secret,
            config.public_base_url.clone(),
        ),
        db,
        uploads,
        bulk,
        workspaces,
        storages,
    });

    tracing::info!("Services initialized");
    Ok((
        state,
        BackgroundTasks {
            job_queue,
            reclaimer,
            shutdown,
        },
    ))
}

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;

use stowage_core::models::JobLane;
use stowage_core::{AppError, Config};
use stowage_db::{Database, UploadRepository};
use stowage_worker::JobNotifier;

use crate::upload::abandon_upload;

const SCAN_BATCH_SIZE: i64 = 100;

/// Periodically abandons uploads that have been idle longer than the retention period.
///
/// Abandoning an upload enqueues the job that releases its backend storage, so a
/// scan only touches the database.
#[derive(Clone)]
pub struct AbandonedUploadReclaimer {
    db: Database,
    uploads: UploadRepository,
    notifier: JobNotifier,
    retention: chrono::Duration,
    scan_interval: Duration,
}

impl AbandonedUploadReclaimer {
    pub fn new(
        db: Database,
        notifier: JobNotifier,
        retention: chrono::Duration,
        scan_interval: Duration,
    ) -> Self {
        Self {
            uploads: UploadRepository::new(db.pool.clone()),
            db,
            notifier,
            retention,
            scan_interval,
        }
    }

    pub fn from_config(db: Database, notifier: JobNotifier, config: &Config) -> Self {
        Self::new(
            db,
            notifier,
            config.abandoned_upload_retention(),
            Duration::from_secs(config.abandoned_upload_scan_interval_secs.max(1)),
        )
    }

    /// Start the background scan. Returns a JoinHandle for graceful shutdown.
    pub fn start(self: Arc<Self>, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut scan_interval = interval(self.scan_interval);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = scan_interval.tick() => {}
                }

                match self.reclaim_once().await {
                    Ok(0) => tracing::debug!("No abandoned uploads found"),
                    Ok(count) => tracing::info!(abandoned = count, "Abandoned uploads scheduled for reclaim"),
                    Err(e) => tracing::error!(error = %e, "Abandoned upload scan failed"),
                }
            }

            tracing::info!("Abandoned upload reclaimer stopped");
        })
    }

    /// Abandon every upload idle since before the retention cutoff. Returns how many
    /// uploads this scan abandoned.
    #[tracing::instrument(skip(self), fields(cleanup.operation = "abandon_idle_uploads"))]
    pub async fn reclaim_once(&self) -> Result<usize, AppError> {
        let cutoff = Utc::now() - self.retention;
        let mut total = 0;

        loop {
            let idle = self.uploads.list_inactive(cutoff, SCAN_BATCH_SIZE).await?;
            let batch_len = idle.len();
            let mut abandoned = 0;

            for upload in idle {
                tracing::info!(
                    upload_id = %upload.id,
                    workspace_id = %upload.workspace_id,
                    last_activity_at = %upload.last_activity_at,
                    "Abandoning idle upload"
                );

                let id = upload.id.clone();
                let result = self
                    .db
                    .writer
                    .execute(move |conn| {
                        Box::pin(async move {
                            abandon_upload(conn, &id, Utc::now(), Some(cutoff)).await
                        })
                    })
                    .await;
                match result {
                    Ok(true) => abandoned += 1,
                    Ok(false) => {}
                    Err(e) => {
                        tracing::error!(upload_id = %upload.id, error = %e, "Failed to abandon upload")
                    }
                }
            }

            if abandoned > 0 {
                self.notifier.notify_lane(JobLane::Normal);
            }
            total += abandoned;

            // Failed rows stay idle and would be listed again; leave them for the next tick.
            if batch_len < SCAN_BATCH_SIZE as usize || abandoned == 0 {
                break;
            }
        }

        Ok(total)
    }
}

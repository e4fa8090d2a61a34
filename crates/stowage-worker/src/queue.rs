//! Job queue: per-lane worker pools, wakeups, retry and the stale job reaper.
//!
//! Jobs are rows in `queue_jobs`, so they survive restarts. Delivery is at least once:
//! every claim is a single atomic update through the database writer, and any job left
//! `in_flight` by a crash is put back in line when the queue starts.
//!
//! Shutdown: [`JobQueueHandle::shutdown`] stops claiming, cancels the token handed to
//! running executors and waits for each lane to drain.

use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use stowage_core::models::{JobDefinition, JobLane, QueueJob};
use stowage_core::{AppError, JobQueueSettings};
use stowage_db::{Database, JobRepository};

use crate::context::{ExecutorRegistry, JobAlertSink, LoggingAlertSink};

/// Maximum delay in seconds before retrying a failed job. Caps exponential backoff
/// so that high attempt counts do not produce excessively long delays.
pub const MAX_RETRY_BACKOFF_SECS: u64 = 300;

/// Backoff in seconds after `attempt_count` earlier failed attempts (exponential with cap).
#[inline]
pub(crate) fn compute_retry_backoff_seconds(attempt_count: i64) -> u64 {
    2_u64
        .saturating_pow(attempt_count.clamp(0, 63) as u32)
        .min(MAX_RETRY_BACKOFF_SECS)
}

/// Wakes the lane dispatchers when jobs are committed.
///
/// Code that inserts jobs inside its own write transaction calls [`JobNotifier::notify`]
/// after the commit. Lanes also poll, so a missed wakeup only delays a job.
#[derive(Clone, Default)]
pub struct JobNotifier {
    normal: Arc<Notify>,
    long_running: Arc<Notify>,
}

impl JobNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notify(&self) {
        self.normal.notify_one();
        self.long_running.notify_one();
    }

    pub fn notify_lane(&self, lane: JobLane) {
        self.lane(lane).notify_one();
    }

    fn lane(&self, lane: JobLane) -> &Arc<Notify> {
        match lane {
            JobLane::Normal => &self.normal,
            JobLane::LongRunning => &self.long_running,
        }
    }
}

#[derive(Clone)]
pub struct JobQueue {
    db: Database,
    executors: Arc<ExecutorRegistry>,
    settings: JobQueueSettings,
    notifier: JobNotifier,
    alerts: Arc<dyn JobAlertSink>,
    shutdown: CancellationToken,
}

impl JobQueue {
    pub fn new(
        db: Database,
        executors: ExecutorRegistry,
        settings: JobQueueSettings,
        notifier: JobNotifier,
    ) -> Self {
        Self {
            db,
            executors: Arc::new(executors),
            settings,
            notifier,
            alerts: Arc::new(LoggingAlertSink),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_alert_sink(mut self, alerts: Arc<dyn JobAlertSink>) -> Self {
        self.alerts = alerts;
        self
    }

    pub fn notifier(&self) -> &JobNotifier {
        &self.notifier
    }

    /// Submit a job on its own. Jobs that must commit together with other state are
    /// inserted with [`JobRepository::insert`] inside that write instead.
    #[tracing::instrument(skip(self, job), fields(job.type = D::JOB_TYPE, correlation_id = %correlation_id))]
    pub async fn enqueue<D: JobDefinition>(
        &self,
        job: &D,
        correlation_id: Uuid,
    ) -> Result<i64, AppError> {
        let new_job = job.to_new_job(correlation_id)?;
        let lane = new_job.lane;
        let id = self
            .db
            .writer
            .execute(move |conn| Box::pin(async move { JobRepository::insert(conn, &new_job).await }))
            .await?;
        self.notifier.notify_lane(lane);

        tracing::info!(job_id = id, lane = %lane, "Job submitted to queue");
        Ok(id)
    }

    /// Return orphaned `in_flight` jobs to the queue and start both lanes and the reaper.
    pub async fn start(&self) -> Result<JobQueueHandle, AppError> {
        let reset = self
            .db
            .writer
            .execute(|conn| Box::pin(async move { JobRepository::reset_in_flight(conn).await }))
            .await?;
        if reset > 0 {
            tracing::warn!(jobs = reset, "Requeued jobs left in flight by a previous run");
        }

        let mut tasks = Vec::new();
        for lane in [JobLane::Normal, JobLane::LongRunning] {
            tasks.push(tokio::spawn(self.clone().run_lane(lane)));
        }
        if self.settings.stale_job_reap_interval_secs > 0 {
            tasks.push(tokio::spawn(self.clone().run_reaper()));
        }

        tracing::info!(
            executors = ?self.executors.job_types(),
            normal_workers = self.settings.normal_workers,
            long_running_workers = self.settings.long_running_workers,
            "Job queue started"
        );

        Ok(JobQueueHandle {
            shutdown: self.shutdown.clone(),
            tasks,
        })
    }

    /// Signals the lanes to stop claiming. Does not wait; see [`JobQueueHandle::shutdown`].
    pub fn shutdown(&self) {
        tracing::info!("Initiating job queue shutdown");
        self.shutdown.cancel();
    }

    fn lane_workers(&self, lane: JobLane) -> usize {
        match lane {
            JobLane::Normal => self.settings.normal_workers,
            JobLane::LongRunning => self.settings.long_running_workers,
        }
        .max(1)
    }

    fn lane_timeout(&self, lane: JobLane) -> Duration {
        Duration::from_secs(match lane {
            JobLane::Normal => self.settings.job_timeout_secs,
            JobLane::LongRunning => self.settings.long_running_job_timeout_secs,
        })
    }

    async fn run_lane(self, lane: JobLane) {
        let workers = self.lane_workers(lane);
        let semaphore = Arc::new(Semaphore::new(workers));
        let poll_interval = Duration::from_millis(self.settings.poll_interval_ms.max(1));
        let notify = self.notifier.lane(lane).clone();

        tracing::info!(
            lane = %lane,
            workers = workers,
            poll_interval_ms = self.settings.poll_interval_ms,
            "Job lane started"
        );

        loop {
            self.dispatch_available(lane, &semaphore).await;
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = notify.notified() => {}
                _ = sleep(poll_interval) => {}
            }
        }

        // Every permit back means every spawned job has finished.
        let _ = semaphore.acquire_many(workers as u32).await;
        tracing::info!(lane = %lane, "Job lane stopped");
    }

    /// Claim and spawn jobs until the lane is saturated or nothing is due.
    async fn dispatch_available(&self, lane: JobLane, semaphore: &Arc<Semaphore>) {
        loop {
            if self.shutdown.is_cancelled() {
                return;
            }
            let available = semaphore.available_permits();
            if available == 0 {
                tracing::trace!(lane = %lane, "No workers available, skipping claim");
                return;
            }

            let limit = available.min(self.settings.claim_batch_size.max(1));
            let claimed = self
                .db
                .writer
                .execute(move |conn| {
                    Box::pin(async move { JobRepository::claim(conn, lane, limit, Utc::now()).await })
                })
                .await;
            let jobs = match claimed {
                Ok(jobs) => jobs,
                Err(e) => {
                    tracing::error!(lane = %lane, error = %e, "Failed to claim jobs");
                    return;
                }
            };
            let count = jobs.len();
            if count == 0 {
                return;
            }

            for job in jobs {
                // Only this loop takes permits, so one is free for every claimed job.
                let Ok(permit) = semaphore.clone().acquire_owned().await else {
                    return;
                };
                let queue = self.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    queue.process_job(job).await;
                    queue.notifier.notify_lane(lane);
                });
            }

            if count < limit {
                return;
            }
        }
    }

    #[tracing::instrument(
        skip(self, job),
        fields(job.id = job.id, job.type = %job.job_type, correlation_id = %job.correlation_id, attempt = job.attempt_count + 1)
    )]
    async fn process_job(&self, job: QueueJob) {
        let Some(executor) = self.executors.get(&job.job_type) else {
            let error = format!("no executor registered for job type {}", job.job_type);
            self.fail(&job, &error).await;
            return;
        };

        let timeout = self.lane_timeout(job.lane);
        let started = Instant::now();
        let outcome =
            tokio::time::timeout(timeout, executor.execute(&job, self.shutdown.child_token())).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(Ok(())) => {
                let id = job.id;
                let marked = self
                    .db
                    .writer
                    .execute(move |conn| Box::pin(async move { JobRepository::mark_done(conn, id).await }))
                    .await;
                match marked {
                    Ok(()) => tracing::info!(duration_ms = duration_ms, "Job completed successfully"),
                    Err(e) => tracing::error!(error = %e, "Failed to mark job as done"),
                }
            }
            Ok(Err(_)) if self.shutdown.is_cancelled() => {
                self.release(&job, "interrupted by shutdown").await;
            }
            Ok(Err(e)) => {
                let error = format!("{:#}", e.inner());
                tracing::warn!(
                    error = %error,
                    recoverable = e.is_recoverable(),
                    duration_ms = duration_ms,
                    "Job execution failed"
                );
                if e.is_recoverable() {
                    self.retry_or_fail(&job, &error).await;
                } else {
                    self.fail(&job, &error).await;
                }
            }
            Err(_) => {
                let error = format!("timed out after {}s", timeout.as_secs());
                tracing::error!(timeout_secs = timeout.as_secs(), "Job execution timed out");
                self.retry_or_fail(&job, &error).await;
            }
        }
    }

    async fn retry_or_fail(&self, job: &QueueJob, error: &str) {
        if !job.can_retry() {
            self.fail(job, error).await;
            return;
        }

        let backoff_seconds = compute_retry_backoff_seconds(job.attempt_count);
        let next_attempt_at = Utc::now() + chrono::Duration::seconds(backoff_seconds as i64);
        let (id, attempt_count, error_text) = (job.id, job.attempt_count + 1, error.to_string());
        let recorded = self
            .db
            .writer
            .execute(move |conn| {
                Box::pin(async move {
                    JobRepository::record_retry(conn, id, attempt_count, next_attempt_at, &error_text)
                        .await
                })
            })
            .await;

        match recorded {
            Ok(()) => tracing::info!(
                attempt_count = attempt_count,
                max_attempts = job.max_attempts,
                backoff_seconds = backoff_seconds,
                "Scheduling job retry"
            ),
            Err(e) => tracing::error!(error = %e, "Failed to schedule job retry"),
        }
    }

    async fn fail(&self, job: &QueueJob, error: &str) {
        let (id, attempt_count, error_text) = (job.id, job.attempt_count + 1, error.to_string());
        let marked = self
            .db
            .writer
            .execute(move |conn| {
                Box::pin(async move {
                    JobRepository::mark_failed(conn, id, attempt_count, &error_text).await
                })
            })
            .await;
        if let Err(e) = marked {
            tracing::error!(error = %e, "Failed to mark job as failed");
        }
        self.alerts.job_failed(job, error);
    }

    /// Put a job back without charging an attempt.
    async fn release(&self, job: &QueueJob, reason: &str) {
        let (id, attempt_count, reason_text) = (job.id, job.attempt_count, reason.to_string());
        let released = self
            .db
            .writer
            .execute(move |conn| {
                Box::pin(async move {
                    JobRepository::record_retry(conn, id, attempt_count, Utc::now(), &reason_text)
                        .await
                })
            })
            .await;
        if let Err(e) = released {
            // Still in flight; the next startup requeues it.
            tracing::warn!(error = %e, "Failed to release interrupted job");
        }
    }

    async fn run_reaper(self) {
        let mut interval =
            tokio::time::interval(Duration::from_secs(self.settings.stale_job_reap_interval_secs));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.reap_once().await {
                        tracing::error!(error = %e, "Stale job reaper failed");
                    }
                }
                _ = self.shutdown.cancelled() => break,
            }
        }
    }

    /// Requeue jobs held past their lane timeout plus the grace period, and purge
    /// finished jobs past retention. Returns `(requeued, purged)`.
    pub async fn reap_once(&self) -> Result<(u64, u64), AppError> {
        let now = Utc::now();
        let grace = Duration::from_secs(self.settings.stale_job_grace_period_secs);
        let mut requeued = 0;

        for lane in [JobLane::Normal, JobLane::LongRunning] {
            let cutoff = self.lane_timeout(lane) + grace;
            let claimed_before = now
                - chrono::Duration::from_std(cutoff)
                    .map_err(|e| AppError::Internal(format!("invalid stale job cutoff: {}", e)))?;
            requeued += self
                .db
                .writer
                .execute(move |conn| {
                    Box::pin(async move { JobRepository::reap_stale(conn, lane, claimed_before).await })
                })
                .await?;
        }

        let mut purged = 0;
        if self.settings.finished_job_retention_days > 0 {
            let before =
                now - chrono::Duration::days(self.settings.finished_job_retention_days as i64);
            purged = self
                .db
                .writer
                .execute(move |conn| {
                    Box::pin(async move { JobRepository::purge_finished(conn, before).await })
                })
                .await?;
        }

        if requeued > 0 {
            tracing::warn!(jobs = requeued, "Requeued stale in-flight jobs");
            self.notifier.notify();
        }
        if purged > 0 {
            tracing::debug!(jobs = purged, "Purged finished jobs");
        }
        Ok((requeued, purged))
    }
}

/// Running lanes and reaper.
pub struct JobQueueHandle {
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl JobQueueHandle {
    /// Stop claiming, cancel running executors and wait for the lanes to drain.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "Job queue task panicked");
            }
        }
        tracing::info!("Job queue stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::JobExecutor;
    use async_trait::async_trait;
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use stowage_core::models::{DeleteBucketJob, JobStatus, NewJob};
    use stowage_core::{JobError, StorageId};
    use stowage_db::DatabaseSettings;

    #[derive(Serialize, Deserialize)]
    struct SampleJob {
        label: String,
    }

    impl JobDefinition for SampleJob {
        const JOB_TYPE: &'static str = "sample";
        const MAX_ATTEMPTS: i64 = 2;
    }

    enum Behaviour {
        Succeed,
        FailRecoverable,
        FailFatal,
    }

    struct SampleExecutor {
        calls: AtomicUsize,
        behaviour: Behaviour,
    }

    impl SampleExecutor {
        fn new(behaviour: Behaviour) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                behaviour,
            })
        }
    }

    #[async_trait]
    impl JobExecutor for SampleExecutor {
        fn job_type(&self) -> &'static str {
            SampleJob::JOB_TYPE
        }

        async fn execute(&self, job: &QueueJob, _cancel: CancellationToken) -> Result<(), JobError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let payload: SampleJob = job
                .payload_as()
                .map_err(JobError::unrecoverable)?;
            match self.behaviour {
                Behaviour::Succeed => Ok(()),
                Behaviour::FailRecoverable => Err(JobError::recoverable(anyhow::anyhow!(
                    "SlowDown while handling {}",
                    payload.label
                ))),
                Behaviour::FailFatal => Err(JobError::unrecoverable(anyhow::anyhow!(
                    "AccessDenied"
                ))),
            }
        }
    }

    #[derive(Serialize, Deserialize)]
    struct PatientJob;

    impl JobDefinition for PatientJob {
        const JOB_TYPE: &'static str = "patient";
        const MAX_ATTEMPTS: i64 = 4;
    }

    /// Fails recoverably every time and remembers the attempt count it was handed.
    #[derive(Default)]
    struct AttemptRecorder(Mutex<Vec<i64>>);

    #[async_trait]
    impl JobExecutor for AttemptRecorder {
        fn job_type(&self) -> &'static str {
            PatientJob::JOB_TYPE
        }

        async fn execute(&self, job: &QueueJob, _cancel: CancellationToken) -> Result<(), JobError> {
            self.0.lock().unwrap().push(job.attempt_count);
            Err(JobError::recoverable(anyhow::anyhow!("ServiceUnavailable")))
        }
    }

    #[derive(Default)]
    struct RecordingAlerts(Mutex<Vec<String>>);

    impl JobAlertSink for RecordingAlerts {
        fn job_failed(&self, job: &QueueJob, _error: &str) {
            self.0.lock().unwrap().push(job.job_type.clone());
        }
    }

    fn fast_settings() -> JobQueueSettings {
        JobQueueSettings {
            poll_interval_ms: 20,
            stale_job_reap_interval_secs: 0,
            ..JobQueueSettings::default()
        }
    }

    async fn open_db() -> (tempfile::TempDir, Database) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(&DatabaseSettings::for_path(dir.path().join("jobs.db")))
            .await
            .unwrap();
        (dir, db)
    }

    fn queue_with(db: &Database, executor: Option<Arc<SampleExecutor>>) -> JobQueue {
        let mut executors = ExecutorRegistry::new();
        if let Some(executor) = executor {
            executors.register(executor);
        }
        JobQueue::new(db.clone(), executors, fast_settings(), JobNotifier::new())
    }

    async fn wait_for_status(db: &Database, id: i64, status: JobStatus) -> QueueJob {
        let repo = JobRepository::new(db.pool.clone());
        for _ in 0..500 {
            let job = repo.get(id).await.unwrap().unwrap();
            if job.status == status {
                return job;
            }
            sleep(Duration::from_millis(20)).await;
        }
        panic!("job {} never reached {:?}", id, status);
    }

    fn sample(label: &str) -> SampleJob {
        SampleJob {
            label: label.to_string(),
        }
    }

    #[test]
    fn retry_backoff_exponential_then_capped() {
        assert_eq!(compute_retry_backoff_seconds(0), 1);
        assert_eq!(compute_retry_backoff_seconds(1), 2);
        assert_eq!(compute_retry_backoff_seconds(2), 4);
        assert_eq!(compute_retry_backoff_seconds(8), 256);
        assert_eq!(compute_retry_backoff_seconds(9), MAX_RETRY_BACKOFF_SECS);
        assert_eq!(compute_retry_backoff_seconds(200), MAX_RETRY_BACKOFF_SECS);
    }

    #[tokio::test]
    async fn successful_job_is_marked_done() {
        let (_dir, db) = open_db().await;
        let executor = SampleExecutor::new(Behaviour::Succeed);
        let queue = queue_with(&db, Some(executor.clone()));
        let handle = queue.start().await.unwrap();

        let id = queue.enqueue(&sample("ok"), Uuid::new_v4()).await.unwrap();
        let job = wait_for_status(&db, id, JobStatus::Done).await;
        assert_eq!(job.attempt_count, 0);
        assert_eq!(executor.calls.load(Ordering::SeqCst), 1);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn recoverable_failures_retry_until_attempts_are_spent() {
        let (_dir, db) = open_db().await;
        let executor = SampleExecutor::new(Behaviour::FailRecoverable);
        let alerts = Arc::new(RecordingAlerts::default());
        let queue = queue_with(&db, Some(executor.clone())).with_alert_sink(alerts.clone());
        let handle = queue.start().await.unwrap();

        let id = queue.enqueue(&sample("flaky"), Uuid::new_v4()).await.unwrap();
        let job = wait_for_status(&db, id, JobStatus::Failed).await;

        assert_eq!(job.attempt_count, 2);
        assert_eq!(executor.calls.load(Ordering::SeqCst), 2);
        assert!(job.last_error.unwrap().contains("SlowDown"));
        assert_eq!(alerts.0.lock().unwrap().as_slice(), ["sample"]);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn every_retry_sees_a_higher_attempt_count() {
        let (_dir, db) = open_db().await;
        let recorder = Arc::new(AttemptRecorder::default());
        let mut executors = ExecutorRegistry::new();
        executors.register(recorder.clone());
        let queue = JobQueue::new(db.clone(), executors, fast_settings(), JobNotifier::new());
        let handle = queue.start().await.unwrap();

        let id = queue.enqueue(&PatientJob, Uuid::new_v4()).await.unwrap();
        let repo = JobRepository::new(db.pool.clone());
        let mut failed = None;
        for _ in 0..500 {
            let job = repo.get(id).await.unwrap().unwrap();
            if job.status == JobStatus::Failed {
                failed = Some(job);
                break;
            }
            // Skip the backoff so the test does not wait out each delay.
            sqlx::query(
                "UPDATE queue_jobs SET next_attempt_at = ?1 WHERE id = ?2 AND status = 'pending'",
            )
            .bind(Utc::now())
            .bind(id)
            .execute(&db.pool)
            .await
            .unwrap();
            sleep(Duration::from_millis(20)).await;
        }
        let failed = failed.expect("job never failed");

        let seen = recorder.0.lock().unwrap().clone();
        assert_eq!(seen, vec![0, 1, 2, 3]);
        assert!(seen.windows(2).all(|pair| pair[0] < pair[1]));
        assert_eq!(failed.attempt_count, 4);
        assert!(failed.last_error.unwrap().contains("ServiceUnavailable"));

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn unrecoverable_failure_is_not_retried() {
        let (_dir, db) = open_db().await;
        let executor = SampleExecutor::new(Behaviour::FailFatal);
        let queue = queue_with(&db, Some(executor.clone()));
        let handle = queue.start().await.unwrap();

        let id = queue.enqueue(&sample("denied"), Uuid::new_v4()).await.unwrap();
        let job = wait_for_status(&db, id, JobStatus::Failed).await;
        assert_eq!(job.attempt_count, 1);
        assert_eq!(executor.calls.load(Ordering::SeqCst), 1);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn job_without_executor_fails() {
        let (_dir, db) = open_db().await;
        let queue = queue_with(&db, None);
        let handle = queue.start().await.unwrap();

        let job = DeleteBucketJob {
            storage_id: StorageId::new(),
            bucket_name: "gone".to_string(),
        };
        let id = queue.enqueue(&job, Uuid::new_v4()).await.unwrap();
        let failed = wait_for_status(&db, id, JobStatus::Failed).await;
        assert!(failed.last_error.unwrap().contains("no executor"));

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn job_in_flight_during_a_crash_runs_after_restart() {
        let (_dir, db) = open_db().await;

        // A previous process claimed the job and died before finishing it.
        let new_job: NewJob = sample("orphan").to_new_job(Uuid::new_v4()).unwrap();
        let id = db
            .writer
            .execute(move |conn| {
                Box::pin(async move {
                    let id = JobRepository::insert(conn, &new_job).await?;
                    JobRepository::claim(conn, JobLane::Normal, 1, Utc::now()).await?;
                    Ok(id)
                })
            })
            .await
            .unwrap();

        let executor = SampleExecutor::new(Behaviour::Succeed);
        let queue = queue_with(&db, Some(executor.clone()));
        let handle = queue.start().await.unwrap();

        wait_for_status(&db, id, JobStatus::Done).await;
        assert_eq!(executor.calls.load(Ordering::SeqCst), 1);

        handle.shutdown().await;
    }
}

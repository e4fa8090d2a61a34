//! Job executors and failure alerts
//!
//! The services crate implements [`JobExecutor`] once per job type and registers each
//! implementation in an [`ExecutorRegistry`]. The queue looks executors up by the job's
//! type tag when it dispatches a claimed job.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use stowage_core::models::QueueJob;
use stowage_core::JobError;

/// Runs one type of job.
///
/// Executors must be idempotent: a job can run more than once after a crash or a
/// timeout. A recoverable [`JobError`] is retried with backoff; an unrecoverable one
/// fails the job immediately.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    fn job_type(&self) -> &'static str;

    async fn execute(&self, job: &QueueJob, cancel: CancellationToken) -> Result<(), JobError>;
}

#[derive(Default, Clone)]
pub struct ExecutorRegistry {
    executors: HashMap<&'static str, Arc<dyn JobExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `executor` for its job type, replacing any earlier registration.
    pub fn register(&mut self, executor: Arc<dyn JobExecutor>) -> &mut Self {
        let job_type = executor.job_type();
        if self.executors.insert(job_type, executor).is_some() {
            tracing::warn!(job_type = job_type, "Replacing job executor");
        }
        self
    }

    pub fn get(&self, job_type: &str) -> Option<Arc<dyn JobExecutor>> {
        self.executors.get(job_type).cloned()
    }

    pub fn job_types(&self) -> Vec<&'static str> {
        let mut types: Vec<_> = self.executors.keys().copied().collect();
        types.sort_unstable();
        types
    }
}

/// Receives jobs that failed permanently.
pub trait JobAlertSink: Send + Sync {
    fn job_failed(&self, job: &QueueJob, error: &str);
}

/// Default sink: an error-level log line carrying the job's correlation id.
pub struct LoggingAlertSink;

impl JobAlertSink for LoggingAlertSink {
    fn job_failed(&self, job: &QueueJob, error: &str) {
        tracing::error!(
            job_id = job.id,
            job_type = %job.job_type,
            correlation_id = %job.correlation_id,
            attempts = job.attempt_count + 1,
            error = %error,
            "Job failed permanently"
        );
    }
}

//! Durable background job models and the job definitions the pipeline enqueues.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::str::FromStr;
use uuid::Uuid;

use crate::ids::{FileUploadId, StorageId, WorkspaceId};

pub const DEFAULT_MAX_ATTEMPTS: i64 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    InFlight,
    Done,
    Failed,
}

impl Display for JobStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::InFlight => write!(f, "in_flight"),
            JobStatus::Done => write!(f, "done"),
            JobStatus::Failed => write!(f, "failed"),
        }
    }
}

impl FromStr for JobStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "in_flight" => Ok(JobStatus::InFlight),
            "done" => Ok(JobStatus::Done),
            "failed" => Ok(JobStatus::Failed),
            _ => Err(anyhow::anyhow!("Invalid job status: {}", s)),
        }
    }
}

/// Execution lane. Each lane has its own worker pool.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[serde(rename_all = "snake_case")]
pub enum JobLane {
    #[default]
    Normal,
    LongRunning,
}

impl Display for JobLane {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            JobLane::Normal => write!(f, "normal"),
            JobLane::LongRunning => write!(f, "long_running"),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low = 3,
    #[default]
    Normal = 5,
    High = 7,
    Critical = 10,
}

impl Priority {
    pub fn as_i64(&self) -> i64 {
        *self as i64
    }

    pub fn from_i64(value: i64) -> Self {
        match value {
            i64::MIN..=3 => Priority::Low,
            4..=6 => Priority::Normal,
            7..=9 => Priority::High,
            _ => Priority::Critical,
        }
    }
}

impl From<Priority> for i64 {
    fn from(priority: Priority) -> Self {
        priority as i64
    }
}

/// A persisted job row.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct QueueJob {
    pub id: i64,
    pub job_type: String,
    pub lane: JobLane,
    pub priority: i64,
    /// Serialized job definition (JSON).
    pub payload: String,
    pub correlation_id: Uuid,
    pub status: JobStatus,
    pub attempt_count: i64,
    pub max_attempts: i64,
    pub next_attempt_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl QueueJob {
    /// Whether another attempt is allowed after the current one fails.
    pub fn can_retry(&self) -> bool {
        self.attempt_count + 1 < self.max_attempts
    }

    pub fn priority(&self) -> Priority {
        Priority::from_i64(self.priority)
    }

    pub fn payload_as<D: JobDefinition>(&self) -> Result<D, serde_json::Error> {
        serde_json::from_str(&self.payload)
    }
}

/// A job ready to be inserted.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub job_type: String,
    pub lane: JobLane,
    pub priority: Priority,
    pub payload: String,
    pub correlation_id: Uuid,
    pub max_attempts: i64,
    pub run_at: DateTime<Utc>,
}

/// A typed job definition stored as the payload of a [`QueueJob`].
pub trait JobDefinition: Serialize + DeserializeOwned + Send + Sync {
    /// Type tag used to dispatch the job to its executor.
    const JOB_TYPE: &'static str;
    const LANE: JobLane = JobLane::Normal;
    const PRIORITY: Priority = Priority::Normal;
    const MAX_ATTEMPTS: i64 = DEFAULT_MAX_ATTEMPTS;

    fn to_new_job(&self, correlation_id: Uuid) -> Result<NewJob, serde_json::Error> {
        Ok(NewJob {
            job_type: Self::JOB_TYPE.to_string(),
            lane: Self::LANE,
            priority: Self::PRIORITY,
            payload: serde_json::to_string(self)?,
            correlation_id,
            max_attempts: Self::MAX_ATTEMPTS,
            run_at: Utc::now(),
        })
    }
}

/// Recompute a workspace's stored byte total from its files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateWorkspaceSizeJob {
    pub workspace_id: WorkspaceId,
}

impl JobDefinition for UpdateWorkspaceSizeJob {
    const JOB_TYPE: &'static str = "update_workspace_size";
    const PRIORITY: Priority = Priority::High;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteObjectJob {
    pub storage_id: StorageId,
    pub bucket_name: String,
    pub key: String,
}

impl JobDefinition for DeleteObjectJob {
    const JOB_TYPE: &'static str = "delete_s3_object";
}

/// Delete many objects of one bucket. Split so a single job never exceeds
/// [`BulkDeleteObjectsJob::MAX_KEYS`] keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkDeleteObjectsJob {
    pub storage_id: StorageId,
    pub bucket_name: String,
    pub keys: Vec<String>,
}

impl BulkDeleteObjectsJob {
    pub const MAX_KEYS: usize = 1000;

    /// One job per chunk of at most `MAX_KEYS` keys.
    pub fn chunked(storage_id: &StorageId, bucket_name: &str, keys: Vec<String>) -> Vec<Self> {
        keys.chunks(Self::MAX_KEYS)
            .map(|chunk| Self {
                storage_id: storage_id.clone(),
                bucket_name: bucket_name.to_string(),
                keys: chunk.to_vec(),
            })
            .collect()
    }
}

impl JobDefinition for BulkDeleteObjectsJob {
    const JOB_TYPE: &'static str = "bulk_delete_s3_objects";
    const LANE: JobLane = JobLane::LongRunning;
}

/// Release the backend side of an abandoned upload and drop its session row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReclaimFileUploadJob {
    pub upload_id: FileUploadId,
    pub storage_id: StorageId,
    pub bucket_name: String,
    pub key: String,
    #[serde(default)]
    pub multipart_upload_id: Option<String>,
}

impl JobDefinition for ReclaimFileUploadJob {
    const JOB_TYPE: &'static str = "reclaim_file_upload";
    const PRIORITY: Priority = Priority::Low;
}

/// Empty and remove a bucket once its workspace is gone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteBucketJob {
    pub storage_id: StorageId,
    pub bucket_name: String,
}

impl JobDefinition for DeleteBucketJob {
    const JOB_TYPE: &'static str = "delete_bucket";
    const LANE: JobLane = JobLane::LongRunning;
    const PRIORITY: Priority = Priority::Low;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_orders_size_updates_above_cleanup() {
        assert!(UpdateWorkspaceSizeJob::PRIORITY > DeleteBucketJob::PRIORITY);
        assert!(UpdateWorkspaceSizeJob::PRIORITY > ReclaimFileUploadJob::PRIORITY);
        assert_eq!(Priority::from_i64(Priority::High.as_i64()), Priority::High);
    }

    #[test]
    fn long_running_jobs_use_their_own_lane() {
        assert_eq!(BulkDeleteObjectsJob::LANE, JobLane::LongRunning);
        assert_eq!(DeleteBucketJob::LANE, JobLane::LongRunning);
        assert_eq!(DeleteObjectJob::LANE, JobLane::Normal);
    }

    #[test]
    fn bulk_delete_is_chunked() {
        let keys: Vec<String> = (0..2500).map(|i| format!("k{}", i)).collect();
        let jobs = BulkDeleteObjectsJob::chunked(&StorageId::new(), "b", keys);
        assert_eq!(jobs.len(), 3);
        assert_eq!(jobs[0].keys.len(), 1000);
        assert_eq!(jobs[2].keys.len(), 500);
    }

    #[test]
    fn new_job_carries_definition() {
        let job = UpdateWorkspaceSizeJob {
            workspace_id: WorkspaceId::new(),
        };
        let correlation_id = Uuid::new_v4();
        let new_job = job.to_new_job(correlation_id).unwrap();
        assert_eq!(new_job.job_type, "update_workspace_size");
        assert_eq!(new_job.priority, Priority::High);
        assert_eq!(new_job.correlation_id, correlation_id);
        let back: UpdateWorkspaceSizeJob = serde_json::from_str(&new_job.payload).unwrap();
        assert_eq!(back, job);
    }
}

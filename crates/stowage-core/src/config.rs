//! Configuration module
//!
//! Settings are read from the environment (after `dotenvy` has loaded `.env`, see the
//! API binary). Every value has a default suitable for local development except the
//! signing secret, which must be set outside development.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::thresholds::{
    UploadThresholds, DEFAULT_DIRECT_UPLOAD_THRESHOLD_BYTES, DEFAULT_SINGLE_CHUNK_THRESHOLD_BYTES,
    DEFAULT_UPLOAD_PART_SIZE_BYTES,
};

const SERVER_PORT: u16 = 4000;
const MAX_READ_CONNECTIONS: u32 = 8;
const CONNECTION_TIMEOUT_SECS: u64 = 30;
const PRESIGNED_URL_TTL_SECS: u64 = 15 * 60;
const ABANDONED_UPLOAD_RETENTION_HOURS: u64 = 24;
const ABANDONED_UPLOAD_SCAN_INTERVAL_SECS: u64 = 15 * 60;
const STORAGE_RETRY_ATTEMPTS: u32 = 3;
const DEV_SIGNING_SECRET: &str = "stowage-development-signing-secret";

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<T>().ok())
        .unwrap_or(default)
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

/// Worker pool settings for the background job queue.
#[derive(Clone, Debug)]
pub struct JobQueueSettings {
    pub normal_workers: usize,
    pub long_running_workers: usize,
    pub poll_interval_ms: u64,
    pub claim_batch_size: usize,
    pub job_timeout_secs: u64,
    pub long_running_job_timeout_secs: u64,
    /// Interval in seconds between runs of the stale job reaper. 0 = disabled.
    pub stale_job_reap_interval_secs: u64,
    /// Grace period in seconds added to the job timeout before an in-flight job is reaped.
    pub stale_job_grace_period_secs: u64,
    /// Retention in days for finished jobs. 0 = keep forever.
    pub finished_job_retention_days: u64,
}

impl Default for JobQueueSettings {
    fn default() -> Self {
        Self {
            normal_workers: 4,
            long_running_workers: 2,
            poll_interval_ms: 1000,
            claim_batch_size: 8,
            job_timeout_secs: 300,
            long_running_job_timeout_secs: 3600,
            stale_job_reap_interval_secs: 60,
            stale_job_grace_period_secs: 300,
            finished_job_retention_days: 7,
        }
    }
}

/// Storage backend registered at startup when no backend rows exist yet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BootstrapStorage {
    Local {
        path: String,
    },
    S3 {
        region: String,
        endpoint: Option<String>,
        access_key_id: Option<String>,
        secret_access_key: Option<String>,
    },
}

#[derive(Clone, Debug)]
pub struct Config {
    pub environment: String,
    pub server_port: u16,
    pub cors_origins: Vec<String>,
    pub database_path: String,
    pub db_max_connections: u32,
    pub db_timeout_seconds: u64,
    /// Capacity of the metadata write queue. `None` = unbounded.
    pub write_queue_capacity: Option<usize>,
    pub public_base_url: String,
    pub upload_thresholds: UploadThresholds,
    pub presigned_url_ttl_secs: u64,
    pub storage_retry_attempts: u32,
    pub abandoned_upload_retention_hours: u64,
    pub abandoned_upload_scan_interval_secs: u64,
    pub local_storage_signing_secret: String,
    pub bootstrap_storage: Option<BootstrapStorage>,
    pub job_queue: JobQueueSettings,
}

impl Config {
    pub fn from_env() -> Result<Self, anyhow::Error> {
        let environment = env::var("ENVIRONMENT")
            .or_else(|_| env::var("APP_ENV"))
            .unwrap_or_else(|_| "development".to_string());

        let cors_origins = env::var("CORS_ORIGINS")
            .unwrap_or_else(|_| "*".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let server_port = env_or("PORT", SERVER_PORT);
        let public_base_url = env::var("PUBLIC_BASE_URL")
            .unwrap_or_else(|_| format!("http://localhost:{}", server_port));

        let bootstrap_storage = match env_opt("STORAGE_BACKEND").as_deref() {
            None => None,
            Some("local") => Some(BootstrapStorage::Local {
                path: env::var("LOCAL_STORAGE_PATH")
                    .unwrap_or_else(|_| "./data/storage".to_string()),
            }),
            Some("s3") => Some(BootstrapStorage::S3 {
                region: env_opt("S3_REGION")
                    .or_else(|| env_opt("AWS_REGION"))
                    .unwrap_or_else(|| "us-east-1".to_string()),
                endpoint: env_opt("S3_ENDPOINT"),
                access_key_id: env_opt("AWS_ACCESS_KEY_ID"),
                secret_access_key: env_opt("AWS_SECRET_ACCESS_KEY"),
            }),
            Some(other) => {
                return Err(anyhow::anyhow!(
                    "Invalid STORAGE_BACKEND '{}': expected 'local' or 's3'",
                    other
                ))
            }
        };

        let defaults = JobQueueSettings::default();
        let job_queue = JobQueueSettings {
            normal_workers: env_or("JOB_QUEUE_NORMAL_WORKERS", defaults.normal_workers),
            long_running_workers: env_or(
                "JOB_QUEUE_LONG_RUNNING_WORKERS",
                defaults.long_running_workers,
            ),
            poll_interval_ms: env_or("JOB_QUEUE_POLL_INTERVAL_MS", defaults.poll_interval_ms),
            claim_batch_size: env_or("JOB_QUEUE_CLAIM_BATCH_SIZE", defaults.claim_batch_size),
            job_timeout_secs: env_or("JOB_QUEUE_JOB_TIMEOUT_SECS", defaults.job_timeout_secs),
            long_running_job_timeout_secs: env_or(
                "JOB_QUEUE_LONG_RUNNING_JOB_TIMEOUT_SECS",
                defaults.long_running_job_timeout_secs,
            ),
            stale_job_reap_interval_secs: env_or(
                "JOB_QUEUE_STALE_JOB_REAP_INTERVAL_SECS",
                defaults.stale_job_reap_interval_secs,
            ),
            stale_job_grace_period_secs: env_or(
                "JOB_QUEUE_STALE_JOB_GRACE_PERIOD_SECS",
                defaults.stale_job_grace_period_secs,
            ),
            finished_job_retention_days: env_or(
                "JOB_RETENTION_DAYS",
                defaults.finished_job_retention_days,
            ),
        };

        let config = Self {
            server_port,
            cors_origins,
            database_path: env::var("DATABASE_PATH")
                .unwrap_or_else(|_| "./data/stowage.db".to_string()),
            db_max_connections: env_or("DB_MAX_CONNECTIONS", MAX_READ_CONNECTIONS),
            db_timeout_seconds: env_or("DB_TIMEOUT_SECONDS", CONNECTION_TIMEOUT_SECS),
            write_queue_capacity: env_opt("WRITE_QUEUE_CAPACITY")
                .and_then(|v| v.parse::<usize>().ok())
                .filter(|&capacity| capacity > 0),
            public_base_url: public_base_url.trim_end_matches('/').to_string(),
            upload_thresholds: UploadThresholds {
                direct_max_bytes: env_or(
                    "DIRECT_UPLOAD_THRESHOLD_BYTES",
                    DEFAULT_DIRECT_UPLOAD_THRESHOLD_BYTES,
                ),
                single_chunk_max_bytes: env_or(
                    "SINGLE_CHUNK_THRESHOLD_BYTES",
                    DEFAULT_SINGLE_CHUNK_THRESHOLD_BYTES,
                ),
                part_size_bytes: env_or("UPLOAD_PART_SIZE_BYTES", DEFAULT_UPLOAD_PART_SIZE_BYTES),
            },
            presigned_url_ttl_secs: env_or("PRESIGNED_URL_TTL_SECS", PRESIGNED_URL_TTL_SECS),
            storage_retry_attempts: env_or("STORAGE_RETRY_ATTEMPTS", STORAGE_RETRY_ATTEMPTS),
            abandoned_upload_retention_hours: env_or(
                "ABANDONED_UPLOAD_RETENTION_HOURS",
                ABANDONED_UPLOAD_RETENTION_HOURS,
            ),
            abandoned_upload_scan_interval_secs: env_or(
                "ABANDONED_UPLOAD_SCAN_INTERVAL_SECS",
                ABANDONED_UPLOAD_SCAN_INTERVAL_SECS,
            ),
            local_storage_signing_secret: env::var("LOCAL_STORAGE_SIGNING_SECRET")
                .unwrap_or_else(|_| DEV_SIGNING_SECRET.to_string()),
            bootstrap_storage,
            job_queue,
            environment,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), anyhow::Error> {
        self.upload_thresholds
            .validate()
            .map_err(|e| anyhow::anyhow!(e.to_string()))?;
        if self.is_production() && self.local_storage_signing_secret == DEV_SIGNING_SECRET {
            anyhow::bail!("LOCAL_STORAGE_SIGNING_SECRET must be set in production");
        }
        if self.job_queue.normal_workers == 0 || self.job_queue.long_running_workers == 0 {
            anyhow::bail!("job queue lanes need at least one worker each");
        }
        Ok(())
    }

    pub fn is_production(&self) -> bool {
        self.environment.eq_ignore_ascii_case("production")
    }

    pub fn presigned_url_ttl(&self) -> Duration {
        Duration::from_secs(self.presigned_url_ttl_secs)
    }

    pub fn abandoned_upload_retention(&self) -> chrono::Duration {
        chrono::Duration::hours(self.abandoned_upload_retention_hours as i64)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            environment: "development".to_string(),
            server_port: SERVER_PORT,
            cors_origins: vec!["*".to_string()],
            database_path: "./data/stowage.db".to_string(),
            db_max_connections: MAX_READ_CONNECTIONS,
            db_timeout_seconds: CONNECTION_TIMEOUT_SECS,
            write_queue_capacity: None,
            public_base_url: format!("http://localhost:{}", SERVER_PORT),
            upload_thresholds: UploadThresholds::default(),
            presigned_url_ttl_secs: PRESIGNED_URL_TTL_SECS,
            storage_retry_attempts: STORAGE_RETRY_ATTEMPTS,
            abandoned_upload_retention_hours: ABANDONED_UPLOAD_RETENTION_HOURS,
            abandoned_upload_scan_interval_secs: ABANDONED_UPLOAD_SCAN_INTERVAL_SECS,
            local_storage_signing_secret: DEV_SIGNING_SECRET.to_string(),
            bootstrap_storage: None,
            job_queue: JobQueueSettings::default(),
        }
    }
}

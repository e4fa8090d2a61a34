//! Durable job rows.
//!
//! Status flow: `pending` -> `in_flight` -> `done` | `failed`, with failed attempts
//! that may retry going back to `pending` and a later `next_attempt_at`. Rows left
//! `in_flight` by a crashed process are returned to `pending` on startup and by the
//! stale job reaper.

use chrono::{DateTime, Utc};
use sqlx::{Sqlite, SqliteConnection, SqlitePool};
use stowage_core::models::{JobLane, JobStatus, NewJob, QueueJob};
use stowage_core::AppError;

const JOB_COLUMNS: &str = r#"
    id, job_type, lane, priority, payload, correlation_id, status, attempt_count, max_attempts,
    next_attempt_at, created_at, claimed_at, completed_at, last_error
"#;

#[derive(Clone)]
pub struct JobRepository {
    pool: SqlitePool,
}

impl JobRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    #[tracing::instrument(skip(self), fields(db.table = "queue_jobs", db.operation = "select", db.record_id = id))]
    pub async fn get(&self, id: i64) -> Result<Option<QueueJob>, AppError> {
        let job = sqlx::query_as::<Sqlite, QueueJob>(&format!(
            "SELECT {} FROM queue_jobs WHERE id = ?1",
            JOB_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(job)
    }

    pub async fn count_by_status(&self, status: JobStatus) -> Result<i64, AppError> {
        let count =
            sqlx::query_scalar::<Sqlite, i64>("SELECT COUNT(*) FROM queue_jobs WHERE status = ?1")
                .bind(status)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    /// Persist a job; returns its id. Runs inside the caller's transaction so a job is
    /// enqueued only if the state change that produced it commits.
    pub async fn insert(conn: &mut SqliteConnection, job: &NewJob) -> Result<i64, AppError> {
        let id = sqlx::query_scalar::<Sqlite, i64>(
            r#"
            INSERT INTO queue_jobs (
                job_type, lane, priority, payload, correlation_id, status, attempt_count,
                max_attempts, next_attempt_at, created_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, 'pending', 0, ?6, ?7, ?8)
            RETURNING id
            "#,
        )
        .bind(&job.job_type)
        .bind(job.lane)
        .bind(job.priority.as_i64())
        .bind(&job.payload)
        .bind(job.correlation_id)
        .bind(job.max_attempts.max(1))
        .bind(job.run_at)
        .bind(Utc::now())
        .fetch_one(&mut *conn)
        .await?;

        tracing::debug!(
            job_id = id,
            job_type = %job.job_type,
            lane = %job.lane,
            priority = job.priority.as_i64(),
            correlation_id = %job.correlation_id,
            "Job enqueued"
        );
        Ok(id)
    }

    /// Atomically move up to `limit` due jobs of `lane` to `in_flight`.
    ///
    /// Higher priority first, then oldest first. A job is handed to exactly one caller.
    pub async fn claim(
        conn: &mut SqliteConnection,
        lane: JobLane,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<QueueJob>, AppError> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut jobs = sqlx::query_as::<Sqlite, QueueJob>(&format!(
            r#"
            UPDATE queue_jobs
            SET status = 'in_flight', claimed_at = ?1
            WHERE id IN (
                SELECT id FROM queue_jobs
                WHERE status = 'pending' AND lane = ?2 AND next_attempt_at <= ?1
                ORDER BY priority DESC, id ASC
                LIMIT ?3
            )
            RETURNING {}
            "#,
            JOB_COLUMNS
        ))
        .bind(now)
        .bind(lane)
        .bind(limit as i64)
        .fetch_all(&mut *conn)
        .await?;

        // RETURNING order is unspecified.
        jobs.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.id.cmp(&b.id)));
        Ok(jobs)
    }

    pub async fn mark_done(conn: &mut SqliteConnection, id: i64) -> Result<(), AppError> {
        sqlx::query(
            "UPDATE queue_jobs SET status = 'done', completed_at = ?2, last_error = NULL WHERE id = ?1",
        )
        .bind(id)
        .bind(Utc::now())
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    /// Record a failed attempt and put the job back in line for `next_attempt_at`.
    pub async fn record_retry(
        conn: &mut SqliteConnection,
        id: i64,
        attempt_count: i64,
        next_attempt_at: DateTime<Utc>,
        error: &str,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE queue_jobs
            SET status = 'pending', attempt_count = ?2, next_attempt_at = ?3, claimed_at = NULL,
                last_error = ?4
            WHERE id = ?1
            "#,
        )
        .bind(id)
        .bind(attempt_count)
        .bind(next_attempt_at)
        .bind(error)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    pub async fn mark_failed(
        conn: &mut SqliteConnection,
        id: i64,
        attempt_count: i64,
        error: &str,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE queue_jobs
            SET status = 'failed', attempt_count = ?2, completed_at = ?3, last_error = ?4
            WHERE id = ?1
            "#,
        )
        .bind(id)
        .bind(attempt_count)
        .bind(Utc::now())
        .bind(error)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    /// Return every `in_flight` job to `pending`. Only valid while no worker of this
    /// database is running, i.e. at startup.
    pub async fn reset_in_flight(conn: &mut SqliteConnection) -> Result<u64, AppError> {
        let result = sqlx::query(
            "UPDATE queue_jobs SET status = 'pending', claimed_at = NULL WHERE status = 'in_flight'",
        )
        .execute(&mut *conn)
        .await?;
        Ok(result.rows_affected())
    }

    /// Return jobs of `lane` claimed before `claimed_before` to `pending`.
    pub async fn reap_stale(
        conn: &mut SqliteConnection,
        lane: JobLane,
        claimed_before: DateTime<Utc>,
    ) -> Result<u64, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE queue_jobs
            SET status = 'pending', claimed_at = NULL,
                last_error = COALESCE(last_error, 'reclaimed after exceeding its timeout')
            WHERE status = 'in_flight' AND lane = ?1 AND claimed_at < ?2
            "#,
        )
        .bind(lane)
        .bind(claimed_before)
        .execute(&mut *conn)
        .await?;
        Ok(result.rows_affected())
    }

    /// Drop `done` and `failed` rows completed before `before`.
    pub async fn purge_finished(
        conn: &mut SqliteConnection,
        before: DateTime<Utc>,
    ) -> Result<u64, AppError> {
        let result = sqlx::query(
            "DELETE FROM queue_jobs WHERE status IN ('done', 'failed') AND completed_at < ?1",
        )
        .bind(before)
        .execute(&mut *conn)
        .await?;
        Ok(result.rows_affected())
    }
}

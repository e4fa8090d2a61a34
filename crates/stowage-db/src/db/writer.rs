//! Single-writer actor for metadata mutations.
//!
//! SQLite allows one writer at a time. Rather than letting request handlers and workers
//! race for the write lock, every mutation is submitted to one task that owns the write
//! connection and runs submissions strictly in FIFO order, each in its own transaction.
//! Submitters get a [`PendingWrite`] and await their own result. An operation that
//! panics fails with `AppError::Internal` and the writer carries on with a new connection.

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use sqlx::{Connection, SqliteConnection, SqlitePool};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use stowage_core::AppError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[async_trait]
trait QueuedWrite: Send {
    /// Returns `false` if the operation panicked. The connection may then be left
    /// inside an unfinished transaction and must not be reused.
    async fn run(self: Box<Self>, conn: &mut SqliteConnection) -> bool;

    fn fail(self: Box<Self>, error: AppError);
}

struct Submission<T, F> {
    sequence: u64,
    enqueued_at: Instant,
    op: F,
    reply: oneshot::Sender<Result<T, AppError>>,
}

#[async_trait]
impl<T, F> QueuedWrite for Submission<T, F>
where
    T: Send + 'static,
    F: for<'c> FnOnce(&'c mut SqliteConnection) -> BoxFuture<'c, Result<T, AppError>>
        + Send
        + 'static,
{
    async fn run(self: Box<Self>, conn: &mut SqliteConnection) -> bool {
        let Submission {
            sequence,
            enqueued_at,
            op,
            reply,
        } = *self;
        let queue_wait = enqueued_at.elapsed();
        let started = Instant::now();

        let outcome: Result<Result<T, AppError>, Box<dyn Any + Send>> = AssertUnwindSafe(async {
            let mut tx = conn.begin().await?;
            match op(&mut *tx).await {
                Ok(value) => {
                    tx.commit().await?;
                    Ok(value)
                }
                Err(e) => {
                    if let Err(rollback_error) = tx.rollback().await {
                        tracing::error!(error = %rollback_error, sequence = sequence, "Write rollback failed");
                    }
                    Err(e)
                }
            }
        })
        .catch_unwind()
        .await;

        let healthy = outcome.is_ok();
        let result: Result<T, AppError> = outcome.unwrap_or_else(|panic| {
            let message = panic_message(panic.as_ref());
            tracing::error!(sequence = sequence, panic = %message, "Write operation panicked");
            Err(AppError::Internal(format!("database write panicked: {}", message)))
        });

        tracing::debug!(
            sequence = sequence,
            queue_wait_ms = queue_wait.as_secs_f64() * 1000.0,
            execution_ms = started.elapsed().as_secs_f64() * 1000.0,
            success = result.is_ok(),
            "Write operation finished"
        );

        // The submitter may have stopped waiting; the write itself still happened.
        let _ = reply.send(result);
        healthy
    }

    fn fail(self: Box<Self>, error: AppError) {
        let _ = self.reply.send(Err(error));
    }
}

type BoxedWrite = Box<dyn QueuedWrite>;

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[derive(Clone)]
enum WriteSender {
    Unbounded(mpsc::UnboundedSender<BoxedWrite>),
    Bounded(mpsc::Sender<BoxedWrite>),
}

enum WriteReceiver {
    Unbounded(mpsc::UnboundedReceiver<BoxedWrite>),
    Bounded(mpsc::Receiver<BoxedWrite>),
}

impl WriteReceiver {
    async fn recv(&mut self) -> Option<BoxedWrite> {
        match self {
            WriteReceiver::Unbounded(rx) => rx.recv().await,
            WriteReceiver::Bounded(rx) => rx.recv().await,
        }
    }
}

/// Handle to the writer task. Cheap to clone; the task stops once every handle is gone
/// and the queue has drained.
#[derive(Clone)]
pub struct DbWriter {
    sender: WriteSender,
    next_sequence: Arc<AtomicU64>,
}

impl DbWriter {
    /// Start the writer task over `pool`, which should be limited to one connection.
    pub fn spawn(pool: SqlitePool, capacity: Option<usize>) -> Self {
        Self::spawn_with_handle(pool, capacity).0
    }

    pub fn spawn_with_handle(pool: SqlitePool, capacity: Option<usize>) -> (Self, JoinHandle<()>) {
        let (sender, receiver) = match capacity {
            Some(capacity) => {
                let (tx, rx) = mpsc::channel(capacity.max(1));
                (WriteSender::Bounded(tx), WriteReceiver::Bounded(rx))
            }
            None => {
                let (tx, rx) = mpsc::unbounded_channel();
                (WriteSender::Unbounded(tx), WriteReceiver::Unbounded(rx))
            }
        };

        let handle = tokio::spawn(run_writer(pool, receiver));
        (
            Self {
                sender,
                next_sequence: Arc::new(AtomicU64::new(0)),
            },
            handle,
        )
    }

    /// Queue `op` behind every write submitted before it.
    ///
    /// `op` borrows the writer's connection inside an open transaction; returning `Err`
    /// rolls the transaction back.
    ///
    /// Fails immediately with `WriteQueueFull` when a bounded queue is at capacity.
    pub fn submit<T, F>(&self, op: F) -> Result<PendingWrite<T>, AppError>
    where
        T: Send + 'static,
        F: for<'c> FnOnce(&'c mut SqliteConnection) -> BoxFuture<'c, Result<T, AppError>>
            + Send
            + 'static,
    {
        let (reply, receiver) = oneshot::channel();
        let sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst);
        let submission: BoxedWrite = Box::new(Submission {
            sequence,
            enqueued_at: Instant::now(),
            op,
            reply,
        });

        match &self.sender {
            WriteSender::Unbounded(tx) => tx
                .send(submission)
                .map_err(|_| AppError::Internal("database writer has stopped".to_string()))?,
            WriteSender::Bounded(tx) => tx.try_send(submission).map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => AppError::WriteQueueFull,
                mpsc::error::TrySendError::Closed(_) => {
                    AppError::Internal("database writer has stopped".to_string())
                }
            })?,
        }

        Ok(PendingWrite { receiver })
    }

    /// Submit and wait for the result.
    pub async fn execute<T, F>(&self, op: F) -> Result<T, AppError>
    where
        T: Send + 'static,
        F: for<'c> FnOnce(&'c mut SqliteConnection) -> BoxFuture<'c, Result<T, AppError>>
            + Send
            + 'static,
    {
        self.submit(op)?.wait().await
    }

    /// Submit and wait, giving up on the wait if `cancel` fires. A write that already
    /// started still commits or rolls back on its own.
    pub async fn execute_or_cancel<T, F>(
        &self,
        cancel: &CancellationToken,
        op: F,
    ) -> Result<T, AppError>
    where
        T: Send + 'static,
        F: for<'c> FnOnce(&'c mut SqliteConnection) -> BoxFuture<'c, Result<T, AppError>>
            + Send
            + 'static,
    {
        self.submit(op)?.wait_or_cancel(cancel).await
    }
}

/// Result of a submitted write that has not been awaited yet.
pub struct PendingWrite<T> {
    receiver: oneshot::Receiver<Result<T, AppError>>,
}

impl<T> PendingWrite<T> {
    pub async fn wait(self) -> Result<T, AppError> {
        self.receiver.await.map_err(|_| {
            AppError::Internal("database writer dropped the operation".to_string())
        })?
    }

    pub async fn wait_or_cancel(self, cancel: &CancellationToken) -> Result<T, AppError> {
        tokio::select! {
            result = self.wait() => result,
            _ = cancel.cancelled() => Err(AppError::Cancelled),
        }
    }
}

async fn run_writer(pool: SqlitePool, mut receiver: WriteReceiver) {
    tracing::info!("Database writer started");

    while let Some(write) = receiver.recv().await {
        match pool.acquire().await {
            Ok(mut conn) => {
                if !write.run(&mut conn).await {
                    // Dropping the detached connection closes it and discards whatever
                    // the panicking write left open; the next write gets a fresh one.
                    drop(conn.detach());
                    tracing::warn!("Replaced the write connection after a panicked write");
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "Database writer could not acquire its connection");
                write.fail(AppError::Database(e));
            }
        }
    }

    pool.close().await;
    tracing::info!("Database writer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::pool::test_support::open_temp;
    use std::sync::Mutex;

    #[tokio::test]
    async fn writes_run_in_submission_order_under_concurrency() {
        let (_dir, db) = open_temp().await;
        let stamp = Arc::new(Mutex::new(0u64));
        let executed = Arc::new(Mutex::new(Vec::new()));

        let mut tasks = Vec::new();
        for _ in 0..32 {
            let writer = db.writer.clone();
            let stamp = stamp.clone();
            let executed = executed.clone();
            tasks.push(tokio::spawn(async move {
                // Stamp and enqueue under one lock so stamp order equals queue order.
                let pending = {
                    let mut next = stamp.lock().unwrap();
                    let mine = *next;
                    *next += 1;
                    writer
                        .submit(move |conn: &mut SqliteConnection| {
                            Box::pin(async move {
                                sqlx::query("SELECT 1").execute(&mut *conn).await?;
                                executed.lock().unwrap().push(mine);
                                Ok(mine)
                            })
                        })
                        .unwrap()
                };
                pending.wait().await.unwrap()
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let executed = executed.lock().unwrap().clone();
        assert_eq!(executed.len(), 32);
        assert!(executed.windows(2).all(|w| w[0] < w[1]), "{:?}", executed);
    }

    #[tokio::test]
    async fn failed_operations_roll_back() {
        let (_dir, db) = open_temp().await;

        let result: Result<(), AppError> = db
            .writer
            .execute(|conn: &mut SqliteConnection| {
                Box::pin(async move {
                    sqlx::query(
                        "INSERT INTO storages (id, name, provider, encryption_mode, created_at) VALUES ('s_rollback', 'x', '{}', 'none', '2025-01-01T00:00:00+00:00')",
                    )
                    .execute(&mut *conn)
                    .await?;
                    Err(AppError::InvalidInput("abort".to_string()))
                })
            })
            .await;
        assert!(matches!(result, Err(AppError::InvalidInput(_))));

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM storages")
            .fetch_one(&db.pool)
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn bounded_queue_rejects_when_full() {
        let (_dir, db) = open_temp().await;
        let write_pool = db.pool.clone();
        let writer = DbWriter::spawn(write_pool, Some(1));

        let (release, gate) = oneshot::channel::<()>();
        let first = writer
            .submit(move |_conn: &mut SqliteConnection| {
                Box::pin(async move {
                    let _ = gate.await;
                    Ok(())
                })
            })
            .unwrap();

        // Wait until the writer has picked up the first write and is blocked in it.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let second = writer
            .submit(|_conn: &mut SqliteConnection| Box::pin(async move { Ok(()) }))
            .unwrap();
        let third = writer.submit(|_conn: &mut SqliteConnection| Box::pin(async move { Ok(()) }));
        assert!(matches!(third, Err(AppError::WriteQueueFull)));

        release.send(()).unwrap();
        first.wait().await.unwrap();
        second.wait().await.unwrap();
    }

    #[tokio::test]
    async fn panicking_write_does_not_stop_the_writer() {
        let (_dir, db) = open_temp().await;

        let result: Result<(), AppError> = db
            .writer
            .execute(|conn: &mut SqliteConnection| {
                Box::pin(async move {
                    let inserted = sqlx::query(
                        "INSERT INTO storages (id, name, provider, encryption_mode, created_at) VALUES ('s_panicked', 'x', '{}', 'none', '2025-01-01T00:00:00+00:00')",
                    )
                    .execute(&mut *conn)
                    .await?;
                    assert_eq!(inserted.rows_affected(), 0, "write exploded");
                    Ok(())
                })
            })
            .await;
        match result {
            Err(AppError::Internal(message)) => assert!(message.contains("write exploded")),
            other => panic!("unexpected result {:?}", other),
        }

        // The writer keeps serving, and the half-done write never committed.
        let count: i64 = db
            .writer
            .execute(|conn: &mut SqliteConnection| {
                Box::pin(async move {
                    Ok(sqlx::query_scalar("SELECT COUNT(*) FROM storages")
                        .fetch_one(&mut *conn)
                        .await?)
                })
            })
            .await
            .unwrap();
        assert_eq!(count, 0);

        db.writer
            .execute(|conn: &mut SqliteConnection| {
                Box::pin(async move {
                    sqlx::query(
                        "INSERT INTO storages (id, name, provider, encryption_mode, created_at) VALUES ('s_after', 'x', '{}', 'none', '2025-01-01T00:00:00+00:00')",
                    )
                    .execute(&mut *conn)
                    .await?;
                    Ok(())
                })
            })
            .await
            .unwrap();
        let stored: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM storages WHERE id = 's_after'")
            .fetch_one(&db.pool)
            .await
            .unwrap();
        assert_eq!(stored, 1);
    }

    #[tokio::test]
    async fn cancelled_wait_does_not_cancel_the_write() {
        let (_dir, db) = open_temp().await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = db
            .writer
            .execute_or_cancel(&cancel, |conn: &mut SqliteConnection| {
                Box::pin(async move {
                    sqlx::query(
                        "INSERT INTO storages (id, name, provider, encryption_mode, created_at) VALUES ('s_kept', 'x', '{}', 'none', '2025-01-01T00:00:00+00:00')",
                    )
                    .execute(&mut *conn)
                    .await?;
                    Ok(())
                })
            })
            .await;
        assert!(matches!(result, Err(AppError::Cancelled)));

        // A later write observes the earlier one because the queue is FIFO.
        let count: i64 = db
            .writer
            .execute(|conn: &mut SqliteConnection| {
                Box::pin(async move {
                    Ok(sqlx::query_scalar("SELECT COUNT(*) FROM storages WHERE id = 's_kept'")
                        .fetch_one(&mut *conn)
                        .await?)
                })
            })
            .await
            .unwrap();
        assert_eq!(count, 1);
    }
}

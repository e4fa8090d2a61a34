//! Caller-side retry of transient storage failures.

use std::future::Future;
use std::time::Duration;
use stowage_storage::{StorageError, StorageResult};

const BASE_DELAY_MS: u64 = 100;
const MAX_DELAY_MS: u64 = 2_000;

fn backoff(attempt: u32) -> Duration {
    Duration::from_millis(
        BASE_DELAY_MS
            .saturating_mul(2_u64.saturating_pow(attempt.saturating_sub(1)))
            .min(MAX_DELAY_MS),
    )
}

/// Run `call` up to `attempts` times, retrying only [`StorageError::is_transient`]
/// failures with exponential backoff.
pub async fn with_storage_retry<T, F, Fut>(
    attempts: u32,
    operation: &'static str,
    mut call: F,
) -> StorageResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StorageError>>,
{
    let attempts = attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match call().await {
            Err(e) if e.is_transient() && attempt < attempts => {
                let delay = backoff(attempt);
                tracing::warn!(
                    operation = operation,
                    attempt = attempt,
                    max_attempts = attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Transient storage error, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            result => return result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn transient_errors_are_retried_until_success() {
        let calls = AtomicU32::new(0);
        let result = with_storage_retry(3, "head_object", || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(StorageError::Transient("SlowDown".into()))
            } else {
                Ok(7)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: StorageResult<()> = with_storage_retry(3, "complete_multipart", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(StorageError::IntegrityMismatch("part 2".into()))
        })
        .await;
        assert!(matches!(result, Err(StorageError::IntegrityMismatch(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn attempts_are_bounded() {
        let calls = AtomicU32::new(0);
        let result: StorageResult<()> = with_storage_retry(3, "put_object", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(StorageError::Transient("RequestTimeout".into()))
        })
        .await;
        assert!(result.unwrap_err().is_transient());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}

//! Timeouts and retry policy for external calls

use crate::errors::{AppError, Result};
use backoff::ExponentialBackoff;
use std::future::Future;
use std::time::Duration;

/// Run `fut`, failing with [`AppError::Timeout`] once `limit` elapses.
pub async fn bounded<T, F>(operation: &str, limit: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(AppError::Timeout {
            operation: operation.to_string(),
            timeout_ms: limit.as_millis() as u64,
        }),
    }
}

/// Exponential backoff whose total retry time stays within `budget`
pub fn retry_policy(budget: Duration) -> ExponentialBackoff {
    ExponentialBackoff {
        initial_interval: Duration::from_millis(100),
        max_interval: budget.min(Duration::from_secs(2)),
        max_elapsed_time: Some(budget),
        ..Default::default()
    }
}

/// Classify an error for the backoff loop
pub fn classify(err: AppError) -> backoff::Error<AppError> {
    if err.is_transient() {
        backoff::Error::transient(err)
    } else {
        backoff::Error::permanent(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_bounded_times_out() {
        let result: Result<()> = bounded("slow op", Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;

        match result {
            Err(AppError::Timeout { operation, timeout_ms }) => {
                assert_eq!(operation, "slow op");
                assert_eq!(timeout_ms, 10);
            }
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let attempts = AtomicU32::new(0);
        let result = backoff::future::retry(retry_policy(Duration::from_secs(2)), || async {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            if n < 2 {
                Err(classify(AppError::Wallet {
                    message: "connection reset".into(),
                }))
            } else {
                Ok(n)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_permanent_errors_stop_immediately() {
        let attempts = AtomicU32::new(0);
        let result: std::result::Result<(), AppError> =
            backoff::future::retry(retry_policy(Duration::from_secs(2)), || async {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(classify(AppError::Validation {
                    message: "bad".into(),
                    field: None,
                }))
            })
            .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}

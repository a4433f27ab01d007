//! Timeout enforcement.
//!
//! Every network call runs under a deadline; an elapsed deadline becomes a
//! retryable `Transient { cause: Timeout }`.

use std::future::Future;
use std::time::Duration;

use crate::error::{SyncError, SyncResult, TransientCause};

/// Run `fut` with a deadline.
pub async fn with_timeout<T, F>(operation: &str, limit: Duration, fut: F) -> SyncResult<T>
where
    F: Future<Output = SyncResult<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!(operation = %operation, timeout_ms = limit.as_millis() as u64, "Call timed out");
            Err(SyncError::transient(
                operation,
                TransientCause::Timeout,
                format!("no response within {:?}", limit),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_retryable() {
        let result: SyncResult<()> = with_timeout("slow", Duration::from_secs(1), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;

        let err = result.unwrap_err();
        assert!(err.is_retryable());
        assert!(matches!(err, SyncError::Transient { cause: TransientCause::Timeout, .. }));
    }

    #[tokio::test]
    async fn test_fast_call_passes_through() {
        let value = with_timeout("fast", Duration::from_secs(1), async { Ok(42) }).await.unwrap();
        assert_eq!(value, 42);
    }
}

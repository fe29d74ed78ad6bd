//! Timeout enforcement.
//!
//! # Responsibilities
//! - Wrap calls, dials and probes with a deadline
//! - Map an elapsed deadline to a distinct `Timeout` error

use std::future::Future;
use std::time::Duration;

use crate::error::{Result, TransportError};

/// Run `fut`, failing with `TransportError::Timeout` after `duration`.
pub async fn with_timeout<F, T>(duration: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(duration, fut).await {
        Ok(result) => result,
        Err(_) => Err(TransportError::Timeout(duration)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_elapsed_deadline() {
        let err = with_timeout(Duration::from_millis(50), async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok(())
        })
        .await
        .unwrap_err();
        assert!(matches!(err, TransportError::Timeout(d) if d == Duration::from_millis(50)));
    }

    #[tokio::test]
    async fn test_inner_error_passes_through() {
        let err = with_timeout(Duration::from_secs(1), async {
            Err::<(), _>(TransportError::NotConnected)
        })
        .await
        .unwrap_err();
        assert!(matches!(err, TransportError::NotConnected));
    }
}

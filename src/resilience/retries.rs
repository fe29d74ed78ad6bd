//! Retry logic for unary calls.
//!
//! # Responsibilities
//! - Decide whether a failed call may be retried
//! - Space retries with a linear delay (`retry_delay × attempt`)
//! - Surface the last error once retries are used up
//!
//! # Design Decisions
//! - Acquisition timeouts and shutdown are never retried
//! - Connection, call, timeout and stream errors are retried

use std::future::Future;
use std::time::Duration;

use crate::error::{Result, TransportError};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_retries: u32,
    delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, delay: Duration) -> Self {
        Self { max_retries, delay }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Delay before retry number `retry` (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        self.delay.saturating_mul(retry)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// retry budget is spent. `op` receives the zero-based attempt number.
    pub async fn run<F, Fut, T>(&self, mut op: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) if attempt >= self.max_retries => {
                    if self.max_retries == 0 {
                        return Err(e);
                    }
                    return Err(TransportError::RetriesExhausted {
                        attempts: attempt + 1,
                        source: Box::new(e),
                    });
                }
                Err(e) => {
                    attempt += 1;
                    let delay = self.delay_for(attempt);
                    tracing::debug!(attempt, ?delay, error = %e, "Retrying call");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

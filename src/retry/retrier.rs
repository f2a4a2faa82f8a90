//! Execute-with-retry loop
//!
//! The caller decides what is retryable: `should_retry` receives the
//! 1-based number of the attempt that just failed and its error.

use std::future::Future;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::RetryConfig;
use crate::error::Error;

/// Marker error for a cancelled retry loop. Callers' error types convert
/// from it so cancellation surfaces in their own taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("Operation cancelled")]
pub struct Cancelled;

/// Validated retry loop
#[derive(Debug, Clone)]
pub struct Retrier {
    config: RetryConfig,
}

impl Retrier {
    pub fn new(config: RetryConfig) -> Result<Self, Error> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    pub async fn execute_with_retry<T, E, F, Fut, P>(
        &self,
        ctx: &CancellationToken,
        mut operation: F,
        should_retry: P,
    ) -> Result<T, E>
    where
        E: From<Cancelled> + std::fmt::Display,
        F: FnMut(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(u32, &E) -> bool,
    {
        let max_attempts = self.config.max_attempts;
        let mut attempt: u32 = 0;

        loop {
            if ctx.is_cancelled() {
                debug!("Retry loop cancelled before attempt {}", attempt + 1);
                return Err(Cancelled.into());
            }

            let err = match operation(ctx.clone()).await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            let failed_attempt = attempt + 1;
            if !should_retry(failed_attempt, &err) {
                debug!("Attempt {} failed with non-retryable error: {}", failed_attempt, err);
                return Err(err);
            }

            if failed_attempt >= max_attempts {
                warn!("Giving up after {} attempts: {}", failed_attempt, err);
                return Err(err);
            }

            let delay = self.config.backoff.next(attempt);
            debug!(
                "Attempt {}/{} failed, retrying in {:?}: {}",
                failed_attempt, max_attempts, delay, err
            );

            tokio::select! {
                _ = ctx.cancelled() => {
                    debug!("Retry loop cancelled during backoff");
                    return Err(Cancelled.into());
                }
                _ = tokio::time::sleep(delay) => {}
            }

            attempt += 1;
        }
    }
}

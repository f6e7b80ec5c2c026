//! Retry with exponential backoff for transient fetch errors.
//!
//! The pagination driver wraps each page fetch (download and decode) in
//! [`RetryPolicy::run`]. Transient failures (see
//! [`SourceError::is_transient`]) are retried on the same page; permanent
//! ones and the final transient failure are returned to the caller.

use std::future::Future;
use std::time::Duration;

use crate::SourceError;

/// Attempts per page before the run fails.
pub const MAX_ATTEMPTS: u32 = 3;

/// Delay before the second attempt; doubles for each further attempt.
pub const BASE_DELAY: Duration = Duration::from_secs(1);

/// How many times to try an operation and how long to wait in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: MAX_ATTEMPTS,
            base_delay: BASE_DELAY,
        }
    }
}

impl RetryPolicy {
    /// Same attempt ceiling with no waiting, for tests and dry runs.
    #[must_use]
    pub const fn immediate() -> Self {
        Self {
            max_attempts: MAX_ATTEMPTS,
            base_delay: Duration::ZERO,
        }
    }

    /// Backoff before attempt number `attempt` (1-based). The first attempt
    /// never waits.
    #[must_use]
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        self.base_delay * (1u32 << (attempt - 2).min(16))
    }

    /// Runs `op` until it succeeds, fails permanently, or the attempt
    /// ceiling is reached.
    ///
    /// # Errors
    ///
    /// Returns the last [`SourceError`] produced by `op`.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T, SourceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, SourceError>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            let delay = self.delay_before(attempt);
            if !delay.is_zero() {
                log::warn!("{label} retry {}/{max_attempts} in {delay:?}...", attempt - 1);
                tokio::time::sleep(delay).await;
            }

            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    log::warn!("{label} transient error (attempt {attempt}/{max_attempts}): {e}");
                    attempt += 1;
                }
                Err(e) => {
                    if attempt > 1 {
                        log::error!("{label} giving up after {attempt} attempts: {e}");
                    }
                    return Err(e);
                }
            }
        }
    }
}

//! Retry policy for transient external failures.
//!
//! One policy covers every external touchpoint: store calls, page
//! reads, and event publication. Delays grow exponentially from the
//! configured initial backoff; non-transient errors (cancellation, lost
//! leadership, write failures, state inconsistencies) surface
//! immediately.

use std::future::Future;
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};

use crate::config::PolicyConfig;
use crate::error::{Error, Result};

/// Exponential backoff policy applied to transient failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    max_retries: u32,
    initial_backoff: Duration,
    multiplier: f64,
}

impl RetryPolicy {
    /// Creates a policy with explicit parameters.
    #[must_use]
    pub const fn new(max_retries: u32, initial_backoff: Duration, multiplier: f64) -> Self {
        Self {
            max_retries,
            initial_backoff,
            multiplier,
        }
    }

    /// Derives the policy from worker configuration.
    #[must_use]
    pub const fn from_config(policy: &PolicyConfig) -> Self {
        Self::new(
            policy.max_retries,
            policy.initial_backoff(),
            policy.backoff_multiplier,
        )
    }

    /// A policy that never retries, for tests that assert first-error
    /// behavior.
    #[must_use]
    pub const fn none() -> Self {
        Self::new(0, Duration::from_millis(1), 1.0)
    }

    #[allow(clippy::cast_possible_truncation)]
    fn builder(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(self.initial_backoff)
            .with_factor(self.multiplier as f32)
            .with_max_times(self.max_retries as usize)
    }

    /// Runs an operation, retrying transient errors with backoff.
    ///
    /// # Errors
    ///
    /// Returns the final error after retries are exhausted, or the
    /// first non-transient error immediately.
    pub async fn run<T, F, Fut>(&self, operation: &'static str, action: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        action
            .retry(self.builder())
            .when(Error::is_transient)
            .notify(|error, delay| {
                tracing::warn!(
                    operation,
                    error = %error,
                    "transient failure; retrying in {:.1}s",
                    delay.as_secs_f32()
                );
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn fast() -> RetryPolicy {
        RetryPolicy::new(3, Duration::from_millis(1), 2.0)
    }

    #[tokio::test]
    async fn retries_transient_until_success() -> Result<()> {
        let attempts = AtomicU32::new(0);

        let value = fast()
            .run("flaky", || async {
                if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(Error::store("connection reset"))
                } else {
                    Ok(42)
                }
            })
            .await?;

        assert_eq!(value, 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);

        Ok(())
    }

    #[tokio::test]
    async fn surfaces_after_exhausting_retries() {
        let attempts = AtomicU32::new(0);

        let result: Result<()> = fast()
            .run("always-down", || async {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(Error::store("still down"))
            })
            .await;

        assert!(result.is_err());
        // Initial attempt plus three retries.
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn fatal_errors_are_not_retried() {
        let attempts = AtomicU32::new(0);

        let result: Result<()> = fast()
            .run("fatal", || async {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(Error::TranslatorNotRegistered {
                    translator_id: "csv".into(),
                })
            })
            .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn none_policy_gives_single_attempt() {
        let attempts = AtomicU32::new(0);

        let result: Result<()> = RetryPolicy::none()
            .run("single", || async {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(Error::store("down"))
            })
            .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}

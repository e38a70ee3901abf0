// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Retry logic with exponential backoff.
//!
//! Provides configurable retry behavior for transient storage failures.
//! Different presets are available for different use cases.
//!
//! # Example
//!
//! ```
//! use oplog::RetryConfig;
//!
//! // Startup: fail fast on bad config
//! let startup = RetryConfig::startup();
//! assert_eq!(startup.max_retries, Some(5));
//!
//! // Ingest: never give up once an operation is accepted
//! let ingest = RetryConfig::ingest();
//! assert_eq!(ingest.max_retries, None); // Infinite
//! ```

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Configuration for connection/operation retry behavior.
///
/// Use the preset constructors for common patterns:
/// - [`RetryConfig::startup()`] - Fast-fail for initial connections
/// - [`RetryConfig::ingest()`] - Infinite retry for accepted operations
/// - [`RetryConfig::tail()`] - Infinite retry for subscriber sessions
/// - [`RetryConfig::query()`] - Quick retry for individual reads
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
    pub max_retries: Option<usize>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::ingest()
    }
}

impl RetryConfig {
    /// Fast-fail retry for initial startup connection.
    /// Use this during agent startup to detect configuration errors
    /// quickly; an init failure is fatal.
    #[must_use]
    pub fn startup() -> Self {
        Self {
            max_retries: Some(5),
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
        }
    }

    /// Infinite retry for the ingest write path. An operation accepted
    /// into the queue is never dropped: 500 ms initial delay, factor
    /// 1.5, interval capped at 60 s, no cap on total elapsed time.
    #[must_use]
    pub fn ingest() -> Self {
        Self {
            max_retries: None, // Infinite
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
            factor: 1.5,
        }
    }

    /// Infinite retry for subscriber tail sessions. Reconnects are
    /// frequent and cheap, so the interval caps lower than ingest.
    #[must_use]
    pub fn tail() -> Self {
        Self {
            max_retries: None,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            factor: 2.0,
        }
    }

    /// Quick retry for individual queries (don't block forever).
    /// 3 attempts with fast backoff - if it fails, let caller handle it.
    #[must_use]
    pub fn query() -> Self {
        Self {
            max_retries: Some(3),
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
        }
    }

    /// Fast retry for tests (minimal delays)
    #[cfg(test)]
    pub fn test() -> Self {
        Self {
            max_retries: Some(3),
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            factor: 2.0,
        }
    }
}

/// Mutable backoff state for hand-rolled retry loops.
///
/// The ingestor and tailer drive their own loops (they refresh the
/// store session between attempts and must observe shutdown between
/// sleeps), so they use this instead of [`retry`].
#[derive(Debug)]
pub struct Backoff {
    config: RetryConfig,
    delay: Duration,
}

impl Backoff {
    #[must_use]
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            config: config.clone(),
            delay: config.initial_delay,
        }
    }

    /// The delay the next sleep will use.
    #[must_use]
    pub fn current_delay(&self) -> Duration {
        self.delay
    }

    /// Back to the initial delay, after a successful attempt.
    pub fn reset(&mut self) {
        self.delay = self.config.initial_delay;
    }

    /// Sleep for the current delay, then grow it.
    pub async fn sleep(&mut self) {
        sleep(self.delay).await;
        self.advance();
    }

    /// Sleep for the current delay unless the token fires first.
    /// Returns `false` when cancelled, so retry loops can exit without
    /// blocking the shutdown path.
    pub async fn sleep_unless_cancelled(&mut self, cancel: &CancellationToken) -> bool {
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = sleep(self.delay) => {
                self.advance();
                true
            }
        }
    }

    fn advance(&mut self) {
        self.delay = self.delay.mul_f64(self.config.factor).min(self.config.max_delay);
    }
}

pub async fn retry<F, Fut, T, E>(
    operation_name: &str,
    config: &RetryConfig,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut delay = config.initial_delay;
    let mut attempts = 0;

    loop {
        match operation().await {
            Ok(val) => {
                if attempts > 0 {
                    info!("Operation '{}' succeeded after {} retries", operation_name, attempts);
                }
                return Ok(val);
            }
            Err(err) => {
                attempts += 1;
                crate::metrics::record_store_retry(operation_name);

                if let Some(max) = config.max_retries {
                    if attempts >= max {
                        return Err(err);
                    }
                    warn!(
                        "Operation '{}' failed (attempt {}/{}): {}. Retrying in {:?}...",
                        operation_name, attempts, max, err, delay
                    );
                } else {
                    warn!(
                        "Operation '{}' failed (attempt {}, will retry forever): {}. Next retry in {:?}...",
                        operation_name, attempts, err, delay
                    );
                }

                sleep(delay).await;
                delay = (delay.mul_f64(config.factor)).min(config.max_delay);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Debug)]
    struct TestError(String);

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{}", self.0)
        }
    }

    #[tokio::test]
    async fn test_retry_succeeds_first_try() {
        let result: Result<i32, TestError> =
            retry("test_op", &RetryConfig::test(), || async { Ok(42) }).await;

        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_failures() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();

        let result: Result<i32, TestError> = retry("test_op", &RetryConfig::test(), || {
            let a = attempts_clone.clone();
            async move {
                let count = a.fetch_add(1, Ordering::SeqCst) + 1;
                if count < 3 {
                    Err(TestError(format!("fail {}", count)))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_exhausts_retries() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();

        let result: Result<i32, TestError> = retry("test_op", &RetryConfig::test(), || {
            let a = attempts_clone.clone();
            async move {
                a.fetch_add(1, Ordering::SeqCst);
                Err(TestError("always fail".to_string()))
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_retry_config_presets() {
        let startup = RetryConfig::startup();
        assert_eq!(startup.max_retries, Some(5));

        // Ingest never gives up and matches the documented curve.
        let ingest = RetryConfig::ingest();
        assert!(ingest.max_retries.is_none());
        assert_eq!(ingest.initial_delay, Duration::from_millis(500));
        assert_eq!(ingest.max_delay, Duration::from_secs(60));

        let query = RetryConfig::query();
        assert_eq!(query.max_retries, Some(3));
    }

    #[test]
    fn test_backoff_growth_and_cap() {
        let config = RetryConfig {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_millis(1000),
            factor: 1.5,
            max_retries: None,
        };
        let mut backoff = Backoff::new(&config);

        assert_eq!(backoff.current_delay(), Duration::from_millis(500));
        backoff.advance();
        assert_eq!(backoff.current_delay(), Duration::from_millis(750));
        backoff.advance();
        // 1125ms caps at 1000ms
        assert_eq!(backoff.current_delay(), Duration::from_millis(1000));

        backoff.reset();
        assert_eq!(backoff.current_delay(), Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_backoff_sleep_observes_cancellation() {
        let config = RetryConfig {
            initial_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(60),
            factor: 2.0,
            max_retries: None,
        };
        let mut backoff = Backoff::new(&config);
        let cancel = CancellationToken::new();
        cancel.cancel();

        // Returns immediately instead of sleeping a minute.
        assert!(!backoff.sleep_unless_cancelled(&cancel).await);
    }
}

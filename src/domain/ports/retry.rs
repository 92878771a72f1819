//! Retry strategy port and the built-in delay strategy.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::domain::entities::Source;
use crate::domain::errors::ImageError;

/// State handed to a retry strategy after a failed attempt.
#[derive(Debug, Clone)]
pub struct RetryContext {
    /// Source being retried.
    pub source: Source,
    /// Error of the last attempt.
    pub error: ImageError,
    /// How many retries already happened for this source.
    pub retried_count: u32,
}

impl RetryContext {
    /// Creates a context for the first failure of `source`.
    #[must_use]
    pub const fn new(source: Source, error: ImageError) -> Self {
        Self {
            source,
            error,
            retried_count: 0,
        }
    }

    /// Records another failure.
    pub fn increase_retry_count(&mut self, error: ImageError) {
        self.error = error;
        self.retried_count += 1;
    }
}

/// Outcome of [`RetryStrategy::retry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Try the same source again.
    Retry,
    /// Give up on this source.
    Stop,
}

/// Decides whether a failed attempt is retried.
#[async_trait]
pub trait RetryStrategy: Send + Sync {
    /// Inspects the failure and decides. May wait before returning
    /// [`RetryDecision::Retry`].
    async fn retry(&self, context: &RetryContext) -> RetryDecision;
}

/// Delay between retries.
#[derive(Clone)]
pub enum RetryInterval {
    /// Fixed delay.
    Fixed(Duration),
    /// Delay grows linearly with the retry count.
    Accumulated(Duration),
    /// Delay computed from the retry count.
    Custom(Arc<dyn Fn(u32) -> Duration + Send + Sync>),
}

impl RetryInterval {
    /// Delay before retry number `retried_count + 1`.
    #[must_use]
    pub fn delay(&self, retried_count: u32) -> Duration {
        match self {
            Self::Fixed(interval) => *interval,
            Self::Accumulated(interval) => interval.saturating_mul(retried_count + 1),
            Self::Custom(compute) => compute(retried_count),
        }
    }
}

impl fmt::Debug for RetryInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fixed(interval) => f.debug_tuple("Fixed").field(interval).finish(),
            Self::Accumulated(interval) => f.debug_tuple("Accumulated").field(interval).finish(),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// Retries response errors a bounded number of times with a delay.
#[derive(Debug, Clone)]
pub struct DelayRetryStrategy {
    max_retry_count: u32,
    retry_interval: RetryInterval,
}

impl DelayRetryStrategy {
    /// Creates the strategy.
    #[must_use]
    pub const fn new(max_retry_count: u32, retry_interval: RetryInterval) -> Self {
        Self {
            max_retry_count,
            retry_interval,
        }
    }

    /// Maximum number of retries per source.
    #[must_use]
    pub const fn max_retry_count(&self) -> u32 {
        self.max_retry_count
    }
}

impl Default for DelayRetryStrategy {
    fn default() -> Self {
        Self::new(3, RetryInterval::Fixed(Duration::from_secs(3)))
    }
}

#[async_trait]
impl RetryStrategy for DelayRetryStrategy {
    async fn retry(&self, context: &RetryContext) -> RetryDecision {
        if context.retried_count >= self.max_retry_count {
            return RetryDecision::Stop;
        }
        if context.error.is_task_cancelled() || !context.error.is_response_error() {
            return RetryDecision::Stop;
        }
        let delay = self.retry_interval.delay(context.retried_count);
        debug!(
            source = %context.source,
            attempt = context.retried_count + 1,
            delay_ms = delay.as_millis(),
            "Retrying after failure"
        );
        tokio::time::sleep(delay).await;
        RetryDecision::Retry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use url::Url;

    fn context(error: ImageError, retried_count: u32) -> RetryContext {
        let url = Url::parse("https://example.com/a.png").unwrap();
        RetryContext {
            source: Source::from_url(url),
            error,
            retried_count,
        }
    }

    fn session_error() -> ImageError {
        ImageError::session(Url::parse("https://example.com/a.png").unwrap(), "reset")
    }

    #[tokio::test]
    async fn test_retries_response_errors_until_limit() {
        let strategy = DelayRetryStrategy::new(2, RetryInterval::Fixed(Duration::ZERO));
        assert_eq!(
            strategy.retry(&context(session_error(), 0)).await,
            RetryDecision::Retry
        );
        assert_eq!(
            strategy.retry(&context(session_error(), 1)).await,
            RetryDecision::Retry
        );
        assert_eq!(
            strategy.retry(&context(session_error(), 2)).await,
            RetryDecision::Stop
        );
    }

    #[tokio::test]
    async fn test_never_retries_cancellation_or_cache_errors() {
        let strategy = DelayRetryStrategy::new(5, RetryInterval::Fixed(Duration::ZERO));
        assert_eq!(
            strategy.retry(&context(ImageError::cancelled(None, 1), 0)).await,
            RetryDecision::Stop
        );
        assert_eq!(
            strategy.retry(&context(ImageError::not_existing("k"), 0)).await,
            RetryDecision::Stop
        );
    }

    #[test]
    fn test_intervals() {
        let base = Duration::from_millis(100);
        assert_eq!(RetryInterval::Fixed(base).delay(4), base);
        assert_eq!(
            RetryInterval::Accumulated(base).delay(2),
            Duration::from_millis(300)
        );
        let custom = RetryInterval::Custom(Arc::new(|n| Duration::from_secs(u64::from(n))));
        assert_eq!(custom.delay(7), Duration::from_secs(7));
    }

    #[test]
    fn test_context_counts_failures() {
        let mut ctx = context(session_error(), 0);
        ctx.increase_retry_count(ImageError::not_existing("k"));
        assert_eq!(ctx.retried_count, 1);
        assert_eq!(ctx.error.code(), 3006);
    }
}

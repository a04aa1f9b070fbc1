/// Retry loops with an explicit policy
///
/// Network calls that may fail transiently go through `RetryPolicy::run`,
/// which bounds the attempts, sleeps between them and always yields to the
/// shutdown signal.

use crate::shutdown::Shutdown;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// Sleep between attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    None,
    Fixed(Duration),
}

impl Backoff {
    fn delay(&self) -> Duration {
        match self {
            Self::None => Duration::ZERO,
            Self::Fixed(delay) => *delay,
        }
    }
}

/// What to do with a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry after the policy's backoff
    Retry,

    /// Retry after a specific delay instead of the policy's backoff
    RetryAfter(Duration),

    /// Give up and surface the error
    Stop,
}

#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    #[error("gave up after {attempts} attempts: {error}")]
    Exhausted { attempts: u32, error: E },

    #[error("not retryable: {0}")]
    Stopped(E),

    #[error("cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// `None` retries forever
    pub max_attempts: Option<u32>,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub fn infinite(backoff: Backoff) -> Self {
        Self {
            max_attempts: None,
            backoff,
        }
    }

    pub fn attempts(max_attempts: u32, backoff: Backoff) -> Self {
        Self {
            max_attempts: Some(max_attempts.max(1)),
            backoff,
        }
    }

    /// Run `op` until it succeeds, `classify` stops it, the attempts run
    /// out, or `shutdown` fires. `op` receives the 1-based attempt number.
    pub async fn run<T, E, F, Fut, C>(
        &self,
        shutdown: &Shutdown,
        mut op: F,
        classify: C,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: Fn(&E) -> RetryDecision,
        E: Display,
    {
        let mut attempt = 0u32;

        loop {
            attempt += 1;

            let result = tokio::select! {
                _ = shutdown.wait() => return Err(RetryError::Cancelled),
                result = op(attempt) => result,
            };

            let error = match result {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            let delay = match classify(&error) {
                RetryDecision::Stop => return Err(RetryError::Stopped(error)),
                RetryDecision::Retry => self.backoff.delay(),
                RetryDecision::RetryAfter(delay) => delay,
            };

            if self.max_attempts.is_some_and(|max| attempt >= max) {
                return Err(RetryError::Exhausted { attempts: attempt, error });
            }

            debug!("Retry: attempt {} failed ({}), waiting {:?}", attempt, error, delay);

            tokio::select! {
                _ = shutdown.wait() => return Err(RetryError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::infinite(Backoff::Fixed(Duration::from_secs(1)));

        let counter = calls.clone();
        let result: Result<u32, RetryError<String>> = policy
            .run(
                &Shutdown::new(),
                |attempt| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if attempt < 3 {
                            Err("reset".to_string())
                        } else {
                            Ok(attempt)
                        }
                    }
                },
                |_| RetryDecision::Retry,
            )
            .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounded_attempts_exhaust() {
        let policy = RetryPolicy::attempts(2, Backoff::None);
        let result: Result<(), RetryError<&str>> = policy
            .run(&Shutdown::new(), |_| async { Err("nope") }, |_| RetryDecision::Retry)
            .await;

        assert!(matches!(result, Err(RetryError::Exhausted { attempts: 2, .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_decision_surfaces_error() {
        let policy = RetryPolicy::infinite(Backoff::None);
        let result: Result<(), RetryError<&str>> = policy
            .run(&Shutdown::new(), |_| async { Err("fatal") }, |_| RetryDecision::Stop)
            .await;

        assert!(matches!(result, Err(RetryError::Stopped("fatal"))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_interrupts_backoff() {
        let shutdown = Shutdown::new();
        let trigger = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            trigger.trigger();
        });

        let policy = RetryPolicy::infinite(Backoff::None);
        let result: Result<(), RetryError<&str>> = policy
            .run(
                &shutdown,
                |_| async { Err("timeout") },
                |_| RetryDecision::RetryAfter(Duration::from_secs(120)),
            )
            .await;

        assert!(matches!(result, Err(RetryError::Cancelled)));
    }
}

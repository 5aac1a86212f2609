//! Retry with exponential backoff and jitter.
//!
//! One implementation shared by the gate runner, outbox delivery, and the
//! supervisor restart path. The caller supplies a `classify` hook that
//! decides, per error, whether to retry, defer to a later sweep, or fail.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// What to do with a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryVerdict {
    /// Sleep the backoff and try again.
    Retry,
    /// Stop now; the caller will revisit on its own schedule.
    Defer,
    /// Stop now; the failure is final.
    Fail,
}

/// Backoff configuration.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Base delay before the first retry.
    pub base: Duration,
    /// Upper bound of the uniform jitter added to each delay.
    pub jitter: Duration,
    /// Total attempts, including the first.
    pub max_attempts: u32,
}

impl RetryConfig {
    /// Config with no jitter (deterministic tests, restart backoff).
    #[must_use]
    pub fn fixed(base: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            jitter: Duration::ZERO,
            max_attempts,
        }
    }

    /// The delay before attempt `attempt` (0-based), `base * 2^attempt`
    /// plus uniform jitter.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self.base.saturating_mul(1u32 << attempt.min(16));
        if self.jitter.is_zero() {
            return exp;
        }
        let jitter_ms = rand::thread_rng().gen_range(0..=self.jitter.as_millis() as u64);
        exp + Duration::from_millis(jitter_ms)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(2),
            jitter: Duration::from_millis(1500),
            max_attempts: 2,
        }
    }
}

/// Outcome of a [`retry`] run.
#[derive(Debug)]
pub enum RetryOutcome<T, E> {
    /// An attempt succeeded.
    Success {
        /// The successful value.
        value: T,
        /// How many attempts were made, including the successful one.
        attempts: u32,
    },
    /// The classify hook said to defer.
    Deferred {
        /// The error that triggered the deferral.
        error: E,
        /// Attempts made before deferring.
        attempts: u32,
    },
    /// Attempts exhausted or the classify hook said to fail.
    Failed {
        /// The final error.
        error: E,
        /// Attempts made.
        attempts: u32,
    },
}

impl<T, E> RetryOutcome<T, E> {
    /// Unwrap into a `Result`, losing the attempt count.
    ///
    /// # Errors
    ///
    /// Returns the final error for deferred and failed outcomes.
    pub fn into_result(self) -> Result<T, E> {
        match self {
            Self::Success { value, .. } => Ok(value),
            Self::Deferred { error, .. } | Self::Failed { error, .. } => Err(error),
        }
    }
}

/// Run `op` with the given backoff policy.
///
/// `classify` is consulted after each failure; `RetryVerdict::Retry` sleeps
/// the backoff and tries again until `max_attempts` is reached.
pub async fn retry<T, E, F, Fut, C>(
    config: &RetryConfig,
    mut classify: C,
    mut op: F,
) -> RetryOutcome<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    C: FnMut(&E) -> RetryVerdict,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => {
                return RetryOutcome::Success {
                    value,
                    attempts: attempt + 1,
                }
            }
            Err(error) => {
                let attempts = attempt + 1;
                match classify(&error) {
                    RetryVerdict::Defer => return RetryOutcome::Deferred { error, attempts },
                    RetryVerdict::Fail => return RetryOutcome::Failed { error, attempts },
                    RetryVerdict::Retry => {
                        if attempts >= config.max_attempts {
                            return RetryOutcome::Failed { error, attempts };
                        }
                        let delay = config.delay_for(attempt);
                        debug!(attempt = attempts, delay_ms = delay.as_millis() as u64, error = %error, "retrying after backoff");
                        tokio::time::sleep(delay).await;
                        attempt = attempts;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_delay_doubles() {
        let cfg = RetryConfig::fixed(Duration::from_secs(2), 4);
        assert_eq!(cfg.delay_for(0), Duration::from_secs(2));
        assert_eq!(cfg.delay_for(1), Duration::from_secs(4));
        assert_eq!(cfg.delay_for(2), Duration::from_secs(8));
    }

    #[test]
    fn test_jitter_bounded() {
        let cfg = RetryConfig {
            base: Duration::from_millis(10),
            jitter: Duration::from_millis(50),
            max_attempts: 2,
        };
        for _ in 0..20 {
            let d = cfg.delay_for(0);
            assert!(d >= Duration::from_millis(10));
            assert!(d <= Duration::from_millis(60));
        }
    }

    #[tokio::test]
    async fn test_success_first_attempt() {
        let cfg = RetryConfig::fixed(Duration::from_millis(1), 3);
        let outcome = retry(&cfg, |_: &String| RetryVerdict::Retry, || async {
            Ok::<_, String>(42)
        })
        .await;
        match outcome {
            RetryOutcome::Success { value, attempts } => {
                assert_eq!(value, 42);
                assert_eq!(attempts, 1);
            }
            _ => panic!("expected success"),
        }
    }

    #[tokio::test]
    async fn test_retries_then_succeeds() {
        let cfg = RetryConfig::fixed(Duration::from_millis(1), 3);
        let calls = AtomicU32::new(0);
        let outcome = retry(&cfg, |_: &String| RetryVerdict::Retry, || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 1 {
                Err("blip".to_string())
            } else {
                Ok(7)
            }
        })
        .await;
        match outcome {
            RetryOutcome::Success { value, attempts } => {
                assert_eq!(value, 7);
                assert_eq!(attempts, 2);
            }
            _ => panic!("expected success after retry"),
        }
    }

    #[tokio::test]
    async fn test_exhaustion_fails() {
        let cfg = RetryConfig::fixed(Duration::from_millis(1), 2);
        let outcome = retry(&cfg, |_: &String| RetryVerdict::Retry, || async {
            Err::<u32, _>("down".to_string())
        })
        .await;
        match outcome {
            RetryOutcome::Failed { attempts, .. } => assert_eq!(attempts, 2),
            _ => panic!("expected failure"),
        }
    }

    #[tokio::test]
    async fn test_classify_fail_short_circuits() {
        let cfg = RetryConfig::fixed(Duration::from_millis(1), 5);
        let outcome = retry(&cfg, |_: &String| RetryVerdict::Fail, || async {
            Err::<u32, _>("denied".to_string())
        })
        .await;
        match outcome {
            RetryOutcome::Failed { attempts, .. } => assert_eq!(attempts, 1),
            _ => panic!("expected immediate failure"),
        }
    }

    #[tokio::test]
    async fn test_classify_defer() {
        let cfg = RetryConfig::fixed(Duration::from_millis(1), 5);
        let outcome = retry(&cfg, |_: &String| RetryVerdict::Defer, || async {
            Err::<u32, _>("circuit open".to_string())
        })
        .await;
        assert!(matches!(outcome, RetryOutcome::Deferred { attempts: 1, .. }));
    }
}

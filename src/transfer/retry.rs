//! Retry and timeout helpers for sink operations

use crate::error::{Error, Result};
use std::future::Future;
use std::time::Duration;
use tracing::{error, warn};

/// Exponential backoff with a cap and a little jitter
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    base_ms: u64,
    max_ms: u64,
    max_retries: u32,
    attempt: u32,
}

impl ExponentialBackoff {
    pub fn new(base_delay_ms: u64, max_retries: u32) -> Self {
        ExponentialBackoff {
            base_ms: base_delay_ms,
            max_ms: 30_000,
            max_retries,
            attempt: 0,
        }
    }

    pub fn with_max_delay(mut self, max_delay_ms: u64) -> Self {
        self.max_ms = max_delay_ms;
        self
    }

    /// Delay before the next retry, or `None` once retries are exhausted
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.max_retries {
            return None;
        }
        let exp = self
            .base_ms
            .saturating_mul(1u64 << self.attempt.min(32))
            .min(self.max_ms);
        let jitter = if exp >= 4 {
            rand::random::<u64>() % (exp / 4)
        } else {
            0
        };
        self.attempt += 1;
        Some(Duration::from_millis(exp.saturating_add(jitter).min(self.max_ms)))
    }

    /// Retries handed out so far
    pub fn retries(&self) -> u32 {
        self.attempt
    }
}

/// How often and how patiently a failing sink operation is retried
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Per-attempt timeout; expiry counts as a transient failure
    pub op_timeout: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            op_timeout: Some(Duration::from_secs(60)),
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no waiting
    pub fn none() -> Self {
        RetryPolicy {
            max_retries: 0,
            ..Default::default()
        }
    }

    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff::new(self.base_delay.as_millis() as u64, self.max_retries)
            .with_max_delay(self.max_delay.as_millis() as u64)
    }
}

/// Await `fut`, turning expiry of `limit` into a transient transport error
pub async fn timed<T, F>(limit: Option<Duration>, what: &str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut).await.map_err(|_| {
            Error::Transport(format!("{} timed out after {:?}", what, limit))
        })?,
        None => fut.await,
    }
}

/// Run `op` until it succeeds, fails permanently, or retries run out
///
/// Only [`Error::Transport`] is retried; anything else is returned at once.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, what: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut backoff = policy.backoff();
    loop {
        match timed(policy.op_timeout, what, op()).await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retriable() => match backoff.next_delay() {
                Some(delay) => {
                    warn!("{} failed, retrying in {:?}: {}", what, delay, e);
                    tokio::time::sleep(delay).await;
                }
                None => {
                    error!(
                        "{} failed after {} attempts: {}",
                        what,
                        backoff.retries() + 1,
                        e
                    );
                    return Err(e);
                }
            },
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            op_timeout: Some(Duration::from_secs(5)),
        }
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let mut backoff = ExponentialBackoff::new(100, 5).with_max_delay(350);
        let delays: Vec<Duration> = std::iter::from_fn(|| backoff.next_delay()).collect();
        assert_eq!(delays.len(), 5);
        assert!(delays[0] >= Duration::from_millis(100));
        assert!(delays[1] >= Duration::from_millis(200));
        assert!(delays.iter().all(|d| *d <= Duration::from_millis(350)));
    }

    #[test]
    fn test_backoff_zero_retries() {
        assert!(ExponentialBackoff::new(100, 0).next_delay().is_none());
    }

    #[tokio::test]
    async fn test_retries_transient_then_succeeds() {
        let calls = AtomicU32::new(0);
        let result = with_retry(&fast(3), "put", || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(Error::Transport("reset".into()))
            } else {
                Ok(7)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = with_retry(&fast(2), "put", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::Transport("reset".into()))
        })
        .await;
        assert!(matches!(result, Err(Error::Transport(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_fatal_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = with_retry(&fast(5), "put", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::fatal("permission denied"))
        })
        .await;
        assert!(matches!(result, Err(Error::FatalTransport { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_timeout_is_transient() {
        let result: Result<()> = timed(Some(Duration::from_millis(5)), "get", async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(Error::Transport(_))));
    }
}

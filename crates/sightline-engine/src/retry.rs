//! Bounded, retried store calls.

use std::{future::Future, time::Duration};

use sightline_core::Classify;
use tracing::warn;

use crate::{Error, Result};

/// Backoff before the first retry; doubles on each further attempt.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(150);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
  /// Total attempts, including the first.
  pub max_attempts: u32,
  pub base_delay:   Duration,
  /// Deadline for each attempt.
  pub timeout:      Duration,
}

impl RetryPolicy {
  fn delay_before(&self, retry: u32) -> Duration {
    self.base_delay.saturating_mul(1 << retry.min(16))
  }
}

/// Run `call` until it succeeds, fails with a non-retryable error, or runs
/// out of attempts.
///
/// Each attempt is bounded by `policy.timeout`; an attempt that runs past it
/// counts as a transport failure.
pub async fn with_retry<T, E, F, Fut>(
  policy: RetryPolicy,
  operation: &'static str,
  mut call: F,
) -> Result<T>
where
  E: std::error::Error + Classify + Send + Sync + 'static,
  F: FnMut() -> Fut,
  Fut: Future<Output = Result<T, E>>,
{
  let attempts = policy.max_attempts.max(1);
  let mut attempt = 0;
  loop {
    attempt += 1;
    let outcome = match tokio::time::timeout(policy.timeout, call()).await {
      Ok(result) => result.map_err(Error::store),
      Err(_) => Err(Error::DeadlineExceeded { operation, after: policy.timeout }),
    };
    match outcome {
      Err(e) if e.is_retryable() && attempt < attempts => {
        let delay = policy.delay_before(attempt - 1);
        warn!(operation, attempt, ?delay, error = %e, "retrying store call");
        tokio::time::sleep(delay).await;
      }
      other => return other,
    }
  }
}

#[cfg(test)]
mod tests {
  use std::sync::atomic::{AtomicU32, Ordering};

  use sightline_core::ErrorKind;

  use super::*;

  #[derive(Debug, thiserror::Error)]
  #[error("{0:?}")]
  struct Flaky(ErrorKind);

  impl Classify for Flaky {
    fn kind(&self) -> ErrorKind { self.0 }
  }

  fn policy(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
      max_attempts,
      base_delay: Duration::from_millis(1),
      timeout: Duration::from_secs(5),
    }
  }

  #[test]
  fn delay_doubles() {
    let p = RetryPolicy { base_delay: DEFAULT_BASE_DELAY, ..policy(3) };
    assert_eq!(p.delay_before(0), Duration::from_millis(150));
    assert_eq!(p.delay_before(2), Duration::from_millis(600));
  }

  #[tokio::test]
  async fn transport_failures_are_retried() {
    let calls = &AtomicU32::new(0);
    let out = with_retry(policy(3), "test", move || async move {
      if calls.fetch_add(1, Ordering::SeqCst) < 2 {
        Err(Flaky(ErrorKind::Transport))
      } else {
        Ok(7)
      }
    })
    .await
    .unwrap();
    assert_eq!(out, 7);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
  }

  #[tokio::test]
  async fn gives_up_after_max_attempts() {
    let calls = &AtomicU32::new(0);
    let err = with_retry(policy(2), "test", move || async move {
      calls.fetch_add(1, Ordering::SeqCst);
      Err::<(), _>(Flaky(ErrorKind::Transport))
    })
    .await
    .unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test]
  async fn conflicts_are_not_retried() {
    let calls = &AtomicU32::new(0);
    let err = with_retry(policy(5), "test", move || async move {
      calls.fetch_add(1, Ordering::SeqCst);
      Err::<(), _>(Flaky(ErrorKind::Conflict))
    })
    .await
    .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn slow_call_hits_deadline() {
    let p = RetryPolicy { timeout: Duration::from_millis(5), ..policy(1) };
    let err = with_retry(p, "slow", || async {
      tokio::time::sleep(Duration::from_secs(5)).await;
      Ok::<_, Flaky>(())
    })
    .await
    .unwrap_err();
    assert!(matches!(err, Error::DeadlineExceeded { operation: "slow", .. }));
  }
}

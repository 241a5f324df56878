use std::time::{Duration, Instant};

use snapvault_types::{CancelToken, Result, SnapvaultError};

/// Backoff settings shared by every remote operation of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound for a single backoff step (before jitter).
    pub max_backoff: Duration,
    /// Wall-clock budget for retrying one operation. Zero means unlimited.
    pub max_retry_time: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30 * 60),
            max_retry_time: Duration::from_secs(12 * 60 * 60),
        }
    }
}

/// Run `f` until it succeeds, fails with a non-transient error, or the retry
/// budget is spent.
///
/// Transient failures are followed by an exponentially growing pause with
/// random jitter, clipped so no sleep runs past the deadline. Once the
/// deadline has passed the last transient error is escalated to `Fatal`.
/// Cancellation is observed between attempts and while sleeping.
pub fn retry_with_backoff<T>(
    policy: &RetryPolicy,
    cancel: &CancelToken,
    op_label: &str,
    mut f: impl FnMut() -> Result<T>,
) -> Result<T> {
    let start = Instant::now();
    let deadline = (!policy.max_retry_time.is_zero()).then(|| start + policy.max_retry_time);
    let step_cap = policy.max_backoff.max(policy.base_delay);
    let mut delay = policy.base_delay;
    let mut attempt: u32 = 0;

    loop {
        cancel.check()?;
        attempt += 1;
        let err = match f() {
            Ok(val) => return Ok(val),
            Err(e) if e.is_transient() => e,
            Err(e) => return Err(e),
        };

        let now = Instant::now();
        let remaining = match deadline {
            Some(deadline) if now >= deadline => {
                return Err(SnapvaultError::fatal(
                    op_label,
                    format!(
                        "gave up after {attempt} attempts in {:.1}s: {err}",
                        start.elapsed().as_secs_f64()
                    ),
                ));
            }
            Some(deadline) => Some(deadline - now),
            None => None,
        };

        let mut pause = delay + jitter(delay);
        if let Some(remaining) = remaining {
            pause = pause.min(remaining);
        }
        tracing::warn!(
            "{op_label}: transient error (attempt {attempt}), retrying in {}ms: {err}",
            pause.as_millis()
        );
        cancel.sleep(pause)?;
        delay = delay.saturating_mul(2).min(step_cap);
    }
}

fn jitter(delay: Duration) -> Duration {
    let delay_ms = delay.as_millis().min(u64::MAX as u128) as u64;
    Duration::from_millis(rand::random::<u64>() % delay_ms.max(1))
}

/// Whether an HTTP error is transient and worth retrying.
pub fn is_retryable_http(err: &ureq::Error) -> bool {
    match err {
        ureq::Error::Transport(_) => true,
        ureq::Error::Status(code, _) => *code == 408 || *code == 429 || *code >= 500,
    }
}

/// Whether an I/O error is transient and worth retrying.
pub fn is_retryable_io(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::TimedOut
            | std::io::ErrorKind::Interrupted
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_policy(max_retry_time: Duration) -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_millis(5),
            max_backoff: Duration::from_millis(20),
            max_retry_time,
        }
    }

    #[test]
    fn retryable_io_errors() {
        let retryable_kinds = [
            std::io::ErrorKind::ConnectionReset,
            std::io::ErrorKind::ConnectionAborted,
            std::io::ErrorKind::BrokenPipe,
            std::io::ErrorKind::UnexpectedEof,
            std::io::ErrorKind::TimedOut,
            std::io::ErrorKind::Interrupted,
        ];
        for kind in retryable_kinds {
            let err = std::io::Error::new(kind, "test");
            assert!(is_retryable_io(&err), "{kind:?} should be retryable");
        }
    }

    #[test]
    fn non_retryable_io_errors() {
        let non_retryable_kinds = [
            std::io::ErrorKind::NotFound,
            std::io::ErrorKind::PermissionDenied,
            std::io::ErrorKind::InvalidData,
            std::io::ErrorKind::InvalidInput,
            std::io::ErrorKind::AlreadyExists,
        ];
        for kind in non_retryable_kinds {
            let err = std::io::Error::new(kind, "test");
            assert!(!is_retryable_io(&err), "{kind:?} should NOT be retryable");
        }
    }

    #[test]
    fn succeeds_after_transient_failures() {
        let mut calls = 0;
        let out = retry_with_backoff(
            &fast_policy(Duration::from_secs(5)),
            &CancelToken::new(),
            "PUT k",
            || {
                calls += 1;
                if calls < 3 {
                    Err(SnapvaultError::transient("PUT k", "503"))
                } else {
                    Ok(calls)
                }
            },
        )
        .unwrap();
        assert_eq!(out, 3);
    }

    #[test]
    fn non_transient_errors_return_immediately() {
        let mut calls = 0;
        let err = retry_with_backoff(
            &fast_policy(Duration::from_secs(5)),
            &CancelToken::new(),
            "PUT k",
            || -> Result<()> {
                calls += 1;
                Err(SnapvaultError::fatal("PUT k", "403 Forbidden"))
            },
        )
        .unwrap_err();
        assert_eq!(calls, 1);
        assert!(matches!(err, SnapvaultError::Fatal { .. }));
    }

    #[test]
    fn gives_up_once_budget_is_spent() {
        let budget = Duration::from_millis(150);
        let start = Instant::now();
        let err = retry_with_backoff(
            &fast_policy(budget),
            &CancelToken::new(),
            "PUT k",
            || -> Result<()> { Err(SnapvaultError::transient("PUT k", "timeout")) },
        )
        .unwrap_err();
        let elapsed = start.elapsed();

        assert!(matches!(err, SnapvaultError::Fatal { .. }));
        assert!(err.to_string().contains("gave up"));
        assert!(elapsed >= budget, "stopped early: {elapsed:?}");
        assert!(elapsed < budget + Duration::from_secs(2), "overran: {elapsed:?}");
    }

    #[test]
    fn cancellation_interrupts_backoff() {
        let cancel = CancelToken::new();
        let policy = RetryPolicy {
            base_delay: Duration::from_secs(60),
            max_backoff: Duration::from_secs(60),
            max_retry_time: Duration::ZERO,
        };
        let canceller = {
            let cancel = cancel.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(50));
                cancel.cancel();
            })
        };
        let start = Instant::now();
        let err = retry_with_backoff(&policy, &cancel, "GET k", || -> Result<()> {
            Err(SnapvaultError::transient("GET k", "reset"))
        })
        .unwrap_err();
        canceller.join().unwrap();
        assert!(matches!(err, SnapvaultError::Cancelled));
        assert!(start.elapsed() < Duration::from_secs(30));
    }
}

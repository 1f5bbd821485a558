//! Generic retry combinator (spec §4.5). Replaces the exception-based
//! retry control flow of the source with a `Result`-returning runner
//! that inspects [`TransportError::retryable`].

use std::time::Duration;

use tracing::{debug, warn};

use crate::error::TransportError;

pub trait RetryPolicy {
    /// Total number of attempts allowed (not "retries after the
    /// first" — `max_attempts() == 1` means no retrying at all).
    fn max_attempts(&self) -> u32;

    /// Sleep inserted between a failed attempt and the next one.
    fn sleep_between(&self) -> Duration;
}

/// Up to `attempts` total attempts, no sleep between them. Used for
/// the listener bring-up scan (spec §4.3).
pub struct CountingRetry {
    pub attempts: u32,
}

impl RetryPolicy for CountingRetry {
    fn max_attempts(&self) -> u32 {
        self.attempts.max(1)
    }

    fn sleep_between(&self) -> Duration {
        Duration::ZERO
    }
}

/// Up to `attempts` total attempts, sleeping `sleep_ms` between each.
/// Used for `Send`/`Receive` (spec §4.4).
pub struct CountingAndSleepRetry {
    pub attempts: u32,
    pub sleep_ms: u64,
}

impl RetryPolicy for CountingAndSleepRetry {
    fn max_attempts(&self) -> u32 {
        self.attempts.max(1)
    }

    fn sleep_between(&self) -> Duration {
        Duration::from_millis(self.sleep_ms)
    }
}

/// Runs `f` under `policy`, logging each attempt by ordinal. Stops and
/// surfaces the error immediately if it is non-retryable (spec §7:
/// the non-retryable variant aborts the loop without consuming a
/// retry). Otherwise sleeps `policy.sleep_between()` and tries again
/// until attempts are exhausted, then surfaces the last error.
pub fn retry<T>(
    name: &str,
    policy: &dyn RetryPolicy,
    mut f: impl FnMut(u32) -> Result<T, TransportError>,
) -> Result<T, TransportError> {
    let max = policy.max_attempts();
    let mut last_err = None;

    for attempt in 1..=max {
        match f(attempt) {
            Ok(v) => return Ok(v),
            Err(e) => {
                if !e.retryable() {
                    warn!(name, attempt, error = %e, "non-retryable error, aborting retries");
                    return Err(e);
                }
                debug!(name, attempt, max, error = %e, "attempt failed");
                last_err = Some(e);
                if attempt < max {
                    let sleep = policy.sleep_between();
                    if !sleep.is_zero() {
                        std::thread::sleep(sleep);
                    }
                }
            }
        }
    }

    Err(last_err.expect("loop runs at least once"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_succeeds_on_first_try() {
        let policy = CountingRetry { attempts: 3 };
        let calls = AtomicU32::new(0);
        let result = retry("t", &policy, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, TransportError>(())
        });
        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_retries_then_succeeds() {
        let policy = CountingAndSleepRetry {
            attempts: 3,
            sleep_ms: 1,
        };
        let calls = AtomicU32::new(0);
        let result = retry("t", &policy, |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            if attempt < 3 {
                Err(TransportError::TransientTransferError("nope".into()))
            } else {
                Ok(())
            }
        });
        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_non_retryable_stops_after_one_attempt() {
        let policy = CountingAndSleepRetry {
            attempts: 5,
            sleep_ms: 1,
        };
        let calls = AtomicU32::new(0);
        let result: Result<(), TransportError> = retry("t", &policy, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(TransportError::ArgumentError("bad arg".into()))
        });
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_exhaustion_surfaces_last_error() {
        let policy = CountingRetry { attempts: 2 };
        let calls = AtomicU32::new(0);
        let result: Result<(), TransportError> = retry("t", &policy, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(TransportError::TransientTransferError("still failing".into()))
        });
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}

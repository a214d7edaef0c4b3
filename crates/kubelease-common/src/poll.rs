//! Bounded, cancellable polling
//!
//! Used where the target cluster materializes state asynchronously (token
//! secrets for a new service account). The loop never sleeps past its
//! deadline and wakes immediately when the caller's token is cancelled.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::Error;

/// Poll until a check yields a value, the timeout passes, or the caller cancels
///
/// # Arguments
/// * `timeout` - Maximum time to wait for the condition
/// * `poll_interval` - Time between polling attempts
/// * `cancel` - Caller cancellation; aborts the wait promptly
/// * `operation` - Name used in logs and in the cancellation error
/// * `check_fn` - Returns `Ok(Some(v))` when done, `Ok(None)` to keep
///   polling, or `Err` to stop immediately
///
/// # Returns
/// `Ok(Some(v))` once the check succeeds, `Ok(None)` if the timeout elapsed
/// first, `Err` if the check failed or the caller cancelled.
pub async fn poll_until<F, Fut, T>(
    timeout: Duration,
    poll_interval: Duration,
    cancel: &CancellationToken,
    operation: &str,
    mut check_fn: F,
) -> Result<Option<T>, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, Error>>,
{
    // No deadline when `timeout` is too large to represent
    let deadline = Instant::now().checked_add(timeout);
    let mut attempt = 0u32;

    loop {
        if cancel.is_cancelled() {
            return Err(Error::cancelled(operation));
        }

        attempt += 1;
        let checked = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::cancelled(operation)),
            result = check_fn() => result?,
        };
        if let Some(value) = checked {
            return Ok(Some(value));
        }

        let wait = match deadline {
            Some(deadline) => {
                let left = deadline.saturating_duration_since(Instant::now());
                if left.is_zero() {
                    trace!(operation, attempt, "Polling deadline reached");
                    return Ok(None);
                }
                poll_interval.min(left)
            }
            None => poll_interval,
        };
        trace!(operation, attempt, "Polling condition not yet met, retrying...");

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::cancelled(operation)),
            _ = tokio::time::sleep(wait) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn returns_value_once_condition_is_met() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let cancel = CancellationToken::new();

        let result = poll_until(
            Duration::from_secs(10),
            Duration::from_millis(100),
            &cancel,
            "op",
            || {
                let c = c.clone();
                async move {
                    let n = c.fetch_add(1, Ordering::SeqCst) + 1;
                    Ok(if n >= 3 { Some(n) } else { None })
                }
            },
        )
        .await
        .unwrap();

        assert_eq!(result, Some(3));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_timeout() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let cancel = CancellationToken::new();

        let result: Option<()> = poll_until(
            Duration::from_secs(1),
            Duration::from_millis(250),
            &cancel,
            "op",
            || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok(None)
                }
            },
        )
        .await
        .unwrap();

        assert!(result.is_none());
        // t=0, 250, 500, 750, 1000
        assert_eq!(count.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn unrepresentable_timeout_polls_without_a_deadline() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let cancel = CancellationToken::new();

        let result = poll_until(
            Duration::MAX,
            Duration::from_millis(100),
            &cancel,
            "op",
            || {
                let c = c.clone();
                async move {
                    let n = c.fetch_add(1, Ordering::SeqCst) + 1;
                    Ok(if n >= 4 { Some(n) } else { None })
                }
            },
        )
        .await
        .unwrap();

        assert_eq!(result, Some(4));
    }

    #[tokio::test(start_paused = true)]
    async fn check_errors_stop_the_loop() {
        let cancel = CancellationToken::new();
        let result: Result<Option<()>, Error> = poll_until(
            Duration::from_secs(10),
            Duration::from_millis(100),
            &cancel,
            "op",
            || async { Err(Error::configuration("boom")) },
        )
        .await;

        assert!(matches!(result, Err(Error::Configuration { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_the_wait() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let result: Result<Option<()>, Error> = poll_until(
            Duration::from_secs(60),
            Duration::from_secs(5),
            &cancel,
            "fetch_credentials",
            || async { Ok(None) },
        )
        .await;

        assert!(matches!(
            result,
            Err(Error::Cancelled { timed_out: false, .. })
        ));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn already_cancelled_token_skips_the_check() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let called = Arc::new(AtomicU32::new(0));
        let c = called.clone();

        let result: Result<Option<()>, Error> = poll_until(
            Duration::from_secs(1),
            Duration::from_millis(10),
            &cancel,
            "op",
            || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok(None)
                }
            },
        )
        .await;

        assert!(result.is_err());
        assert_eq!(called.load(Ordering::SeqCst), 0);
    }
}

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::errors::{TestkitError, TestkitResult};

/// Waits until `check` reports success, re-running it every `interval`.
///
/// Each tick evaluates the whole condition from scratch; nothing is carried
/// over between attempts, so transient flapping of the observed system does
/// no harm. `check` always runs at least once. The deadline and the
/// cancellation token are only looked at between ticks, an attempt that is
/// already running is allowed to finish.
///
/// Returns `NotConverged` carrying the last error once `timeout` has passed,
/// or `Cancelled` if `cancel` fires first.
pub async fn await_converge<F, Fut, E>(
    cancel: &CancellationToken,
    timeout: Duration,
    interval: Duration,
    mut check: F,
) -> TestkitResult<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), E>>,
    E: Display,
{
    let started = Instant::now();
    let deadline = started + timeout;
    let mut attempts: u32 = 0;

    loop {
        attempts += 1;
        let last_error = match check().await {
            Ok(()) => {
                debug!(attempts, elapsed = ?started.elapsed(), "converged");
                return Ok(());
            }
            Err(e) => e.to_string(),
        };
        trace!(attempts, error = %last_error, "not converged yet");

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TestkitError::Cancelled),
            _ = tokio::time::sleep_until(deadline) => {
                return Err(TestkitError::NotConverged {
                    waited: started.elapsed(),
                    last_error,
                });
            }
            _ = tokio::time::sleep(interval) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // succeeds on the k-th call
    fn succeed_on(k: u32, calls: &mut u32) -> impl Future<Output = Result<(), String>> {
        *calls += 1;
        let n = *calls;
        async move {
            if n >= k {
                Ok(())
            } else {
                Err(format!("{n} of {k}"))
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_converges_after_k_minus_one_intervals() {
        let cancel = CancellationToken::new();
        let mut calls = 0;
        let start = Instant::now();

        let result = await_converge(&cancel, Duration::from_secs(10), Duration::from_secs(1), || {
            succeed_on(4, &mut calls)
        })
        .await;

        assert!(result.is_ok());
        assert_eq!(calls, 4);
        assert!(start.elapsed() >= Duration::from_secs(3));
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_immediate_success_does_not_sleep() {
        let cancel = CancellationToken::new();
        let start = Instant::now();
        let result = await_converge(&cancel, Duration::from_secs(5), Duration::from_secs(1), || async {
            Ok::<(), String>(())
        })
        .await;
        assert!(result.is_ok());
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_reports_last_error() {
        let cancel = CancellationToken::new();
        let mut calls = 0;
        let start = Instant::now();

        let result = await_converge(&cancel, Duration::from_millis(2500), Duration::from_secs(1), || {
            succeed_on(10, &mut calls)
        })
        .await;

        match result {
            Err(TestkitError::NotConverged { last_error, .. }) => assert_eq!(last_error, "3 of 10"),
            other => panic!("expected NotConverged, got {other:?}"),
        }
        assert_eq!(calls, 3);
        assert_eq!(start.elapsed(), Duration::from_millis(2500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_stops_polling() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(1500)).await;
            trigger.cancel();
        });

        let mut calls = 0;
        let result = await_converge(&cancel, Duration::from_secs(60), Duration::from_secs(1), || {
            succeed_on(100, &mut calls)
        })
        .await;

        assert!(matches!(result, Err(TestkitError::Cancelled)));
        assert_eq!(calls, 2);
    }
}

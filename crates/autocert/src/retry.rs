//! Bounded-duration retry with a curated backoff schedule
//!
//! The schedule is weighted toward the front: intermittent errors usually
//! clear on the first retry, while anything that survives it tends to need
//! minutes to hours (DNS propagation, an operator fixing records) before
//! another attempt can succeed.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::error;

use crate::error::{Error, Result};

/// Backoff intervals; the last entry repeats until [`MAX_RETRY_DURATION`]
pub const RETRY_INTERVALS: [Duration; 12] = [
    Duration::from_secs(60),
    Duration::from_secs(2 * 60),
    Duration::from_secs(2 * 60),
    Duration::from_secs(5 * 60), // elapsed: 10 min
    Duration::from_secs(10 * 60),
    Duration::from_secs(20 * 60),
    Duration::from_secs(20 * 60), // elapsed: 1 hr
    Duration::from_secs(30 * 60),
    Duration::from_secs(30 * 60), // elapsed: 2 hrs
    Duration::from_secs(60 * 60),
    Duration::from_secs(3 * 60 * 60), // elapsed: 6 hrs
    Duration::from_secs(6 * 60 * 60),
];

/// Total budget across all attempts
pub const MAX_RETRY_DURATION: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Call `f` until it succeeds, retrying on the backoff schedule.
///
/// The first invocation is immediate. On failure the next interval is slept
/// (clamped to the schedule's last entry once exhausted) and only then is
/// `f` re-invoked. Retrying stops as soon as `f` succeeds, the token is
/// cancelled, the error is tagged no-retry, or the total budget runs out,
/// in which case the last error is returned. The attempt counter is passed
/// to `f`, starting at 0.
pub async fn with_retry<T, F, Fut>(cancel: &CancellationToken, mut f: F) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let start = Instant::now();
    let mut attempts: u32 = 0;
    let mut interval_index: Option<usize> = None;

    loop {
        if let Some(index) = interval_index {
            let wait = RETRY_INTERVALS[index];
            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Canceled),
                _ = tokio::time::sleep(wait) => {}
            }
        }

        let err = match f(attempts).await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_no_retry() => return Err(e),
            Err(e) => e,
        };
        attempts += 1;

        let next_index = match interval_index {
            None => 0,
            Some(i) => (i + 1).min(RETRY_INTERVALS.len() - 1),
        };
        interval_index = Some(next_index);

        if start.elapsed() + RETRY_INTERVALS[next_index] > MAX_RETRY_DURATION {
            error!(
                attempts,
                error = %err,
                "Giving up after exhausting the retry budget"
            );
            return Err(err);
        }

        error!(
            attempt = attempts,
            error = %err,
            retry_in_secs = RETRY_INTERVALS[next_index].as_secs(),
            "Attempt failed; will retry"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_first_attempt_is_immediate() {
        let cancel = CancellationToken::new();
        let started = Instant::now();

        let result = with_retry(&cancel, |_| async { Ok::<_, Error>(42) }).await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_schedule_is_followed() {
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));
        let started = Instant::now();

        let calls2 = calls.clone();
        let result = with_retry(&cancel, move |attempt| {
            let calls = calls2.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                if attempt < 3 {
                    Err(Error::Transient("flaky".into()))
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        // slept 1m + 2m + 2m before the successful attempt
        assert_eq!(started.elapsed(), Duration::from_secs(5 * 60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_retry_stops_immediately() {
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));

        let calls2 = calls.clone();
        let result: Result<()> = with_retry(&cancel, move |_| {
            let calls = calls2.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::RateLimited("429".into()))
            }
        })
        .await;

        assert!(matches!(result.unwrap_err(), Error::RateLimited(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_during_backoff() {
        let cancel = CancellationToken::new();
        let cancel2 = cancel.clone();

        let handle = tokio::spawn(async move {
            with_retry(&cancel2, |_| async {
                Err::<(), _>(Error::Transient("down".into()))
            })
            .await
        });

        // let the first failure land, then cancel during the 1m sleep
        tokio::time::sleep(Duration::from_secs(5)).await;
        cancel.cancel();

        let result = handle.await.unwrap();
        assert!(matches!(result.unwrap_err(), Error::Canceled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_exhaustion_returns_last_error() {
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));

        let calls2 = calls.clone();
        let result: Result<()> = with_retry(&cancel, move |_| {
            let calls = calls2.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::Transient("permanent outage".into()))
            }
        })
        .await;

        assert!(matches!(result.unwrap_err(), Error::Transient(_)));
        // the schedule reaches its 6h plateau; 30 days at that cadence is
        // bounded well under 200 attempts
        let total = calls.load(Ordering::SeqCst);
        assert!(total > 100 && total < 200, "unexpected attempts: {total}");
    }
}

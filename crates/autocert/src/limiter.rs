//! Sliding-window rate limiting
//!
//! A ring buffer of event timestamps gates how many ACME transactions may
//! start per window. This is a politeness throttle to keep a large
//! deployment from firehosing the CA's endpoints; it deliberately does not
//! try to mirror the CA's own published limits, because only the CA can
//! enforce those authoritatively.

use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Ring-buffer rate limiter over a sliding window
#[derive(Debug)]
pub struct RingRateLimiter {
    window: Duration,
    inner: Mutex<Ring>,
}

#[derive(Debug)]
struct Ring {
    // cursor points at the oldest slot; timestamps are non-decreasing
    // going clockwise from it
    slots: Vec<Option<Instant>>,
    cursor: usize,
}

impl RingRateLimiter {
    /// Create a limiter admitting at most `max_events` per `window`
    pub fn new(max_events: usize, window: Duration) -> Self {
        Self {
            window,
            inner: Mutex::new(Ring {
                slots: vec![None; max_events.max(1)],
                cursor: 0,
            }),
        }
    }

    /// Wait until an event may be admitted, then record it.
    ///
    /// Returns immediately if fewer than the maximum number of events fall
    /// within the window; otherwise sleeps until the oldest recorded event
    /// ages out. Cancellation while sleeping returns [`Error::Canceled`].
    pub async fn wait(&self, cancel: &CancellationToken) -> Result<()> {
        loop {
            let sleep_for = {
                let mut ring = self
                    .inner
                    .lock()
                    .map_err(|_| Error::Internal("rate limiter lock poisoned".to_string()))?;

                let cursor = ring.cursor;
                let age = ring.slots[cursor].map(|oldest| oldest.elapsed());
                match age {
                    Some(age) if age < self.window => self.window - age,
                    _ => {
                        ring.slots[cursor] = Some(Instant::now());
                        ring.cursor = (cursor + 1) % ring.slots.len();
                        return Ok(());
                    }
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Canceled),
                _ = tokio::time::sleep(sleep_for) => {}
            }
        }
    }

    /// Number of events currently recorded inside the window
    pub fn recent_events(&self) -> usize {
        match self.inner.lock() {
            Ok(ring) => ring
                .slots
                .iter()
                .flatten()
                .filter(|t| t.elapsed() < self.window)
                .count(),
            Err(_) => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_burst_admitted_immediately() {
        let limiter = RingRateLimiter::new(3, Duration::from_secs(60));
        let cancel = CancellationToken::new();

        for _ in 0..3 {
            limiter.wait(&cancel).await.unwrap();
        }
        assert_eq!(limiter.recent_events(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_for_window_to_slide() {
        let limiter = RingRateLimiter::new(2, Duration::from_secs(60));
        let cancel = CancellationToken::new();

        limiter.wait(&cancel).await.unwrap();
        tokio::time::advance(Duration::from_secs(10)).await;
        limiter.wait(&cancel).await.unwrap();

        // third event must wait until the first slides out at t=60
        let started = Instant::now();
        limiter.wait(&cancel).await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(49));
    }

    #[tokio::test(start_paused = true)]
    async fn test_at_most_n_per_window() {
        let limiter = RingRateLimiter::new(5, Duration::from_secs(60));
        let cancel = CancellationToken::new();

        // admit 20 events as fast as the limiter allows, recording when
        let mut admitted = Vec::new();
        for _ in 0..20 {
            limiter.wait(&cancel).await.unwrap();
            admitted.push(Instant::now());
        }

        // no window of 60s may contain more than 5 admissions
        for (i, start) in admitted.iter().enumerate() {
            let in_window = admitted[i..]
                .iter()
                .take_while(|t| t.duration_since(*start) < Duration::from_secs(60))
                .count();
            assert!(in_window <= 5, "window starting at {i} held {in_window}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_while_waiting() {
        let limiter = RingRateLimiter::new(1, Duration::from_secs(60));
        let cancel = CancellationToken::new();

        limiter.wait(&cancel).await.unwrap();

        cancel.cancel();
        let err = limiter.wait(&cancel).await.unwrap_err();
        assert!(matches!(err, Error::Canceled));
    }
}

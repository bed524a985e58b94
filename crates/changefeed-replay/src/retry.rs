//! Retry with exponential backoff for batch writes.
//!
//! Writes are retried without limit: a batch either lands or the writer is
//! shut down. The backoff only spaces the attempts out.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::database::Status;

/// Backoff between failed writes.
///
/// Retry `n` (counting from 0) waits `base << min(n, max_shift)` plus a
/// uniformly random jitter in `[0, delay)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Delay of the first retry before jitter.
    pub base: Duration,
    /// Largest exponent applied to `base`.
    pub max_shift: u32,
}

impl BackoffPolicy {
    /// Creates a policy.
    #[must_use]
    pub fn new(base: Duration, max_shift: u32) -> Self {
        Self { base, max_shift }
    }

    /// Delay for a retry before jitter.
    #[must_use]
    pub fn delay(&self, retry: u32) -> Duration {
        self.base * (1u32 << retry.min(self.max_shift))
    }

    /// Delay for a retry with random jitter added.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)] // delays stay far below u64::MAX ms
    pub fn jittered<R: Rng + ?Sized>(&self, retry: u32, rng: &mut R) -> Duration {
        let delay = self.delay(retry);
        let millis = delay.as_millis() as u64;
        if millis == 0 {
            return delay;
        }
        delay + Duration::from_millis(rng.gen_range(0..millis))
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(Duration::from_millis(25), 8)
    }
}

/// Runs `op` until it returns a success status.
///
/// `on_failure` is called after every failed attempt with the retry number,
/// the status and the upcoming delay. Cancellation is only observed while
/// sleeping, so an attempt in flight always completes.
///
/// Returns the number of retries, or `None` if cancelled during a backoff.
pub async fn retry_until_success<F, Fut, H>(
    policy: &BackoffPolicy,
    cancel: &CancellationToken,
    mut op: F,
    mut on_failure: H,
) -> Option<u32>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Status>,
    H: FnMut(u32, &Status, Duration),
{
    let mut retry = 0u32;
    loop {
        let status = op().await;
        if status.is_success() {
            return Some(retry);
        }

        let delay = policy.jittered(retry, &mut rand::thread_rng());
        on_failure(retry, &status, delay);

        tokio::select! {
            () = cancel.cancelled() => return None,
            () = tokio::time::sleep(delay) => {}
        }
        retry = retry.saturating_add(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::StatusCode;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_delay_doubles_until_cap() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay(0), Duration::from_millis(25));
        assert_eq!(policy.delay(1), Duration::from_millis(50));
        assert_eq!(policy.delay(4), Duration::from_millis(400));
        assert_eq!(policy.delay(8), Duration::from_millis(6400));
        assert_eq!(policy.delay(30), Duration::from_millis(6400));
    }

    #[test]
    fn test_jitter_range() {
        let policy = BackoffPolicy::default();
        let mut rng = StdRng::seed_from_u64(7);
        for retry in 0..12 {
            let base = policy.delay(retry);
            for _ in 0..50 {
                let d = policy.jittered(retry, &mut rng);
                assert!(d >= base && d < base * 2, "retry {retry}: {d:?}");
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_success() {
        let counter = AtomicU32::new(0);
        let attempts = &counter;
        let mut seen = Vec::new();
        let retries = retry_until_success(
            &BackoffPolicy::default(),
            &CancellationToken::new(),
            move || async move {
                if attempts.fetch_add(1, Ordering::SeqCst) < 3 {
                    Status::error(StatusCode::Unavailable, "down")
                } else {
                    Status::SUCCESS
                }
            },
            |retry, status, _| seen.push((retry, status.code)),
        )
        .await;

        assert_eq!(retries, Some(3));
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
        assert_eq!(
            seen,
            vec![
                (0, StatusCode::Unavailable),
                (1, StatusCode::Unavailable),
                (2, StatusCode::Unavailable),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff() {
        let cancel = CancellationToken::new();
        let counter = AtomicU32::new(0);
        let attempts = &counter;
        let result = retry_until_success(
            &BackoffPolicy::default(),
            &cancel,
            move || async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Status::error(StatusCode::Timeout, "slow")
            },
            |_, _, _| cancel.cancel(),
        )
        .await;

        assert_eq!(result, None);
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}

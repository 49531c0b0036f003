//! Deadline- and cancellation-aware polling
//!
//! The admission webhook blocks its request while it waits for a pre-check
//! verdict. The wait is a timer-driven poll bounded by a deadline; it gives
//! the task back to the runtime between polls and stops as soon as the caller
//! cancels.

use std::future::Future;
use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::Error;

/// Poll `check` every `interval` until it yields a value, `timeout` elapses or
/// `cancel` fires.
///
/// The first poll happens one interval after the call and the last one at the
/// deadline. `check` returning `Ok(None)` means "not yet"; an error ends the
/// wait immediately. An earlier poll still in flight at the deadline is
/// abandoned; the poll at the deadline gets one more interval to answer.
pub async fn poll_until<F, Fut, T>(
    interval: Duration,
    timeout: Duration,
    cancel: &CancellationToken,
    what: &str,
    mut check: F,
) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, Error>>,
{
    let start = Instant::now();
    let deadline = start + timeout;
    let mut ticker = tokio::time::interval_at(start + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        // A tick due at the deadline is taken before the deadline itself
        let last = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::cancelled(what)),
            _ = ticker.tick() => Instant::now() >= deadline,
            _ = tokio::time::sleep_until(deadline) => true,
        };
        let budget = if last { deadline + interval } else { deadline };

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::cancelled(what)),
            outcome = check() => outcome?,
            _ = tokio::time::sleep_until(budget) => return Err(Error::timeout(what, timeout)),
        };

        match outcome {
            Some(value) => return Ok(value),
            None if last => return Err(Error::timeout(what, timeout)),
            None => trace!(what, elapsed_ms = start.elapsed().as_millis(), "Still waiting"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    const INTERVAL: Duration = Duration::from_secs(3);
    const TIMEOUT: Duration = Duration::from_secs(9);

    #[tokio::test(start_paused = true)]
    async fn times_out_at_the_deadline() {
        let polls = Arc::new(AtomicU32::new(0));
        let p = polls.clone();
        let start = Instant::now();

        let result: Result<(), Error> =
            poll_until(INTERVAL, TIMEOUT, &CancellationToken::new(), "verdict", || {
                let p = p.clone();
                async move {
                    p.fetch_add(1, Ordering::SeqCst);
                    Ok(None)
                }
            })
            .await;

        assert!(matches!(result, Err(Error::Timeout { .. })));
        assert_eq!(start.elapsed(), TIMEOUT);
        assert_eq!(polls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn polls_once_more_at_the_deadline() {
        let polls = Arc::new(AtomicU32::new(0));
        let p = polls.clone();
        let start = Instant::now();

        let result = poll_until(INTERVAL, TIMEOUT, &CancellationToken::new(), "verdict", || {
            let p = p.clone();
            async move {
                let n = p.fetch_add(1, Ordering::SeqCst) + 1;
                Ok((n == 3).then_some("pass"))
            }
        })
        .await;

        assert_eq!(result.unwrap(), "pass");
        assert_eq!(start.elapsed(), TIMEOUT);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_poll_runs_when_interval_does_not_divide_timeout() {
        let polls = Arc::new(AtomicU32::new(0));
        let p = polls.clone();
        let start = Instant::now();

        let result: Result<(), Error> = poll_until(
            Duration::from_secs(4),
            TIMEOUT,
            &CancellationToken::new(),
            "verdict",
            || {
                let p = p.clone();
                async move {
                    p.fetch_add(1, Ordering::SeqCst);
                    Ok(None)
                }
            },
        )
        .await;

        assert!(matches!(result, Err(Error::Timeout { .. })));
        assert_eq!(start.elapsed(), TIMEOUT);
        // 4s, 8s and the deadline at 9s
        assert_eq!(polls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_deadline_poll_is_bounded() {
        let start = Instant::now();

        let result: Result<(), Error> =
            poll_until(INTERVAL, TIMEOUT, &CancellationToken::new(), "verdict", || {
                std::future::pending()
            })
            .await;

        assert!(matches!(result, Err(Error::Timeout { .. })));
        assert_eq!(start.elapsed(), TIMEOUT);
    }

    #[tokio::test(start_paused = true)]
    async fn returns_the_first_ready_value() {
        let polls = Arc::new(AtomicU32::new(0));
        let p = polls.clone();
        let start = Instant::now();

        let result = poll_until(INTERVAL, TIMEOUT, &CancellationToken::new(), "verdict", || {
            let p = p.clone();
            async move {
                let n = p.fetch_add(1, Ordering::SeqCst) + 1;
                Ok((n == 2).then_some("pass"))
            }
        })
        .await;

        assert_eq!(result.unwrap(), "pass");
        assert_eq!(start.elapsed(), Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_ends_the_wait() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(4)).await;
            trigger.cancel();
        });
        let start = Instant::now();

        let result: Result<(), Error> =
            poll_until(INTERVAL, TIMEOUT, &cancel, "verdict", || async { Ok(None) }).await;

        assert!(matches!(result, Err(Error::Cancelled { .. })));
        assert_eq!(start.elapsed(), Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn check_errors_end_the_wait() {
        let result: Result<(), Error> = poll_until(
            INTERVAL,
            TIMEOUT,
            &CancellationToken::new(),
            "verdict",
            || async { Err(Error::superseded("exec-a", "exec-b")) },
        )
        .await;
        assert!(matches!(result, Err(Error::Superseded { .. })));
    }
}

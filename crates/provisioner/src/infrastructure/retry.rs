//! Bounded exponential backoff for API calls.

use std::future::Future;
use std::time::Duration;

/// Backoff schedule: `steps` attempts total, delay multiplied by `factor`
/// after each failure, capped at `max_delay`.
#[derive(Clone, Copy, Debug)]
pub struct Backoff {
    pub steps: u32,
    pub initial_delay: Duration,
    pub factor: f64,
    pub max_delay: Duration,
}

/// Short, flat schedule for status writes.
pub const DEFAULT_RETRY: Backoff = Backoff {
    steps: 5,
    initial_delay: Duration::from_millis(10),
    factor: 1.0,
    max_delay: Duration::from_millis(10),
};

/// Steeper schedule for create/list calls against slow provisioners.
pub const DEFAULT_BACKOFF: Backoff = Backoff {
    steps: 4,
    initial_delay: Duration::from_millis(10),
    factor: 5.0,
    max_delay: Duration::from_secs(2),
};

/// Runs `op` until it succeeds, the schedule is exhausted, or `retriable`
/// rejects the error. The last error is returned unchanged.
pub async fn retry_on<T, E, Cond, Op, Fut>(
    backoff: Backoff,
    mut retriable: Cond,
    mut op: Op,
) -> Result<T, E>
where
    Cond: FnMut(&E) -> bool,
    Op: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut delay = backoff.initial_delay;
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                attempt += 1;
                if attempt >= backoff.steps || !retriable(&err) {
                    return Err(err);
                }
                tokio::time::sleep(delay).await;
                delay = delay.mul_f64(backoff.factor).min(backoff.max_delay);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn retries_until_success() {
        let calls = AtomicUsize::new(0);
        let result: Result<u32, &str> = retry_on(
            DEFAULT_RETRY,
            |_| true,
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err("transient")
                    } else {
                        Ok(7)
                    }
                }
            },
        )
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn stops_on_non_retriable_error() {
        let calls = AtomicUsize::new(0);
        let result: Result<u32, &str> = retry_on(
            DEFAULT_BACKOFF,
            |e: &&str| *e != "permanent",
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("permanent") }
            },
        )
        .await;
        assert_eq!(result.unwrap_err(), "permanent");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausts_the_schedule() {
        let calls = AtomicUsize::new(0);
        let result: Result<u32, &str> = retry_on(
            DEFAULT_RETRY,
            |_| true,
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("transient") }
            },
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), DEFAULT_RETRY.steps as usize);
    }
}

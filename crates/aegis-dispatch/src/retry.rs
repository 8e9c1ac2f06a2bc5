//! Bounded retry for transient store errors.
//!
//! 100 ms initial delay, doubling, at most 5 attempts and 5 s total.
//! Validation failures never come through here; callers retry only the
//! storage step, after all gates have passed.

use std::future::Future;
use std::time::Duration;

use anyhow::Result;
use tracing::warn;

const INITIAL_DELAY: Duration = Duration::from_millis(100);
const MAX_ATTEMPTS: u32 = 5;
const TOTAL_BUDGET: Duration = Duration::from_secs(5);

pub async fn with_backoff<T, Fut>(op: &str, mut f: impl FnMut() -> Fut) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
{
    let started = tokio::time::Instant::now();
    let mut delay = INITIAL_DELAY;
    let mut last_err = None;

    for attempt in 1..=MAX_ATTEMPTS {
        match f().await {
            Ok(v) => return Ok(v),
            Err(e) => {
                warn!(op, attempt, "transient failure: {e:#}");
                last_err = Some(e);
            }
        }
        if attempt == MAX_ATTEMPTS || started.elapsed() + delay > TOTAL_BUDGET {
            break;
        }
        tokio::time::sleep(delay).await;
        delay *= 2;
    }

    Err(last_err.expect("loop ran at least once"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let out: i32 = with_backoff("op", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(anyhow::anyhow!("transient"))
                } else {
                    Ok(42)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(out, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_five_attempts() {
        let calls = AtomicU32::new(0);
        let res: Result<()> = with_backoff("op", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(anyhow::anyhow!("still broken")) }
        })
        .await;
        assert!(res.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }
}

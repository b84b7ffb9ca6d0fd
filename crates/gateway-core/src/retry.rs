use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::config::{RETRY_BASE_DELAY_MS, RETRY_JITTER_MAX_MS, RETRY_MAX_ATTEMPTS, RETRY_MAX_DELAY_MS};

/// Exponential backoff with jitter for transient provider errors.
///
/// Attempts up to `RETRY_MAX_ATTEMPTS` times total. Delay doubles each retry
/// starting from `RETRY_BASE_DELAY_MS`, capped at `RETRY_MAX_DELAY_MS`, plus
/// up to `RETRY_JITTER_MAX_MS` of random jitter so concurrent turns don't
/// retry in lockstep.
pub async fn with_backoff<T, E, F, Fut>(mut is_transient: impl FnMut(&E) -> bool, mut op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if attempt < RETRY_MAX_ATTEMPTS && is_transient(&e) => {
                let delay = next_delay(attempt);
                tracing::warn!(attempt, delay_ms = delay.as_millis() as u64, "retrying after transient error");
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

fn next_delay(attempt: u32) -> Duration {
    let exp = RETRY_BASE_DELAY_MS.saturating_mul(1u64 << (attempt.saturating_sub(1)).min(16));
    let base = exp.min(RETRY_MAX_DELAY_MS);
    let jitter = rand::thread_rng().gen_range(0..=RETRY_JITTER_MAX_MS);
    Duration::from_millis(base + jitter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_never_exceeds_cap_plus_jitter() {
        for attempt in 1..8 {
            let d = next_delay(attempt).as_millis() as u64;
            assert!(d <= RETRY_MAX_DELAY_MS + RETRY_JITTER_MAX_MS);
        }
    }

    #[tokio::test]
    async fn succeeds_without_retry_when_first_attempt_ok() {
        let mut calls = 0;
        let result: Result<u32, &str> = with_backoff(
            |_e: &&str| true,
            || {
                calls += 1;
                async { Ok(7) }
            },
        )
        .await;
        assert_eq!(result, Ok(7));
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts_on_transient_error() {
        let mut calls = 0;
        let result: Result<u32, &str> = with_backoff(
            |_e: &&str| true,
            || {
                calls += 1;
                async { Err("boom") }
            },
        )
        .await;
        assert_eq!(result, Err("boom"));
        assert_eq!(calls, RETRY_MAX_ATTEMPTS);
    }

    #[tokio::test]
    async fn stops_immediately_on_non_transient_error() {
        let mut calls = 0;
        let result: Result<u32, &str> = with_backoff(
            |_e: &&str| false,
            || {
                calls += 1;
                async { Err("fatal") }
            },
        )
        .await;
        assert_eq!(result, Err("fatal"));
        assert_eq!(calls, 1);
    }
}

use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub const RETRY_INITIAL_DELAY: u64 = 2000;
pub const RETRY_BACKOFF_FACTOR: u64 = 2;
pub const RETRY_MAX_DELAY: u64 = 30_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    /// Upper bound on the total time spent sleeping between attempts.
    pub max_cumulative_wait_ms: u64,
    pub initial_delay_ms: u64,
    pub backoff_factor: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            max_cumulative_wait_ms: 60_000,
            initial_delay_ms: RETRY_INITIAL_DELAY,
            backoff_factor: RETRY_BACKOFF_FACTOR,
            max_delay_ms: RETRY_MAX_DELAY,
        }
    }
}

/// Implement this on error types so the retry helpers know whether to retry.
/// Return `Some(message)` when the error is retryable, `None` otherwise.
pub trait IsRetryable {
    fn is_retryable(&self) -> Option<String>;

    /// Server-suggested wait before the next attempt.
    fn retry_after_ms(&self) -> Option<u64> {
        None
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Sleep cancelled")]
pub struct SleepCancelled;

pub async fn sleep_with_cancel(ms: u64, cancel: &CancellationToken) -> Result<(), SleepCancelled> {
    let duration = Duration::from_millis(ms);

    tokio::select! {
        _ = cancel.cancelled() => Err(SleepCancelled),
        _ = sleep(duration) => Ok(()),
    }
}

/// Wait before retry number `attempt` (1-based). A server hint wins over
/// the exponential schedule.
pub fn delay(config: &RetryConfig, attempt: u32, retry_after_ms: Option<u64>) -> u64 {
    if let Some(ms) = retry_after_ms {
        return ms;
    }
    let exp = config
        .backoff_factor
        .saturating_pow(attempt.saturating_sub(1));
    config
        .initial_delay_ms
        .saturating_mul(exp)
        .min(config.max_delay_ms)
}

/// Run `op` until it succeeds, fails for good, or the retry budget runs out.
///
/// `state` is handed to each attempt and handed back with its outcome, so
/// attempts can mutate caller-owned data across awaits. `on_retry` sees the
/// attempt number, the error and the planned wait before every sleep.
/// Cancellation during a sleep ends the loop with `E::from(SleepCancelled)`.
pub async fn with_retries<S, T, E, F, Fut, H>(
    config: &RetryConfig,
    cancel: &CancellationToken,
    mut state: S,
    mut op: F,
    mut on_retry: H,
) -> (S, Result<T, E>)
where
    F: FnMut(S, u32) -> Fut,
    Fut: Future<Output = (S, Result<T, E>)>,
    E: IsRetryable + From<SleepCancelled> + Display,
    H: FnMut(u32, &E, u64),
{
    let max_attempts = config.max_attempts.max(1);
    let mut waited: u64 = 0;
    let mut attempt: u32 = 1;

    loop {
        let (next_state, result) = op(state, attempt).await;
        state = next_state;

        let err = match result {
            Ok(value) => return (state, Ok(value)),
            Err(err) => err,
        };

        let Some(reason) = err.is_retryable() else {
            return (state, Err(err));
        };
        if attempt >= max_attempts {
            warn!(attempt, error = %err, "retry attempts exhausted");
            return (state, Err(err));
        }

        let wait = delay(config, attempt, err.retry_after_ms());
        if waited.saturating_add(wait) > config.max_cumulative_wait_ms {
            warn!(
                attempt,
                waited_ms = waited,
                next_wait_ms = wait,
                "retry wait budget exhausted"
            );
            return (state, Err(err));
        }

        debug!(attempt, delay_ms = wait, %reason, "retrying after error");
        on_retry(attempt, &err, wait);

        if let Err(cancelled) = sleep_with_cancel(wait, cancel).await {
            return (state, Err(E::from(cancelled)));
        }
        waited += wait;
        attempt += 1;
    }
}

//! Retry with exponential backoff and wall-clock timeouts for upstream calls.

use crate::UpstreamError;
use std::sync::mpsc;
use std::time::Duration;
use tracing::warn;

const MAX_ATTEMPTS: u32 = 3;
const INITIAL_BACKOFF_MS: u64 = 200;
const MAX_BACKOFF_MS: u64 = 5_000;
const BACKOFF_MULTIPLIER: u32 = 2;

/// Slice at which a backoff sleep re-checks for cancellation.
const CANCEL_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: MAX_ATTEMPTS,
            initial_backoff: Duration::from_millis(INITIAL_BACKOFF_MS),
            max_backoff: Duration::from_millis(MAX_BACKOFF_MS),
            multiplier: BACKOFF_MULTIPLIER,
        }
    }
}

impl RetryPolicy {
    /// A policy that makes a single attempt.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (1-based): initial × multiplier^(attempt-1), capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = self
            .multiplier
            .max(1)
            .saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryFailure {
    /// The last error, after `attempts` tries.
    Failed { error: UpstreamError, attempts: u32 },
    /// Cancellation was observed between attempts.
    Cancelled,
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// attempt budget is spent. Only [`UpstreamError::Unreachable`] is retried.
pub fn retry<T>(
    policy: &RetryPolicy,
    what: &str,
    is_cancelled: impl Fn() -> bool,
    mut op: impl FnMut(u32) -> Result<T, UpstreamError>,
) -> Result<T, RetryFailure> {
    let max = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        if is_cancelled() {
            return Err(RetryFailure::Cancelled);
        }
        match op(attempt) {
            Ok(value) => return Ok(value),
            Err(error) if error.is_retryable() && attempt < max => {
                let delay = policy.backoff(attempt);
                warn!("{what}: attempt {attempt}/{max} failed: {error}, retrying in {delay:?}");
                if sleep_unless_cancelled(delay, &is_cancelled) {
                    return Err(RetryFailure::Cancelled);
                }
                attempt += 1;
            }
            Err(error) => {
                return Err(RetryFailure::Failed {
                    error,
                    attempts: attempt,
                })
            }
        }
    }
}

/// Sleep for `delay`, waking early on cancellation. Returns true if cancelled.
fn sleep_unless_cancelled(delay: Duration, is_cancelled: &impl Fn() -> bool) -> bool {
    let mut remaining = delay;
    while !remaining.is_zero() {
        if is_cancelled() {
            return true;
        }
        let step = remaining.min(CANCEL_POLL);
        std::thread::sleep(step);
        remaining -= step;
    }
    is_cancelled()
}

/// Run `f` on a worker thread and give up after `timeout`.
///
/// A timed-out call is reported as `Unreachable` so it falls under the retry
/// policy. The worker is detached; its late result is discarded.
pub fn call_with_timeout<T, F>(timeout: Duration, what: &str, f: F) -> Result<T, UpstreamError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, UpstreamError> + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    std::thread::Builder::new()
        .name("rpkg-fetch".to_owned())
        .spawn(move || {
            let _ = tx.send(f());
        })
        .map_err(|e| UpstreamError::Unreachable(format!("{what}: cannot spawn worker: {e}")))?;

    match rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(mpsc::RecvTimeoutError::Timeout) => Err(UpstreamError::Unreachable(format!(
            "{what}: timed out after {}s",
            timeout.as_secs_f32()
        ))),
        Err(mpsc::RecvTimeoutError::Disconnected) => Err(UpstreamError::Unreachable(format!(
            "{what}: worker exited without a result"
        ))),
    }
}

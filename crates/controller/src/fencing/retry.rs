//! Bounded exponential backoff for API writes

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::warn;

/// Fixed backoff policy: `steps` attempts, waiting `initial`, then
/// `initial * factor`, `initial * factor^2`, ... between them.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    pub initial: Duration,
    pub factor: f64,
    pub steps: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            factor: 1.2,
            steps: 5,
        }
    }
}

impl Backoff {
    /// Delay after the given failed attempt (1-indexed)
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let nanos = (self.initial.as_nanos() as f64 * self.factor.max(1.0).powi(exponent))
            .round()
            .min(u64::MAX as f64) as u64;
        Duration::from_nanos(nanos)
    }
}

/// Run `operation` until it succeeds or the policy's steps are spent.
///
/// Returns the last error on exhaustion. At least one attempt is always made.
pub async fn retry_with_backoff<T, E, F, Fut>(
    backoff: &Backoff,
    operation_name: &str,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let steps = backoff.steps.max(1);
    let mut attempt = 1;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt >= steps => {
                warn!(
                    operation = %operation_name,
                    attempts = attempt,
                    error = %e,
                    "Giving up after bounded retries"
                );
                return Err(e);
            }
            Err(e) => {
                let delay = backoff.delay(attempt);
                warn!(
                    operation = %operation_name,
                    attempt,
                    max_attempts = steps,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %e,
                    "Operation failed, retrying"
                );
                sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

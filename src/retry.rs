//! # Retry Engine
//!
//! Exponential backoff with jitter for transient failures. Only wrapped
//! around operations that are safe to repeat: git clone into a
//! content-addressed path, remote ref resolution, Kubernetes reads.
//! Applying a configuration is never retried here; that decision belongs to
//! the scheduler.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{error, info, warn};

use crate::config::RetryConfig;
use crate::error::Error;

/// Delay before attempt `attempt + 1` (zero-based), without jitter.
fn backoff_delay(policy: &RetryConfig, attempt: u32) -> Duration {
    let exp = policy.exponential_base.powi(attempt as i32);
    let delay = policy.initial_delay.as_secs_f64() * exp;
    Duration::from_secs_f64(delay.min(policy.max_delay.as_secs_f64()))
}

/// Multiply a delay by uniform(0.5, 1.5) to avoid thundering herds.
fn with_jitter(delay: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.5..1.5);
    Duration::from_secs_f64(delay.as_secs_f64() * factor)
}

/// Run `op` until it succeeds or `policy.max_attempts` is exhausted.
///
/// `operation` names the call site in logs and in the final
/// [`Error::RetryExhausted`].
pub async fn retry_with_backoff<T, F, Fut>(
    operation: &str,
    policy: &RetryConfig,
    mut op: F,
) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut last_error: Option<Error> = None;

    for attempt in 1..=max_attempts {
        match op().await {
            Ok(value) => {
                if attempt > 1 {
                    info!(operation, attempt, "operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) => {
                // Permanent failures pass straight through; repeating a
                // validation error cannot change the outcome.
                if !err.is_temporary() {
                    return Err(err);
                }

                if attempt == max_attempts {
                    error!(operation, attempt, error = %err, "all retry attempts failed");
                    last_error = Some(err);
                    break;
                }

                let delay = with_jitter(backoff_delay(policy, attempt - 1));
                warn!(
                    operation,
                    attempt,
                    max_attempts,
                    delay_secs = delay.as_secs_f64(),
                    error = %err,
                    "operation failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }

    Err(Error::RetryExhausted {
        operation: operation.to_string(),
        cause: anyhow::Error::new(
            last_error.expect("loop always records an error before breaking"),
        ),
    })
}

/*!
 * Async utilities for DomoFlow.
 *
 * Bounded-timeout and bounded-retry helpers used by every transport, plus
 * a background task spawner that logs failures instead of dropping them.
 */
use std::future::Future;
use std::time::{Duration, Instant};

use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Run a future with a timeout
///
/// # Arguments
///
/// * `duration` - The timeout duration
/// * `future` - The future to run
///
/// # Returns
///
/// The result of the future, or a timeout error if the timeout is reached
pub async fn with_timeout<F, T>(duration: Duration, future: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match timeout(duration, future).await {
        Ok(result) => result,
        Err(_) => Err(Error::timeout("Operation timed out")),
    }
}

/// Run a future with a per-attempt timeout and retry on failure
///
/// Attempts run back to back with no backoff; vendor request/response
/// calls are expected to resolve or time out within seconds.
///
/// # Arguments
///
/// * `duration` - The timeout duration for each attempt
/// * `retries` - The number of additional attempts after the first
/// * `future_factory` - A function that creates a new future for each attempt
///
/// # Returns
///
/// The result of the first successful attempt, or the last error if all
/// attempts fail
pub async fn with_retry<F, Fut, T>(
    duration: Duration,
    retries: usize,
    mut future_factory: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut last_error = None;
    let start = Instant::now();

    for i in 0..=retries {
        if i > 0 {
            debug!("Retry {}/{}", i, retries);
        }

        match timeout(duration, future_factory()).await {
            Ok(Ok(result)) => {
                if i > 0 {
                    debug!("Succeeded after {} retries", i);
                }
                return Ok(result);
            }
            Ok(Err(e)) => {
                warn!("Attempt {} failed: {}", i + 1, e);
                last_error = Some(e);
            }
            Err(_) => {
                warn!("Attempt {} timed out", i + 1);
                last_error = Some(Error::timeout("Operation timed out"));
            }
        }
    }

    let elapsed = start.elapsed();
    warn!("All {} retries failed after {:?}", retries, elapsed);

    Err(last_error.unwrap_or_else(|| Error::other("Unknown error in retry loop")))
}

/// Spawn a background task that logs its outcome
///
/// # Arguments
///
/// * `name` - A name for the task (for logging)
/// * `fut` - The future to run
pub fn spawn_and_log<F, T, E>(name: &str, fut: F) -> tokio::task::JoinHandle<()>
where
    F: Future<Output = std::result::Result<T, E>> + Send + 'static,
    T: Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let task_name = name.to_string();
    tokio::spawn(async move {
        match fut.await {
            Ok(_) => {
                debug!("Task '{}' completed successfully", task_name);
            }
            Err(e) => {
                warn!("Task '{}' failed: {}", task_name, e);
            }
        }
    })
}

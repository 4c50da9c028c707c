//! Bounded connection retries with exponential backoff.

use std::time::Duration;

use tracing::{error, info, warn};

use crate::error::{ResourceError, ResourceResult};

/// Retries a connection attempt up to `max_attempts` times.
#[derive(Debug, Clone)]
pub struct ReconnectionManager {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectionManager {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl ReconnectionManager {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
        }
    }

    /// delay = min(base_delay * 2^(attempt-1), max_delay)
    pub fn calculate_backoff(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exponent = attempt.saturating_sub(1).min(63);
        let factor = 2u64.saturating_pow(exponent);
        let delay = (self.base_delay.as_millis() as u64).saturating_mul(factor);
        Duration::from_millis(delay.min(self.max_delay.as_millis() as u64))
    }

    /// Run `connect_fn` until it succeeds or the attempt budget is spent.
    ///
    /// Non-transient errors (unknown tool, closed gate) are returned as-is
    /// without retrying. Exhausting the budget yields
    /// [`ResourceError::ConnectionFailed`] carrying the last error.
    pub async fn connect<F, Fut, T>(&self, tool: &str, mut connect_fn: F) -> ResourceResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: std::future::Future<Output = ResourceResult<T>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            match connect_fn(attempt).await {
                Ok(val) => {
                    if attempt > 1 {
                        info!(tool, attempt, "Connected after retry");
                    }
                    return Ok(val);
                }
                Err(e) if !e.is_transient() => return Err(e),
                Err(e) => {
                    last_error = e.to_string();
                    if attempt >= max_attempts {
                        error!(tool, attempt, error = %e, "Connection attempts exhausted");
                        break;
                    }
                    let delay = self.calculate_backoff(attempt);
                    warn!(
                        tool,
                        attempt,
                        error = %e,
                        "Connection attempt failed, retrying in {:?}",
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }

        Err(ResourceError::ConnectionFailed {
            tool: tool.to_string(),
            attempts: max_attempts,
            details: last_error,
        })
    }
}

//! Bounded exponential backoff for control-plane commands.

use std::future::Future;
use std::time::Duration;

use crate::config::ReconcileSettings;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_settings(settings: &ReconcileSettings) -> Self {
        Self {
            attempts: settings.retry_attempts.max(1),
            initial_delay: Duration::from_millis(settings.retry_initial_ms),
            max_delay: Duration::from_millis(settings.retry_max_ms),
        }
    }

    /// A single attempt, no waiting.
    pub fn none() -> Self {
        Self {
            attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay before retry number `failures` (1 = after the first failure).
    pub fn next_delay(&self, failures: u32) -> Duration {
        let factor = 2u32.saturating_pow(failures.saturating_sub(1));
        self.initial_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }

    /// Run `op` until it succeeds or the attempts are used up.
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> anyhow::Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let mut failures = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    failures += 1;
                    if failures >= self.attempts {
                        return Err(err.context(format!(
                            "{} failed after {} attempt(s)",
                            what, failures
                        )));
                    }
                    let delay = self.next_delay(failures);
                    tracing::warn!(what, attempt = failures, delay_ms = delay.as_millis() as u64, error = %err, "retrying");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

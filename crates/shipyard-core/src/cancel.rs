//! Caller-side cancellation.
//!
//! A [`CancelToken`] is threaded through every suspending step of a
//! deployment. Cancelling before promotion sends the deployment down its
//! abort path; cancelling afterwards only shortens the retirement grace period.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::error::{DeployError, Step};

#[derive(Debug, Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    /// Cancel every clone of this token.
    pub fn cancel(&self) {
        // ignore send error: receivers may already be dropped
        let _ = self.tx.send(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Cancel automatically once `timeout` elapses. Requires a tokio runtime.
    pub fn cancel_after(&self, timeout: Duration) {
        let token = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(timeout) => token.cancel(),
                _ = token.cancelled() => {}
            }
        });
    }

    /// Resolves once the token is cancelled.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                // Sender lives as long as any token; unreachable in practice.
                std::future::pending::<()>().await;
            }
        }
    }

    /// Fail fast when already cancelled.
    pub fn check(&self, step: Step) -> Result<(), DeployError> {
        if self.is_cancelled() {
            Err(DeployError::Cancelled(step))
        } else {
            Ok(())
        }
    }

    /// Run `fut`, abandoning it with `Cancelled(step)` if the token fires first.
    pub async fn run<T, F>(&self, step: Step, fut: F) -> Result<T, DeployError>
    where
        F: Future<Output = Result<T, DeployError>>,
    {
        self.check(step)?;
        tokio::select! {
            biased;
            _ = self.cancelled() => Err(DeployError::Cancelled(step)),
            out = fut => out,
        }
    }

    /// Sleep for `duration`, returning early (with `false`) on cancellation.
    pub async fn sleep(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => true,
            _ = self.cancelled() => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn run_completes_when_not_cancelled() {
        let token = CancelToken::new();
        let out = token.run(Step::Fetch, async { Ok::<_, DeployError>(7) }).await;
        assert_eq!(out.unwrap(), 7);
    }

    #[tokio::test]
    async fn cancel_interrupts_pending_work() {
        let token = CancelToken::new();
        let clone = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            clone.cancel();
        });

        let out = token
            .run(Step::HealthGate, async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok::<_, DeployError>(())
            })
            .await;
        assert!(matches!(out, Err(DeployError::Cancelled(Step::HealthGate))));
    }

    #[tokio::test]
    async fn cancel_after_fires() {
        let token = CancelToken::new();
        token.cancel_after(Duration::from_millis(10));
        assert!(!token.sleep(Duration::from_secs(30)).await);
        assert!(token.is_cancelled());
    }
}

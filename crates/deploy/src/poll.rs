//! Bounded polling and cancellation for long-running remote operations.

use std::{future::Future, ops::ControlFlow, sync::Arc, time::Duration};

use tokio::{sync::watch, time::Instant};

use crate::DeployError;

/// Cooperative cancellation signal shared by every wait in a run.
///
/// Cloning is cheap; all clones observe the same signal.
#[derive(Debug, Clone)]
pub struct Cancellation {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for Cancellation {
    fn default() -> Self {
        Self::new()
    }
}

impl Cancellation {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Trip the signal. Every pending and future wait returns
    /// [`DeployError::Cancelled`].
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once the signal has been tripped.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`, so this only ends on cancel.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }

    /// Sleep for `duration` unless cancelled first.
    pub async fn sleep(&self, duration: Duration) -> Result<(), DeployError> {
        if self.is_cancelled() {
            return Err(DeployError::Cancelled);
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => Ok(()),
            _ = self.cancelled() => Err(DeployError::Cancelled),
        }
    }

    pub fn check(&self) -> Result<(), DeployError> {
        if self.is_cancelled() {
            Err(DeployError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Fixed-interval poller with an attempt bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Poller {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl Poller {
    pub fn new(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts,
        }
    }

    /// Upper bound on the time spent sleeping between checks. Saturates
    /// instead of overflowing.
    pub fn budget(&self) -> Duration {
        self.interval
            .checked_mul(self.max_attempts)
            .unwrap_or(Duration::MAX)
    }

    /// Call `check` until it breaks with a value, sleeping `interval` between
    /// attempts.
    ///
    /// Returns [`DeployError::PollTimeout`] after `max_attempts` checks that
    /// all continued, and [`DeployError::Cancelled`] if `cancel` trips while
    /// sleeping. Errors from `check` end the wait immediately.
    pub async fn until<T, F, Fut>(
        &self,
        what: &str,
        cancel: &Cancellation,
        mut check: F,
    ) -> Result<T, DeployError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<ControlFlow<T>, DeployError>>,
    {
        let start = Instant::now();

        for attempt in 1..=self.max_attempts {
            cancel.check()?;

            if let ControlFlow::Break(value) = check(attempt).await? {
                return Ok(value);
            }

            tracing::trace!(
                what,
                attempt,
                max_attempts = self.max_attempts,
                "Not ready, waiting..."
            );

            if attempt < self.max_attempts {
                cancel.sleep(self.interval).await?;
            }
        }

        Err(DeployError::PollTimeout {
            what: what.to_string(),
            attempts: self.max_attempts,
            elapsed: start.elapsed(),
        })
    }
}

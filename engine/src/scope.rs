//! Request scopes
//!
//! A [`RequestScope`] carries the deadline and the cancel signal of one
//! inbound request down to every readiness poll and completion call made on
//! its behalf. The HTTP layer keeps the matching [`CancelHandle`] inside the
//! request future, so a client disconnect drops the handle and cancels the
//! scope.
//!
//! Time is read from `tokio::time`, so paused-clock tests drive it.

use sdk::errors::EngineError;
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// Deadline and cancel signal for one request
#[derive(Debug, Clone)]
pub struct RequestScope {
    deadline: Instant,
    cancel: Option<watch::Receiver<bool>>,
}

/// Cancels its scope when triggered or dropped
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        // send_replace never fails, even with no receivers left
        self.tx.send_replace(true);
    }
}

impl Drop for CancelHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl RequestScope {
    /// Create a cancellable scope that expires after `timeout`
    pub fn new(timeout: Duration) -> (Self, CancelHandle) {
        let (tx, rx) = watch::channel(false);
        let scope = Self {
            deadline: Instant::now() + timeout,
            cancel: Some(rx),
        };
        (scope, CancelHandle { tx })
    }

    /// Create a scope that only expires, for work no client is waiting on
    pub fn detached(timeout: Duration) -> Self {
        Self {
            deadline: Instant::now() + timeout,
            cancel: None,
        }
    }

    /// Child scope sharing the cancel signal, with the earlier of the two deadlines
    pub fn narrowed(&self, timeout: Duration) -> Self {
        Self {
            deadline: self.deadline.min(Instant::now() + timeout),
            cancel: self.cancel.clone(),
        }
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Time left before the deadline, zero once it has passed
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.deadline
    }

    pub fn is_cancelled(&self) -> bool {
        match &self.cancel {
            None => false,
            // a closed channel means the handle is gone
            Some(rx) => *rx.borrow() || rx.has_changed().is_err(),
        }
    }

    /// Resolves once the scope is cancelled; never resolves for detached scopes
    pub async fn cancelled(&self) {
        match &self.cancel {
            None => std::future::pending::<()>().await,
            Some(rx) => {
                let mut rx = rx.clone();
                let _ = rx.wait_for(|cancelled| *cancelled).await;
            }
        }
    }

    /// Race `fut` against the deadline and the cancel signal
    pub async fn run<T, F>(&self, fut: F) -> Result<T, EngineError>
    where
        F: Future<Output = Result<T, EngineError>>,
    {
        if self.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        tokio::select! {
            biased;
            _ = self.cancelled() => Err(EngineError::Cancelled),
            _ = tokio::time::sleep_until(self.deadline) => Err(EngineError::DeadlineExceeded),
            out = fut => out,
        }
    }

    /// Sleep for `duration` unless the scope is cancelled first
    pub async fn sleep(&self, duration: Duration) -> Result<(), EngineError> {
        tokio::select! {
            biased;
            _ = self.cancelled() => Err(EngineError::Cancelled),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }
}

//! Worker handles
//!
//! A [`Worker`] is a session's view of one container: its index, the port it
//! was assigned, and where it is in its lifecycle.
//!
//! ```text
//! Created -> Started -> Serving -> Stopped -> Removed
//!               ^                     |
//!               +---------------------+
//! ```
//!
//! `Serving` is only entered after the readiness gate succeeds. Stop and
//! remove are idempotent so teardown can be retried after partial failures.

use sdk::errors::EngineError;
use std::fmt;

use super::ContainerRuntime;

/// Lifecycle state of a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Created,
    Started,
    Serving,
    Stopped,
    Removed,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerState::Created => write!(f, "created"),
            WorkerState::Started => write!(f, "started"),
            WorkerState::Serving => write!(f, "serving"),
            WorkerState::Stopped => write!(f, "stopped"),
            WorkerState::Removed => write!(f, "removed"),
        }
    }
}

/// Address of a worker's HTTP server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Base URL of the OpenAI-compatible API
    pub fn api_base(&self) -> String {
        format!("http://{}:{}/v1", self.host, self.port)
    }

    /// URL probed by the readiness gate
    pub fn health_url(&self) -> String {
        format!("http://{}:{}/health", self.host, self.port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// One inference worker owned by a session
#[derive(Debug, Clone, PartialEq)]
pub struct Worker {
    pub index: usize,
    pub container_id: String,
    pub port: u16,
    pub model: String,
    state: WorkerState,
}

impl Worker {
    /// Handle for a freshly created container
    pub fn created(
        index: usize,
        container_id: impl Into<String>,
        port: u16,
        model: impl Into<String>,
    ) -> Self {
        Self {
            index,
            container_id: container_id.into(),
            port,
            model: model.into(),
            state: WorkerState::Created,
        }
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    fn invalid(&self, to: WorkerState) -> EngineError {
        EngineError::InvalidTransition {
            from: format!("worker {} {}", self.index, self.state),
            to: to.to_string(),
        }
    }

    /// Start the container; no-op if it is already running
    pub async fn start(&mut self, runtime: &dyn ContainerRuntime) -> Result<(), EngineError> {
        match self.state {
            WorkerState::Started | WorkerState::Serving => return Ok(()),
            WorkerState::Removed => return Err(self.invalid(WorkerState::Started)),
            WorkerState::Created | WorkerState::Stopped => {}
        }

        // marked before the call so an interrupted start still gets stopped
        let previous = self.state;
        self.state = WorkerState::Started;

        if let Err(e) = runtime.start_worker(&self.container_id).await {
            self.state = previous;
            return Err(EngineError::WorkerStart {
                index: self.index,
                reason: e.to_string(),
            });
        }

        tracing::debug!(worker = self.index, container = %self.container_id, "Worker started");
        Ok(())
    }

    /// Record that the readiness gate passed
    pub fn mark_serving(&mut self) -> Result<(), EngineError> {
        match self.state {
            WorkerState::Started | WorkerState::Serving => {
                self.state = WorkerState::Serving;
                Ok(())
            }
            _ => Err(self.invalid(WorkerState::Serving)),
        }
    }

    /// Stop the container; no-op unless it is running
    pub async fn stop(&mut self, runtime: &dyn ContainerRuntime) -> Result<(), EngineError> {
        match self.state {
            WorkerState::Created | WorkerState::Stopped | WorkerState::Removed => return Ok(()),
            WorkerState::Started | WorkerState::Serving => {}
        }

        runtime
            .stop_worker(&self.container_id)
            .await
            .map_err(|e| EngineError::Shutdown(format!("stop worker {}: {}", self.index, e)))?;

        tracing::debug!(worker = self.index, container = %self.container_id, "Worker stopped");
        self.state = WorkerState::Stopped;
        Ok(())
    }

    /// Remove the container; no-op if it is already removed
    pub async fn remove(&mut self, runtime: &dyn ContainerRuntime) -> Result<(), EngineError> {
        if self.state == WorkerState::Removed {
            return Ok(());
        }

        runtime
            .remove_worker(&self.container_id)
            .await
            .map_err(|e| EngineError::Shutdown(format!("remove worker {}: {}", self.index, e)))?;

        tracing::debug!(worker = self.index, container = %self.container_id, "Worker removed");
        self.state = WorkerState::Removed;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::{FakeRuntime, RuntimeCall};

    #[test]
    fn test_endpoint_urls() {
        let endpoint = Endpoint::new("localhost", 8001);
        assert_eq!(endpoint.api_base(), "http://localhost:8001/v1");
        assert_eq!(endpoint.health_url(), "http://localhost:8001/health");
    }

    #[tokio::test]
    async fn test_lifecycle_happy_path() {
        let runtime = FakeRuntime::new();
        let mut worker = Worker::created(0, "c0", 8000, "m1");

        worker.start(&runtime).await.unwrap();
        worker.mark_serving().unwrap();
        worker.stop(&runtime).await.unwrap();
        worker.start(&runtime).await.unwrap();
        worker.stop(&runtime).await.unwrap();
        worker.remove(&runtime).await.unwrap();

        assert_eq!(worker.state(), WorkerState::Removed);
    }

    #[tokio::test]
    async fn test_stop_and_remove_are_idempotent() {
        let runtime = FakeRuntime::new();
        let mut worker = Worker::created(0, "c0", 8000, "m1");
        worker.start(&runtime).await.unwrap();

        worker.stop(&runtime).await.unwrap();
        worker.stop(&runtime).await.unwrap();
        worker.remove(&runtime).await.unwrap();
        worker.remove(&runtime).await.unwrap();

        let stops = runtime
            .calls()
            .iter()
            .filter(|c| matches!(c, RuntimeCall::Stop(_)))
            .count();
        let removes = runtime
            .calls()
            .iter()
            .filter(|c| matches!(c, RuntimeCall::Remove(_)))
            .count();
        assert_eq!(stops, 1);
        assert_eq!(removes, 1);
    }

    #[tokio::test]
    async fn test_cannot_serve_before_start() {
        let mut worker = Worker::created(0, "c0", 8000, "m1");

        assert!(matches!(
            worker.mark_serving(),
            Err(EngineError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_removed_worker_cannot_restart() {
        let runtime = FakeRuntime::new();
        let mut worker = Worker::created(0, "c0", 8000, "m1");
        worker.remove(&runtime).await.unwrap();

        assert!(worker.start(&runtime).await.is_err());
    }

    #[tokio::test]
    async fn test_start_failure_names_worker() {
        let runtime = FakeRuntime::new();
        runtime.fail_start("c3");
        let mut worker = Worker::created(3, "c3", 8003, "m4");

        match worker.start(&runtime).await {
            Err(EngineError::WorkerStart { index, .. }) => assert_eq!(index, 3),
            other => panic!("Expected WorkerStart, got: {:?}", other),
        }
        assert_eq!(worker.state(), WorkerState::Created);
    }

    #[tokio::test(start_paused = true)]
    async fn test_interrupted_start_is_still_stopped() {
        let runtime = FakeRuntime::new();
        runtime.stall_start("c0");
        let mut worker = Worker::created(0, "c0", 8000, "m1");

        let interrupted =
            tokio::time::timeout(std::time::Duration::from_secs(1), worker.start(&runtime)).await;

        assert!(interrupted.is_err());
        assert_eq!(worker.state(), WorkerState::Started);
        assert_eq!(runtime.running(), vec!["c0".to_string()]);

        worker.stop(&runtime).await.unwrap();
        assert!(runtime.running().is_empty());
    }
}

//! Container Lifecycle Manager
//!
//! Thin operations over a container runtime: pull an image, create, start,
//! stop and remove inference workers, and list the workers this service
//! created (for crash recovery).
//!
//! The [`ContainerRuntime`] trait is the seam between sessions and the
//! runtime. [`docker::DockerRuntime`] talks to the local Docker daemon;
//! tests use the in-memory runtime from `testkit`.
//!
//! Runtimes are stateless with respect to sessions: every call names the
//! container it acts on, and one runtime is shared by all sessions.

use async_trait::async_trait;
use futures::stream::BoxStream;
use sdk::errors::EngineError;
use std::collections::HashMap;
use std::path::PathBuf;

pub mod docker;
pub mod worker;

pub use docker::DockerRuntime;
pub use worker::{Endpoint, Worker, WorkerState};

/// Label marking containers created by this service
pub const LABEL_MANAGED: &str = "slape.managed";
pub const LABEL_SESSION: &str = "slape.session";
pub const LABEL_PIPELINE: &str = "slape.pipeline";
pub const LABEL_WORKER_INDEX: &str = "slape.worker.index";
pub const LABEL_MODEL: &str = "slape.model";

/// Everything needed to create one worker container
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerSpec {
    pub session_id: String,
    pub pipeline: String,
    pub index: usize,
    pub image: String,
    pub port: u16,
    /// Model file name inside the models directory
    pub model: String,
    pub gpu: bool,
    pub models_dir: PathBuf,
    pub context_length: u32,
}

impl WorkerSpec {
    pub fn container_name(&self) -> String {
        format!("slape-{}-{}", self.session_id, self.index)
    }

    pub fn labels(&self) -> HashMap<String, String> {
        HashMap::from([
            (LABEL_MANAGED.to_string(), "true".to_string()),
            (LABEL_SESSION.to_string(), self.session_id.clone()),
            (LABEL_PIPELINE.to_string(), self.pipeline.clone()),
            (LABEL_WORKER_INDEX.to_string(), self.index.to_string()),
            (LABEL_MODEL.to_string(), self.model.clone()),
        ])
    }

    /// llama.cpp server arguments
    pub fn command(&self) -> Vec<String> {
        let mut cmd = vec![
            "-m".to_string(),
            format!("/models/{}", self.model),
            "--host".to_string(),
            "0.0.0.0".to_string(),
            "--port".to_string(),
            self.port.to_string(),
            "-c".to_string(),
            self.context_length.to_string(),
        ];

        if self.gpu {
            cmd.push("-ngl".to_string());
            cmd.push("99".to_string());
        }

        cmd
    }
}

/// One status line reported while pulling an image
#[derive(Debug, Clone, PartialEq)]
pub struct PullProgress {
    pub status: String,
    pub progress: Option<String>,
}

/// Result of a successful create call
#[derive(Debug, Clone, PartialEq)]
pub struct CreatedWorker {
    pub id: String,
    /// Warnings the runtime attached to the create call
    pub warnings: Vec<String>,
}

/// A worker container found on the runtime
#[derive(Debug, Clone, PartialEq)]
pub struct ManagedContainer {
    pub id: String,
    pub name: Option<String>,
    pub session_id: Option<String>,
    pub state: Option<String>,
}

/// Container runtime operations used by pipeline sessions
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Pull `image`, reporting progress; the stream ends when the pull is done
    fn pull_image(&self, image: &str) -> BoxStream<'static, Result<PullProgress, EngineError>>;

    /// Create (but do not start) a worker; fails with `WorkerCreation`
    async fn create_worker(&self, spec: &WorkerSpec) -> Result<CreatedWorker, EngineError>;

    /// Start a created or stopped worker; starting a running worker is not an error
    async fn start_worker(&self, id: &str) -> Result<(), EngineError>;

    /// Stop a worker; no-op if it is already stopped or gone
    async fn stop_worker(&self, id: &str) -> Result<(), EngineError>;

    /// Remove a worker; no-op if it is already gone
    async fn remove_worker(&self, id: &str) -> Result<(), EngineError>;

    /// Every container carrying the managed label, running or not
    async fn list_managed(&self) -> Result<Vec<ManagedContainer>, EngineError>;
}

//! In-memory collaborators for tests
//!
//! - [`FakeRuntime`]: a container runtime that records every call and can be
//!   told to fail specific operations
//! - [`ScriptedInference`]: an inference client that answers from a counter
//!   (or a custom responder) and records each request
//! - [`StaticProbe`]: a health probe that turns ready after N attempts

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use sdk::errors::EngineError;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::container::{
    ContainerRuntime, CreatedWorker, Endpoint, ManagedContainer, PullProgress, WorkerSpec,
};
use crate::llm::{ChatRequest, InferenceClient, LLMError};
use crate::readiness::HealthProbe;

/// A call made against [`FakeRuntime`]
#[derive(Debug, Clone, PartialEq)]
pub enum RuntimeCall {
    Pull(String),
    Create(WorkerSpec),
    Start(String),
    Stop(String),
    Remove(String),
    List,
}

#[derive(Default)]
struct RuntimeState {
    calls: Vec<RuntimeCall>,
    /// container id -> (session label, running)
    containers: BTreeMap<String, (Option<String>, bool)>,
    fail_pull: bool,
    fail_create_at: Option<usize>,
    fail_start: HashSet<String>,
    fail_stop: HashSet<String>,
    fail_remove: HashSet<String>,
    stall_create_at: Option<usize>,
    stall_start: HashSet<String>,
}

/// Container runtime that keeps containers in a map
#[derive(Clone, Default)]
pub struct FakeRuntime {
    state: Arc<Mutex<RuntimeState>>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RuntimeState> {
        self.state.lock().unwrap()
    }

    pub fn calls(&self) -> Vec<RuntimeCall> {
        self.lock().calls.clone()
    }

    pub fn fail_pull(&self) {
        self.lock().fail_pull = true;
    }

    /// Fail the create call for worker `index`
    pub fn fail_create_at(&self, index: usize) {
        self.lock().fail_create_at = Some(index);
    }

    pub fn fail_start(&self, id: &str) {
        self.lock().fail_start.insert(id.to_string());
    }

    pub fn fail_stop(&self, id: &str) {
        self.lock().fail_stop.insert(id.to_string());
    }

    pub fn fail_remove(&self, id: &str) {
        self.lock().fail_remove.insert(id.to_string());
    }

    /// Create worker `index`'s container, then never answer the create call
    pub fn stall_create_at(&self, index: usize) {
        self.lock().stall_create_at = Some(index);
    }

    /// Start the container, then never answer the start call
    pub fn stall_start(&self, id: &str) {
        self.lock().stall_start.insert(id.to_string());
    }

    /// Pretend a container from an earlier process is still around
    pub fn add_existing(&self, id: &str, session_id: Option<&str>, running: bool) {
        self.lock()
            .containers
            .insert(id.to_string(), (session_id.map(str::to_string), running));
    }

    /// Ids of containers that exist, in id order
    pub fn containers(&self) -> Vec<String> {
        self.lock().containers.keys().cloned().collect()
    }

    /// Ids of running containers, in id order
    pub fn running(&self) -> Vec<String> {
        self.lock()
            .containers
            .iter()
            .filter(|(_, (_, running))| *running)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Created worker specs, in call order
    pub fn created_specs(&self) -> Vec<WorkerSpec> {
        self.lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                RuntimeCall::Create(spec) => Some(spec.clone()),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    fn pull_image(&self, image: &str) -> BoxStream<'static, Result<PullProgress, EngineError>> {
        let mut state = self.lock();
        state.calls.push(RuntimeCall::Pull(image.to_string()));

        let progress = PullProgress {
            status: "Pulling fs layer".to_string(),
            progress: None,
        };

        if state.fail_pull {
            let err = EngineError::ImagePull {
                image: image.to_string(),
                reason: "manifest unknown".to_string(),
            };
            stream::iter(vec![Ok(progress), Err(err)]).boxed()
        } else {
            stream::iter(vec![Ok(progress)]).boxed()
        }
    }

    async fn create_worker(&self, spec: &WorkerSpec) -> Result<CreatedWorker, EngineError> {
        let stall = {
            let mut state = self.lock();
            state.calls.push(RuntimeCall::Create(spec.clone()));

            if state.fail_create_at == Some(spec.index) {
                return Err(EngineError::WorkerCreation {
                    index: spec.index,
                    reason: format!("port {} is already allocated", spec.port),
                    warnings: vec!["Your kernel does not support swap limit capabilities".to_string()],
                });
            }

            state
                .containers
                .insert(spec.container_name(), (Some(spec.session_id.clone()), false));
            state.stall_create_at == Some(spec.index)
        };

        if stall {
            futures::future::pending::<()>().await;
        }

        Ok(CreatedWorker {
            id: spec.container_name(),
            warnings: Vec::new(),
        })
    }

    async fn start_worker(&self, id: &str) -> Result<(), EngineError> {
        let stall = {
            let mut state = self.lock();
            state.calls.push(RuntimeCall::Start(id.to_string()));

            if state.fail_start.contains(id) {
                return Err(EngineError::Runtime(format!("cannot start {}", id)));
            }

            state
                .containers
                .entry(id.to_string())
                .or_insert((None, false))
                .1 = true;
            state.stall_start.contains(id)
        };

        if stall {
            futures::future::pending::<()>().await;
        }
        Ok(())
    }

    async fn stop_worker(&self, id: &str) -> Result<(), EngineError> {
        let mut state = self.lock();
        state.calls.push(RuntimeCall::Stop(id.to_string()));

        if state.fail_stop.contains(id) {
            return Err(EngineError::Runtime(format!("cannot stop {}", id)));
        }

        if let Some(entry) = state.containers.get_mut(id) {
            entry.1 = false;
        }
        Ok(())
    }

    async fn remove_worker(&self, id: &str) -> Result<(), EngineError> {
        let mut state = self.lock();
        state.calls.push(RuntimeCall::Remove(id.to_string()));

        if state.fail_remove.contains(id) {
            return Err(EngineError::Runtime(format!("cannot remove {}", id)));
        }

        state.containers.remove(id);
        Ok(())
    }

    async fn list_managed(&self) -> Result<Vec<ManagedContainer>, EngineError> {
        let mut state = self.lock();
        state.calls.push(RuntimeCall::List);

        Ok(state
            .containers
            .iter()
            .map(|(id, (session_id, running))| ManagedContainer {
                id: id.clone(),
                name: Some(id.clone()),
                session_id: session_id.clone(),
                state: Some(if *running { "running" } else { "exited" }.to_string()),
            })
            .collect())
    }
}

/// A completion request seen by [`ScriptedInference`]
#[derive(Debug, Clone, PartialEq)]
pub struct InferenceCall {
    pub endpoint: Endpoint,
    pub request: ChatRequest,
    pub response: String,
}

type Responder =
    dyn Fn(&Endpoint, &ChatRequest, usize) -> Result<String, LLMError> + Send + Sync + 'static;

/// Inference client answering `"answer <n>"` for the n-th call (1-based)
#[derive(Clone)]
pub struct ScriptedInference {
    attempts: Arc<AtomicUsize>,
    calls: Arc<Mutex<Vec<InferenceCall>>>,
    responder: Arc<Responder>,
}

impl Default for ScriptedInference {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedInference {
    pub fn new() -> Self {
        Self::with_responder(|_, _, n| Ok(format!("answer {}", n)))
    }

    pub fn with_responder<F>(responder: F) -> Self
    where
        F: Fn(&Endpoint, &ChatRequest, usize) -> Result<String, LLMError> + Send + Sync + 'static,
    {
        Self {
            attempts: Arc::new(AtomicUsize::new(0)),
            calls: Arc::new(Mutex::new(Vec::new())),
            responder: Arc::new(responder),
        }
    }

    /// Answer normally except for call `n` (1-based), which fails
    pub fn failing_on(n: usize) -> Self {
        Self::with_responder(move |_, _, call| {
            if call == n {
                Err(LLMError::ProviderUnavailable("worker went away".to_string()))
            } else {
                Ok(format!("answer {}", call))
            }
        })
    }

    pub fn calls(&self) -> Vec<InferenceCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Ports of the workers called, in call order
    pub fn ports(&self) -> Vec<u16> {
        self.calls().iter().map(|c| c.endpoint.port).collect()
    }
}

#[async_trait]
impl InferenceClient for ScriptedInference {
    async fn complete_chat(
        &self,
        endpoint: &Endpoint,
        request: &ChatRequest,
    ) -> Result<String, LLMError> {
        // failed attempts are counted but not recorded
        let n = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        let response = (self.responder)(endpoint, request, n)?;

        self.calls.lock().unwrap().push(InferenceCall {
            endpoint: endpoint.clone(),
            request: request.clone(),
            response: response.clone(),
        });
        Ok(response)
    }

    async fn embed(
        &self,
        _endpoint: &Endpoint,
        text: &str,
        _model: &str,
    ) -> Result<Vec<f32>, LLMError> {
        Ok(vec![text.len() as f32])
    }
}

/// Health probe that fails a fixed number of times before succeeding
#[derive(Debug, Default)]
pub struct StaticProbe {
    failures_before_ready: Option<u32>,
    attempts: AtomicU32,
}

impl StaticProbe {
    pub fn ready_after(failures: u32) -> Self {
        Self {
            failures_before_ready: Some(failures),
            attempts: AtomicU32::new(0),
        }
    }

    pub fn never() -> Self {
        Self {
            failures_before_ready: None,
            attempts: AtomicU32::new(0),
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HealthProbe for StaticProbe {
    async fn probe(&self, _endpoint: &Endpoint) -> bool {
        let previous = self.attempts.fetch_add(1, Ordering::SeqCst);
        match self.failures_before_ready {
            Some(failures) => previous >= failures,
            None => false,
        }
    }
}

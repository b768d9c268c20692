//! Pipeline sessions
//!
//! A [`Session`] owns the workers and the [`ContextBox`] of one pipeline
//! instance and drives them through
//!
//! ```text
//! Idle -> SettingUp -> Ready <-> Generating
//!             |          |
//!             |          v
//!             |     ShuttingDown -> TornDown
//!             +--------------------> TornDown   (setup failed, rolled back)
//! ```
//!
//! Strategies hold a session and use its capabilities (start a worker and
//! wait for it, fill the context, run a completion, stop a worker); they
//! never touch the runtime or the inference client directly.
//!
//! Teardown is best effort: every worker gets a stop pass and then a remove
//! pass, failures are logged and the remaining workers are still handled.

use futures::StreamExt;
use sdk::errors::EngineError;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::context::ContextBox;
use super::prompts::{PromptCatalog, ResolvedPrompt, THINKING_SYSTEM};
use super::tools::ToolSet;
use super::{GenerateRequest, PipelineKind};
use crate::config::Config;
use crate::container::{ContainerRuntime, Endpoint, Worker, WorkerSpec, WorkerState};
use crate::db::{WorkerRecord, WorkerRepository};
use crate::llm::{ChatRequest, InferenceClient};
use crate::readiness::{wait_ready, HealthProbe};
use crate::scope::RequestScope;

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    SettingUp,
    Ready,
    Generating,
    ShuttingDown,
    TornDown,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Idle => write!(f, "idle"),
            SessionState::SettingUp => write!(f, "setting_up"),
            SessionState::Ready => write!(f, "ready"),
            SessionState::Generating => write!(f, "generating"),
            SessionState::ShuttingDown => write!(f, "shutting_down"),
            SessionState::TornDown => write!(f, "torn_down"),
        }
    }
}

impl SessionState {
    fn can_become(self, to: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, to),
            (Idle, SettingUp)
                | (SettingUp, Ready)
                | (SettingUp, TornDown)
                | (Ready, Generating)
                | (Generating, Ready)
                | (Ready, ShuttingDown)
                | (ShuttingDown, TornDown)
        )
    }
}

/// Which workers setup starts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartPolicy {
    /// Only worker 0; the rest are started on demand
    FirstOnly,
    All,
}

/// Worker and timing settings shared by every session
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSettings {
    pub host: String,
    pub base_port: u16,
    pub max_workers: usize,
    pub image: String,
    pub gpu: bool,
    pub models_dir: PathBuf,
    pub context_length: u32,
    pub readiness_interval: Duration,
    pub readiness_timeout: Duration,
    pub shutdown_timeout: Duration,
    pub debate_rounds: usize,
}

impl SessionSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            host: config.workers.host.clone(),
            base_port: config.workers.base_port,
            max_workers: config.workers.max_workers,
            image: config.workers.image_ref(),
            gpu: config.workers.gpu,
            models_dir: config.workers.models_dir.clone(),
            context_length: config.workers.context_length,
            readiness_interval: config.readiness.interval(),
            readiness_timeout: config.readiness.timeout(),
            shutdown_timeout: config.timeouts.shutdown(),
            debate_rounds: config.pipelines.debate_rounds,
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Collaborators shared by every session
pub struct Services {
    pub runtime: Arc<dyn ContainerRuntime>,
    pub inference: Arc<dyn InferenceClient>,
    pub probe: Arc<dyn HealthProbe>,
    pub registry: Option<WorkerRepository>,
    pub prompts: PromptCatalog,
    pub tools: ToolSet,
    pub settings: SessionSettings,
}

impl Services {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        inference: Arc<dyn InferenceClient>,
        probe: Arc<dyn HealthProbe>,
        settings: SessionSettings,
    ) -> Self {
        Self {
            runtime,
            inference,
            probe,
            registry: None,
            prompts: PromptCatalog::default(),
            tools: ToolSet::default(),
            settings,
        }
    }

    pub fn with_registry(mut self, registry: WorkerRepository) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_tools(mut self, tools: ToolSet) -> Self {
        self.tools = tools;
        self
    }
}

/// One pipeline instance: its workers, its context and its state
pub struct Session {
    id: String,
    kind: PipelineKind,
    services: Arc<Services>,
    state: SessionState,
    models: Vec<String>,
    workers: Vec<Worker>,
    context: ContextBox,
}

impl Session {
    pub fn new(kind: PipelineKind, services: Arc<Services>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            services,
            state: SessionState::Idle,
            models: Vec::new(),
            workers: Vec::new(),
            context: ContextBox::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> PipelineKind {
        self.kind
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn models(&self) -> &[String] {
        &self.models
    }

    pub fn workers(&self) -> &[Worker] {
        &self.workers
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn context(&self) -> &ContextBox {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut ContextBox {
        &mut self.context
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.services.settings
    }

    fn transition(&mut self, to: SessionState) -> Result<(), EngineError> {
        if !self.state.can_become(to) {
            return Err(EngineError::InvalidTransition {
                from: self.state.to_string(),
                to: to.to_string(),
            });
        }

        debug!(session = %self.id, from = %self.state, to = %to, "Session transition");
        self.state = to;
        Ok(())
    }

    /// Port of worker `index`
    pub fn port_for(&self, index: usize) -> Result<u16, EngineError> {
        u16::try_from(index)
            .ok()
            .and_then(|i| self.settings().base_port.checked_add(i))
            .ok_or_else(|| {
                EngineError::InvalidRequest(format!("no port available for worker {}", index))
            })
    }

    pub fn endpoint(&self, index: usize) -> Result<Endpoint, EngineError> {
        Ok(Endpoint::new(
            self.settings().host.clone(),
            self.port_for(index)?,
        ))
    }

    fn validate_models(&self, models: &[String]) -> Result<(), EngineError> {
        if models.is_empty() {
            return Err(EngineError::InvalidRequest(
                "at least one model is required".to_string(),
            ));
        }

        let limit = self
            .kind
            .max_models()
            .unwrap_or(usize::MAX)
            .min(self.settings().max_workers);
        if models.len() > limit {
            return Err(EngineError::InvalidRequest(format!(
                "{} pipeline accepts at most {} models, got {}",
                self.kind,
                limit,
                models.len()
            )));
        }

        for model in models {
            let model = model.trim();
            if model.is_empty()
                || model.contains('/')
                || model.contains('\\')
                || model.contains("..")
            {
                return Err(EngineError::InvalidRequest(format!(
                    "invalid model name: {:?}",
                    model
                )));
            }
        }

        // every worker needs a port
        self.port_for(models.len() - 1)?;
        Ok(())
    }

    fn worker_spec(&self, index: usize, model: &str) -> Result<WorkerSpec, EngineError> {
        let settings = self.settings();
        Ok(WorkerSpec {
            session_id: self.id.clone(),
            pipeline: self.kind.to_string(),
            index,
            image: settings.image.clone(),
            port: self.port_for(index)?,
            model: model.to_string(),
            gpu: settings.gpu,
            models_dir: settings.models_dir.clone(),
            context_length: settings.context_length,
        })
    }

    /// Pull the image, create one worker per model and start them per `policy`
    ///
    /// On any failure the workers created so far are stopped and removed and
    /// the session ends `TornDown`.
    pub async fn setup(
        &mut self,
        models: Vec<String>,
        policy: StartPolicy,
        scope: &RequestScope,
    ) -> Result<(), EngineError> {
        if self.state != SessionState::Idle {
            return Err(EngineError::AlreadySetUp);
        }
        self.validate_models(&models)?;
        self.transition(SessionState::SettingUp)?;
        self.models = models.iter().map(|m| m.trim().to_string()).collect();

        info!(
            session = %self.id,
            pipeline = %self.kind,
            workers = self.models.len(),
            image = %self.settings().image,
            "Setting up session"
        );

        match self.provision(policy, scope).await {
            Ok(()) => {
                self.transition(SessionState::Ready)?;
                info!(session = %self.id, pipeline = %self.kind, "Session ready");
                Ok(())
            }
            Err(e) => {
                error!(session = %self.id, pipeline = %self.kind, error = %e, "Setup failed, rolling back");
                self.teardown().await;
                if matches!(e, EngineError::Cancelled | EngineError::DeadlineExceeded) {
                    self.sweep_untracked().await;
                }
                self.transition(SessionState::TornDown)?;
                Err(e)
            }
        }
    }

    async fn provision(
        &mut self,
        policy: StartPolicy,
        scope: &RequestScope,
    ) -> Result<(), EngineError> {
        self.pull_image(scope).await?;

        let runtime = self.services.runtime.clone();
        for (index, model) in self.models.clone().iter().enumerate() {
            let spec = self.worker_spec(index, model)?;
            let created = scope.run(runtime.create_worker(&spec)).await?;

            let worker = Worker::created(index, created.id, spec.port, model.clone());
            info!(
                session = %self.id,
                worker = index,
                port = spec.port,
                container = %worker.container_id,
                "Worker created"
            );
            self.record_worker(&worker).await;
            self.workers.push(worker);
        }

        let to_start = match policy {
            StartPolicy::FirstOnly => 1,
            StartPolicy::All => self.workers.len(),
        };
        for worker in self.workers.iter_mut().take(to_start) {
            scope.run(worker.start(runtime.as_ref())).await?;
        }

        Ok(())
    }

    async fn pull_image(&self, scope: &RequestScope) -> Result<(), EngineError> {
        let image = self.settings().image.clone();
        let mut progress = self.services.runtime.pull_image(&image);

        info!(session = %self.id, image = %image, "Pulling image");
        scope
            .run(async move {
                while let Some(item) = progress.next().await {
                    let item = item?;
                    debug!(
                        status = %item.status,
                        progress = item.progress.as_deref().unwrap_or(""),
                        "Pull progress"
                    );
                }
                Ok(())
            })
            .await
    }

    async fn record_worker(&self, worker: &Worker) {
        let Some(registry) = &self.services.registry else {
            return;
        };

        let record = WorkerRecord::new(
            worker.container_id.clone(),
            self.id.clone(),
            self.kind.to_string(),
            worker.index,
            worker.port,
            worker.model.clone(),
        );
        if let Err(e) = registry.record(&record).await {
            warn!(container = %worker.container_id, error = %e, "Failed to record worker in registry");
        }
    }

    async fn forget_worker(&self, container_id: &str) {
        let Some(registry) = &self.services.registry else {
            return;
        };

        if let Err(e) = registry.delete(container_id).await {
            warn!(container = %container_id, error = %e, "Failed to remove worker from registry");
        }
    }

    fn worker_mut(&mut self, index: usize) -> Result<&mut Worker, EngineError> {
        let count = self.workers.len();
        self.workers.get_mut(index).ok_or_else(|| {
            EngineError::InvalidRequest(format!("worker {} out of range ({} workers)", index, count))
        })
    }

    /// Start worker `index` if needed and wait until it serves
    pub async fn ensure_serving(
        &mut self,
        index: usize,
        scope: &RequestScope,
    ) -> Result<(), EngineError> {
        let endpoint = self.endpoint(index)?;
        let runtime = self.services.runtime.clone();
        let probe = self.services.probe.clone();
        let interval = self.settings().readiness_interval;
        let readiness = scope.narrowed(self.settings().readiness_timeout);

        let worker = self.worker_mut(index)?;
        if worker.state() == WorkerState::Serving {
            return Ok(());
        }

        scope.run(worker.start(runtime.as_ref())).await?;
        info!(worker = index, port = endpoint.port, "Waiting for worker");
        wait_ready(probe.as_ref(), &endpoint, interval, &readiness).await?;
        worker.mark_serving()
    }

    /// Start worker `index` without waiting for it
    pub async fn start_worker(&mut self, index: usize, scope: &RequestScope) -> Result<(), EngineError> {
        let runtime = self.services.runtime.clone();
        let worker = self.worker_mut(index)?;
        scope.run(worker.start(runtime.as_ref())).await
    }

    /// Stop worker `index`; failures are logged
    pub async fn stop_worker(&mut self, index: usize) {
        let runtime = self.services.runtime.clone();
        let Ok(worker) = self.worker_mut(index) else {
            return;
        };

        if let Err(e) = worker.stop(runtime.as_ref()).await {
            warn!(worker = index, error = %e, "Failed to stop worker");
        }
    }

    /// Chat request for worker `index`'s model
    pub fn chat_request(&self, index: usize, max_tokens: u32) -> ChatRequest {
        let model = self.models.get(index).cloned().unwrap_or_default();
        ChatRequest::new(model, max_tokens)
    }

    /// Run one completion against worker `index`
    pub async fn complete(
        &self,
        index: usize,
        request: &ChatRequest,
        scope: &RequestScope,
    ) -> Result<String, EngineError> {
        let endpoint = self.endpoint(index)?;
        let inference = self.services.inference.clone();

        debug!(session = %self.id, worker = index, model = %request.model, "Completion");
        scope
            .run(async {
                inference
                    .complete_chat(&endpoint, request)
                    .await
                    .map_err(EngineError::from)
            })
            .await
    }

    /// Enter `Generating`, reset the context and run the optional search and thinking steps
    pub async fn begin_generate(
        &mut self,
        request: &GenerateRequest,
        scope: &RequestScope,
    ) -> Result<ResolvedPrompt, EngineError> {
        match self.state {
            SessionState::Ready => {}
            SessionState::Idle | SessionState::TornDown => return Err(EngineError::NotSetUp),
            _ => {
                return Err(EngineError::InvalidTransition {
                    from: self.state.to_string(),
                    to: SessionState::Generating.to_string(),
                })
            }
        }
        self.transition(SessionState::Generating)?;

        let resolved = self.services.prompts.resolve(&request.mode);
        info!(
            session = %self.id,
            pipeline = %self.kind,
            mode = resolved.mode,
            max_tokens = resolved.max_tokens,
            thinking = request.thinking,
            search = request.search,
            "Generating"
        );
        self.context.begin_generate(resolved.template, request.prompt.clone());

        if let Err(e) = self.prepare(request, resolved, scope).await {
            self.finish_generate(false).await;
            return Err(e);
        }

        Ok(resolved)
    }

    async fn prepare(
        &mut self,
        request: &GenerateRequest,
        resolved: ResolvedPrompt,
        scope: &RequestScope,
    ) -> Result<(), EngineError> {
        if request.search {
            let search = self.services.tools.search.clone();
            let results = scope.run(search.search(&request.prompt)).await?;
            debug!(results = results.len(), "Search results");
            self.context.set_search_results(results);
        }

        if request.thinking {
            self.ensure_serving(0, scope).await?;
            let thinking = self
                .chat_request(0, resolved.max_tokens)
                .system(THINKING_SYSTEM)
                .user(request.prompt.clone());
            let thoughts = self.complete(0, &thinking, scope).await?;
            self.context.set_thoughts(thoughts);
        }

        Ok(())
    }

    /// Leave `Generating`; after a failure every running worker is stopped
    pub async fn finish_generate(&mut self, succeeded: bool) {
        self.context.end_generate();

        if !succeeded {
            for index in 0..self.workers.len() {
                if matches!(
                    self.workers[index].state(),
                    WorkerState::Started | WorkerState::Serving
                ) {
                    self.stop_worker(index).await;
                }
            }
        }

        if let Err(e) = self.transition(SessionState::Ready) {
            warn!(session = %self.id, error = %e, "Unexpected state after generate");
        }
    }

    /// Stop and remove every worker; idempotent
    pub async fn shutdown(&mut self) -> Result<(), EngineError> {
        match self.state {
            SessionState::Idle | SessionState::TornDown => {
                debug!(session = %self.id, state = %self.state, "Nothing to shut down");
                return Ok(());
            }
            SessionState::Ready => {}
            _ => {
                return Err(EngineError::InvalidTransition {
                    from: self.state.to_string(),
                    to: SessionState::ShuttingDown.to_string(),
                })
            }
        }

        self.transition(SessionState::ShuttingDown)?;
        let failures = self.teardown().await;
        self.transition(SessionState::TornDown)?;

        if failures == 0 {
            info!(session = %self.id, pipeline = %self.kind, "Session torn down");
        } else {
            warn!(session = %self.id, failures, "Session torn down with failures");
        }
        Ok(())
    }

    /// Remove containers labelled with this session that never got a worker handle
    ///
    /// An interrupted create call can leave one behind.
    async fn sweep_untracked(&self) {
        let runtime = self.services.runtime.clone();
        let scope = RequestScope::detached(self.settings().shutdown_timeout);

        let managed = match scope.run(runtime.list_managed()).await {
            Ok(managed) => managed,
            Err(e) => {
                warn!(session = %self.id, error = %e, "Failed to list containers after rollback");
                return;
            }
        };

        for container in managed {
            let ours = container.session_id.as_deref() == Some(self.id.as_str());
            let tracked = self.workers.iter().any(|w| w.container_id == container.id);
            if !ours || tracked {
                continue;
            }

            info!(session = %self.id, container = %container.id, "Removing untracked container");
            if let Err(e) = scope.run(runtime.remove_worker(&container.id)).await {
                warn!(container = %container.id, error = %e, "Failed to remove untracked container");
            }
        }
    }

    /// Stop pass then remove pass over every worker; returns the failure count
    async fn teardown(&mut self) -> usize {
        let runtime = self.services.runtime.clone();
        let scope = RequestScope::detached(self.settings().shutdown_timeout);
        let mut failures = 0;

        for worker in self.workers.iter_mut() {
            if let Err(e) = scope.run(worker.stop(runtime.as_ref())).await {
                warn!(worker = worker.index, container = %worker.container_id, error = %e, "Stop failed");
                failures += 1;
            }
        }

        let mut removed = Vec::new();
        for worker in self.workers.iter_mut() {
            match scope.run(worker.remove(runtime.as_ref())).await {
                Ok(()) => removed.push(worker.container_id.clone()),
                Err(e) => {
                    warn!(worker = worker.index, container = %worker.container_id, error = %e, "Remove failed");
                    failures += 1;
                }
            }
        }

        for container_id in removed {
            self.forget_worker(&container_id).await;
        }

        failures
    }
}

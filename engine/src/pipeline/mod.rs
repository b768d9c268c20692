//! Pipeline Strategies
//!
//! Three orchestration algorithms share one shape (setup, generate any
//! number of times, shutdown) and differ only in how they walk the workers:
//!
//! - **simple**: one worker, one completion
//! - **cot** (chain): a sequential relay; each worker answers, then all but
//!   the last summarize and pose five questions for the next worker
//! - **debate**: a fixed number of round-robin rounds; each worker answers
//!   and summarizes, and the summary seeds the next speaker
//!
//! Inference is strictly sequential inside a session: a worker is stopped
//! before the next one is started.

use async_trait::async_trait;
use sdk::errors::EngineError;
use sdk::types::GeneratePayload;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::scope::RequestScope;

pub mod chain;
pub mod context;
pub mod debate;
pub mod handle;
pub mod prompts;
pub mod session;
pub mod simple;
pub mod tools;

pub use chain::ChainPipeline;
pub use context::{ContextBox, RoundState};
pub use debate::DebatePipeline;
pub use handle::SessionHandle;
pub use prompts::{PromptCatalog, ResolvedPrompt};
pub use session::{Services, Session, SessionSettings, SessionState, StartPolicy};
pub use simple::SimplePipeline;
pub use tools::{DisabledSearch, ToolSet, WebSearch};

/// Which strategy a session runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineKind {
    Simple,
    Chain,
    Debate,
}

impl PipelineKind {
    pub const ALL: [PipelineKind; 3] = [
        PipelineKind::Simple,
        PipelineKind::Chain,
        PipelineKind::Debate,
    ];

    /// Name used in routes, container labels and logs
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineKind::Simple => "simple",
            PipelineKind::Chain => "cot",
            PipelineKind::Debate => "debate",
        }
    }

    /// Upper bound on models for this strategy, if it has one
    pub fn max_models(&self) -> Option<usize> {
        match self {
            PipelineKind::Simple => Some(1),
            PipelineKind::Chain | PipelineKind::Debate => None,
        }
    }

    pub fn start_policy(&self) -> StartPolicy {
        match self {
            PipelineKind::Simple | PipelineKind::Chain => StartPolicy::FirstOnly,
            PipelineKind::Debate => StartPolicy::All,
        }
    }
}

impl fmt::Display for PipelineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PipelineKind {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "simple" => Ok(PipelineKind::Simple),
            "cot" | "chain" => Ok(PipelineKind::Chain),
            "debate" => Ok(PipelineKind::Debate),
            other => Err(EngineError::InvalidRequest(format!(
                "unknown pipeline: {}",
                other
            ))),
        }
    }
}

/// A generate call with its flags resolved
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerateRequest {
    pub prompt: String,
    pub mode: String,
    pub thinking: bool,
    pub search: bool,
}

impl GenerateRequest {
    pub fn new(prompt: impl Into<String>, mode: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            mode: mode.into(),
            thinking: false,
            search: false,
        }
    }

    pub fn with_thinking(mut self, thinking: bool) -> Self {
        self.thinking = thinking;
        self
    }

    pub fn with_search(mut self, search: bool) -> Self {
        self.search = search;
        self
    }

    /// Resolve the wire payload; bad flag strings are `InvalidRequest`
    pub fn from_payload(payload: &GeneratePayload) -> Result<Self, EngineError> {
        Ok(Self {
            prompt: payload.prompt.clone(),
            mode: payload.mode.clone(),
            thinking: payload.thinking()?,
            search: payload.search()?,
        })
    }
}

/// One worker's turn inside a generate call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Round {
    pub round: usize,
    pub worker: usize,
    pub input: String,
    pub answer: String,
    pub summary: Option<String>,
    pub questions: Option<String>,
}

impl Round {
    pub fn new(round: usize, worker: usize, input: impl Into<String>, answer: impl Into<String>) -> Self {
        Self {
            round,
            worker,
            input: input.into(),
            answer: answer.into(),
            summary: None,
            questions: None,
        }
    }
}

/// Result of a generate call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Generation {
    pub answer: String,
    pub rounds: Vec<Round>,
}

/// Setup, generate and shutdown for one strategy
#[async_trait]
pub trait Pipeline: Send + Sync {
    fn kind(&self) -> PipelineKind;

    fn session(&self) -> &Session;

    async fn setup(&mut self, models: Vec<String>, scope: &RequestScope)
        -> Result<(), EngineError>;

    async fn generate(
        &mut self,
        request: &GenerateRequest,
        scope: &RequestScope,
    ) -> Result<Generation, EngineError>;

    /// Best effort and idempotent; failures are logged, not returned
    async fn shutdown(&mut self) -> Result<(), EngineError>;
}

/// Fresh, idle pipeline of the given kind
pub fn build(kind: PipelineKind, services: Arc<Services>) -> Box<dyn Pipeline> {
    let session = Session::new(kind, services);
    match kind {
        PipelineKind::Simple => Box::new(SimplePipeline::new(session)),
        PipelineKind::Chain => Box::new(ChainPipeline::new(session)),
        PipelineKind::Debate => Box::new(DebatePipeline::new(session)),
    }
}

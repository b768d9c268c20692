//! Inference Client Adapter
//!
//! Every worker exposes an OpenAI-compatible API. The [`InferenceClient`]
//! trait issues chat-completion and embedding calls against the endpoint it
//! is handed; clients hold no per-worker state, so one client serves every
//! worker of every session.
//!
//! Reproducibility parameters are fixed for all calls: `seed = 0` and
//! `temperature = 0.1`. The token budget comes from the resolved prompt mode.

use async_trait::async_trait;
use sdk::errors::EngineError;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::container::Endpoint;

pub mod openai;

pub use openai::OpenAICompatClient;

/// Seed sent with every completion
pub const SEED: i64 = 0;

/// Sampling temperature sent with every completion
pub const TEMPERATURE: f32 = 0.1;

/// Result type for inference operations
pub type Result<T> = std::result::Result<T, LLMError>;

/// Errors that can occur while talking to a worker
#[derive(Debug, thiserror::Error)]
pub enum LLMError {
    #[error("Worker unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Timeout")]
    Timeout,

    #[error("Parse error: {0}")]
    ParseError(String),
}

impl From<LLMError> for EngineError {
    fn from(err: LLMError) -> Self {
        EngineError::Generation(err.to_string())
    }
}

/// Message in a chat request
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    /// Role of the message sender (user, assistant, system)
    pub role: MessageRole,

    /// Content of the message
    pub content: String,
}

impl Message {
    /// Create a new user message
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }

    /// Create a new assistant message
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
        }
    }

    /// Create a new system message
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
        }
    }
}

/// Role of a message sender
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

impl fmt::Display for MessageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageRole::User => write!(f, "user"),
            MessageRole::Assistant => write!(f, "assistant"),
            MessageRole::System => write!(f, "system"),
        }
    }
}

/// One chat-completion call
#[derive(Debug, Clone, PartialEq)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<Message>,
    pub max_tokens: u32,
}

impl ChatRequest {
    pub fn new(model: impl Into<String>, max_tokens: u32) -> Self {
        Self {
            model: model.into(),
            messages: Vec::new(),
            max_tokens,
        }
    }

    /// System prompt followed by one user prompt
    pub fn simple(
        model: impl Into<String>,
        system: impl Into<String>,
        user: impl Into<String>,
        max_tokens: u32,
    ) -> Self {
        Self::new(model, max_tokens).system(system).user(user)
    }

    pub fn system(mut self, content: impl Into<String>) -> Self {
        self.messages.push(Message::system(content));
        self
    }

    pub fn user(mut self, content: impl Into<String>) -> Self {
        self.messages.push(Message::user(content));
        self
    }

    /// Content of the first system message, if any
    pub fn system_prompt(&self) -> Option<&str> {
        self.messages
            .iter()
            .find(|m| m.role == MessageRole::System)
            .map(|m| m.content.as_str())
    }
}

/// Chat and embedding calls against a worker endpoint
#[async_trait]
pub trait InferenceClient: Send + Sync {
    /// Run a chat completion and return the first choice's text
    async fn complete_chat(&self, endpoint: &Endpoint, request: &ChatRequest) -> Result<String>;

    /// Embed `text` with `model`
    async fn embed(&self, endpoint: &Endpoint, text: &str, model: &str) -> Result<Vec<f32>>;
}

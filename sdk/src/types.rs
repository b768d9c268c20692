//! HTTP request and response bodies
//!
//! Browser clients send `thinking` and `search` as strings, other clients send
//! JSON booleans. Both are accepted by [`Flag`]; parsing to `bool` happens in
//! [`GeneratePayload::thinking`] / [`GeneratePayload::search`] so a bad value
//! can be reported separately from a malformed body.

use serde::{Deserialize, Serialize};

use crate::errors::EngineError;

/// Body of a pipeline setup request
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SetupRequest {
    /// Model file names, one worker per entry, in worker order
    pub models: Vec<String>,
}

/// A boolean that may arrive as a JSON bool or as a string
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum Flag {
    Bool(bool),
    Text(String),
}

impl Flag {
    /// Resolve to a `bool`
    ///
    /// Accepts `1`, `t`, `true`, `0`, `f`, `false` in any case. An empty
    /// string counts as `false`.
    pub fn resolve(&self, field: &str) -> Result<bool, EngineError> {
        match self {
            Flag::Bool(value) => Ok(*value),
            Flag::Text(text) => match text.trim().to_ascii_lowercase().as_str() {
                "1" | "t" | "true" => Ok(true),
                "" | "0" | "f" | "false" => Ok(false),
                other => Err(EngineError::InvalidRequest(format!(
                    "'{}' is not a valid boolean for '{}'",
                    other, field
                ))),
            },
        }
    }
}

impl From<bool> for Flag {
    fn from(value: bool) -> Self {
        Flag::Bool(value)
    }
}

/// Body of a generate request
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GeneratePayload {
    /// The user's question
    pub prompt: String,

    /// Prompt mode name (simple, cot, tot, got, moe, thinkinghats, goe)
    #[serde(default)]
    pub mode: String,

    /// Ask the first worker for preliminary thoughts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<Flag>,

    /// Fold web search results into the additional context
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search: Option<Flag>,
}

impl GeneratePayload {
    /// Create a payload with both flags off
    pub fn new(prompt: impl Into<String>, mode: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            mode: mode.into(),
            thinking: None,
            search: None,
        }
    }

    /// Resolved `thinking` flag, `false` when absent
    pub fn thinking(&self) -> Result<bool, EngineError> {
        self.thinking
            .as_ref()
            .map_or(Ok(false), |flag| flag.resolve("thinking"))
    }

    /// Resolved `search` flag, `false` when absent
    pub fn search(&self) -> Result<bool, EngineError> {
        self.search
            .as_ref()
            .map_or(Ok(false), |flag| flag.resolve("search"))
    }
}

/// Body returned by a successful generate request
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnswerResponse {
    pub answer: String,
}

/// Body returned by `/getmodels`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelsResponse {
    pub models: Vec<String>,
}

/// Body returned with every non-2xx response
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorBody {
    pub error: String,
    pub hint: String,
}

//! Session tools
//!
//! Tools a session may consult while building a round's additional context.
//! Only web search exists today; the built-in implementation is disabled and
//! contributes nothing, so `search = true` requests still succeed.

use async_trait::async_trait;
use sdk::errors::EngineError;

/// Web search used when a generate request sets `search`
#[async_trait]
pub trait WebSearch: Send + Sync {
    /// Result snippets for `query`, best first
    async fn search(&self, query: &str) -> Result<Vec<String>, EngineError>;
}

/// Search that is switched off and always returns nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledSearch;

#[async_trait]
impl WebSearch for DisabledSearch {
    async fn search(&self, query: &str) -> Result<Vec<String>, EngineError> {
        tracing::debug!(query_len = query.len(), "Web search is disabled");
        Ok(Vec::new())
    }
}

/// Tools available to a session
#[derive(Clone)]
pub struct ToolSet {
    pub search: std::sync::Arc<dyn WebSearch>,
}

impl Default for ToolSet {
    fn default() -> Self {
        Self {
            search: std::sync::Arc::new(DisabledSearch),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_disabled_search_is_empty() {
        let tools = ToolSet::default();

        assert!(tools.search.search("rust async").await.unwrap().is_empty());
    }
}

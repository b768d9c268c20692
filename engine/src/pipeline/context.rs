//! ContextBox
//!
//! Prompting state carried between the rounds of one generate call: the
//! pristine system-prompt template, preliminary thoughts, conversation
//! history, follow-up questions and the search/tool result slots.
//!
//! Each round moves through `Unfilled -> Filled -> Consumed`. [`ContextBox::fill`]
//! substitutes the template exactly once per round and always starts from
//! the pristine template, never from a previous round's output. A second
//! fill in the same round is rejected with `TemplateAlreadyFilled`.

use sdk::errors::EngineError;

/// Substituted when a slot has nothing to offer
pub const NONE: &str = "None";

/// Where the current round is in its use of the system prompt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundState {
    Unfilled,
    Filled,
    Consumed,
}

/// Accumulated prompting state for one session
#[derive(Debug, Clone)]
pub struct ContextBox {
    template: String,
    filled: Option<String>,
    state: RoundState,
    thoughts: String,
    prompt: String,
    history: Vec<String>,
    future_questions: String,
    search_results: Vec<String>,
    tool_results: Vec<String>,
}

impl Default for ContextBox {
    fn default() -> Self {
        Self {
            template: String::new(),
            filled: None,
            state: RoundState::Unfilled,
            thoughts: NONE.to_string(),
            prompt: String::new(),
            history: Vec::new(),
            future_questions: String::new(),
            search_results: Vec::new(),
            tool_results: Vec::new(),
        }
    }
}

impl ContextBox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset for a new generate call with a freshly resolved template
    pub fn begin_generate(&mut self, template: impl Into<String>, prompt: impl Into<String>) {
        *self = Self {
            template: template.into(),
            prompt: prompt.into(),
            ..Self::default()
        };
    }

    /// Start the next round; the next [`fill`](Self::fill) reads the pristine template again
    pub fn begin_round(&mut self) {
        self.filled = None;
        self.state = RoundState::Unfilled;
    }

    /// Substitute thoughts, additional context and `previous_answer` into the template
    ///
    /// An empty `previous_answer` becomes `"None"`.
    pub fn fill(&mut self, previous_answer: &str) -> Result<String, EngineError> {
        if self.state != RoundState::Unfilled {
            return Err(EngineError::TemplateAlreadyFilled);
        }

        let previous_answer = if previous_answer.trim().is_empty() {
            NONE
        } else {
            previous_answer
        };
        let context = self.additional_context();

        let filled = substitute(
            &self.template,
            &[
                ("thoughts", self.thoughts.as_str()),
                ("context", context.as_str()),
                ("previous_answer", previous_answer),
            ],
        );

        self.filled = Some(filled.clone());
        self.state = RoundState::Filled;
        Ok(filled)
    }

    /// Mark the filled prompt as sent
    pub fn consume(&mut self) -> Result<(), EngineError> {
        match self.state {
            RoundState::Filled | RoundState::Consumed => {
                self.state = RoundState::Consumed;
                Ok(())
            }
            RoundState::Unfilled => Err(EngineError::InvalidTransition {
                from: "unfilled".to_string(),
                to: "consumed".to_string(),
            }),
        }
    }

    /// Retrieval and search results joined; `"None"` when there are none
    pub fn additional_context(&self) -> String {
        let parts: Vec<&str> = self
            .tool_results
            .iter()
            .chain(self.search_results.iter())
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .collect();

        if parts.is_empty() {
            NONE.to_string()
        } else {
            parts.join("\n")
        }
    }

    /// Clear per-call history once a generate call ends
    pub fn end_generate(&mut self) {
        self.history.clear();
        self.begin_round();
    }

    pub fn state(&self) -> RoundState {
        self.state
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    /// This round's filled system prompt, if it has been filled
    pub fn filled(&self) -> Option<&str> {
        self.filled.as_deref()
    }

    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    pub fn thoughts(&self) -> &str {
        &self.thoughts
    }

    pub fn set_thoughts(&mut self, thoughts: impl Into<String>) {
        let thoughts = thoughts.into();
        self.thoughts = if thoughts.trim().is_empty() {
            NONE.to_string()
        } else {
            thoughts
        };
    }

    pub fn history(&self) -> &[String] {
        &self.history
    }

    pub fn push_history(&mut self, entry: impl Into<String>) {
        self.history.push(entry.into());
    }

    pub fn future_questions(&self) -> &str {
        &self.future_questions
    }

    pub fn set_future_questions(&mut self, questions: impl Into<String>) {
        self.future_questions = questions.into();
    }

    pub fn set_search_results(&mut self, results: Vec<String>) {
        self.search_results = results;
    }

    pub fn push_tool_result(&mut self, result: impl Into<String>) {
        self.tool_results.push(result.into());
    }
}

/// Replace `{name}` tokens in one left-to-right pass
///
/// Substituted values are never rescanned, and unknown tokens are kept
/// verbatim.
fn substitute(template: &str, values: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];

        let replaced = after.find('}').and_then(|close| {
            let name = &after[..close];
            values
                .iter()
                .find(|(key, _)| *key == name)
                .map(|(_, value)| (*value, close))
        });

        match replaced {
            Some((value, close)) => {
                out.push_str(value);
                rest = &after[close + 1..];
            }
            None => {
                out.push('{');
                rest = after;
            }
        }
    }

    out.push_str(rest);
    out
}

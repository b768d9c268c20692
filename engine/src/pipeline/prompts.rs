//! Prompt mode catalog
//!
//! Maps a request's `mode` to a system-prompt template and a token budget.
//! The table is plain data; unknown modes fall back to the simple template
//! with a deliberately small budget.
//!
//! Templates use three named placeholders, substituted once per round by
//! the context box: `{thoughts}`, `{context}` and `{previous_answer}`.

/// Template and budget resolved for one generate call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedPrompt {
    pub mode: &'static str,
    pub template: &'static str,
    pub max_tokens: u32,
}

const SIMPLE: &str = "You are a helpful assistant running as a small language model. \
Answer the user's question clearly and concisely.\n\
Preliminary thoughts: {thoughts}\n\
Additional context: {context}\n\
Previous answer: {previous_answer}";

const COT: &str = "You are a careful reasoner. Work through the user's question step by step, \
writing out each intermediate step before giving a final answer.\n\
Preliminary thoughts: {thoughts}\n\
Additional context: {context}\n\
Previous answer: {previous_answer}";

const TOT: &str = "You are exploring a tree of thoughts. Propose several distinct lines of \
reasoning for the user's question, evaluate each one, discard the weak branches and expand \
the most promising branch into a final answer.\n\
Preliminary thoughts: {thoughts}\n\
Additional context: {context}\n\
Previous answer: {previous_answer}";

const GOT: &str = "You are reasoning over a graph of thoughts. Break the user's question into \
ideas, connect ideas that support or contradict one another, merge the strongest connected \
ideas and state the answer they lead to.\n\
Preliminary thoughts: {thoughts}\n\
Additional context: {context}\n\
Previous answer: {previous_answer}";

const MOE: &str = "You are a panel of experts. Decide which fields of expertise the user's \
question needs, answer briefly as each expert, then combine the experts' answers into one \
final answer.\n\
Preliminary thoughts: {thoughts}\n\
Additional context: {context}\n\
Previous answer: {previous_answer}";

const THINKING_HATS: &str = "You are using the six thinking hats. Consider the user's question \
in turn with facts (white), feelings (red), risks (black), benefits (yellow), alternatives \
(green) and process (blue), then give a balanced final answer.\n\
Preliminary thoughts: {thoughts}\n\
Additional context: {context}\n\
Previous answer: {previous_answer}";

const GOE: &str = "You are a graph of experts. Pick the experts the user's question needs, let \
each expert build on or challenge the others' conclusions, and report the answer the experts \
converge on.\n\
Preliminary thoughts: {thoughts}\n\
Additional context: {context}\n\
Previous answer: {previous_answer}";

/// Budget for modes the catalog does not know
pub const FALLBACK_MAX_TOKENS: u32 = 100;

const MODES: &[ResolvedPrompt] = &[
    ResolvedPrompt {
        mode: "simple",
        template: SIMPLE,
        max_tokens: 1024,
    },
    ResolvedPrompt {
        mode: "cot",
        template: COT,
        max_tokens: 4096,
    },
    ResolvedPrompt {
        mode: "tot",
        template: TOT,
        max_tokens: 32768,
    },
    ResolvedPrompt {
        mode: "got",
        template: GOT,
        max_tokens: 32768,
    },
    ResolvedPrompt {
        mode: "moe",
        template: MOE,
        max_tokens: 32768,
    },
    ResolvedPrompt {
        mode: "thinkinghats",
        template: THINKING_HATS,
        max_tokens: 32768,
    },
    ResolvedPrompt {
        mode: "goe",
        template: GOE,
        max_tokens: 32768,
    },
];

/// System prompt for the optional thinking step
pub const THINKING_SYSTEM: &str = "You are an intelligent small language model. \
You answer problems in a simple manner. \
First think through this problem and return your thoughts.";

/// System prompt for chain summaries; carries no placeholders
pub const SUMMARIZER_SYSTEM: &str = "You are a helpful assistant running as a small language \
model. Answer clearly and concisely.";

/// Chain hop: condense an answer for the next worker
pub fn summarize_prompt(answer: &str) -> String {
    format!(
        "Summarize the following answer so another model can build on it. \
         Keep every fact and conclusion, drop repetition.\n\nAnswer: {}",
        answer
    )
}

/// Chain hop: questions the next worker should address
pub fn questions_prompt(summary: &str) -> String {
    format!(
        "Given this answer, {}, can you generate five questions to ask someone else, \
         that pertain to the question? Your goal is to be concise while still maintaining \
         the original message.",
        summary
    )
}

/// Debate turn: summary handed to the next speaker
pub fn debate_summary_prompt(answer: &str) -> String {
    format!("Given this answer {}, can you summarize it", answer)
}

/// Mode lookup table
#[derive(Debug, Clone, Copy)]
pub struct PromptCatalog {
    modes: &'static [ResolvedPrompt],
}

impl Default for PromptCatalog {
    fn default() -> Self {
        Self { modes: MODES }
    }
}

impl PromptCatalog {
    /// Resolve `mode` (case-insensitive); unknown modes get the simple
    /// template with [`FALLBACK_MAX_TOKENS`]
    pub fn resolve(&self, mode: &str) -> ResolvedPrompt {
        let mode = mode.trim();
        self.modes
            .iter()
            .find(|entry| entry.mode.eq_ignore_ascii_case(mode))
            .copied()
            .unwrap_or(ResolvedPrompt {
                mode: "simple",
                template: SIMPLE,
                max_tokens: FALLBACK_MAX_TOKENS,
            })
    }

    pub fn modes(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.modes.iter().map(|entry| entry.mode)
    }
}

//! Chain pipeline: a sequential relay across workers
//!
//! Hop `i` answers the question with the previous hop's answer filled in
//! as the previous answer and the previous hop's questions as an extra user
//! message. Every hop but the last then makes two more calls: a summary
//! (appended to the conversation history) and five follow-up questions.
//! The last hop's answer is returned.
//!
//! Worker `i` is stopped before worker `i + 1` starts. Worker 0 is started
//! again at the end so the next generate call begins warm.

use async_trait::async_trait;
use sdk::errors::EngineError;
use tracing::{info, warn};

use super::prompts::{questions_prompt, summarize_prompt, ResolvedPrompt, SUMMARIZER_SYSTEM};
use super::{GenerateRequest, Generation, Pipeline, PipelineKind, Round, Session};
use crate::scope::RequestScope;

pub struct ChainPipeline {
    session: Session,
}

impl ChainPipeline {
    pub fn new(session: Session) -> Self {
        Self { session }
    }

    async fn relay(
        &mut self,
        resolved: ResolvedPrompt,
        scope: &RequestScope,
    ) -> Result<Generation, EngineError> {
        let session = &mut self.session;
        let hops = session.worker_count();
        let prompt = session.context().prompt().to_string();
        let max_tokens = resolved.max_tokens;

        let mut previous = String::new();
        let mut answer = String::new();
        let mut rounds = Vec::with_capacity(hops);

        for i in 0..hops {
            info!(session = %session.id(), worker = i, hops, "Chain hop");
            session.ensure_serving(i, scope).await?;

            session.context_mut().begin_round();
            let system = session.context_mut().fill(&previous)?;
            let mut request = session
                .chat_request(i, max_tokens)
                .system(system.clone())
                .user(prompt.clone());
            let questions_in = session.context().future_questions().to_string();
            if !questions_in.is_empty() {
                request = request.user(questions_in);
            }

            answer = session.complete(i, &request, scope).await?;
            session.context_mut().consume()?;
            previous = answer.clone();
            let mut round = Round::new(0, i, prompt.clone(), answer.clone());

            if i + 1 < hops {
                let summarize = session
                    .chat_request(i, max_tokens)
                    .system(SUMMARIZER_SYSTEM)
                    .user(summarize_prompt(&answer));
                let summary = session.complete(i, &summarize, scope).await?;
                session.context_mut().push_history(summary.clone());

                let ask = session
                    .chat_request(i, max_tokens)
                    .system(system)
                    .user(questions_prompt(&summary));
                let questions = session.complete(i, &ask, scope).await?;
                session.context_mut().set_future_questions(questions.clone());

                round.summary = Some(summary);
                round.questions = Some(questions);
            }

            rounds.push(round);
            session.stop_worker(i).await;
        }

        if let Err(e) = session.start_worker(0, scope).await {
            warn!(session = %session.id(), error = %e, "Failed to restart worker 0 for the next run");
        }

        Ok(Generation { answer, rounds })
    }
}

#[async_trait]
impl Pipeline for ChainPipeline {
    fn kind(&self) -> PipelineKind {
        PipelineKind::Chain
    }

    fn session(&self) -> &Session {
        &self.session
    }

    async fn setup(
        &mut self,
        models: Vec<String>,
        scope: &RequestScope,
    ) -> Result<(), EngineError> {
        let policy = self.kind().start_policy();
        self.session.setup(models, policy, scope).await
    }

    async fn generate(
        &mut self,
        request: &GenerateRequest,
        scope: &RequestScope,
    ) -> Result<Generation, EngineError> {
        let resolved = self.session.begin_generate(request, scope).await?;
        let result = self.relay(resolved, scope).await;
        self.session.finish_generate(result.is_ok()).await;
        result
    }

    async fn shutdown(&mut self) -> Result<(), EngineError> {
        self.session.shutdown().await
    }
}

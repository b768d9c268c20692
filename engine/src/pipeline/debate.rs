//! Debate pipeline: fixed rounds of round-robin answers
//!
//! In every round each worker answers with the running summary filled in as
//! the previous answer (and sent again as an extra user message), then
//! summarizes its own answer. That summary becomes the running summary for
//! the next speaker. The last summary of the last round is returned.
//!
//! Calls per generate: `2 * rounds * workers`.

use async_trait::async_trait;
use sdk::errors::EngineError;
use tracing::{info, warn};

use super::prompts::{debate_summary_prompt, ResolvedPrompt};
use super::{GenerateRequest, Generation, Pipeline, PipelineKind, Round, Session};
use crate::scope::RequestScope;

pub struct DebatePipeline {
    session: Session,
}

impl DebatePipeline {
    pub fn new(session: Session) -> Self {
        Self { session }
    }

    async fn debate(
        &mut self,
        resolved: ResolvedPrompt,
        scope: &RequestScope,
    ) -> Result<Generation, EngineError> {
        let session = &mut self.session;
        let speakers = session.worker_count();
        let total_rounds = session.settings().debate_rounds;
        let prompt = session.context().prompt().to_string();
        let max_tokens = resolved.max_tokens;

        let mut summary = String::new();
        let mut rounds = Vec::with_capacity(total_rounds * speakers);

        for round in 0..total_rounds {
            info!(session = %session.id(), round = round + 1, total_rounds, "Debate round");

            for i in 0..speakers {
                session.ensure_serving(i, scope).await?;

                session.context_mut().begin_round();
                let system = session.context_mut().fill(&summary)?;
                let mut request = session
                    .chat_request(i, max_tokens)
                    .system(system.clone())
                    .user(prompt.clone());
                let carried = session.context().future_questions().to_string();
                if !carried.is_empty() {
                    request = request.user(carried);
                }

                let answer = session.complete(i, &request, scope).await?;
                session.context_mut().consume()?;

                let summarize = session
                    .chat_request(i, max_tokens)
                    .system(system)
                    .user(debate_summary_prompt(&answer));
                summary = session.complete(i, &summarize, scope).await?;
                session.context_mut().set_future_questions(summary.clone());

                let mut turn = Round::new(round, i, prompt.clone(), answer);
                turn.summary = Some(summary.clone());
                rounds.push(turn);

                session.stop_worker(i).await;
            }
        }

        // leave every worker running for the next call, as after setup
        for i in 0..speakers {
            if let Err(e) = session.start_worker(i, scope).await {
                warn!(session = %session.id(), worker = i, error = %e, "Failed to restart worker");
            }
        }

        Ok(Generation {
            answer: summary,
            rounds,
        })
    }
}

#[async_trait]
impl Pipeline for DebatePipeline {
    fn kind(&self) -> PipelineKind {
        PipelineKind::Debate
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
        let result = self.debate(resolved, scope).await;
        self.session.finish_generate(result.is_ok()).await;
        result
    }

    async fn shutdown(&mut self) -> Result<(), EngineError> {
        self.session.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{Services, SessionSettings};
    use crate::testkit::{FakeRuntime, ScriptedInference, StaticProbe};
    use std::sync::Arc;
    use std::time::Duration;

    fn pipeline(
        runtime: &FakeRuntime,
        inference: &ScriptedInference,
        rounds: usize,
    ) -> DebatePipeline {
        let settings = SessionSettings {
            debate_rounds: rounds,
            ..SessionSettings::default()
        };
        let services = Arc::new(Services::new(
            Arc::new(runtime.clone()),
            Arc::new(inference.clone()),
            Arc::new(StaticProbe::ready_after(0)),
            settings,
        ));
        DebatePipeline::new(Session::new(PipelineKind::Debate, services))
    }

    fn models(n: usize) -> Vec<String> {
        (1..=n).map(|i| format!("m{}", i)).collect()
    }

    fn scope() -> RequestScope {
        RequestScope::detached(Duration::from_secs(60))
    }

    #[tokio::test]
    async fn test_setup_starts_every_worker() {
        let runtime = FakeRuntime::new();
        let inference = ScriptedInference::new();
        let mut pipeline = pipeline(&runtime, &inference, 3);

        pipeline.setup(models(3), &scope()).await.unwrap();

        assert_eq!(runtime.running().len(), 3);
    }

    #[tokio::test]
    async fn test_call_count_is_round_major() {
        for (n, rounds) in [(1, 1), (2, 3), (3, 2)] {
            let runtime = FakeRuntime::new();
            let inference = ScriptedInference::new();
            let mut pipeline = pipeline(&runtime, &inference, rounds);
            pipeline.setup(models(n), &scope()).await.unwrap();

            let generation = pipeline
                .generate(&GenerateRequest::new("q", "simple"), &scope())
                .await
                .unwrap();

            let ports = inference.ports();
            assert_eq!(ports.len(), 2 * rounds * n);

            let expected: Vec<u16> = (0..rounds)
                .flat_map(|_| (0..n).flat_map(|i| [8000 + i as u16; 2]))
                .collect();
            assert_eq!(ports, expected);
            assert_eq!(generation.answer, format!("answer {}", 2 * rounds * n));
        }
    }

    #[tokio::test]
    async fn test_summary_seeds_next_speaker() {
        let runtime = FakeRuntime::new();
        let inference = ScriptedInference::new();
        let mut pipeline = pipeline(&runtime, &inference, 1);
        pipeline.setup(models(2), &scope()).await.unwrap();

        pipeline
            .generate(&GenerateRequest::new("q", "simple"), &scope())
            .await
            .unwrap();

        let calls = inference.calls();
        assert_eq!(calls[0].request.messages.len(), 2);
        assert_eq!(
            calls[1].request.messages[1].content,
            "Given this answer answer 1, can you summarize it"
        );
        let second = &calls[2].request;
        assert!(second.system_prompt().unwrap().contains("Previous answer: answer 2"));
        assert_eq!(second.messages[2].content, "answer 2");
    }

    #[tokio::test]
    async fn test_workers_restarted_after_generate() {
        let runtime = FakeRuntime::new();
        let inference = ScriptedInference::new();
        let mut pipeline = pipeline(&runtime, &inference, 2);
        pipeline.setup(models(2), &scope()).await.unwrap();

        pipeline
            .generate(&GenerateRequest::new("q", "simple"), &scope())
            .await
            .unwrap();

        assert_eq!(runtime.running().len(), 2);
    }
}

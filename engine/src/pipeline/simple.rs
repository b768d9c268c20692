//! Simple pipeline: one worker answers once

use async_trait::async_trait;
use sdk::errors::EngineError;

use super::prompts::ResolvedPrompt;
use super::{GenerateRequest, Generation, Pipeline, PipelineKind, Round, Session};
use crate::scope::RequestScope;

pub struct SimplePipeline {
    session: Session,
}

impl SimplePipeline {
    pub fn new(session: Session) -> Self {
        Self { session }
    }

    async fn answer(
        &mut self,
        resolved: ResolvedPrompt,
        scope: &RequestScope,
    ) -> Result<Generation, EngineError> {
        let session = &mut self.session;
        session.ensure_serving(0, scope).await?;

        session.context_mut().begin_round();
        let system = session.context_mut().fill("")?;
        let prompt = session.context().prompt().to_string();
        let request = session
            .chat_request(0, resolved.max_tokens)
            .system(system)
            .user(prompt.clone());

        let answer = session.complete(0, &request, scope).await?;
        session.context_mut().consume()?;

        Ok(Generation {
            answer: answer.clone(),
            rounds: vec![Round::new(0, 0, prompt, answer)],
        })
    }
}

#[async_trait]
impl Pipeline for SimplePipeline {
    fn kind(&self) -> PipelineKind {
        PipelineKind::Simple
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
        let result = self.answer(resolved, scope).await;
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
    use crate::container::WorkerState;
    use crate::llm::MessageRole;
    use crate::pipeline::{Services, SessionSettings};
    use crate::testkit::{FakeRuntime, ScriptedInference, StaticProbe};
    use std::sync::Arc;
    use std::time::Duration;

    fn pipeline(runtime: &FakeRuntime, inference: &ScriptedInference) -> SimplePipeline {
        let services = Arc::new(Services::new(
            Arc::new(runtime.clone()),
            Arc::new(inference.clone()),
            Arc::new(StaticProbe::ready_after(0)),
            SessionSettings::default(),
        ));
        SimplePipeline::new(Session::new(PipelineKind::Simple, services))
    }

    fn scope() -> RequestScope {
        RequestScope::detached(Duration::from_secs(60))
    }

    #[tokio::test]
    async fn test_one_call_with_filled_template() {
        let runtime = FakeRuntime::new();
        let inference = ScriptedInference::new();
        let mut pipeline = pipeline(&runtime, &inference);
        pipeline.setup(vec!["m1".to_string()], &scope()).await.unwrap();

        let generation = pipeline
            .generate(&GenerateRequest::new("hello", "simple"), &scope())
            .await
            .unwrap();

        let calls = inference.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(generation.answer, "answer 1");
        assert_eq!(calls[0].request.max_tokens, 1024);
        assert_eq!(calls[0].request.model, "m1");

        let system = calls[0].request.system_prompt().unwrap();
        assert!(system.contains("Previous answer: None"));
        assert!(!system.contains("{thoughts}"));
        assert_eq!(calls[0].request.messages[1].role, MessageRole::User);
        assert_eq!(calls[0].request.messages[1].content, "hello");
    }

    #[tokio::test]
    async fn test_repeated_generate_refills_each_time() {
        let runtime = FakeRuntime::new();
        let inference = ScriptedInference::new();
        let mut pipeline = pipeline(&runtime, &inference);
        pipeline.setup(vec!["m1".to_string()], &scope()).await.unwrap();

        for _ in 0..3 {
            pipeline
                .generate(&GenerateRequest::new("hello", "cot"), &scope())
                .await
                .unwrap();
        }

        let calls = inference.calls();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[0].request.system_prompt(), calls[2].request.system_prompt());
        assert_eq!(pipeline.session().workers()[0].state(), WorkerState::Serving);
    }

    #[tokio::test]
    async fn test_thinking_adds_one_call() {
        let runtime = FakeRuntime::new();
        let inference = ScriptedInference::new();
        let mut pipeline = pipeline(&runtime, &inference);
        pipeline.setup(vec!["m1".to_string()], &scope()).await.unwrap();

        let request = GenerateRequest::new("hello", "simple").with_thinking(true);
        let generation = pipeline.generate(&request, &scope()).await.unwrap();

        let calls = inference.calls();
        assert_eq!(calls.len(), 2);
        assert!(calls[1]
            .request
            .system_prompt()
            .unwrap()
            .contains("Preliminary thoughts: answer 1"));
        assert_eq!(generation.answer, "answer 2");
    }

    #[tokio::test]
    async fn test_failed_generation_keeps_session_ready() {
        let runtime = FakeRuntime::new();
        let inference = ScriptedInference::failing_on(1);
        let mut pipeline = pipeline(&runtime, &inference);
        pipeline.setup(vec!["m1".to_string()], &scope()).await.unwrap();

        let result = pipeline
            .generate(&GenerateRequest::new("hello", "simple"), &scope())
            .await;
        assert!(matches!(result, Err(EngineError::Generation(_))));
        assert_eq!(pipeline.session().state(), crate::pipeline::SessionState::Ready);

        let retry = pipeline
            .generate(&GenerateRequest::new("hello", "simple"), &scope())
            .await
            .unwrap();
        assert_eq!(retry.answer, "answer 2");
    }
}

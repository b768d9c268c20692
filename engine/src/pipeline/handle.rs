//! Single-flight access to a pipeline
//!
//! A [`SessionHandle`] owns one pipeline slot. Each call takes the slot's
//! lock without waiting; a second concurrent call gets `SessionBusy`.
//!
//! The work itself runs on a spawned task that holds the lock. If the
//! caller goes away, the task keeps the pipeline until it has finished its
//! state transition, while the dropped cancel handle makes every readiness
//! poll and completion inside it return `Cancelled` promptly.

use sdk::errors::EngineError;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::{build, GenerateRequest, Generation, Pipeline, PipelineKind, Services, SessionState};
use crate::scope::RequestScope;

#[derive(Clone)]
pub struct SessionHandle {
    kind: PipelineKind,
    services: Arc<Services>,
    pipeline: Arc<Mutex<Box<dyn Pipeline>>>,
}

impl SessionHandle {
    pub fn new(kind: PipelineKind, services: Arc<Services>) -> Self {
        let pipeline = build(kind, services.clone());
        Self {
            kind,
            services,
            pipeline: Arc::new(Mutex::new(pipeline)),
        }
    }

    pub fn kind(&self) -> PipelineKind {
        self.kind
    }

    fn try_claim(&self) -> Result<OwnedMutexGuard<Box<dyn Pipeline>>, EngineError> {
        self.pipeline
            .clone()
            .try_lock_owned()
            .map_err(|_| EngineError::SessionBusy)
    }

    /// Current session state, `None` while a call is in flight
    pub fn state(&self) -> Option<SessionState> {
        self.pipeline
            .try_lock()
            .ok()
            .map(|pipeline| pipeline.session().state())
    }

    /// Set up the pipeline; a torn-down pipeline is replaced by a fresh one first
    pub async fn setup(&self, models: Vec<String>, scope: RequestScope) -> Result<(), EngineError> {
        let mut guard = self.try_claim()?;
        let kind = self.kind;
        let services = self.services.clone();

        let task = tokio::spawn(async move {
            if guard.session().state() == SessionState::TornDown {
                *guard = build(kind, services);
            }
            guard.setup(models, &scope).await
        });

        task.await
            .map_err(|e| EngineError::Runtime(format!("setup task failed: {}", e)))?
    }

    pub async fn generate(
        &self,
        request: GenerateRequest,
        scope: RequestScope,
    ) -> Result<Generation, EngineError> {
        let mut guard = self.try_claim()?;

        let task = tokio::spawn(async move { guard.generate(&request, &scope).await });

        task.await
            .map_err(|e| EngineError::Runtime(format!("generate task failed: {}", e)))?
    }

    /// Tear the pipeline down; rejected with `SessionBusy` while a call is in flight
    pub async fn shutdown(&self) -> Result<(), EngineError> {
        let mut guard = self.try_claim()?;

        let task = tokio::spawn(async move { guard.shutdown().await });

        task.await
            .map_err(|e| EngineError::Runtime(format!("shutdown task failed: {}", e)))?
    }

    /// Wait for any in-flight call, then tear down
    pub async fn drain(&self) -> Result<(), EngineError> {
        let mut guard = self.pipeline.clone().lock_owned().await;
        guard.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::SessionSettings;
    use crate::testkit::{FakeRuntime, ScriptedInference, StaticProbe};
    use std::time::Duration;

    fn handle(runtime: &FakeRuntime, probe: StaticProbe) -> SessionHandle {
        let services = Arc::new(Services::new(
            Arc::new(runtime.clone()),
            Arc::new(ScriptedInference::new()),
            Arc::new(probe),
            SessionSettings::default(),
        ));
        SessionHandle::new(PipelineKind::Simple, services)
    }

    fn scope() -> RequestScope {
        RequestScope::detached(Duration::from_secs(600))
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_call_is_busy() {
        let runtime = FakeRuntime::new();
        let handle = handle(&runtime, StaticProbe::never());
        handle.setup(vec!["m1".to_string()], scope()).await.unwrap();

        // never ready, so this generate sits in the readiness gate
        let busy = handle.clone();
        let first = tokio::spawn(async move {
            busy.generate(GenerateRequest::new("q", "simple"), scope()).await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(handle.state().is_none());
        assert!(matches!(
            handle.generate(GenerateRequest::new("q", "simple"), scope()).await,
            Err(EngineError::SessionBusy)
        ));
        assert!(matches!(handle.shutdown().await, Err(EngineError::SessionBusy)));

        first.abort();
    }

    #[tokio::test]
    async fn test_setup_after_shutdown_uses_fresh_session() {
        let runtime = FakeRuntime::new();
        let handle = handle(&runtime, StaticProbe::ready_after(0));

        handle.setup(vec!["m1".to_string()], scope()).await.unwrap();
        handle.shutdown().await.unwrap();
        assert_eq!(handle.state(), Some(SessionState::TornDown));

        handle.setup(vec!["m1".to_string()], scope()).await.unwrap();
        assert_eq!(handle.state(), Some(SessionState::Ready));

        let specs = runtime.created_specs();
        assert_eq!(specs.len(), 2);
        assert_ne!(specs[0].session_id, specs[1].session_id);
    }

    #[tokio::test]
    async fn test_generate_before_setup() {
        let runtime = FakeRuntime::new();
        let handle = handle(&runtime, StaticProbe::ready_after(0));

        assert!(matches!(
            handle.generate(GenerateRequest::new("q", "simple"), scope()).await,
            Err(EngineError::NotSetUp)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_request_releases_session() {
        let runtime = FakeRuntime::new();
        let handle = handle(&runtime, StaticProbe::never());
        handle.setup(vec!["m1".to_string()], scope()).await.unwrap();

        let (request_scope, cancel) = RequestScope::new(Duration::from_secs(600));
        let caller = handle.clone();
        let pending = tokio::spawn(async move {
            caller
                .generate(GenerateRequest::new("q", "simple"), request_scope)
                .await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        drop(cancel);
        let result = pending.await.unwrap();

        assert!(matches!(result, Err(EngineError::Cancelled)));
        assert_eq!(handle.state(), Some(SessionState::Ready));
    }
}

//! HTTP surface
//!
//! One route family per pipeline kind (`/simple`, `/cot`, `/debate`), each
//! with `setup`, generate and `shutdown`, plus `/getmodels` and `/health`.
//!
//! Handlers build a [`RequestScope`] per request and keep its cancel handle
//! in the handler future. When the client disconnects, axum drops the future,
//! the handle goes with it, and the pipeline work sees `Cancelled`.

use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use sdk::errors::EngineError;
use sdk::types::{AnswerResponse, GeneratePayload, ModelsResponse, SetupRequest};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::models::list_models;
use crate::pipeline::{GenerateRequest, PipelineKind, Services, SessionHandle};
use crate::scope::RequestScope;

pub mod error;

pub use error::{ApiError, ApiResult};

/// Per-call deadlines and the models directory
#[derive(Debug, Clone)]
pub struct ApiSettings {
    pub setup_timeout: Duration,
    pub generate_timeout: Duration,
    pub models_dir: PathBuf,
}

impl ApiSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            setup_timeout: config.timeouts.setup(),
            generate_timeout: config.timeouts.generate(),
            models_dir: config.workers.models_dir.clone(),
        }
    }
}

/// Shared handler state: one session handle per pipeline kind
#[derive(Clone)]
pub struct AppState {
    simple: SessionHandle,
    chain: SessionHandle,
    debate: SessionHandle,
    settings: Arc<ApiSettings>,
}

impl AppState {
    pub fn new(services: Arc<Services>, settings: ApiSettings) -> Self {
        Self {
            simple: SessionHandle::new(PipelineKind::Simple, services.clone()),
            chain: SessionHandle::new(PipelineKind::Chain, services.clone()),
            debate: SessionHandle::new(PipelineKind::Debate, services),
            settings: Arc::new(settings),
        }
    }

    pub fn session(&self, kind: PipelineKind) -> &SessionHandle {
        match kind {
            PipelineKind::Simple => &self.simple,
            PipelineKind::Chain => &self.chain,
            PipelineKind::Debate => &self.debate,
        }
    }

    pub fn sessions(&self) -> [&SessionHandle; 3] {
        [&self.simple, &self.chain, &self.debate]
    }
}

/// Build the application router
pub fn router(state: AppState) -> Router {
    let mut router: Router<AppState> = Router::new()
        .route("/health", get(health))
        .route("/getmodels", get(get_models));

    for kind in PipelineKind::ALL {
        router = router
            .route(
                &format!("/{}/setup", kind),
                post(
                    move |state: State<AppState>,
                          body: Result<Json<SetupRequest>, JsonRejection>| {
                        setup(kind, state, body)
                    },
                ),
            )
            .route(
                &format!("/{}", kind),
                post(
                    move |state: State<AppState>,
                          body: Result<Json<GeneratePayload>, JsonRejection>| {
                        generate(kind, state, body)
                    },
                ),
            )
            .route(
                &format!("/{}/shutdown", kind),
                post(move |state: State<AppState>| shutdown(kind, state)),
            );
    }

    router
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve until `shutdown` resolves, then let in-flight requests finish
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> Result<(), EngineError>
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        info!("HTTP surface listening on {}", addr);
    }

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await?;

    Ok(())
}

async fn health() -> StatusCode {
    StatusCode::OK
}

async fn get_models(State(state): State<AppState>) -> ApiResult<Json<ModelsResponse>> {
    let models = list_models(&state.settings.models_dir).await.map_err(|e| {
        error!("Failed to list models in {:?}: {}", state.settings.models_dir, e);
        e
    })?;

    Ok(Json(ModelsResponse { models }))
}

async fn setup(
    kind: PipelineKind,
    State(state): State<AppState>,
    body: Result<Json<SetupRequest>, JsonRejection>,
) -> ApiResult<StatusCode> {
    let Json(request) = body?;
    let (scope, _cancel) = RequestScope::new(state.settings.setup_timeout);

    info!(pipeline = %kind, models = ?request.models, "Setup requested");
    state
        .session(kind)
        .setup(request.models, scope)
        .await
        .map_err(|e| {
            error!(pipeline = %kind, error = %e, "Setup failed");
            e
        })?;

    info!(pipeline = %kind, "Pipeline ready");
    Ok(StatusCode::OK)
}

async fn generate(
    kind: PipelineKind,
    State(state): State<AppState>,
    body: Result<Json<GeneratePayload>, JsonRejection>,
) -> ApiResult<Json<AnswerResponse>> {
    let Json(payload) = body?;
    let request = GenerateRequest::from_payload(&payload)?;
    let (scope, _cancel) = RequestScope::new(state.settings.generate_timeout);

    info!(
        pipeline = %kind,
        mode = %request.mode,
        thinking = request.thinking,
        search = request.search,
        "Generate requested"
    );
    let generation = state
        .session(kind)
        .generate(request, scope)
        .await
        .map_err(|e| {
            error!(pipeline = %kind, error = %e, "Generation failed");
            e
        })?;

    info!(pipeline = %kind, rounds = generation.rounds.len(), "Generation complete");
    Ok(Json(AnswerResponse {
        answer: generation.answer,
    }))
}

/// Always 200 unless another call holds the session
async fn shutdown(kind: PipelineKind, State(state): State<AppState>) -> ApiResult<StatusCode> {
    info!(pipeline = %kind, "Shutdown requested");

    match state.session(kind).shutdown().await {
        Ok(()) => Ok(StatusCode::OK),
        Err(EngineError::SessionBusy) => Err(EngineError::SessionBusy.into()),
        Err(e) => {
            warn!(pipeline = %kind, error = %e, "Shutdown incomplete");
            Ok(StatusCode::OK)
        }
    }
}

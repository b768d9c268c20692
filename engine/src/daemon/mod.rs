//! Daemon lifecycle management
//!
//! The [`Daemon`] wires the engine together from the configuration and runs
//! the HTTP service:
//! - Opens the worker registry (~/.slape/registry.db)
//! - Reclaims workers orphaned by an earlier crash
//! - Serves the HTTP surface until Ctrl-C or SIGTERM
//! - Tears down every live session and flushes the registry
//!
//! # Examples
//!
//! ```no_run
//! use slape_engine::config::Config;
//! use slape_engine::daemon::Daemon;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::load_or_create()?;
//! let daemon = Daemon::new(config).await?;
//! daemon.run().await?;
//! # Ok(())
//! # }
//! ```

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::TcpListener;

use crate::api::{self, ApiSettings, AppState};
use crate::config::Config;
use crate::container::{ContainerRuntime, DockerRuntime, Endpoint};
use crate::db::Database;
use crate::llm::{InferenceClient, OpenAICompatClient};
use crate::pipeline::{Services, SessionSettings};
use crate::readiness::{HealthProbe, HttpHealthProbe};
use sdk::errors::EngineError;

pub mod reconcile;

pub use reconcile::{reconcile, ReconcileReport};

/// Result type for daemon operations
pub type Result<T> = std::result::Result<T, EngineError>;

/// A configured engine, ready to serve
pub struct Daemon {
    config: Config,
    runtime: Arc<dyn ContainerRuntime>,
    database: Option<Database>,
    state: AppState,
}

impl Daemon {
    /// Build the daemon against the local Docker daemon
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP clients cannot be built or the registry
    /// cannot be opened.
    pub async fn new(config: Config) -> Result<Self> {
        let runtime = Arc::new(DockerRuntime::new(config.workers.stop_grace_secs));
        let inference = Arc::new(OpenAICompatClient::new(config.timeouts.completion())?);
        let probe = Arc::new(HttpHealthProbe::new(config.readiness.probe_timeout())?);
        let database = open_registry(&config).await?;

        Ok(Self::from_parts(config, runtime, inference, probe, database))
    }

    /// Build the daemon from explicit collaborators
    pub fn from_parts(
        config: Config,
        runtime: Arc<dyn ContainerRuntime>,
        inference: Arc<dyn InferenceClient>,
        probe: Arc<dyn HealthProbe>,
        database: Option<Database>,
    ) -> Self {
        let mut services = Services::new(
            runtime.clone(),
            inference,
            probe,
            SessionSettings::from_config(&config),
        );
        if let Some(database) = &database {
            services = services.with_registry(database.workers());
        }

        let state = AppState::new(Arc::new(services), ApiSettings::from_config(&config));

        Self {
            config,
            runtime,
            database,
            state,
        }
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Run the orphan recovery pass configured for startup
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        let registry = self.database.as_ref().map(Database::workers);
        reconcile(
            self.runtime.as_ref(),
            registry.as_ref(),
            self.config.registry.remove_orphans,
        )
        .await
    }

    /// Reconcile, serve until a shutdown signal, then shut down gracefully
    pub async fn run(self) -> Result<()> {
        if self.config.registry.reconcile_on_startup {
            match self.reconcile().await {
                Ok(report) if !report.failed.is_empty() => tracing::warn!(
                    "{} orphaned workers could not be removed: {:?}",
                    report.failed.len(),
                    report.failed
                ),
                Ok(report) => tracing::info!("Reclaimed {} orphaned workers", report.removed.len()),
                Err(e) => tracing::warn!("Startup reconciliation failed: {}", e),
            }
        }

        let listener = TcpListener::bind(&self.config.server.bind)
            .await
            .map_err(|e| {
                EngineError::Config(format!("Failed to bind {}: {}", self.config.server.bind, e))
            })?;

        let served = api::serve(listener, self.state.clone(), shutdown_signal()).await;
        if let Err(e) = &served {
            tracing::error!("HTTP server error: {}", e);
        }

        self.graceful_shutdown().await;
        served
    }

    /// Tear down every session, then flush and close the registry
    ///
    /// Each step logs its failures and the next step still runs.
    pub async fn graceful_shutdown(self) {
        tracing::info!("Starting graceful shutdown");

        // Waits for in-flight calls, bounded by their own request deadlines
        for handle in self.state.sessions() {
            tracing::info!("Tearing down {} pipeline", handle.kind());
            if let Err(e) = handle.drain().await {
                tracing::warn!("Failed to tear down {} pipeline: {}", handle.kind(), e);
            }
        }

        if let Some(database) = self.database {
            tracing::info!("Flushing SQLite WAL");
            match database.flush_wal().await {
                Ok(_) => tracing::info!("SQLite WAL flushed successfully"),
                Err(e) => tracing::error!("Failed to flush SQLite WAL: {}", e),
            }

            if let Err(e) = database.close().await {
                tracing::error!("Failed to close registry: {}", e);
            }
        } else {
            tracing::debug!("No registry to flush");
        }

        tracing::info!("Graceful shutdown completed");
    }
}

/// Open the registry if it is enabled
pub async fn open_registry(config: &Config) -> Result<Option<Database>> {
    if !config.registry.enabled {
        tracing::info!("Worker registry disabled");
        return Ok(None);
    }

    Database::new(&config.registry.path)
        .await
        .map(Some)
        .map_err(|e| EngineError::Database(e.to_string()))
}

/// Loopback endpoint of a service bound to `bind`
pub fn local_endpoint(bind: &str) -> Result<Endpoint> {
    if let Ok(addr) = bind.parse::<SocketAddr>() {
        let host = match addr.ip() {
            IpAddr::V4(ip) if ip.is_unspecified() => Ipv4Addr::LOCALHOST.to_string(),
            IpAddr::V4(ip) => ip.to_string(),
            IpAddr::V6(ip) if ip.is_unspecified() => format!("[{}]", Ipv6Addr::LOCALHOST),
            IpAddr::V6(ip) => format!("[{}]", ip),
        };
        return Ok(Endpoint::new(host, addr.port()));
    }

    let (host, port) = bind
        .rsplit_once(':')
        .and_then(|(host, port)| Some((host, port.parse::<u16>().ok()?)))
        .ok_or_else(|| EngineError::Config(format!("Invalid bind address: {}", bind)))?;
    Ok(Endpoint::new(host, port))
}

/// Fail if a service answers `/health` on `bind`
///
/// Removing orphans next to a live service would remove its workers too.
pub async fn ensure_not_serving(probe: &dyn HealthProbe, bind: &str) -> Result<()> {
    let endpoint = local_endpoint(bind)?;
    if probe.probe(&endpoint).await {
        return Err(EngineError::DaemonRunning(endpoint.to_string()));
    }

    tracing::debug!("No service answering on {}", endpoint);
    Ok(())
}

/// Resolves on Ctrl-C or, on unix, SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl-C"),
        _ = terminate => tracing::info!("Received SIGTERM signal"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{GenerateRequest, PipelineKind, SessionState};
    use crate::scope::RequestScope;
    use crate::testkit::{FakeRuntime, ScriptedInference, StaticProbe};
    use std::time::Duration;
    use tempfile::TempDir;

    async fn daemon(dir: &TempDir, runtime: &FakeRuntime) -> Daemon {
        let mut config = Config::default();
        config.registry.path = dir.path().join("registry.db");
        let database = open_registry(&config).await.unwrap();

        Daemon::from_parts(
            config,
            Arc::new(runtime.clone()),
            Arc::new(ScriptedInference::new()),
            Arc::new(StaticProbe::ready_after(0)),
            database,
        )
    }

    fn scope() -> RequestScope {
        RequestScope::detached(Duration::from_secs(60))
    }

    #[tokio::test]
    async fn test_graceful_shutdown_tears_down_sessions() {
        let dir = TempDir::new().unwrap();
        let runtime = FakeRuntime::new();
        let daemon = daemon(&dir, &runtime).await;

        let chain = daemon.state().session(PipelineKind::Chain).clone();
        chain
            .setup(vec!["m1".to_string(), "m2".to_string()], scope())
            .await
            .unwrap();
        chain
            .generate(GenerateRequest::new("q", "cot"), scope())
            .await
            .unwrap();
        assert_eq!(runtime.containers().len(), 2);

        daemon.graceful_shutdown().await;

        assert!(runtime.containers().is_empty());
        assert_eq!(chain.state(), Some(SessionState::TornDown));
    }

    #[tokio::test]
    async fn test_reconcile_after_crash() {
        let dir = TempDir::new().unwrap();
        let runtime = FakeRuntime::new();

        // first process sets up and dies without tearing down
        {
            let crashed = daemon(&dir, &runtime).await;
            let debate = crashed.state().session(PipelineKind::Debate).clone();
            debate
                .setup(vec!["m1".to_string(), "m2".to_string()], scope())
                .await
                .unwrap();
        }
        assert_eq!(runtime.running().len(), 2);

        let restarted = daemon(&dir, &runtime).await;
        let report = restarted.reconcile().await.unwrap();

        assert_eq!(report.removed.len(), 2);
        assert!(runtime.containers().is_empty());
    }

    #[test]
    fn test_local_endpoint() {
        let endpoint = local_endpoint("0.0.0.0:8080").unwrap();
        assert_eq!(endpoint.health_url(), "http://127.0.0.1:8080/health");

        let endpoint = local_endpoint("[::]:9000").unwrap();
        assert_eq!(endpoint.health_url(), "http://[::1]:9000/health");

        let endpoint = local_endpoint("localhost:8081").unwrap();
        assert_eq!(endpoint.health_url(), "http://localhost:8081/health");

        assert!(local_endpoint("no-port").is_err());
    }

    #[tokio::test]
    async fn test_reconcile_refused_while_serving() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        let probe = HttpHealthProbe::new(Duration::from_secs(1)).unwrap();

        let result = ensure_not_serving(&probe, &server.address().to_string()).await;

        assert!(matches!(result, Err(EngineError::DaemonRunning(_))));
    }

    #[tokio::test]
    async fn test_reconcile_allowed_when_nothing_serves() {
        let probe = StaticProbe::never();

        ensure_not_serving(&probe, "0.0.0.0:8080").await.unwrap();
        assert_eq!(probe.attempts(), 1);
    }

    #[tokio::test]
    async fn test_registry_disabled() {
        let mut config = Config::default();
        config.registry.enabled = false;

        assert!(open_registry(&config).await.unwrap().is_none());
    }
}

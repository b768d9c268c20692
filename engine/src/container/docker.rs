//! Docker container runtime
//!
//! Implements [`ContainerRuntime`] with bollard against the local Docker
//! daemon. Workers run the llama.cpp server image with:
//! - the models directory bind-mounted read-only at `/models`
//! - host port `<port>` published to container port `<port>`
//! - an "all GPUs" device request when GPU support is enabled
//!
//! "Not modified" (304) and "not found" (404) answers to start, stop and
//! remove mean the container is already in the requested state.

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, RemoveContainerOptions,
    StopContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{DeviceRequest, HostConfig, PortBinding};
use futures::stream::{BoxStream, StreamExt};
use sdk::errors::EngineError;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};

use super::{
    ContainerRuntime, CreatedWorker, ManagedContainer, PullProgress, WorkerSpec, LABEL_MANAGED,
    LABEL_SESSION,
};

/// Container runtime backed by the local Docker daemon
#[derive(Clone)]
pub struct DockerRuntime {
    /// Cached Docker connection (created on first use)
    docker: Arc<RwLock<Option<bollard::Docker>>>,
    /// Seconds Docker waits before killing a stopping worker
    stop_grace_secs: i64,
}

impl DockerRuntime {
    pub fn new(stop_grace_secs: u64) -> Self {
        Self {
            docker: Arc::new(RwLock::new(None)),
            stop_grace_secs: i64::try_from(stop_grace_secs).unwrap_or(i64::MAX),
        }
    }

    /// Get or create a Docker connection
    async fn docker(&self) -> Result<bollard::Docker, EngineError> {
        {
            let guard = self.docker.read().await;
            if let Some(ref d) = *guard {
                return Ok(d.clone());
            }
        }

        let docker = bollard::Docker::connect_with_local_defaults()
            .map_err(|e| EngineError::Runtime(format!("Cannot connect to Docker: {}", e)))?;
        *self.docker.write().await = Some(docker.clone());
        Ok(docker)
    }

    /// Check that the daemon answers
    pub async fn ping(&self) -> Result<(), EngineError> {
        let docker = self.docker().await?;
        docker
            .ping()
            .await
            .map_err(|e| EngineError::Runtime(format!("Docker is not responding: {}", e)))?;
        Ok(())
    }

    fn container_config(spec: &WorkerSpec) -> Config<String> {
        let port_key = format!("{}/tcp", spec.port);

        let port_bindings = HashMap::from([(
            port_key.clone(),
            Some(vec![PortBinding {
                host_ip: Some("0.0.0.0".to_string()),
                host_port: Some(spec.port.to_string()),
            }]),
        )]);

        let device_requests = spec.gpu.then(|| {
            vec![DeviceRequest {
                count: Some(-1),
                capabilities: Some(vec![vec!["gpu".to_string()]]),
                ..Default::default()
            }]
        });

        let host_config = HostConfig {
            binds: Some(vec![format!("{}:/models:ro", spec.models_dir.display())]),
            port_bindings: Some(port_bindings),
            device_requests,
            ..Default::default()
        };

        Config {
            image: Some(spec.image.clone()),
            cmd: Some(spec.command()),
            labels: Some(spec.labels()),
            exposed_ports: Some(HashMap::from([(port_key, HashMap::new())])),
            host_config: Some(host_config),
            ..Default::default()
        }
    }
}

/// Status code of a daemon error response, if that is what `err` is
fn status_code(err: &bollard::errors::Error) -> Option<u16> {
    match err {
        bollard::errors::Error::DockerResponseServerError { status_code, .. } => {
            Some(*status_code)
        }
        _ => None,
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    fn pull_image(&self, image: &str) -> BoxStream<'static, Result<PullProgress, EngineError>> {
        let (tx, rx) = mpsc::channel(32);
        let runtime = self.clone();
        let image = image.to_string();

        // The returned stream must own everything, so the pull runs on its own task
        tokio::spawn(async move {
            let docker = match runtime.docker().await {
                Ok(docker) => docker,
                Err(e) => {
                    let _ = tx.send(Err(e)).await;
                    return;
                }
            };

            let options = CreateImageOptions {
                from_image: image.clone(),
                ..Default::default()
            };

            let mut pull = Box::pin(docker.create_image(Some(options), None, None));
            while let Some(item) = pull.next().await {
                let item = match item {
                    Ok(info) => match info.error {
                        Some(error) => Err(EngineError::ImagePull {
                            image: image.clone(),
                            reason: error,
                        }),
                        None => Ok(PullProgress {
                            status: info.status.unwrap_or_default(),
                            progress: info.progress,
                        }),
                    },
                    Err(e) => Err(EngineError::ImagePull {
                        image: image.clone(),
                        reason: e.to_string(),
                    }),
                };

                let failed = item.is_err();
                if tx.send(item).await.is_err() || failed {
                    break;
                }
            }
        });

        futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed()
    }

    async fn create_worker(&self, spec: &WorkerSpec) -> Result<CreatedWorker, EngineError> {
        let docker = self.docker().await.map_err(|e| EngineError::WorkerCreation {
            index: spec.index,
            reason: e.to_string(),
            warnings: Vec::new(),
        })?;

        let options = CreateContainerOptions {
            name: spec.container_name(),
            ..Default::default()
        };

        let response = docker
            .create_container(Some(options), Self::container_config(spec))
            .await
            .map_err(|e| EngineError::WorkerCreation {
                index: spec.index,
                reason: e.to_string(),
                warnings: Vec::new(),
            })?;

        if !response.warnings.is_empty() {
            tracing::warn!(
                worker = spec.index,
                container = %response.id,
                warnings = ?response.warnings,
                "Container created with warnings"
            );
        }

        Ok(CreatedWorker {
            id: response.id,
            warnings: response.warnings,
        })
    }

    async fn start_worker(&self, id: &str) -> Result<(), EngineError> {
        let docker = self.docker().await?;

        match docker.start_container::<String>(id, None).await {
            Ok(()) => Ok(()),
            Err(e) if status_code(&e) == Some(304) => Ok(()),
            Err(e) => Err(EngineError::Runtime(e.to_string())),
        }
    }

    async fn stop_worker(&self, id: &str) -> Result<(), EngineError> {
        let docker = self.docker().await?;

        let options = StopContainerOptions {
            t: self.stop_grace_secs,
        };

        match docker.stop_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(e) if matches!(status_code(&e), Some(304) | Some(404)) => {
                tracing::debug!(container = %id, "Container already stopped");
                Ok(())
            }
            Err(e) => Err(EngineError::Runtime(e.to_string())),
        }
    }

    async fn remove_worker(&self, id: &str) -> Result<(), EngineError> {
        let docker = self.docker().await?;

        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };

        match docker.remove_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(e) if status_code(&e) == Some(404) => {
                tracing::debug!(container = %id, "Container already removed");
                Ok(())
            }
            Err(e) => Err(EngineError::Runtime(e.to_string())),
        }
    }

    async fn list_managed(&self) -> Result<Vec<ManagedContainer>, EngineError> {
        let docker = self.docker().await?;

        let options = ListContainersOptions::<String> {
            all: true,
            filters: HashMap::from([(
                "label".to_string(),
                vec![format!("{}=true", LABEL_MANAGED)],
            )]),
            ..Default::default()
        };

        let summaries = docker
            .list_containers(Some(options))
            .await
            .map_err(|e| EngineError::Runtime(e.to_string()))?;

        Ok(summaries
            .into_iter()
            .filter_map(|summary| {
                let id = summary.id?;
                let session_id = summary
                    .labels
                    .as_ref()
                    .and_then(|labels| labels.get(LABEL_SESSION).cloned());
                let name = summary
                    .names
                    .and_then(|names| names.into_iter().next())
                    .map(|name| name.trim_start_matches('/').to_string());

                Some(ManagedContainer {
                    id,
                    name,
                    session_id,
                    state: summary.state,
                })
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn spec(gpu: bool) -> WorkerSpec {
        WorkerSpec {
            session_id: "s1".to_string(),
            pipeline: "simple".to_string(),
            index: 0,
            image: "ghcr.io/ggml-org/llama.cpp:server".to_string(),
            port: 8000,
            model: "m1.gguf".to_string(),
            gpu,
            models_dir: PathBuf::from("/srv/models"),
            context_length: 4096,
        }
    }

    #[test]
    fn test_container_config_publishes_port() {
        let config = DockerRuntime::container_config(&spec(false));

        let host = config.host_config.unwrap();
        let bindings = host.port_bindings.unwrap();
        let binding = bindings["8000/tcp"].as_ref().unwrap();
        assert_eq!(binding[0].host_port.as_deref(), Some("8000"));
        assert!(config.exposed_ports.unwrap().contains_key("8000/tcp"));
    }

    #[test]
    fn test_container_config_mounts_models_read_only() {
        let config = DockerRuntime::container_config(&spec(false));

        let host = config.host_config.unwrap();
        assert_eq!(host.binds.unwrap(), vec!["/srv/models:/models:ro".to_string()]);
        assert!(host.device_requests.is_none());
    }

    #[test]
    fn test_gpu_requests_devices() {
        let config = DockerRuntime::container_config(&spec(true));

        let requests = config.host_config.unwrap().device_requests.unwrap();
        assert_eq!(requests[0].count, Some(-1));
        assert_eq!(
            requests[0].capabilities,
            Some(vec![vec!["gpu".to_string()]])
        );
    }

    #[test]
    fn test_status_code_only_for_daemon_errors() {
        let err = bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            message: "no such container".to_string(),
        };
        assert_eq!(status_code(&err), Some(404));
    }
}

//! Readiness Gate
//!
//! Blocks until a worker's health probe succeeds. The wait is bounded by the
//! scope it runs in: callers narrow their request scope to the readiness
//! timeout, so the gate gives up at whichever deadline comes first and stops
//! immediately when the request is cancelled.
//!
//! Probing is a fixed interval with no backoff:
//! - a first successful probe returns without sleeping
//! - the last probe happens at the deadline, never after it
//! - `ReadinessTimeout` is only reported once the deadline has passed

use async_trait::async_trait;
use reqwest::Client;
use sdk::errors::EngineError;
use std::time::Duration;
use tokio::time::Instant;

use crate::container::Endpoint;
use crate::scope::RequestScope;

/// Answers "is this worker ready?"
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self, endpoint: &Endpoint) -> bool;
}

/// Probe hitting `GET /health` on the worker; any 2xx means ready
#[derive(Debug, Clone)]
pub struct HttpHealthProbe {
    client: Client,
}

impl HttpHealthProbe {
    pub fn new(probe_timeout: Duration) -> Result<Self, EngineError> {
        let client = Client::builder()
            .timeout(probe_timeout)
            .build()
            .map_err(|e| EngineError::Network(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { client })
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn probe(&self, endpoint: &Endpoint) -> bool {
        match self.client.get(endpoint.health_url()).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                tracing::trace!(endpoint = %endpoint, error = %e, "Health probe failed");
                false
            }
        }
    }
}

/// Wait until `endpoint` answers its health probe
///
/// # Errors
///
/// - `ReadinessTimeout` once the scope's deadline has passed without a successful probe
/// - `Cancelled` as soon as the scope is cancelled
pub async fn wait_ready(
    probe: &dyn HealthProbe,
    endpoint: &Endpoint,
    interval: Duration,
    scope: &RequestScope,
) -> Result<(), EngineError> {
    let start = Instant::now();
    let deadline = scope.deadline();
    let mut attempts = 0u32;

    loop {
        if scope.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        attempts += 1;
        let ready = tokio::select! {
            biased;
            _ = scope.cancelled() => return Err(EngineError::Cancelled),
            ready = probe.probe(endpoint) => ready,
        };

        if ready {
            tracing::debug!(
                endpoint = %endpoint,
                attempts,
                "Worker ready after {:.1}s",
                start.elapsed().as_secs_f64()
            );
            return Ok(());
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(EngineError::ReadinessTimeout {
                endpoint: endpoint.to_string(),
                waited_ms: u64::try_from(now.duration_since(start).as_millis())
                    .unwrap_or(u64::MAX),
            });
        }

        // Never sleep past the deadline; the final probe runs exactly at it
        let pause = interval.min(deadline - now);
        scope.sleep(pause).await?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::StaticProbe;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn endpoint() -> Endpoint {
        Endpoint::new("localhost", 8000)
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_immediately_does_not_sleep() {
        let probe = StaticProbe::ready_after(0);
        let scope = RequestScope::detached(Duration::from_secs(30));
        let start = Instant::now();

        wait_ready(&probe, &endpoint(), Duration::from_secs(1), &scope)
            .await
            .unwrap();

        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(probe.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_at_interval() {
        let probe = StaticProbe::ready_after(3);
        let scope = RequestScope::detached(Duration::from_secs(30));
        let start = Instant::now();

        wait_ready(&probe, &endpoint(), Duration::from_secs(2), &scope)
            .await
            .unwrap();

        assert_eq!(probe.attempts(), 4);
        assert!(start.elapsed() >= Duration::from_secs(6));
        assert!(start.elapsed() < Duration::from_millis(6100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_times_out_exactly_at_deadline() {
        let probe = StaticProbe::never();
        let scope = RequestScope::detached(Duration::from_millis(3500));
        let start = Instant::now();

        let result = wait_ready(&probe, &endpoint(), Duration::from_secs(1), &scope).await;

        match result {
            Err(EngineError::ReadinessTimeout { waited_ms, .. }) => {
                assert!((3500..3510).contains(&waited_ms))
            }
            other => panic!("Expected ReadinessTimeout, got: {:?}", other),
        }
        assert!(start.elapsed() >= Duration::from_millis(3500));
        // probes at 0, 1, 2, 3 and the final one at 3.5s
        assert_eq!(probe.attempts(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_waiting() {
        let probe = StaticProbe::never();
        let (scope, handle) = RequestScope::new(Duration::from_secs(300));
        let start = Instant::now();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(2500)).await;
            drop(handle);
        });

        let result = wait_ready(&probe, &endpoint(), Duration::from_secs(1), &scope).await;

        assert!(matches!(result, Err(EngineError::Cancelled)));
        assert!(start.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_http_probe_against_worker() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": "ok"
            })))
            .mount(&server)
            .await;

        let probe = HttpHealthProbe::new(Duration::from_secs(2)).unwrap();
        let endpoint = Endpoint::new("127.0.0.1", server.address().port());

        assert!(probe.probe(&endpoint).await);
    }

    #[tokio::test]
    async fn test_http_probe_loading_model_is_not_ready() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let probe = HttpHealthProbe::new(Duration::from_secs(2)).unwrap();
        let endpoint = Endpoint::new("127.0.0.1", server.address().port());

        assert!(!probe.probe(&endpoint).await);
    }
}

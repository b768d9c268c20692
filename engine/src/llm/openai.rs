//! OpenAI-compatible worker client
//!
//! Talks to the llama.cpp server inside a worker through its `/v1` API:
//! - `POST /v1/chat/completions` with the fixed seed and temperature
//! - `POST /v1/embeddings`
//!
//! Connection failures map to `ProviderUnavailable`, non-2xx answers keep
//! the worker's status and body for the logs.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{ChatRequest, InferenceClient, LLMError, Message, Result, SEED, TEMPERATURE};
use crate::container::Endpoint;

/// Client for workers exposing the OpenAI chat API
#[derive(Debug, Clone)]
pub struct OpenAICompatClient {
    client: Client,
}

impl OpenAICompatClient {
    /// Create a client whose calls give up after `request_timeout`
    pub fn new(request_timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| LLMError::NetworkError(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { client })
    }

    fn map_send_error(endpoint: &Endpoint, e: reqwest::Error) -> LLMError {
        if e.is_timeout() {
            LLMError::Timeout
        } else if e.is_connect() {
            LLMError::ProviderUnavailable(format!("Cannot connect to worker at {}", endpoint))
        } else {
            LLMError::NetworkError(e.to_string())
        }
    }

    async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
        if response.status().is_success() {
            return Ok(response);
        }

        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        if status.is_client_error() {
            Err(LLMError::InvalidRequest(format!("{}: {}", status, text)))
        } else {
            Err(LLMError::ProviderUnavailable(format!(
                "Worker API error ({}): {}",
                status, text
            )))
        }
    }
}

#[async_trait]
impl InferenceClient for OpenAICompatClient {
    async fn complete_chat(&self, endpoint: &Endpoint, request: &ChatRequest) -> Result<String> {
        let body = CompletionRequest {
            model: &request.model,
            messages: &request.messages,
            seed: SEED,
            temperature: TEMPERATURE,
            max_tokens: request.max_tokens,
        };

        tracing::debug!(
            endpoint = %endpoint,
            model = %request.model,
            messages = request.messages.len(),
            max_tokens = request.max_tokens,
            "Completion request"
        );

        let url = format!("{}/chat/completions", endpoint.api_base());
        let start = std::time::Instant::now();
        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| Self::map_send_error(endpoint, e))?;

        let response = Self::check_status(response).await?;

        let completion: CompletionResponse = response
            .json()
            .await
            .map_err(|e| LLMError::ParseError(format!("Failed to parse completion: {}", e)))?;

        tracing::info!(
            endpoint = %endpoint,
            "Completion received in {:.1}s",
            start.elapsed().as_secs_f64()
        );

        completion
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| LLMError::ParseError("No choices in response".to_string()))
    }

    async fn embed(&self, endpoint: &Endpoint, text: &str, model: &str) -> Result<Vec<f32>> {
        let url = format!("{}/embeddings", endpoint.api_base());
        let response = self
            .client
            .post(&url)
            .json(&EmbeddingRequest { model, input: text })
            .send()
            .await
            .map_err(|e| Self::map_send_error(endpoint, e))?;

        let response = Self::check_status(response).await?;

        let embedding: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| LLMError::ParseError(format!("Failed to parse embedding: {}", e)))?;

        embedding
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| LLMError::ParseError("No embedding in response".to_string()))
    }
}

/// Chat completion request format
#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    seed: i64,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a str,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

//! vLLM adapter.
//!
//! vLLM's OpenAI-compatible server speaks the stock chat-completions and
//! embeddings protocol; the only deployment-specific concern is the
//! optional bearer token (`vllm serve --api-key …`). Health is probed via
//! `GET /v1/models`.

use std::time::Duration;

use futures_util::StreamExt as _;
use reqwest::{header, Client};
use serde_json::Value;

use super::{error_for_status, openai, sse, ChunkStream};
use crate::error::ProviderError;
use crate::types::{CompletionRequest, CompletionResponse, ProviderName};

pub struct VllmDriver {
    /// Buffered requests — has the configured request timeout.
    client: Client,
    /// Streaming requests — no request-level timeout.
    stream_client: Client,
    endpoint: String,
}

impl VllmDriver {
    /// Build a vLLM adapter with an optional bearer token.
    pub fn new(endpoint: String, api_key: Option<String>, timeout_ms: u64) -> Self {
        let mut headers = header::HeaderMap::new();
        if let Some(key) = api_key {
            let value = format!("Bearer {key}");
            // Panics on invalid header bytes — surfaces misconfiguration at
            // startup, not at request time.
            headers.insert(
                header::AUTHORIZATION,
                header::HeaderValue::from_str(&value)
                    .expect("vLLM API key contains invalid Authorization header characters"),
            );
        }

        let client = Client::builder()
            .default_headers(headers.clone())
            .timeout(Duration::from_millis(timeout_ms))
            .build()
            .expect("failed to build reqwest client");

        let stream_client = Client::builder()
            .default_headers(headers)
            .build()
            .expect("failed to build streaming reqwest client");

        Self {
            client,
            stream_client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
        }
    }

    pub async fn complete(
        &self,
        request: &CompletionRequest,
        model: &str,
    ) -> Result<CompletionResponse, ProviderError> {
        let body = openai::build_chat_body(request, model, false);
        let url = format!("{}/v1/chat/completions", self.endpoint);

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::from_transport(&e))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| ProviderError::from_transport(&e))?;
        if !status.is_success() {
            return Err(error_for_status(status, &text));
        }

        let value: Value = serde_json::from_str(&text)
            .map_err(|e| ProviderError::protocol(format!("parsing vLLM response: {e}")))?;
        openai::parse_chat_response(value, ProviderName::Vllm, model, request.prompt_chars())
    }

    pub async fn stream(
        &self,
        request: &CompletionRequest,
        model: &str,
    ) -> Result<ChunkStream, ProviderError> {
        let body = openai::build_chat_body(request, model, true);
        let url = format!("{}/v1/chat/completions", self.endpoint);

        let response = self
            .stream_client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::from_transport(&e))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(error_for_status(status, &text));
        }

        let bytes = response
            .bytes_stream()
            .map(|r| r.map_err(|e| ProviderError::from_transport(&e)));
        Ok(openai::chunk_stream(
            sse::data_events(bytes),
            ProviderName::Vllm,
            model.to_string(),
            request.prompt_chars(),
        ))
    }

    pub async fn embed(
        &self,
        texts: &[String],
        model: &str,
    ) -> Result<Vec<Vec<f32>>, ProviderError> {
        let url = format!("{}/v1/embeddings", self.endpoint);
        let response = self
            .client
            .post(&url)
            .json(&serde_json::json!({ "model": model, "input": texts }))
            .send()
            .await
            .map_err(|e| ProviderError::from_transport(&e))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| ProviderError::from_transport(&e))?;
        if !status.is_success() {
            return Err(error_for_status(status, &text));
        }

        let value: Value = serde_json::from_str(&text)
            .map_err(|e| ProviderError::protocol(format!("parsing vLLM embeddings: {e}")))?;
        openai::parse_embeddings(value)
    }

    /// Probe the backend with `GET /v1/models`.
    pub async fn health_check(&self) -> Result<(), ProviderError> {
        let url = format!("{}/v1/models", self.endpoint);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| ProviderError::from_transport(&e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(error_for_status(status, "health check"));
        }
        Ok(())
    }
}

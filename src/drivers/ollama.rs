//! Ollama adapter.
//!
//! Ollama ships OpenAI-compatible `/v1/chat/completions` and
//! `/v1/embeddings` endpoints, so this adapter is intentionally thin — the
//! shared schema translation does the work. No API key is required for
//! typical local deployments, and the root `/` endpoint serves as the
//! health probe rather than `/v1/models`.

use std::time::Duration;

use futures_util::StreamExt as _;
use reqwest::Client;
use serde_json::Value;

use super::{error_for_status, openai, sse, ChunkStream};
use crate::error::ProviderError;
use crate::types::{CompletionRequest, CompletionResponse, ProviderName};

pub struct OllamaDriver {
    /// Buffered requests — has the configured request timeout.
    client: Client,
    /// Streaming requests — no request-level timeout.
    stream_client: Client,
    endpoint: String,
}

impl OllamaDriver {
    pub fn new(endpoint: String, timeout_ms: u64) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .build()
            .expect("failed to build reqwest client");

        let stream_client = Client::builder()
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
            .map_err(|e| ProviderError::protocol(format!("parsing Ollama response: {e}")))?;
        openai::parse_chat_response(value, ProviderName::Ollama, model, request.prompt_chars())
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
            ProviderName::Ollama,
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
            .map_err(|e| ProviderError::protocol(format!("parsing Ollama embeddings: {e}")))?;
        openai::parse_embeddings(value)
    }

    /// Probe Ollama's root endpoint — returns `"Ollama is running"` on success.
    pub async fn health_check(&self) -> Result<(), ProviderError> {
        let url = format!("{}/", self.endpoint);
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::types::{ChatMessage, ModelTier};
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request() -> CompletionRequest {
        CompletionRequest::with_tier(vec![ChatMessage::user("hi")], ModelTier::CostEffective)
    }

    #[tokio::test]
    async fn complete_round_trips_via_openai_compat_route() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{
                    "message": { "content": "Local hello." },
                    "finish_reason": "stop",
                }],
            })))
            .mount(&server)
            .await;

        let driver = OllamaDriver::new(server.uri(), 5_000);
        let resp = driver.complete(&request(), "llama3.1:8b").await.unwrap();
        assert_eq!(resp.text, "Local hello.");
        assert_eq!(resp.provider, ProviderName::Ollama);
        // Ollama's compat route reported no usage — estimated.
        assert!(resp.usage.estimated);
    }

    #[tokio::test]
    async fn refused_connection_maps_to_unavailable() {
        // Nothing listens on this port.
        let driver = OllamaDriver::new("http://127.0.0.1:1".into(), 500);
        let err = driver.complete(&request(), "llama3.1:8b").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Unavailable);
    }

    #[tokio::test]
    async fn health_probes_root_endpoint() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).set_body_string("Ollama is running"))
            .mount(&server)
            .await;

        let driver = OllamaDriver::new(server.uri(), 5_000);
        assert!(driver.health_check().await.is_ok());
    }

    #[tokio::test]
    async fn health_maps_5xx_to_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let driver = OllamaDriver::new(server.uri(), 5_000);
        let err = driver.health_check().await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Unavailable);
    }
}

//! Azure OpenAI adapter.
//!
//! Azure exposes the OpenAI chat-completions schema, but addressed by
//! *deployment name* rather than model id, authenticated with an `api-key`
//! header rather than a bearer token, and versioned through an
//! `api-version` query parameter. The catalog's Azure model ids are
//! therefore deployment names.
//!
//! # Protocol differences handled here
//!
//! | Concern | OpenAI | Azure OpenAI |
//! |---|---|---|
//! | Path | `/v1/chat/completions` | `/openai/deployments/{name}/chat/completions` |
//! | Auth header | `Authorization: Bearer …` | `api-key: …` |
//! | Versioning | none | `?api-version=…` |
//! | Content filter | finish_reason only | also HTTP 400 with `content_filter` code |

use std::time::Duration;

use futures_util::StreamExt as _;
use reqwest::{header, Client};
use serde_json::Value;

use super::{error_for_status, openai, sse, ChunkStream};
use crate::error::ProviderError;
use crate::types::{CompletionRequest, CompletionResponse, ProviderName};

pub struct AzureDriver {
    /// Buffered requests — has the configured request timeout.
    client: Client,
    /// Streaming requests — no request-level timeout (body arrives incrementally).
    stream_client: Client,
    endpoint: String,
    api_version: String,
}

impl AzureDriver {
    /// Build an Azure adapter for the given resource endpoint.
    pub fn new(endpoint: String, api_key: String, api_version: String, timeout_ms: u64) -> Self {
        let mut headers = header::HeaderMap::new();
        // Panics on invalid header bytes — surfaces misconfiguration at
        // startup, not at request time.
        headers.insert(
            "api-key",
            header::HeaderValue::from_str(&api_key)
                .expect("Azure API key contains invalid header characters"),
        );

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
            api_version,
        }
    }

    fn deployment_url(&self, deployment: &str, operation: &str) -> String {
        format!(
            "{}/openai/deployments/{}/{}?api-version={}",
            self.endpoint, deployment, operation, self.api_version
        )
    }

    pub async fn complete(
        &self,
        request: &CompletionRequest,
        model: &str,
    ) -> Result<CompletionResponse, ProviderError> {
        let body = openai::build_chat_body(request, model, false);
        let url = self.deployment_url(model, "chat/completions");

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
            return Err(azure_error(status, &text));
        }

        let value: Value = serde_json::from_str(&text)
            .map_err(|e| ProviderError::protocol(format!("parsing Azure response: {e}")))?;
        openai::parse_chat_response(value, ProviderName::Azure, model, request.prompt_chars())
    }

    pub async fn stream(
        &self,
        request: &CompletionRequest,
        model: &str,
    ) -> Result<ChunkStream, ProviderError> {
        let body = openai::build_chat_body(request, model, true);
        let url = self.deployment_url(model, "chat/completions");

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
            return Err(azure_error(status, &text));
        }

        let bytes = response
            .bytes_stream()
            .map(|r| r.map_err(|e| ProviderError::from_transport(&e)));
        Ok(openai::chunk_stream(
            sse::data_events(bytes),
            ProviderName::Azure,
            model.to_string(),
            request.prompt_chars(),
        ))
    }

    pub async fn embed(
        &self,
        texts: &[String],
        model: &str,
    ) -> Result<Vec<Vec<f32>>, ProviderError> {
        let url = self.deployment_url(model, "embeddings");
        let response = self
            .client
            .post(&url)
            .json(&serde_json::json!({ "input": texts }))
            .send()
            .await
            .map_err(|e| ProviderError::from_transport(&e))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| ProviderError::from_transport(&e))?;
        if !status.is_success() {
            return Err(azure_error(status, &text));
        }

        let value: Value = serde_json::from_str(&text)
            .map_err(|e| ProviderError::protocol(format!("parsing Azure embeddings: {e}")))?;
        openai::parse_embeddings(value)
    }

    /// Probe the deployments list endpoint.
    pub async fn health_check(&self) -> Result<(), ProviderError> {
        let url = format!(
            "{}/openai/models?api-version={}",
            self.endpoint, self.api_version
        );
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

/// Azure reports prompt-level content filtering as an HTTP 400 whose error
/// code is `content_filter`; everything else follows the shared mapping.
fn azure_error(status: reqwest::StatusCode, body: &str) -> ProviderError {
    if status == reqwest::StatusCode::BAD_REQUEST && body.contains("content_filter") {
        return ProviderError::content_filtered(body.to_string());
    }
    error_for_status(status, body)
}

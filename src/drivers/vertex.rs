//! GCP Vertex generative-model adapter.
//!
//! Translates between the gateway's chat contract and Vertex's
//! `generateContent` API. Vertex uses a distinct chat-history shape and
//! reports token counts under `usageMetadata`.
//!
//! # Protocol differences handled here
//!
//! | Concern | Gateway contract | Vertex |
//! |---|---|---|
//! | History | flat `messages` with roles | `contents[].parts[].text`, roles `user`/`model` |
//! | System prompt | `system` role messages | top-level `systemInstruction` |
//! | Sampling | `temperature`/`max_tokens`/`top_p`/`stop` | nested `generationConfig` |
//! | Finish reasons | `stop`/`length`/`content_filter` | `STOP`/`MAX_TOKENS`/`SAFETY` |
//! | Usage | `usage` triple | `usageMetadata` counts |
//! | Streaming | typed chunks | `:streamGenerateContent?alt=sse`, no done sentinel |

use std::time::Duration;

use futures_util::{Stream, StreamExt};
use reqwest::{header, Client};
use serde_json::{json, Value};

use super::{error_for_status, estimate_tokens, sse, ChunkStream};
use crate::error::ProviderError;
use crate::types::{
    CompletionRequest, CompletionResponse, FinishReason, ProviderName, Role, StreamChunk,
    TokenUsage,
};

pub struct VertexDriver {
    /// Buffered requests — has the configured request timeout.
    client: Client,
    /// Streaming requests — no request-level timeout.
    stream_client: Client,
    base_url: String,
    project_id: String,
    region: String,
}

impl VertexDriver {
    /// Build a Vertex adapter. `endpoint` overrides the regional host
    /// (tests); production passes `None`.
    pub fn new(
        project_id: String,
        region: String,
        access_token: String,
        endpoint: Option<String>,
        timeout_ms: u64,
    ) -> Self {
        let mut headers = header::HeaderMap::new();
        let value = format!("Bearer {access_token}");
        // Panics on invalid header bytes — surfaces misconfiguration at
        // startup, not at request time.
        headers.insert(
            header::AUTHORIZATION,
            header::HeaderValue::from_str(&value)
                .expect("GCP access token contains invalid Authorization header characters"),
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

        let base_url = endpoint
            .unwrap_or_else(|| format!("https://{region}-aiplatform.googleapis.com"))
            .trim_end_matches('/')
            .to_string();

        Self { client, stream_client, base_url, project_id, region }
    }

    fn model_url(&self, model: &str, operation: &str) -> String {
        format!(
            "{}/v1/projects/{}/locations/{}/publishers/google/models/{}:{}",
            self.base_url, self.project_id, self.region, model, operation
        )
    }

    pub async fn complete(
        &self,
        request: &CompletionRequest,
        model: &str,
    ) -> Result<CompletionResponse, ProviderError> {
        let body = to_vertex(request);
        let url = self.model_url(model, "generateContent");

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
            .map_err(|e| ProviderError::protocol(format!("parsing Vertex response: {e}")))?;

        let (generated, finish_reason, usage) = from_vertex(&value)?;
        let usage = usage.unwrap_or_else(|| {
            TokenUsage::estimated(
                estimate_tokens(request.prompt_chars()),
                estimate_tokens(generated.len()),
            )
        });

        Ok(CompletionResponse {
            text: generated,
            provider: ProviderName::Gcp,
            model: model.to_string(),
            usage,
            cost_usd: 0.0,
            finish_reason,
        })
    }

    pub async fn stream(
        &self,
        request: &CompletionRequest,
        model: &str,
    ) -> Result<ChunkStream, ProviderError> {
        let body = to_vertex(request);
        let url = format!("{}?alt=sse", self.model_url(model, "streamGenerateContent"));

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
        Ok(vertex_chunk_stream(
            sse::data_events(bytes),
            model.to_string(),
            request.prompt_chars(),
        ))
    }

    /// Probe the publisher models collection.
    pub async fn health_check(&self) -> Result<(), ProviderError> {
        let url = format!(
            "{}/v1/projects/{}/locations/{}/publishers/google/models",
            self.base_url, self.project_id, self.region
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

// ──────────────────────────────────────────────────────────────────────────────
// Schema translation — pub(crate) for unit testing
// ──────────────────────────────────────────────────────────────────────────────

/// Convert a gateway request to the Vertex `generateContent` format.
///
/// System messages move to `systemInstruction`; `assistant` becomes the
/// `model` role.
pub(crate) fn to_vertex(request: &CompletionRequest) -> Value {
    let mut system_parts: Vec<Value> = Vec::new();
    let mut contents: Vec<Value> = Vec::new();

    for msg in &request.messages {
        match msg.role {
            Role::System => system_parts.push(json!({ "text": msg.content })),
            Role::User => contents.push(json!({
                "role": "user",
                "parts": [{ "text": msg.content }],
            })),
            Role::Assistant => contents.push(json!({
                "role": "model",
                "parts": [{ "text": msg.content }],
            })),
        }
    }

    let mut body = json!({ "contents": contents });

    if !system_parts.is_empty() {
        body["systemInstruction"] = json!({ "parts": system_parts });
    }

    let mut generation_config = serde_json::Map::new();
    if let Some(t) = request.temperature {
        generation_config.insert("temperature".into(), json!(t));
    }
    if let Some(n) = request.max_tokens {
        generation_config.insert("maxOutputTokens".into(), json!(n));
    }
    if let Some(p) = request.top_p {
        generation_config.insert("topP".into(), json!(p));
    }
    if !request.stop.is_empty() {
        generation_config.insert("stopSequences".into(), json!(request.stop));
    }
    if !generation_config.is_empty() {
        body["generationConfig"] = Value::Object(generation_config);
    }

    body
}

pub(crate) fn finish_reason_from(s: &str) -> FinishReason {
    match s {
        "MAX_TOKENS" => FinishReason::Length,
        "SAFETY" | "RECITATION" | "BLOCKLIST" | "PROHIBITED_CONTENT" => {
            FinishReason::ContentFilter
        }
        _ => FinishReason::Stop,
    }
}

fn usage_from(value: &Value) -> Option<TokenUsage> {
    let metadata = value.get("usageMetadata")?;
    let prompt = metadata.get("promptTokenCount")?.as_u64()? as u32;
    let completion = metadata
        .get("candidatesTokenCount")
        .and_then(Value::as_u64)
        .unwrap_or(0) as u32;
    Some(TokenUsage::reported(prompt, completion))
}

fn candidate_text(value: &Value) -> Option<String> {
    let parts = value.pointer("/candidates/0/content/parts")?.as_array()?;
    let text: String = parts
        .iter()
        .filter_map(|p| p.get("text").and_then(Value::as_str))
        .collect();
    Some(text)
}

/// Extract `(text, finish_reason, usage)` from a `generateContent` response.
///
/// A prompt blocked by safety filters has no candidates and a
/// `promptFeedback.blockReason` instead — surfaced as `content_filtered`.
pub(crate) fn from_vertex(
    value: &Value,
) -> Result<(String, FinishReason, Option<TokenUsage>), ProviderError> {
    if let Some(reason) = value
        .pointer("/promptFeedback/blockReason")
        .and_then(Value::as_str)
    {
        return Err(ProviderError::content_filtered(format!(
            "prompt blocked: {reason}"
        )));
    }

    let text = candidate_text(value)
        .ok_or_else(|| ProviderError::protocol("Vertex response has no candidate parts"))?;

    let finish_reason = value
        .pointer("/candidates/0/finishReason")
        .and_then(Value::as_str)
        .map(finish_reason_from)
        .unwrap_or(FinishReason::Stop);

    Ok((text, finish_reason, usage_from(value)))
}

struct StreamState<S> {
    events: S,
    model: String,
    prompt_chars: usize,
    output_chars: usize,
    finish: Option<FinishReason>,
    usage: Option<TokenUsage>,
    ended: bool,
}

/// Vertex SSE has no done sentinel; the terminal chunk is emitted when the
/// event stream closes, using the stashed finish reason and usage.
fn vertex_chunk_stream<S>(events: S, model: String, prompt_chars: usize) -> ChunkStream
where
    S: Stream<Item = Result<String, ProviderError>> + Send + 'static,
{
    let state = StreamState {
        events: events.boxed(),
        model,
        prompt_chars,
        output_chars: 0,
        finish: None,
        usage: None,
        ended: false,
    };

    Box::pin(futures_util::stream::unfold(state, |mut st| async move {
        loop {
            if st.ended {
                return None;
            }
            match st.events.next().await {
                Some(Ok(payload)) => {
                    let value: Value = match serde_json::from_str(&payload) {
                        Ok(v) => v,
                        Err(e) => {
                            st.ended = true;
                            return Some((
                                Err(ProviderError::protocol(format!(
                                    "malformed stream event: {e}"
                                ))),
                                st,
                            ));
                        }
                    };

                    if let Some(usage) = usage_from(&value) {
                        st.usage = Some(usage);
                    }
                    if let Some(reason) = value
                        .pointer("/candidates/0/finishReason")
                        .and_then(Value::as_str)
                    {
                        st.finish = Some(finish_reason_from(reason));
                    }
                    let delta = candidate_text(&value).unwrap_or_default();
                    if !delta.is_empty() {
                        st.output_chars += delta.len();
                        let chunk = StreamChunk::delta(ProviderName::Gcp, st.model.clone(), delta);
                        return Some((Ok(chunk), st));
                    }
                }
                Some(Err(e)) => {
                    st.ended = true;
                    return Some((Err(e), st));
                }
                None => {
                    st.ended = true;
                    let chunk = match st.finish {
                        Some(reason) => {
                            let usage = st.usage.unwrap_or_else(|| {
                                TokenUsage::estimated(
                                    estimate_tokens(st.prompt_chars),
                                    estimate_tokens(st.output_chars),
                                )
                            });
                            StreamChunk::terminal(
                                ProviderName::Gcp,
                                st.model.clone(),
                                reason,
                                Some(usage),
                            )
                        }
                        None => StreamChunk::terminal(
                            ProviderName::Gcp,
                            st.model.clone(),
                            FinishReason::Error,
                            None,
                        ),
                    };
                    return Some((Ok(chunk), st));
                }
            }
        }
    }))
}

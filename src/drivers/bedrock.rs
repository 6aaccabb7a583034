//! AWS Bedrock InvokeModel adapter.
//!
//! Bedrock fronts several vendor model families behind one runtime API,
//! but the request and response bodies are family-specific. This adapter
//! dispatches on the model-id prefix and handles each family inline:
//!
//! | Family | Prefix | Request shape | Response shape |
//! |---|---|---|---|
//! | Anthropic | `anthropic.` | Messages API body | `content[].text` + `stop_reason` |
//! | Titan | `amazon.` | `inputText` + `textGenerationConfig` | `results[].outputText` |
//! | Meta | `meta.` | flat `prompt` | `generation` + `stop_reason` |
//!
//! Streaming responses use AWS's binary event-stream framing
//! (`application/vnd.amazon.eventstream`): length-prefixed messages whose
//! JSON payload carries a base64 `bytes` envelope around the family event.
//! The decoder below parses that framing directly; CRCs are carried but
//! not checked.
//!
//! Authentication is a Bedrock API key sent as a bearer token, which keeps
//! this adapter on the same HTTP client stack as every other driver.

use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use futures_util::{Stream, StreamExt};
use reqwest::{header, Client};
use serde_json::{json, Value};

use super::{error_for_status, estimate_tokens, ChunkStream};
use crate::error::{ErrorKind, ProviderError};
use crate::types::{
    CompletionRequest, CompletionResponse, FinishReason, ProviderName, Role, StreamChunk,
    TokenUsage,
};

/// Anthropic-family bodies require `max_tokens`; applied when the caller
/// omits it.
const DEFAULT_MAX_TOKENS: u32 = 4_096;

const ANTHROPIC_BEDROCK_VERSION: &str = "bedrock-2023-05-31";

/// Vendor model family, dispatched on the model-id prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ModelFamily {
    Anthropic,
    Titan,
    Meta,
}

/// Resolve the family from a model id, tolerating cross-region prefixes
/// (`us.anthropic.…`, `eu.meta.…`).
pub(crate) fn family_of(model_id: &str) -> Result<ModelFamily, ProviderError> {
    let bare = model_id
        .strip_prefix("us.")
        .or_else(|| model_id.strip_prefix("eu."))
        .or_else(|| model_id.strip_prefix("apac."))
        .unwrap_or(model_id);

    if bare.starts_with("anthropic.") {
        Ok(ModelFamily::Anthropic)
    } else if bare.starts_with("amazon.") {
        Ok(ModelFamily::Titan)
    } else if bare.starts_with("meta.") {
        Ok(ModelFamily::Meta)
    } else {
        Err(ProviderError::model_not_found(format!(
            "unsupported Bedrock model family for `{model_id}`"
        )))
    }
}

pub struct BedrockDriver {
    /// Buffered requests — has the configured request timeout.
    client: Client,
    /// Streaming requests — no request-level timeout.
    stream_client: Client,
    runtime_url: String,
    control_url: String,
}

impl BedrockDriver {
    /// Build a Bedrock adapter for one region. `endpoint` overrides both
    /// hosts (tests); production passes `None`.
    pub fn new(region: String, api_key: String, endpoint: Option<String>, timeout_ms: u64) -> Self {
        let mut headers = header::HeaderMap::new();
        let value = format!("Bearer {api_key}");
        // Panics on invalid header bytes — surfaces misconfiguration at
        // startup, not at request time.
        headers.insert(
            header::AUTHORIZATION,
            header::HeaderValue::from_str(&value)
                .expect("Bedrock API key contains invalid Authorization header characters"),
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

        let (runtime_url, control_url) = match endpoint {
            Some(e) => {
                let e = e.trim_end_matches('/').to_string();
                (e.clone(), e)
            }
            None => (
                format!("https://bedrock-runtime.{region}.amazonaws.com"),
                format!("https://bedrock.{region}.amazonaws.com"),
            ),
        };

        Self { client, stream_client, runtime_url, control_url }
    }

    pub async fn complete(
        &self,
        request: &CompletionRequest,
        model: &str,
    ) -> Result<CompletionResponse, ProviderError> {
        let family = family_of(model)?;
        let body = build_body(family, request);
        let url = format!("{}/model/{}/invoke", self.runtime_url, model);

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
            .map_err(|e| ProviderError::protocol(format!("parsing Bedrock response: {e}")))?;

        let (generated, finish_reason, usage) = parse_response(family, &value)?;
        let usage = usage.unwrap_or_else(|| {
            TokenUsage::estimated(
                estimate_tokens(request.prompt_chars()),
                estimate_tokens(generated.len()),
            )
        });

        Ok(CompletionResponse {
            text: generated,
            provider: ProviderName::Aws,
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
        let family = family_of(model)?;
        let body = build_body(family, request);
        let url = format!(
            "{}/model/{}/invoke-with-response-stream",
            self.runtime_url, model
        );

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
        Ok(bedrock_chunk_stream(
            bytes,
            family,
            model.to_string(),
            request.prompt_chars(),
        ))
    }

    /// Probe the control plane's foundation-models listing.
    pub async fn health_check(&self) -> Result<(), ProviderError> {
        let url = format!("{}/foundation-models", self.control_url);
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
// Family request/response translation — pub(crate) for unit testing
// ──────────────────────────────────────────────────────────────────────────────

/// Flatten the chat history into a role-prefixed transcript for the
/// completion-style families (Titan, Meta).
fn flatten_prompt(request: &CompletionRequest) -> String {
    let mut out = String::new();
    for msg in &request.messages {
        let label = match msg.role {
            Role::System => "System",
            Role::User => "User",
            Role::Assistant => "Assistant",
        };
        out.push_str(label);
        out.push_str(": ");
        out.push_str(&msg.content);
        out.push_str("\n\n");
    }
    out.push_str("Assistant:");
    out
}

pub(crate) fn build_body(family: ModelFamily, request: &CompletionRequest) -> Value {
    match family {
        ModelFamily::Anthropic => {
            let mut system_parts: Vec<&str> = Vec::new();
            let mut messages: Vec<Value> = Vec::new();
            for msg in &request.messages {
                match msg.role {
                    Role::System => system_parts.push(&msg.content),
                    Role::User => {
                        messages.push(json!({ "role": "user", "content": msg.content }))
                    }
                    Role::Assistant => {
                        messages.push(json!({ "role": "assistant", "content": msg.content }))
                    }
                }
            }

            let mut body = json!({
                "anthropic_version": ANTHROPIC_BEDROCK_VERSION,
                "max_tokens": request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
                "messages": messages,
            });
            if !system_parts.is_empty() {
                body["system"] = Value::String(system_parts.join("\n\n"));
            }
            if let Some(t) = request.temperature {
                body["temperature"] = json!(t);
            }
            if let Some(p) = request.top_p {
                body["top_p"] = json!(p);
            }
            if !request.stop.is_empty() {
                body["stop_sequences"] = json!(request.stop);
            }
            body
        }
        ModelFamily::Titan => {
            let mut config = serde_json::Map::new();
            if let Some(n) = request.max_tokens {
                config.insert("maxTokenCount".into(), json!(n));
            }
            if let Some(t) = request.temperature {
                config.insert("temperature".into(), json!(t));
            }
            if let Some(p) = request.top_p {
                config.insert("topP".into(), json!(p));
            }
            if !request.stop.is_empty() {
                config.insert("stopSequences".into(), json!(request.stop));
            }

            let mut body = json!({ "inputText": flatten_prompt(request) });
            if !config.is_empty() {
                body["textGenerationConfig"] = Value::Object(config);
            }
            body
        }
        ModelFamily::Meta => {
            let mut body = json!({ "prompt": flatten_prompt(request) });
            if let Some(n) = request.max_tokens {
                body["max_gen_len"] = json!(n);
            }
            if let Some(t) = request.temperature {
                body["temperature"] = json!(t);
            }
            if let Some(p) = request.top_p {
                body["top_p"] = json!(p);
            }
            body
        }
    }
}

fn anthropic_finish(s: &str) -> FinishReason {
    match s {
        "max_tokens" => FinishReason::Length,
        "tool_use" => FinishReason::ToolCall,
        _ => FinishReason::Stop, // end_turn, stop_sequence
    }
}

fn titan_finish(s: &str) -> FinishReason {
    match s {
        "LENGTH" => FinishReason::Length,
        "CONTENT_FILTERED" => FinishReason::ContentFilter,
        _ => FinishReason::Stop, // FINISH
    }
}

fn meta_finish(s: &str) -> FinishReason {
    match s {
        "length" => FinishReason::Length,
        _ => FinishReason::Stop,
    }
}

/// Extract `(text, finish_reason, usage)` from a non-streaming response.
pub(crate) fn parse_response(
    family: ModelFamily,
    value: &Value,
) -> Result<(String, FinishReason, Option<TokenUsage>), ProviderError> {
    match family {
        ModelFamily::Anthropic => {
            let text: String = value
                .get("content")
                .and_then(Value::as_array)
                .map(|blocks| {
                    blocks
                        .iter()
                        .filter(|b| b["type"] == "text")
                        .filter_map(|b| b["text"].as_str())
                        .collect()
                })
                .ok_or_else(|| ProviderError::protocol("Anthropic body has no content array"))?;

            let finish = value
                .get("stop_reason")
                .and_then(Value::as_str)
                .map(anthropic_finish)
                .unwrap_or(FinishReason::Stop);

            let usage = value.get("usage").and_then(|u| {
                Some(TokenUsage::reported(
                    u.get("input_tokens")?.as_u64()? as u32,
                    u.get("output_tokens").and_then(Value::as_u64).unwrap_or(0) as u32,
                ))
            });

            Ok((text, finish, usage))
        }
        ModelFamily::Titan => {
            let result = value
                .pointer("/results/0")
                .ok_or_else(|| ProviderError::protocol("Titan body has no results"))?;
            let text = result
                .get("outputText")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let finish = result
                .get("completionReason")
                .and_then(Value::as_str)
                .map(titan_finish)
                .unwrap_or(FinishReason::Stop);

            let usage = match (
                value.get("inputTextTokenCount").and_then(Value::as_u64),
                result.get("tokenCount").and_then(Value::as_u64),
            ) {
                (Some(input), Some(output)) => {
                    Some(TokenUsage::reported(input as u32, output as u32))
                }
                _ => None,
            };

            Ok((text, finish, usage))
        }
        ModelFamily::Meta => {
            let text = value
                .get("generation")
                .and_then(Value::as_str)
                .ok_or_else(|| ProviderError::protocol("Meta body has no generation"))?
                .to_string();
            let finish = value
                .get("stop_reason")
                .and_then(Value::as_str)
                .map(meta_finish)
                .unwrap_or(FinishReason::Stop);

            let usage = match (
                value.get("prompt_token_count").and_then(Value::as_u64),
                value.get("generation_token_count").and_then(Value::as_u64),
            ) {
                (Some(input), Some(output)) => {
                    Some(TokenUsage::reported(input as u32, output as u32))
                }
                _ => None,
            };

            Ok((text, finish, usage))
        }
    }
}

// ──────────────────────────────────────────────────────────────────────────────
// Event-stream framing
// ──────────────────────────────────────────────────────────────────────────────

/// One decoded event-stream message.
#[derive(Debug)]
pub(crate) struct Frame {
    pub message_type: Option<String>,
    pub exception_type: Option<String>,
    pub payload: Vec<u8>,
}

/// Incremental decoder for `application/vnd.amazon.eventstream`.
///
/// Message layout: `[4B total length][4B headers length][4B prelude CRC]
/// [headers][payload][4B message CRC]`, lengths big-endian.
#[derive(Default)]
pub(crate) struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    /// Feed bytes and drain any complete frames.
    pub(crate) fn push(&mut self, bytes: &[u8]) -> Result<Vec<Frame>, ProviderError> {
        self.buf.extend_from_slice(bytes);
        let mut frames = Vec::new();

        loop {
            if self.buf.len() < 12 {
                break;
            }
            let total_len = u32::from_be_bytes(self.buf[0..4].try_into().unwrap()) as usize;
            let headers_len = u32::from_be_bytes(self.buf[4..8].try_into().unwrap()) as usize;
            if total_len < 16 || headers_len > total_len - 16 {
                return Err(ProviderError::protocol("malformed event-stream prelude"));
            }
            if self.buf.len() < total_len {
                break;
            }

            let headers = parse_headers(&self.buf[12..12 + headers_len])?;
            let payload = self.buf[12 + headers_len..total_len - 4].to_vec();
            self.buf.drain(..total_len);

            frames.push(Frame {
                message_type: headers.iter().find(|(k, _)| k == ":message-type").map(|(_, v)| v.clone()),
                exception_type: headers
                    .iter()
                    .find(|(k, _)| k == ":exception-type")
                    .map(|(_, v)| v.clone()),
                payload,
            });
        }

        Ok(frames)
    }
}

/// Parse event-stream headers, keeping string-valued entries.
fn parse_headers(mut buf: &[u8]) -> Result<Vec<(String, String)>, ProviderError> {
    let mut headers = Vec::new();
    while !buf.is_empty() {
        let malformed = || ProviderError::protocol("malformed event-stream header");

        let name_len = *buf.first().ok_or_else(malformed)? as usize;
        buf = &buf[1..];
        if buf.len() < name_len + 1 {
            return Err(malformed());
        }
        let name = String::from_utf8_lossy(&buf[..name_len]).into_owned();
        buf = &buf[name_len..];

        let value_type = buf[0];
        buf = &buf[1..];
        match value_type {
            // bool true / false — no value bytes
            0 | 1 => {}
            // byte
            2 => buf = buf.get(1..).ok_or_else(malformed)?,
            // i16
            3 => buf = buf.get(2..).ok_or_else(malformed)?,
            // i32
            4 => buf = buf.get(4..).ok_or_else(malformed)?,
            // i64 / timestamp
            5 | 8 => buf = buf.get(8..).ok_or_else(malformed)?,
            // byte array / string — 2B length prefix
            6 | 7 => {
                if buf.len() < 2 {
                    return Err(malformed());
                }
                let len = u16::from_be_bytes(buf[0..2].try_into().unwrap()) as usize;
                buf = &buf[2..];
                if buf.len() < len {
                    return Err(malformed());
                }
                if value_type == 7 {
                    headers.push((name.clone(), String::from_utf8_lossy(&buf[..len]).into_owned()));
                }
                buf = &buf[len..];
                continue;
            }
            // uuid
            9 => buf = buf.get(16..).ok_or_else(malformed)?,
            _ => return Err(malformed()),
        }
    }
    Ok(headers)
}

/// Map a Bedrock modeled exception name onto the closed error set.
fn exception_error(exception: &str, detail: &str) -> ProviderError {
    let kind = if exception.contains("throttling") || exception.contains("Throttling") {
        ErrorKind::RateLimited
    } else if exception.contains("accessDenied") || exception.contains("AccessDenied") {
        ErrorKind::Auth
    } else if exception.contains("resourceNotFound") || exception.contains("ResourceNotFound") {
        ErrorKind::ModelNotFound
    } else if exception.contains("Timeout") || exception.contains("timeout") {
        ErrorKind::Cancelled
    } else {
        ErrorKind::Unavailable
    };
    ProviderError::new(kind, format!("{exception}: {detail}"))
}

/// Unwrap the `{"bytes": base64}` envelope of a chunk frame.
fn decode_chunk_payload(payload: &[u8]) -> Result<Value, ProviderError> {
    let envelope: Value = serde_json::from_slice(payload)
        .map_err(|e| ProviderError::protocol(format!("malformed chunk envelope: {e}")))?;
    let encoded = envelope
        .get("bytes")
        .and_then(Value::as_str)
        .ok_or_else(|| ProviderError::protocol("chunk envelope has no bytes field"))?;
    let decoded = BASE64
        .decode(encoded)
        .map_err(|e| ProviderError::protocol(format!("chunk bytes not base64: {e}")))?;
    serde_json::from_slice(&decoded)
        .map_err(|e| ProviderError::protocol(format!("malformed chunk event: {e}")))
}

struct StreamState<S> {
    inner: S,
    decoder: FrameDecoder,
    pending: std::collections::VecDeque<Frame>,
    family: ModelFamily,
    model: String,
    prompt_chars: usize,
    output_chars: usize,
    reported_input: Option<u32>,
    reported_output: Option<u32>,
    finish: Option<FinishReason>,
    ended: bool,
}

impl<S> StreamState<S> {
    fn terminal(&mut self) -> StreamChunk {
        self.ended = true;
        match self.finish {
            Some(reason) => {
                let usage = match (self.reported_input, self.reported_output) {
                    (Some(input), Some(output)) => TokenUsage::reported(input, output),
                    _ => TokenUsage::estimated(
                        estimate_tokens(self.prompt_chars),
                        estimate_tokens(self.output_chars),
                    ),
                };
                StreamChunk::terminal(ProviderName::Aws, self.model.clone(), reason, Some(usage))
            }
            None => {
                StreamChunk::terminal(ProviderName::Aws, self.model.clone(), FinishReason::Error, None)
            }
        }
    }

    /// Digest one family event; returns the delta text to yield, if any,
    /// and whether the event closes the logical message.
    fn apply(&mut self, event: &Value) -> (Option<String>, bool) {
        // Invocation metrics ride on the last event of every family.
        if let Some(metrics) = event.get("amazon-bedrock-invocationMetrics") {
            if let Some(n) = metrics.get("inputTokenCount").and_then(Value::as_u64) {
                self.reported_input = Some(n as u32);
            }
            if let Some(n) = metrics.get("outputTokenCount").and_then(Value::as_u64) {
                self.reported_output = Some(n as u32);
            }
        }

        match self.family {
            ModelFamily::Anthropic => match event.get("type").and_then(Value::as_str) {
                Some("message_start") => {
                    if let Some(n) = event
                        .pointer("/message/usage/input_tokens")
                        .and_then(Value::as_u64)
                    {
                        self.reported_input = Some(n as u32);
                    }
                    (None, false)
                }
                Some("content_block_delta") => {
                    let delta = event
                        .pointer("/delta/text")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string();
                    (Some(delta).filter(|d| !d.is_empty()), false)
                }
                Some("message_delta") => {
                    if let Some(reason) =
                        event.pointer("/delta/stop_reason").and_then(Value::as_str)
                    {
                        self.finish = Some(anthropic_finish(reason));
                    }
                    if let Some(n) = event
                        .pointer("/usage/output_tokens")
                        .and_then(Value::as_u64)
                    {
                        self.reported_output = Some(n as u32);
                    }
                    (None, false)
                }
                Some("message_stop") => (None, true),
                _ => (None, false),
            },
            ModelFamily::Titan => {
                if let Some(reason) = event.get("completionReason").and_then(Value::as_str) {
                    self.finish = Some(titan_finish(reason));
                }
                if let Some(n) = event.get("inputTextTokenCount").and_then(Value::as_u64) {
                    self.reported_input = Some(n as u32);
                }
                let delta = event
                    .get("outputText")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                (Some(delta).filter(|d| !d.is_empty()), false)
            }
            ModelFamily::Meta => {
                if let Some(reason) = event.get("stop_reason").and_then(Value::as_str) {
                    self.finish = Some(meta_finish(reason));
                }
                if let Some(n) = event.get("prompt_token_count").and_then(Value::as_u64) {
                    self.reported_input = Some(n as u32);
                }
                if let Some(n) = event.get("generation_token_count").and_then(Value::as_u64) {
                    self.reported_output = Some(n as u32);
                }
                let delta = event
                    .get("generation")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                (Some(delta).filter(|d| !d.is_empty()), false)
            }
        }
    }
}

fn bedrock_chunk_stream<S>(
    inner: S,
    family: ModelFamily,
    model: String,
    prompt_chars: usize,
) -> ChunkStream
where
    S: Stream<Item = Result<bytes::Bytes, ProviderError>> + Send + 'static,
{
    let state = StreamState {
        inner: inner.boxed(),
        decoder: FrameDecoder::default(),
        pending: std::collections::VecDeque::new(),
        family,
        model,
        prompt_chars,
        output_chars: 0,
        reported_input: None,
        reported_output: None,
        finish: None,
        ended: false,
    };

    Box::pin(futures_util::stream::unfold(state, |mut st| async move {
        loop {
            if st.ended {
                return None;
            }

            if let Some(frame) = st.pending.pop_front() {
                if frame.message_type.as_deref() == Some("exception")
                    || frame.exception_type.is_some()
                {
                    st.ended = true;
                    let name = frame.exception_type.unwrap_or_else(|| "exception".into());
                    let detail = String::from_utf8_lossy(&frame.payload).into_owned();
                    return Some((Err(exception_error(&name, &detail)), st));
                }

                let event = match decode_chunk_payload(&frame.payload) {
                    Ok(v) => v,
                    Err(e) => {
                        st.ended = true;
                        return Some((Err(e), st));
                    }
                };

                let (delta, end_now) = st.apply(&event);
                if let Some(delta) = delta {
                    st.output_chars += delta.len();
                    let chunk = StreamChunk::delta(ProviderName::Aws, st.model.clone(), delta);
                    return Some((Ok(chunk), st));
                }
                if end_now {
                    let terminal = st.terminal();
                    return Some((Ok(terminal), st));
                }
                continue;
            }

            match st.inner.next().await {
                Some(Ok(bytes)) => match st.decoder.push(&bytes) {
                    Ok(frames) => st.pending.extend(frames),
                    Err(e) => {
                        st.ended = true;
                        return Some((Err(e), st));
                    }
                },
                Some(Err(e)) => {
                    st.ended = true;
                    return Some((Err(e), st));
                }
                None => {
                    let terminal = st.terminal();
                    return Some((Ok(terminal), st));
                }
            }
        }
    }))
}

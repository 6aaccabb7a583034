//! OpenAI chat-completions schema translation, shared by every backend that
//! speaks it (Azure OpenAI, Ollama, vLLM).
//!
//! Pure functions only — the adapters own their HTTP clients and call in
//! here for request building, response parsing, and the SSE→chunk state
//! machine.

use futures_util::{Stream, StreamExt};
use serde_json::{json, Value};

use super::{estimate_tokens, ChunkStream};
use crate::error::ProviderError;
use crate::types::{
    CompletionRequest, CompletionResponse, FinishReason, ProviderName, StreamChunk, TokenUsage,
};

/// Build a chat-completions request body.
pub(crate) fn build_chat_body(request: &CompletionRequest, model: &str, stream: bool) -> Value {
    let messages: Vec<Value> = request
        .messages
        .iter()
        .map(|m| json!({ "role": m.role.to_string(), "content": m.content }))
        .collect();

    let mut body = json!({
        "model": model,
        "messages": messages,
        "stream": stream,
    });

    if let Some(t) = request.temperature {
        body["temperature"] = json!(t);
    }
    if let Some(n) = request.max_tokens {
        body["max_tokens"] = json!(n);
    }
    if let Some(p) = request.top_p {
        body["top_p"] = json!(p);
    }
    if !request.stop.is_empty() {
        body["stop"] = json!(request.stop);
    }
    if stream {
        // Ask for the final usage event; backends that predate the option
        // ignore it and we fall back to estimation.
        body["stream_options"] = json!({ "include_usage": true });
    }

    body
}

pub(crate) fn finish_reason_from(s: &str) -> FinishReason {
    match s {
        "length" => FinishReason::Length,
        "content_filter" => FinishReason::ContentFilter,
        "tool_calls" | "function_call" => FinishReason::ToolCall,
        _ => FinishReason::Stop,
    }
}

fn usage_from(value: &Value) -> Option<TokenUsage> {
    let prompt = value.get("prompt_tokens")?.as_u64()? as u32;
    let completion = value.get("completion_tokens").and_then(Value::as_u64).unwrap_or(0) as u32;
    Some(TokenUsage::reported(prompt, completion))
}

/// Parse a non-streaming chat-completions response.
///
/// `prompt_chars` feeds the usage estimate when the backend reports none.
/// The returned `cost_usd` is zero — pricing is the router's concern.
pub(crate) fn parse_chat_response(
    body: Value,
    provider: ProviderName,
    model: &str,
    prompt_chars: usize,
) -> Result<CompletionResponse, ProviderError> {
    let text = body
        .pointer("/choices/0/message/content")
        .and_then(Value::as_str)
        .ok_or_else(|| ProviderError::protocol("response has no choices[0].message.content"))?
        .to_string();

    let finish_reason = body
        .pointer("/choices/0/finish_reason")
        .and_then(Value::as_str)
        .map(finish_reason_from)
        .unwrap_or(FinishReason::Stop);

    let usage = body
        .get("usage")
        .and_then(usage_from)
        .unwrap_or_else(|| {
            TokenUsage::estimated(estimate_tokens(prompt_chars), estimate_tokens(text.len()))
        });

    Ok(CompletionResponse {
        text,
        provider,
        model: model.to_string(),
        usage,
        cost_usd: 0.0,
        finish_reason,
    })
}

/// Parse an embeddings response into same-dimension vectors.
pub(crate) fn parse_embeddings(body: Value) -> Result<Vec<Vec<f32>>, ProviderError> {
    let data = body
        .get("data")
        .and_then(Value::as_array)
        .ok_or_else(|| ProviderError::protocol("embeddings response has no data array"))?;

    let mut vectors = Vec::with_capacity(data.len());
    for item in data {
        let embedding = item
            .get("embedding")
            .and_then(Value::as_array)
            .ok_or_else(|| ProviderError::protocol("embeddings item has no embedding array"))?;
        let vector: Vec<f32> = embedding
            .iter()
            .filter_map(Value::as_f64)
            .map(|v| v as f32)
            .collect();
        if vector.len() != embedding.len() {
            return Err(ProviderError::protocol("non-numeric value in embedding vector"));
        }
        vectors.push(vector);
    }

    if let Some(first) = vectors.first() {
        let dim = first.len();
        if vectors.iter().any(|v| v.len() != dim) {
            return Err(ProviderError::protocol("embedding vectors differ in dimension"));
        }
    }

    Ok(vectors)
}

struct StreamState<S> {
    events: S,
    provider: ProviderName,
    model: String,
    prompt_chars: usize,
    output_chars: usize,
    finish: Option<FinishReason>,
    usage: Option<TokenUsage>,
    ended: bool,
}

impl<S> StreamState<S> {
    fn terminal(&mut self) -> StreamChunk {
        self.ended = true;
        match self.finish {
            Some(reason) => {
                let usage = self.usage.unwrap_or_else(|| {
                    TokenUsage::estimated(
                        estimate_tokens(self.prompt_chars),
                        estimate_tokens(self.output_chars),
                    )
                });
                StreamChunk::terminal(self.provider, self.model.clone(), reason, Some(usage))
            }
            // Backend closed without a finish event — synthesise an error
            // terminal so consumers always see a clean end.
            None => StreamChunk::terminal(self.provider, self.model.clone(), FinishReason::Error, None),
        }
    }
}

/// Drive the SSE payload sequence into the typed chunk contract.
///
/// Deltas are yielded in generation order; `finish_reason` and `usage`
/// payloads are stashed and emitted as the single terminal chunk when the
/// `[DONE]` sentinel (or end of stream) arrives.
pub(crate) fn chunk_stream<S>(
    events: S,
    provider: ProviderName,
    model: String,
    prompt_chars: usize,
) -> ChunkStream
where
    S: Stream<Item = Result<String, ProviderError>> + Send + 'static,
{
    let state = StreamState {
        events: events.boxed(),
        provider,
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
                    if payload == "[DONE]" {
                        let terminal = st.terminal();
                        return Some((Ok(terminal), st));
                    }
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

                    if let Some(usage) = value.get("usage").and_then(usage_from) {
                        st.usage = Some(usage);
                    }
                    if let Some(reason) = value
                        .pointer("/choices/0/finish_reason")
                        .and_then(Value::as_str)
                    {
                        st.finish = Some(finish_reason_from(reason));
                    }
                    let delta = value
                        .pointer("/choices/0/delta/content")
                        .and_then(Value::as_str)
                        .unwrap_or_default();
                    if !delta.is_empty() {
                        st.output_chars += delta.len();
                        let chunk =
                            StreamChunk::delta(st.provider, st.model.clone(), delta);
                        return Some((Ok(chunk), st));
                    }
                    // Bookkeeping-only event; keep reading.
                }
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

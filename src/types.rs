//! Core data model for the gateway — requests, responses, and stream chunks.
//!
//! Every driver speaks its backend's native wire protocol; these types are
//! the single uniform contract all of them translate to and from. Callers
//! build a [`CompletionRequest`], the router resolves tiers and providers,
//! and drivers produce [`CompletionResponse`]s or sequences of
//! [`StreamChunk`]s.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Canonical provider names — the keys of the registry and of every
/// routing chain.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ProviderName {
    /// Azure OpenAI chat-completions API, keyed by deployment name.
    Azure,
    /// AWS Bedrock InvokeModel runtime.
    Aws,
    /// GCP Vertex generative-model endpoint.
    Gcp,
    /// Local Ollama inference server (OpenAI-compatible routes).
    Ollama,
    /// Local vLLM inference server (OpenAI-compatible routes).
    Vllm,
}

impl ProviderName {
    /// All known providers, in canonical order.
    pub const ALL: [ProviderName; 5] = [
        Self::Azure,
        Self::Aws,
        Self::Gcp,
        Self::Ollama,
        Self::Vllm,
    ];

    /// Whether this provider runs on-premise (eligible for local/hybrid routing).
    pub fn is_local(self) -> bool {
        matches!(self, Self::Ollama | Self::Vllm)
    }
}

impl std::fmt::Display for ProviderName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Azure => "azure",
            Self::Aws => "aws",
            Self::Gcp => "gcp",
            Self::Ollama => "ollama",
            Self::Vllm => "vllm",
        })
    }
}

impl std::str::FromStr for ProviderName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "azure" => Ok(Self::Azure),
            "aws" => Ok(Self::Aws),
            "gcp" => Ok(Self::Gcp),
            "ollama" => Ok(Self::Ollama),
            "vllm" => Ok(Self::Vllm),
            other => Err(format!("unknown provider name `{other}`")),
        }
    }
}

/// Quality/cost preset resolved by the catalog to a concrete model id.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ModelTier {
    /// Best available model for the provider.
    Sota,
    /// Cheapest model that is still generally useful.
    CostEffective,
}

impl std::fmt::Display for ModelTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Sota => "sota",
            Self::CostEffective => "cost_effective",
        })
    }
}

/// Data-classification tag carried by a request; hybrid routing rules match
/// against it to force sensitive traffic onto specific providers.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DataClassification {
    Confidential,
    Internal,
    General,
    Public,
}

/// Message role in a chat exchange.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        })
    }
}

/// One message in the conversation history.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: Role::System, content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: content.into() }
    }
}

/// A completion request against the gateway.
///
/// Exactly one of `model` / `tier` is required (a concrete `model` wins when
/// both are set — the tier is then ignored except that pricing is still
/// looked up by model id). Everything else is optional.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CompletionRequest {
    /// Ordered conversation history. Must be non-empty.
    pub messages: Vec<ChatMessage>,

    /// Concrete backend model identifier. Bypasses tier resolution.
    #[serde(default)]
    pub model: Option<String>,

    /// Tier selector, resolved per provider by the catalog.
    #[serde(default)]
    pub tier: Option<ModelTier>,

    /// Sampling temperature in `[0, 2]`.
    #[serde(default)]
    pub temperature: Option<f64>,

    /// Maximum output tokens.
    #[serde(default)]
    pub max_tokens: Option<u32>,

    /// Nucleus-sampling fraction in `(0, 1]`.
    #[serde(default)]
    pub top_p: Option<f64>,

    /// Stop strings forwarded to the backend.
    #[serde(default)]
    pub stop: Vec<String>,

    /// Data-classification tag matched against hybrid routing rules.
    #[serde(default)]
    pub classification: Option<DataClassification>,

    /// Explicit provider override — disables fallback entirely.
    #[serde(default)]
    pub provider: Option<ProviderName>,

    /// Per-call deadline override. Defaults: 60 s completion, 5 min streaming.
    #[serde(skip)]
    pub timeout: Option<Duration>,
}

impl CompletionRequest {
    /// Start a request from the conversation history with a tier selector.
    pub fn with_tier(messages: Vec<ChatMessage>, tier: ModelTier) -> Self {
        Self {
            messages,
            model: None,
            tier: Some(tier),
            temperature: None,
            max_tokens: None,
            top_p: None,
            stop: Vec::new(),
            classification: None,
            provider: None,
            timeout: None,
        }
    }

    /// Start a request from the conversation history with a concrete model id.
    pub fn with_model(messages: Vec<ChatMessage>, model: impl Into<String>) -> Self {
        Self {
            messages,
            model: Some(model.into()),
            tier: None,
            temperature: None,
            max_tokens: None,
            top_p: None,
            stop: Vec::new(),
            classification: None,
            provider: None,
            timeout: None,
        }
    }

    /// Attach a sampling temperature.
    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Attach a max output-token limit.
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Attach a data-classification tag.
    pub fn with_classification(mut self, classification: DataClassification) -> Self {
        self.classification = Some(classification);
        self
    }

    /// Pin the request to one provider, disabling fallback.
    pub fn with_provider(mut self, provider: ProviderName) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Override the default deadline for this call.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Schema validation, run before budget admission.
    pub fn validate(&self) -> Result<(), String> {
        if self.messages.is_empty() {
            return Err("messages must not be empty".into());
        }
        if self.model.is_none() && self.tier.is_none() {
            return Err("either `model` or `tier` is required".into());
        }
        if let Some(t) = self.temperature {
            if !(0.0..=2.0).contains(&t) {
                return Err(format!("temperature {t} outside [0, 2]"));
            }
        }
        if let Some(p) = self.top_p {
            if !(p > 0.0 && p <= 1.0) {
                return Err(format!("top_p {p} outside (0, 1]"));
            }
        }
        if self.max_tokens == Some(0) {
            return Err("max_tokens must be positive".into());
        }
        Ok(())
    }

    /// Total character length of all message bodies — input to the char/4
    /// token estimate when a backend does not report usage.
    pub fn prompt_chars(&self) -> usize {
        self.messages.iter().map(|m| m.content.len()).sum()
    }
}

/// Why the backend stopped generating.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ContentFilter,
    ToolCall,
    Error,
}

/// Token usage for one exchange.
///
/// `estimated` is true when the backend did not report usage and the counts
/// were derived from the char/4 heuristic instead.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
    #[serde(default)]
    pub estimated: bool,
}

impl TokenUsage {
    /// Exact usage as reported by the backend.
    pub fn reported(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
            estimated: false,
        }
    }

    /// Best-effort usage from the char/4 estimate.
    pub fn estimated(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
            estimated: true,
        }
    }
}

/// A completed (non-streaming) exchange.
#[derive(Debug, Clone, Serialize)]
pub struct CompletionResponse {
    /// The generated text.
    pub text: String,
    /// Provider that produced the response.
    pub provider: ProviderName,
    /// Concrete backend model identifier that was invoked.
    pub model: String,
    pub usage: TokenUsage,
    /// Cost in USD, rounded to 6 decimal places.
    pub cost_usd: f64,
    pub finish_reason: FinishReason,
}

/// One element of a streaming response.
///
/// `provider` and `model` are stable across all chunks of one response.
/// Exactly one chunk — the terminal one — carries `finish_reason`, and
/// carries `usage` when the backend exposes it. After the terminal chunk
/// the stream ends cleanly.
#[derive(Debug, Clone, Serialize)]
pub struct StreamChunk {
    /// Text delta; may be empty on non-terminal chunks.
    pub delta: String,
    pub provider: ProviderName,
    pub model: String,
    /// Final usage — present only on the terminal chunk.
    pub usage: Option<TokenUsage>,
    /// Present only on the terminal chunk.
    pub finish_reason: Option<FinishReason>,
}

impl StreamChunk {
    /// A non-terminal delta chunk.
    pub fn delta(provider: ProviderName, model: impl Into<String>, delta: impl Into<String>) -> Self {
        Self {
            delta: delta.into(),
            provider,
            model: model.into(),
            usage: None,
            finish_reason: None,
        }
    }

    /// The terminal chunk.
    pub fn terminal(
        provider: ProviderName,
        model: impl Into<String>,
        finish_reason: FinishReason,
        usage: Option<TokenUsage>,
    ) -> Self {
        Self {
            delta: String::new(),
            provider,
            model: model.into(),
            usage,
            finish_reason: Some(finish_reason),
        }
    }

    /// Whether this is the terminal chunk of its stream.
    pub fn is_terminal(&self) -> bool {
        self.finish_reason.is_some()
    }
}

/// Round a decimal USD amount to the 6-decimal public representation.
pub(crate) fn decimal_to_f64(d: rust_decimal::Decimal) -> f64 {
    use rust_decimal::prelude::ToPrimitive;
    d.round_dp(6).to_f64().unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_request() -> CompletionRequest {
        CompletionRequest::with_tier(vec![ChatMessage::user("hi")], ModelTier::Sota)
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    #[test]
    fn validate_accepts_minimal_request() {
        assert!(minimal_request().validate().is_ok());
    }

    #[test]
    fn validate_rejects_empty_messages() {
        let req = CompletionRequest::with_tier(vec![], ModelTier::Sota);
        assert!(req.validate().is_err());
    }

    #[test]
    fn validate_rejects_missing_model_and_tier() {
        let mut req = minimal_request();
        req.tier = None;
        assert!(req.validate().is_err());
    }

    #[test]
    fn validate_rejects_temperature_out_of_range() {
        assert!(minimal_request().with_temperature(2.5).validate().is_err());
        assert!(minimal_request().with_temperature(-0.1).validate().is_err());
        assert!(minimal_request().with_temperature(2.0).validate().is_ok());
        assert!(minimal_request().with_temperature(0.0).validate().is_ok());
    }

    #[test]
    fn validate_rejects_top_p_out_of_range() {
        let mut req = minimal_request();
        req.top_p = Some(0.0);
        assert!(req.validate().is_err());
        req.top_p = Some(1.0);
        assert!(req.validate().is_ok());
        req.top_p = Some(1.1);
        assert!(req.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_max_tokens() {
        assert!(minimal_request().with_max_tokens(0).validate().is_err());
        assert!(minimal_request().with_max_tokens(1).validate().is_ok());
    }

    // -----------------------------------------------------------------------
    // Provider names
    // -----------------------------------------------------------------------

    #[test]
    fn provider_name_round_trips_through_display_and_from_str() {
        for name in ProviderName::ALL {
            let parsed: ProviderName = name.to_string().parse().unwrap();
            assert_eq!(parsed, name);
        }
    }

    #[test]
    fn provider_name_rejects_unknown() {
        assert!("openai".parse::<ProviderName>().is_err());
    }

    #[test]
    fn local_providers_are_ollama_and_vllm() {
        assert!(ProviderName::Ollama.is_local());
        assert!(ProviderName::Vllm.is_local());
        assert!(!ProviderName::Azure.is_local());
        assert!(!ProviderName::Aws.is_local());
        assert!(!ProviderName::Gcp.is_local());
    }

    // -----------------------------------------------------------------------
    // Chunks & usage
    // -----------------------------------------------------------------------

    #[test]
    fn terminal_chunk_is_terminal() {
        let t = StreamChunk::terminal(ProviderName::Ollama, "m", FinishReason::Stop, None);
        assert!(t.is_terminal());
        let d = StreamChunk::delta(ProviderName::Ollama, "m", "hello");
        assert!(!d.is_terminal());
    }

    #[test]
    fn reported_usage_totals_tokens() {
        let u = TokenUsage::reported(100, 50);
        assert_eq!(u.total_tokens, 150);
        assert!(!u.estimated);
        assert!(TokenUsage::estimated(10, 5).estimated);
    }

    #[test]
    fn prompt_chars_sums_all_messages() {
        let req = CompletionRequest::with_tier(
            vec![ChatMessage::system("abcd"), ChatMessage::user("efgh")],
            ModelTier::Sota,
        );
        assert_eq!(req.prompt_chars(), 8);
    }
}

//! Error taxonomy — the driver-level closed set and the public gateway errors.
//!
//! Every backend failure is mapped by its driver into a [`ProviderError`]
//! with one of the closed [`ErrorKind`] values. The kind alone determines
//! router behaviour (fall over, surface, or stop); the message carries the
//! original backend detail for logs. The router in turn surfaces the public
//! [`GatewayError`] taxonomy to callers.

use crate::types::ProviderName;

/// Closed set of failure kinds a driver may report.
///
/// Transient kinds trigger fallback to the next provider in the chain;
/// everything else is surfaced to the caller immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Credentials rejected by the backend.
    Auth,
    /// Backend applied rate limiting (HTTP 429 or equivalent).
    RateLimited,
    /// Network failure, 5xx, or connection refused.
    Unavailable,
    /// The requested model id is unknown to the backend.
    ModelNotFound,
    /// The backend refused the content (safety filter).
    ContentFiltered,
    /// The backend responded with something the driver could not parse.
    Protocol,
    /// Deadline expired or the caller cancelled.
    Cancelled,
    /// Anything else — driver bug or unclassifiable backend behaviour.
    Internal,
    /// The driver does not implement this optional capability (embeddings).
    Unsupported,
}

impl ErrorKind {
    /// Whether the router should continue to the next provider in the chain.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            Self::Unavailable | Self::RateLimited | Self::Internal | Self::Protocol
        )
    }

    /// Stable lowercase label, used in logs and failure lists.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::RateLimited => "rate_limited",
            Self::Unavailable => "unavailable",
            Self::ModelNotFound => "model_not_found",
            Self::ContentFiltered => "content_filtered",
            Self::Protocol => "protocol",
            Self::Cancelled => "cancelled",
            Self::Internal => "internal",
            Self::Unsupported => "unsupported",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A driver failure — kind plus original backend detail.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind}{}: {message}", provider.map(|p| format!(" ({p})")).unwrap_or_default())]
pub struct ProviderError {
    pub kind: ErrorKind,
    /// Which driver produced the error, when known.
    pub provider: Option<ProviderName>,
    /// Original backend detail — for logs, never for dispatch.
    pub message: String,
}

impl ProviderError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, provider: None, message: message.into() }
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Auth, message)
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::RateLimited, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unavailable, message)
    }

    pub fn model_not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ModelNotFound, message)
    }

    pub fn content_filtered(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ContentFiltered, message)
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Protocol, message)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Cancelled, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unsupported, message)
    }

    /// Tag the error with the provider it came from.
    pub fn with_provider(mut self, provider: ProviderName) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Map a reqwest transport error: timeouts are `cancelled`, everything
    /// else (DNS, refused connection, broken pipe) is `unavailable`.
    pub fn from_transport(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::cancelled(err.to_string())
        } else {
            Self::unavailable(err.to_string())
        }
    }
}

/// One entry of the diagnostics list attached to `all_providers_failed`.
#[derive(Debug, Clone)]
pub struct ProviderFailure {
    pub provider: ProviderName,
    pub kind: ErrorKind,
    pub message: String,
}

impl std::fmt::Display for ProviderFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {} ({})", self.provider, self.kind, self.message)
    }
}

/// The taxonomy surfaced to gateway callers.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Circuit OPEN — no driver was contacted.
    #[error("budget exceeded: ${spend_usd:.2} of ${limit_usd:.2} monthly limit")]
    BudgetExceeded { spend_usd: f64, limit_usd: f64 },

    /// Empty registry, or every provider is unconfigured.
    #[error("no providers configured")]
    NoProvidersConfigured,

    /// Every chain entry returned a transient failure.
    #[error("all providers failed: [{}]", .0.iter().map(ToString::to_string).collect::<Vec<_>>().join("; "))]
    AllProvidersFailed(Vec<ProviderFailure>),

    /// A non-transient driver failure surfaced directly.
    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// Caller cancelled or the deadline expired.
    #[error("cancelled")]
    Cancelled,

    /// Schema violation caught before budget admission.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

//! Driver contract and unified dispatch.
//!
//! [`Driver`] wraps a concrete backend adapter chosen at construction time.
//! All routing code interacts with the same five-operation API (`complete`,
//! `stream`, `embed`, `health_check`, `close`); adapter-specific protocol
//! differences — wire encoding, auth headers, stream framing — are fully
//! encapsulated in the adapter modules.
//!
//! Every adapter maps its backend's failures into the closed
//! [`ErrorKind`](crate::error::ErrorKind) set; the router dispatches on the
//! kind alone.

mod azure;
mod bedrock;
mod ollama;
mod openai;
mod sse;
mod vertex;
mod vllm;

pub use azure::AzureDriver;
pub use bedrock::BedrockDriver;
pub use ollama::OllamaDriver;
pub use vertex::VertexDriver;
pub use vllm::VllmDriver;

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};

use futures_util::Stream;

use crate::error::{ErrorKind, ProviderError};
use crate::types::{CompletionRequest, CompletionResponse, ProviderName, StreamChunk};

/// A `Send`-able, heap-allocated stream of typed chunks.
///
/// Finite, single-pass, non-restartable: the caller consumes it to
/// completion or cancels it by dropping. The driver guarantees generation
/// order, exactly one terminal chunk, and a clean end after it — a backend
/// that closes without a terminal event yields a synthesised
/// `finish_reason = error` terminal first.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<StreamChunk, ProviderError>> + Send>>;

/// Backend adapter, selected once at construction time.
enum Backend {
    Azure(AzureDriver),
    Bedrock(BedrockDriver),
    Vertex(VertexDriver),
    Ollama(OllamaDriver),
    Vllm(VllmDriver),
}

/// One provider's in-process driver.
///
/// Shared across concurrent requests for the process lifetime; `close`
/// is idempotent and flips the driver into a permanently-unavailable state
/// (the pooled connections are released when the last reference drops).
pub struct Driver {
    name: ProviderName,
    backend: Backend,
    closed: AtomicBool,
}

impl Driver {
    pub fn azure(adapter: AzureDriver) -> Self {
        Self::wrap(ProviderName::Azure, Backend::Azure(adapter))
    }

    pub fn bedrock(adapter: BedrockDriver) -> Self {
        Self::wrap(ProviderName::Aws, Backend::Bedrock(adapter))
    }

    pub fn vertex(adapter: VertexDriver) -> Self {
        Self::wrap(ProviderName::Gcp, Backend::Vertex(adapter))
    }

    pub fn ollama(adapter: OllamaDriver) -> Self {
        Self::wrap(ProviderName::Ollama, Backend::Ollama(adapter))
    }

    pub fn vllm(adapter: VllmDriver) -> Self {
        Self::wrap(ProviderName::Vllm, Backend::Vllm(adapter))
    }

    fn wrap(name: ProviderName, backend: Backend) -> Self {
        Self { name, backend, closed: AtomicBool::new(false) }
    }

    pub fn name(&self) -> ProviderName {
        self.name
    }

    /// One non-streaming call. `model` is always a concrete backend id —
    /// tier resolution happened at the router.
    pub async fn complete(
        &self,
        request: &CompletionRequest,
        model: &str,
    ) -> Result<CompletionResponse, ProviderError> {
        self.ensure_open()?;
        let result = match &self.backend {
            Backend::Azure(a) => a.complete(request, model).await,
            Backend::Bedrock(a) => a.complete(request, model).await,
            Backend::Vertex(a) => a.complete(request, model).await,
            Backend::Ollama(a) => a.complete(request, model).await,
            Backend::Vllm(a) => a.complete(request, model).await,
        };
        result.map_err(|e| e.with_provider(self.name))
    }

    /// Open a streaming call and return the typed chunk sequence.
    pub async fn stream(
        &self,
        request: &CompletionRequest,
        model: &str,
    ) -> Result<ChunkStream, ProviderError> {
        self.ensure_open()?;
        let result = match &self.backend {
            Backend::Azure(a) => a.stream(request, model).await,
            Backend::Bedrock(a) => a.stream(request, model).await,
            Backend::Vertex(a) => a.stream(request, model).await,
            Backend::Ollama(a) => a.stream(request, model).await,
            Backend::Vllm(a) => a.stream(request, model).await,
        };
        result.map_err(|e| e.with_provider(self.name))
    }

    /// Embed a batch of texts. Optional capability: Bedrock and Vertex
    /// report `unsupported`.
    pub async fn embed(
        &self,
        texts: &[String],
        model: &str,
    ) -> Result<Vec<Vec<f32>>, ProviderError> {
        self.ensure_open()?;
        let result = match &self.backend {
            Backend::Azure(a) => a.embed(texts, model).await,
            Backend::Ollama(a) => a.embed(texts, model).await,
            Backend::Vllm(a) => a.embed(texts, model).await,
            Backend::Bedrock(_) | Backend::Vertex(_) => {
                Err(ProviderError::unsupported("embeddings not implemented for this backend"))
            }
        };
        result.map_err(|e| e.with_provider(self.name))
    }

    /// Probe the backend for liveness. The registry wraps this in the 5 s
    /// health deadline.
    pub async fn health_check(&self) -> Result<(), ProviderError> {
        self.ensure_open()?;
        let result = match &self.backend {
            Backend::Azure(a) => a.health_check().await,
            Backend::Bedrock(a) => a.health_check().await,
            Backend::Vertex(a) => a.health_check().await,
            Backend::Ollama(a) => a.health_check().await,
            Backend::Vllm(a) => a.health_check().await,
        };
        result.map_err(|e| e.with_provider(self.name))
    }

    /// Mark the driver closed. Idempotent; subsequent calls fail with
    /// `unavailable`.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            tracing::debug!(provider = %self.name, "driver closed");
        }
    }

    fn ensure_open(&self) -> Result<(), ProviderError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(ProviderError::unavailable("driver closed").with_provider(self.name))
        } else {
            Ok(())
        }
    }
}

// ──────────────────────────────────────────────────────────────────────────────
// Shared helpers for adapters
// ──────────────────────────────────────────────────────────────────────────────

/// Best-effort token estimate when a backend reports no usage:
/// one token per four characters, rounded up.
pub(crate) fn estimate_tokens(chars: usize) -> u32 {
    chars.div_ceil(4) as u32
}

/// Map an HTTP error status to the closed error-kind set.
pub(crate) fn kind_for_status(status: reqwest::StatusCode) -> ErrorKind {
    match status.as_u16() {
        401 | 403 => ErrorKind::Auth,
        404 => ErrorKind::ModelNotFound,
        429 => ErrorKind::RateLimited,
        500..=599 => ErrorKind::Unavailable,
        _ => ErrorKind::Internal,
    }
}

/// Build a [`ProviderError`] from a non-2xx response status and body.
pub(crate) fn error_for_status(status: reqwest::StatusCode, body: &str) -> ProviderError {
    ProviderError::new(kind_for_status(status), format!("HTTP {status}: {body}"))
}

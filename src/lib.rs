//! Multi-cloud AI provider gateway.
//!
//! One uniform request/response/streaming contract across heterogeneous
//! LLM backends — Azure OpenAI, AWS Bedrock, GCP Vertex, and the
//! self-hosted Ollama and vLLM servers — with three cross-cutting controls
//! layered on top:
//!
//! - an ordered **fallback router** that walks a provider chain until one
//!   succeeds,
//! - a monthly-budget **circuit breaker** fed by a **cost tracker** that
//!   converts token usage to USD, and
//! - a data-classification-driven **hybrid routing** policy that can force
//!   sensitive traffic onto on-premise models.
//!
//! The crate is loaded as a library by its consumers (a REST layer, an
//! agent layer); [`Gateway`] is the single public entry point.
//!
//! ```rust,no_run
//! use ai_gateway::{ChatMessage, CompletionRequest, Config, Gateway, ModelTier};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::load(std::path::Path::new("/etc/ai-gateway/config.toml"))?;
//! let gateway = Gateway::new(config);
//!
//! let request = CompletionRequest::with_tier(
//!     vec![ChatMessage::user("Summarise this quarter's filings.")],
//!     ModelTier::CostEffective,
//! );
//! let response = gateway.complete(request).await?;
//! println!("{} (${:.4} via {})", response.text, response.cost_usd, response.provider);
//! # Ok(())
//! # }
//! ```

mod budget;
mod catalog;
mod config;
mod cost;
mod drivers;
mod error;
mod registry;
mod router;
mod types;

pub use budget::{BudgetBreaker, BudgetSnapshot, CircuitState, Clock};
pub use catalog::{ModelCatalog, ModelSpec};
pub use config::{Config, HybridRule, RoutingMode};
pub use cost::{CostFilter, CostRecord, CostSummary, CostTracker};
pub use drivers::{ChunkStream, Driver};
pub use error::{ErrorKind, GatewayError, ProviderError, ProviderFailure};
pub use registry::{HealthStatus, ProviderRegistry};
pub use router::{Gateway, GatewayStream};
pub use types::{
    ChatMessage, CompletionRequest, CompletionResponse, DataClassification, FinishReason,
    ModelTier, ProviderName, Role, StreamChunk, TokenUsage,
};

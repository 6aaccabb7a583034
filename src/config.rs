//! Configuration for the gateway.
//!
//! Config is loaded once at startup from a TOML file and validated before
//! any driver is constructed. Invalid configs are rejected with a clear
//! error rather than silently falling back to defaults. Configuration is
//! immutable after load; catalog and routing changes require a restart.
//!
//! Secrets never live in the file: each provider section names an
//! environment variable (`api_key_env`, `access_token_env`) whose value is
//! resolved at startup. A provider whose section is missing, or whose
//! required secret is unset, is *unconfigured* — excluded from routing and
//! reported as skipped by health checks.
//!
//! # Example
//! ```toml
//! [routing]
//! mode           = "cloud"
//! fallback_chain = ["azure", "aws", "gcp"]
//!
//! [budget]
//! monthly_limit_usd = 500.0
//!
//! [providers.azure]
//! endpoint    = "https://myorg.openai.azure.com"
//! api_key_env = "AZURE_OPENAI_API_KEY"
//!
//! [providers.ollama]
//! endpoint = "http://localhost:11434"
//! ```

use std::path::Path;

use anyhow::Context;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::types::{DataClassification, ProviderName};

/// Base routing policy — which chain a request walks when it carries no
/// explicit provider.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RoutingMode {
    /// Walk the configured `fallback_chain`, filtered to available providers.
    #[default]
    Cloud,
    /// Walk the configured `local_chain` only.
    Local,
    /// Match `data_classification` against `hybrid_rules` (first match wins);
    /// unmatched requests fall through to the cloud chain.
    Hybrid,
}

impl std::fmt::Display for RoutingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Cloud => "cloud",
            Self::Local => "local",
            Self::Hybrid => "hybrid",
        })
    }
}

/// One hybrid routing rule. Rules are matched in order; the first whose
/// classification equals the request's tag wins.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HybridRule {
    pub classification: DataClassification,
    pub provider: ProviderName,
}

/// Top-level gateway configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub routing: RoutingConfig,

    #[serde(default)]
    pub budget: BudgetConfig,

    #[serde(default)]
    pub providers: ProvidersConfig,
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content =
            std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let config: Self = toml::from_str(&content).context("parsing config TOML")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let b = &self.budget;
        anyhow::ensure!(
            b.monthly_limit_usd > 0.0,
            "budget.monthly_limit_usd must be positive (got {})",
            b.monthly_limit_usd
        );
        // The breaker keeps spend as fixed-scale decimal; the limit must
        // survive that conversion (rejects inf and values past Decimal's
        // ~7.9e28 ceiling).
        anyhow::ensure!(
            b.monthly_limit_usd.is_finite() && Decimal::from_f64(b.monthly_limit_usd).is_some(),
            "budget.monthly_limit_usd must be a finite decimal-representable amount (got {})",
            b.monthly_limit_usd
        );
        anyhow::ensure!(
            b.alert_threshold > 0.0 && b.alert_threshold <= 1.0,
            "budget.alert_threshold must be in (0, 1] (got {})",
            b.alert_threshold
        );
        anyhow::ensure!(
            b.breaker_threshold > b.alert_threshold && b.breaker_threshold <= 1.0,
            "budget.breaker_threshold must be in (alert_threshold, 1] (got {})",
            b.breaker_threshold
        );

        let r = &self.routing;
        anyhow::ensure!(
            !r.fallback_chain.is_empty(),
            "routing.fallback_chain must not be empty"
        );
        if r.mode == RoutingMode::Local {
            anyhow::ensure!(
                !r.local_chain.is_empty(),
                "routing.local_chain must not be empty when mode is `local`"
            );
        }

        // A zero timeout would make every request against that provider
        // expire instantly; reject it here rather than at request time.
        let p = &self.providers;
        let timeouts = [
            ("azure", p.azure.as_ref().map(|c| c.timeout_ms)),
            ("aws", p.aws.as_ref().map(|c| c.timeout_ms)),
            ("gcp", p.gcp.as_ref().map(|c| c.timeout_ms)),
            ("ollama", p.ollama.as_ref().map(|c| c.timeout_ms)),
            ("vllm", p.vllm.as_ref().map(|c| c.timeout_ms)),
        ];
        for (name, timeout_ms) in timeouts {
            if let Some(ms) = timeout_ms {
                anyhow::ensure!(ms > 0, "providers.{name}.timeout_ms must be positive");
            }
        }

        Ok(())
    }
}

/// Routing policy section.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RoutingConfig {
    #[serde(default)]
    pub mode: RoutingMode,

    /// First element of the default fallback chain.
    #[serde(default = "defaults::default_provider")]
    pub default_provider: ProviderName,

    /// Order tried when mode is `cloud` (and the hybrid fall-through order).
    #[serde(default = "defaults::fallback_chain")]
    pub fallback_chain: Vec<ProviderName>,

    /// Order tried when mode is `local`.
    #[serde(default = "defaults::local_chain")]
    pub local_chain: Vec<ProviderName>,

    /// Classification → provider rules, first match wins.
    #[serde(default)]
    pub hybrid_rules: Vec<HybridRule>,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            mode: RoutingMode::default(),
            default_provider: defaults::default_provider(),
            fallback_chain: defaults::fallback_chain(),
            local_chain: defaults::local_chain(),
            hybrid_rules: Vec::new(),
        }
    }
}

impl RoutingConfig {
    /// The effective cloud chain: `default_provider` first, then the
    /// configured `fallback_chain` with duplicates removed.
    pub fn cloud_chain(&self) -> Vec<ProviderName> {
        let mut chain = vec![self.default_provider];
        for &name in &self.fallback_chain {
            if !chain.contains(&name) {
                chain.push(name);
            }
        }
        chain
    }

    /// First hybrid rule matching the classification, if any.
    pub fn match_rule(&self, classification: DataClassification) -> Option<&HybridRule> {
        self.hybrid_rules
            .iter()
            .find(|r| r.classification == classification)
    }
}

/// Budget circuit-breaker settings.
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct BudgetConfig {
    /// Monthly ceiling in USD. Must be positive.
    #[serde(default = "defaults::monthly_limit_usd")]
    pub monthly_limit_usd: f64,

    /// Usage ratio at which the circuit enters HALF_OPEN (alerting).
    #[serde(default = "defaults::alert_threshold")]
    pub alert_threshold: f64,

    /// Usage ratio at which the circuit OPENs (admissions denied).
    #[serde(default = "defaults::breaker_threshold")]
    pub breaker_threshold: f64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            monthly_limit_usd: defaults::monthly_limit_usd(),
            alert_threshold: defaults::alert_threshold(),
            breaker_threshold: defaults::breaker_threshold(),
        }
    }
}

/// Per-provider sections. A missing section means that provider is
/// unconfigured.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ProvidersConfig {
    #[serde(default)]
    pub azure: Option<AzureConfig>,
    #[serde(default)]
    pub aws: Option<AwsConfig>,
    #[serde(default)]
    pub gcp: Option<GcpConfig>,
    #[serde(default)]
    pub ollama: Option<OllamaConfig>,
    #[serde(default)]
    pub vllm: Option<VllmConfig>,
}

/// Resolve an env-var name to its value, treating empty values as unset.
fn env_value(var: &str) -> Option<String> {
    std::env::var(var).ok().filter(|v| !v.is_empty())
}

/// Azure OpenAI — chat-completions API keyed by deployment name.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AzureConfig {
    /// Resource endpoint, e.g. `https://myorg.openai.azure.com`.
    pub endpoint: String,

    /// Environment variable holding the `api-key` value.
    pub api_key_env: String,

    /// API version query parameter.
    #[serde(default = "defaults::azure_api_version")]
    pub api_version: String,

    /// Request timeout in milliseconds (default: 60 000).
    #[serde(default = "defaults::timeout_ms")]
    pub timeout_ms: u64,

    /// Catalog override: deployment name resolved for the `sota` tier.
    #[serde(default)]
    pub sota_model: Option<String>,

    /// Catalog override: deployment name resolved for the `cost_effective` tier.
    #[serde(default)]
    pub cost_effective_model: Option<String>,
}

impl AzureConfig {
    pub fn api_key(&self) -> Option<String> {
        env_value(&self.api_key_env)
    }

    pub fn is_configured(&self) -> bool {
        self.api_key().is_some()
    }
}

/// AWS Bedrock — InvokeModel runtime, bearer API-key auth.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AwsConfig {
    /// Bedrock region, e.g. `us-east-1`.
    pub region: String,

    /// Environment variable holding the Bedrock API key.
    pub api_key_env: String,

    /// Override the runtime endpoint (tests); defaults to the regional host.
    #[serde(default)]
    pub endpoint: Option<String>,

    #[serde(default = "defaults::timeout_ms")]
    pub timeout_ms: u64,

    #[serde(default)]
    pub sota_model: Option<String>,

    #[serde(default)]
    pub cost_effective_model: Option<String>,
}

impl AwsConfig {
    pub fn api_key(&self) -> Option<String> {
        env_value(&self.api_key_env)
    }

    pub fn is_configured(&self) -> bool {
        self.api_key().is_some()
    }
}

/// GCP Vertex — generative-model endpoint, bearer access-token auth.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GcpConfig {
    pub project_id: String,

    /// Vertex region, e.g. `us-central1`.
    pub region: String,

    /// Environment variable holding an OAuth access token. Refresh is the
    /// deployment's concern, not the gateway's.
    pub access_token_env: String,

    /// Override the endpoint (tests); defaults to the regional host.
    #[serde(default)]
    pub endpoint: Option<String>,

    #[serde(default = "defaults::timeout_ms")]
    pub timeout_ms: u64,

    #[serde(default)]
    pub sota_model: Option<String>,

    #[serde(default)]
    pub cost_effective_model: Option<String>,
}

impl GcpConfig {
    pub fn access_token(&self) -> Option<String> {
        env_value(&self.access_token_env)
    }

    pub fn is_configured(&self) -> bool {
        self.access_token().is_some()
    }
}

/// Ollama local inference server. Keyless.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OllamaConfig {
    #[serde(default = "defaults::ollama_endpoint")]
    pub endpoint: String,

    #[serde(default = "defaults::timeout_ms")]
    pub timeout_ms: u64,

    #[serde(default)]
    pub sota_model: Option<String>,

    #[serde(default)]
    pub cost_effective_model: Option<String>,
}

impl OllamaConfig {
    /// A present section is enough — local Ollama needs no credentials.
    pub fn is_configured(&self) -> bool {
        true
    }
}

/// vLLM local inference server. Optionally authenticated.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct VllmConfig {
    #[serde(default = "defaults::vllm_endpoint")]
    pub endpoint: String,

    /// Environment variable holding a bearer token, when the server
    /// was started with `--api-key`. Leave unset for open servers.
    #[serde(default)]
    pub api_key_env: Option<String>,

    #[serde(default = "defaults::timeout_ms")]
    pub timeout_ms: u64,

    #[serde(default)]
    pub sota_model: Option<String>,

    #[serde(default)]
    pub cost_effective_model: Option<String>,
}

impl VllmConfig {
    pub fn api_key(&self) -> Option<String> {
        self.api_key_env.as_deref().and_then(env_value)
    }

    /// The key is optional, so a present section is always configured.
    pub fn is_configured(&self) -> bool {
        true
    }
}

mod defaults {
    use crate::types::ProviderName;

    pub fn default_provider() -> ProviderName {
        ProviderName::Azure
    }
    pub fn fallback_chain() -> Vec<ProviderName> {
        vec![ProviderName::Azure, ProviderName::Aws, ProviderName::Gcp]
    }
    pub fn local_chain() -> Vec<ProviderName> {
        vec![ProviderName::Ollama, ProviderName::Vllm]
    }
    pub fn monthly_limit_usd() -> f64 { 500.0 }
    pub fn alert_threshold() -> f64 { 0.8 }
    pub fn breaker_threshold() -> f64 { 0.95 }
    pub fn timeout_ms() -> u64 { 60_000 }
    pub fn azure_api_version() -> String { "2024-06-01".into() }
    pub fn ollama_endpoint() -> String { "http://localhost:11434".into() }
    pub fn vllm_endpoint() -> String { "http://localhost:8000".into() }
}

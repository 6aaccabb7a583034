//! Model tier catalog — maps `(provider, tier)` to a concrete backend model
//! identifier and its published per-token prices.
//!
//! The catalog is built once at startup from the built-in table plus any
//! per-provider overrides in the config, and is read-only afterwards. Tier
//! resolution happens exactly once per attempt, at the router, so a request
//! carrying a tier never reaches a driver with anything other than a
//! concrete model id.
//!
//! Pricing is looked up by model id alone; an id unknown to the catalog is
//! priced at zero, and the cost tracker flags that record.

use std::collections::HashMap;
use std::str::FromStr;

use rust_decimal::Decimal;

use crate::config::Config;
use crate::types::{ModelTier, ProviderName};

/// One catalog entry: a concrete model with its published prices.
#[derive(Debug, Clone)]
pub struct ModelSpec {
    pub provider: ProviderName,
    pub tier: ModelTier,
    /// Backend-specific identifier (deployment name on Azure, model id on
    /// Bedrock/Vertex, tag on Ollama, HF repo path on vLLM).
    pub model_id: String,
    /// USD per 1 000 input tokens.
    pub input_per_1k: Decimal,
    /// USD per 1 000 output tokens.
    pub output_per_1k: Decimal,
    pub context_window: u32,
}

/// Static catalog, keyed by `(provider, tier)` and by model id.
pub struct ModelCatalog {
    specs: Vec<ModelSpec>,
    by_tier: HashMap<(ProviderName, ModelTier), usize>,
    by_id: HashMap<String, usize>,
}

/// Parse a static price literal. Only called on compiled-in table entries.
fn price(s: &str) -> Decimal {
    Decimal::from_str(s).expect("static price literal")
}

fn spec(
    provider: ProviderName,
    tier: ModelTier,
    model_id: &str,
    input_per_1k: &str,
    output_per_1k: &str,
    context_window: u32,
) -> ModelSpec {
    ModelSpec {
        provider,
        tier,
        model_id: model_id.into(),
        input_per_1k: price(input_per_1k),
        output_per_1k: price(output_per_1k),
        context_window,
    }
}

/// Built-in table. The first entry per `(provider, tier)` is the one tier
/// resolution returns; later entries exist for pricing lookups only (the
/// Bedrock Titan/Llama families a caller can name explicitly).
fn builtin_specs() -> Vec<ModelSpec> {
    use ModelTier::{CostEffective, Sota};
    use ProviderName::{Aws, Azure, Gcp, Ollama, Vllm};

    vec![
        spec(Azure, Sota, "gpt-4o", "0.0025", "0.01", 128_000),
        spec(Azure, CostEffective, "gpt-4o-mini", "0.00015", "0.0006", 128_000),
        spec(
            Aws,
            Sota,
            "anthropic.claude-3-5-sonnet-20241022-v2:0",
            "0.003",
            "0.015",
            200_000,
        ),
        spec(
            Aws,
            CostEffective,
            "anthropic.claude-3-5-haiku-20241022-v1:0",
            "0.0008",
            "0.004",
            200_000,
        ),
        // Pricing-only Bedrock families, reachable by explicit model id.
        spec(Aws, Sota, "meta.llama3-70b-instruct-v1:0", "0.00265", "0.0035", 8_000),
        spec(Aws, CostEffective, "meta.llama3-8b-instruct-v1:0", "0.0003", "0.0006", 8_000),
        spec(Aws, CostEffective, "amazon.titan-text-express-v1", "0.0002", "0.0006", 8_000),
        spec(Gcp, Sota, "gemini-1.5-pro", "0.00125", "0.005", 2_097_152),
        spec(Gcp, CostEffective, "gemini-1.5-flash", "0.000075", "0.0003", 1_048_576),
        // Self-hosted backends carry no per-token price.
        spec(Ollama, Sota, "llama3.1:70b", "0", "0", 131_072),
        spec(Ollama, CostEffective, "llama3.1:8b", "0", "0", 131_072),
        spec(Vllm, Sota, "meta-llama/Llama-3.1-70B-Instruct", "0", "0", 131_072),
        spec(Vllm, CostEffective, "meta-llama/Llama-3.1-8B-Instruct", "0", "0", 131_072),
    ]
}

impl ModelCatalog {
    /// Build the catalog from the built-in table plus config overrides.
    ///
    /// An override swaps the model id resolved for that `(provider, tier)`.
    /// If the new id is already known to the catalog its pricing and context
    /// window are adopted; otherwise the tier entry's defaults are kept (the
    /// operator pointed at a different deployment of the same capability).
    pub fn from_config(config: &Config) -> Self {
        let mut specs = builtin_specs();

        let overrides: [(ProviderName, Option<&str>, Option<&str>); 5] = [
            (
                ProviderName::Azure,
                config.providers.azure.as_ref().and_then(|p| p.sota_model.as_deref()),
                config
                    .providers
                    .azure
                    .as_ref()
                    .and_then(|p| p.cost_effective_model.as_deref()),
            ),
            (
                ProviderName::Aws,
                config.providers.aws.as_ref().and_then(|p| p.sota_model.as_deref()),
                config
                    .providers
                    .aws
                    .as_ref()
                    .and_then(|p| p.cost_effective_model.as_deref()),
            ),
            (
                ProviderName::Gcp,
                config.providers.gcp.as_ref().and_then(|p| p.sota_model.as_deref()),
                config
                    .providers
                    .gcp
                    .as_ref()
                    .and_then(|p| p.cost_effective_model.as_deref()),
            ),
            (
                ProviderName::Ollama,
                config.providers.ollama.as_ref().and_then(|p| p.sota_model.as_deref()),
                config
                    .providers
                    .ollama
                    .as_ref()
                    .and_then(|p| p.cost_effective_model.as_deref()),
            ),
            (
                ProviderName::Vllm,
                config.providers.vllm.as_ref().and_then(|p| p.sota_model.as_deref()),
                config
                    .providers
                    .vllm
                    .as_ref()
                    .and_then(|p| p.cost_effective_model.as_deref()),
            ),
        ];

        for (provider, sota, cost_effective) in overrides {
            if let Some(id) = sota {
                apply_override(&mut specs, provider, ModelTier::Sota, id);
            }
            if let Some(id) = cost_effective {
                apply_override(&mut specs, provider, ModelTier::CostEffective, id);
            }
        }

        Self::from_specs(specs)
    }

    /// The built-in table with no overrides.
    pub fn builtin() -> Self {
        Self::from_specs(builtin_specs())
    }

    /// Build a catalog from explicit entries (test fixtures).
    #[cfg(test)]
    pub(crate) fn with_specs(specs: Vec<ModelSpec>) -> Self {
        Self::from_specs(specs)
    }

    fn from_specs(specs: Vec<ModelSpec>) -> Self {
        let mut by_tier = HashMap::new();
        let mut by_id = HashMap::new();
        for (idx, s) in specs.iter().enumerate() {
            by_tier.entry((s.provider, s.tier)).or_insert(idx);
            by_id.entry(s.model_id.clone()).or_insert(idx);
        }
        Self { specs, by_tier, by_id }
    }

    /// Resolve a tier to the concrete model for one provider.
    pub fn resolve(&self, provider: ProviderName, tier: ModelTier) -> Option<&ModelSpec> {
        self.by_tier.get(&(provider, tier)).map(|&i| &self.specs[i])
    }

    /// Pricing by model id alone. `None` means the id is unknown and the
    /// request will be priced at zero (flagged in the cost record).
    pub fn price_for(&self, model_id: &str) -> Option<(Decimal, Decimal)> {
        self.by_id
            .get(model_id)
            .map(|&i| (self.specs[i].input_per_1k, self.specs[i].output_per_1k))
    }

    pub fn context_window(&self, model_id: &str) -> Option<u32> {
        self.by_id.get(model_id).map(|&i| self.specs[i].context_window)
    }

    /// All entries, for the admin/introspection surface.
    pub fn specs(&self) -> &[ModelSpec] {
        &self.specs
    }
}

/// Swap the model id of the primary `(provider, tier)` entry.
fn apply_override(specs: &mut [ModelSpec], provider: ProviderName, tier: ModelTier, new_id: &str) {
    let known = specs
        .iter()
        .find(|s| s.model_id == new_id)
        .map(|s| (s.input_per_1k, s.output_per_1k, s.context_window));

    if let Some(entry) = specs
        .iter_mut()
        .find(|s| s.provider == provider && s.tier == tier)
    {
        entry.model_id = new_id.to_string();
        if let Some((input, output, ctx)) = known {
            entry.input_per_1k = input;
            entry.output_per_1k = output;
            entry.context_window = ctx;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // -----------------------------------------------------------------------
    // Resolution
    // -----------------------------------------------------------------------

    #[test]
    fn every_provider_has_both_tiers() {
        let catalog = ModelCatalog::builtin();
        for provider in ProviderName::ALL {
            for tier in [ModelTier::Sota, ModelTier::CostEffective] {
                let spec = catalog.resolve(provider, tier);
                assert!(spec.is_some(), "missing ({provider}, {tier})");
                assert_eq!(spec.unwrap().provider, provider);
            }
        }
    }

    #[test]
    fn resolve_prefers_the_primary_entry() {
        // aws/cost_effective has family alternates; the Claude entry is primary.
        let catalog = ModelCatalog::builtin();
        let spec = catalog
            .resolve(ProviderName::Aws, ModelTier::CostEffective)
            .unwrap();
        assert!(spec.model_id.starts_with("anthropic."), "got {}", spec.model_id);
    }

    // -----------------------------------------------------------------------
    // Pricing
    // -----------------------------------------------------------------------

    #[test]
    fn price_for_known_model() {
        let catalog = ModelCatalog::builtin();
        let (input, output) = catalog.price_for("gpt-4o").unwrap();
        assert_eq!(input, price("0.0025"));
        assert_eq!(output, price("0.01"));
    }

    #[test]
    fn price_for_unknown_model_is_none() {
        let catalog = ModelCatalog::builtin();
        assert!(catalog.price_for("made-up-model-9000").is_none());
    }

    #[test]
    fn local_models_are_free() {
        let catalog = ModelCatalog::builtin();
        let (input, output) = catalog.price_for("llama3.1:8b").unwrap();
        assert_eq!(input, Decimal::ZERO);
        assert_eq!(output, Decimal::ZERO);
    }

    #[test]
    fn pricing_only_family_entries_are_reachable_by_id() {
        let catalog = ModelCatalog::builtin();
        assert!(catalog.price_for("amazon.titan-text-express-v1").is_some());
        assert!(catalog.price_for("meta.llama3-8b-instruct-v1:0").is_some());
    }

    // -----------------------------------------------------------------------
    // Overrides
    // -----------------------------------------------------------------------

    fn config_with_azure_override(sota: &str) -> Config {
        toml::from_str(&format!(
            r#"
            [providers.azure]
            endpoint    = "https://x.openai.azure.com"
            api_key_env = "AZURE_OPENAI_API_KEY"
            sota_model  = "{sota}"
            "#
        ))
        .unwrap()
    }

    #[test]
    fn override_with_unknown_id_keeps_tier_pricing() {
        let config = config_with_azure_override("prod-gpt4o-eastus");
        let catalog = ModelCatalog::from_config(&config);
        let spec = catalog.resolve(ProviderName::Azure, ModelTier::Sota).unwrap();
        assert_eq!(spec.model_id, "prod-gpt4o-eastus");
        // Deployment of the same capability: default gpt-4o pricing retained.
        assert_eq!(spec.input_per_1k, price("0.0025"));
        assert!(catalog.price_for("prod-gpt4o-eastus").is_some());
    }

    #[test]
    fn override_with_known_id_adopts_its_pricing() {
        let config = config_with_azure_override("gpt-4o-mini");
        let catalog = ModelCatalog::from_config(&config);
        let spec = catalog.resolve(ProviderName::Azure, ModelTier::Sota).unwrap();
        assert_eq!(spec.model_id, "gpt-4o-mini");
        assert_eq!(spec.input_per_1k, price("0.00015"));
    }

    #[test]
    fn context_window_lookup() {
        let catalog = ModelCatalog::builtin();
        assert_eq!(catalog.context_window("gpt-4o"), Some(128_000));
        assert_eq!(catalog.context_window("nope"), None);
    }
}

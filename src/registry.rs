//! Provider registry — driver construction, availability, health fan-out.
//!
//! Built once from [`Config`] at startup and immutable afterwards. A
//! provider is registered only when its section is present *and* its
//! required secret resolves; everything else is invisible to routing and
//! reported as skipped by health checks.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::config::Config;
use crate::drivers::{
    AzureDriver, BedrockDriver, Driver, OllamaDriver, VertexDriver, VllmDriver,
};
use crate::error::ProviderError;
use crate::types::ProviderName;

/// Hard deadline for each provider's health probe.
const HEALTH_CHECK_DEADLINE: Duration = Duration::from_secs(5);

/// Outcome of one provider's health probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "status", content = "detail")]
pub enum HealthStatus {
    /// Probe succeeded within the deadline.
    Ok,
    /// Provider is not configured; no probe was made.
    Skipped,
    /// Probe failed or exceeded the deadline.
    Error(String),
}

/// Holds constructed drivers by canonical name.
pub struct ProviderRegistry {
    drivers: HashMap<ProviderName, Arc<Driver>>,
}

impl ProviderRegistry {
    /// Construct a driver for every configured provider.
    pub fn from_config(config: &Config) -> Self {
        let mut drivers: HashMap<ProviderName, Arc<Driver>> = HashMap::new();

        if let Some(azure) = &config.providers.azure {
            match azure.api_key() {
                Some(key) => {
                    let adapter = AzureDriver::new(
                        azure.endpoint.clone(),
                        key,
                        azure.api_version.clone(),
                        azure.timeout_ms,
                    );
                    drivers.insert(ProviderName::Azure, Arc::new(Driver::azure(adapter)));
                }
                None => {
                    tracing::warn!(env = %azure.api_key_env, "azure configured without key — skipping")
                }
            }
        }

        if let Some(aws) = &config.providers.aws {
            match aws.api_key() {
                Some(key) => {
                    let adapter = BedrockDriver::new(
                        aws.region.clone(),
                        key,
                        aws.endpoint.clone(),
                        aws.timeout_ms,
                    );
                    drivers.insert(ProviderName::Aws, Arc::new(Driver::bedrock(adapter)));
                }
                None => {
                    tracing::warn!(env = %aws.api_key_env, "aws configured without key — skipping")
                }
            }
        }

        if let Some(gcp) = &config.providers.gcp {
            match gcp.access_token() {
                Some(token) => {
                    let adapter = VertexDriver::new(
                        gcp.project_id.clone(),
                        gcp.region.clone(),
                        token,
                        gcp.endpoint.clone(),
                        gcp.timeout_ms,
                    );
                    drivers.insert(ProviderName::Gcp, Arc::new(Driver::vertex(adapter)));
                }
                None => {
                    tracing::warn!(env = %gcp.access_token_env, "gcp configured without token — skipping")
                }
            }
        }

        if let Some(ollama) = &config.providers.ollama {
            let adapter = OllamaDriver::new(ollama.endpoint.clone(), ollama.timeout_ms);
            drivers.insert(ProviderName::Ollama, Arc::new(Driver::ollama(adapter)));
        }

        if let Some(vllm) = &config.providers.vllm {
            let adapter = VllmDriver::new(vllm.endpoint.clone(), vllm.api_key(), vllm.timeout_ms);
            drivers.insert(ProviderName::Vllm, Arc::new(Driver::vllm(adapter)));
        }

        tracing::info!(
            providers = ?drivers.keys().map(|p| p.to_string()).collect::<Vec<_>>(),
            "provider registry initialised"
        );

        Self { drivers }
    }

    /// The driver for `name`, or `provider_unavailable` when absent.
    pub fn get(&self, name: ProviderName) -> Result<Arc<Driver>, ProviderError> {
        self.drivers
            .get(&name)
            .cloned()
            .ok_or_else(|| {
                ProviderError::unavailable("provider not configured").with_provider(name)
            })
    }

    /// Configured provider names, in canonical order.
    pub fn available(&self) -> Vec<ProviderName> {
        ProviderName::ALL
            .into_iter()
            .filter(|name| self.drivers.contains_key(name))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.drivers.is_empty()
    }

    /// Probe every known provider in parallel under the 5 s deadline.
    ///
    /// The returned map always has one entry per canonical name, so two
    /// consecutive calls with unchanged configuration have identical key
    /// sets.
    pub async fn health_check_all(&self) -> HashMap<ProviderName, HealthStatus> {
        self.health_check_all_within(HEALTH_CHECK_DEADLINE).await
    }

    async fn health_check_all_within(
        &self,
        deadline: Duration,
    ) -> HashMap<ProviderName, HealthStatus> {
        let probes = ProviderName::ALL.into_iter().map(|name| {
            let driver = self.drivers.get(&name).cloned();
            async move {
                let status = match driver {
                    None => HealthStatus::Skipped,
                    Some(driver) => {
                        match tokio::time::timeout(deadline, driver.health_check()).await {
                            Ok(Ok(())) => HealthStatus::Ok,
                            Ok(Err(e)) => HealthStatus::Error(e.to_string()),
                            Err(_) => HealthStatus::Error("health check deadline exceeded".into()),
                        }
                    }
                };
                (name, status)
            }
        });

        futures_util::future::join_all(probes).await.into_iter().collect()
    }

    /// Close every driver. Idempotent.
    pub fn close_all(&self) {
        for driver in self.drivers.values() {
            driver.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config_with_ollama(endpoint: &str) -> Config {
        toml::from_str(&format!(
            r#"
            [providers.ollama]
            endpoint = "{endpoint}"
            "#
        ))
        .unwrap()
    }

    // -----------------------------------------------------------------------
    // Construction & availability
    // -----------------------------------------------------------------------

    #[test]
    fn empty_config_builds_empty_registry() {
        let registry = ProviderRegistry::from_config(&Config::default());
        assert!(registry.is_empty());
        assert!(registry.available().is_empty());
    }

    #[test]
    fn local_providers_register_without_credentials() {
        let config: Config = toml::from_str(
            r#"
            [providers.ollama]
            endpoint = "http://localhost:11434"

            [providers.vllm]
            endpoint = "http://localhost:8000"
            "#,
        )
        .unwrap();
        let registry = ProviderRegistry::from_config(&config);
        assert_eq!(
            registry.available(),
            vec![ProviderName::Ollama, ProviderName::Vllm]
        );
    }

    #[test]
    fn azure_with_unset_key_env_is_not_registered() {
        let config: Config = toml::from_str(
            r#"
            [providers.azure]
            endpoint    = "https://x.openai.azure.com"
            api_key_env = "AIGW_REG_TEST_UNSET_KEY_7"

            [providers.ollama]
            endpoint = "http://localhost:11434"
            "#,
        )
        .unwrap();
        let registry = ProviderRegistry::from_config(&config);
        assert_eq!(registry.available(), vec![ProviderName::Ollama]);
        assert!(registry.get(ProviderName::Azure).is_err());
    }

    #[test]
    fn azure_registers_when_key_env_resolves() {
        let var = "AIGW_REG_TEST_KEY_RESOLVE_11";
        // SAFETY: single-threaded test setup; env mutation is acceptable here.
        unsafe { std::env::set_var(var, "sk-azure-test") };
        let config: Config = toml::from_str(&format!(
            r#"
            [providers.azure]
            endpoint    = "https://x.openai.azure.com"
            api_key_env = "{var}"
            "#
        ))
        .unwrap();
        let registry = ProviderRegistry::from_config(&config);
        assert_eq!(registry.available(), vec![ProviderName::Azure]);
        unsafe { std::env::remove_var(var) };
    }

    #[test]
    fn get_unknown_provider_is_provider_unavailable() {
        let registry = ProviderRegistry::from_config(&Config::default());
        let err = match registry.get(ProviderName::Gcp) {
            Ok(_) => panic!("expected error"),
            Err(e) => e,
        };
        assert_eq!(err.kind, crate::error::ErrorKind::Unavailable);
        assert_eq!(err.provider, Some(ProviderName::Gcp));
    }

    // -----------------------------------------------------------------------
    // Health fan-out
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn health_check_all_reports_every_canonical_name() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let registry = ProviderRegistry::from_config(&config_with_ollama(&server.uri()));
        let statuses = registry.health_check_all().await;

        assert_eq!(statuses.len(), ProviderName::ALL.len());
        assert_eq!(statuses[&ProviderName::Ollama], HealthStatus::Ok);
        assert_eq!(statuses[&ProviderName::Azure], HealthStatus::Skipped);
        assert_eq!(statuses[&ProviderName::Aws], HealthStatus::Skipped);
    }

    #[tokio::test]
    async fn consecutive_health_checks_have_identical_key_sets() {
        let registry = ProviderRegistry::from_config(&Config::default());
        let first = registry.health_check_all().await;
        let second = registry.health_check_all().await;
        let mut first_keys: Vec<_> = first.keys().copied().collect();
        let mut second_keys: Vec<_> = second.keys().copied().collect();
        first_keys.sort_by_key(|k| k.to_string());
        second_keys.sort_by_key(|k| k.to_string());
        assert_eq!(first_keys, second_keys);
    }

    #[tokio::test]
    async fn unhealthy_backend_reports_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let registry = ProviderRegistry::from_config(&config_with_ollama(&server.uri()));
        let statuses = registry.health_check_all().await;
        assert!(matches!(statuses[&ProviderName::Ollama], HealthStatus::Error(_)));
    }

    #[tokio::test]
    async fn probe_exceeding_deadline_reports_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
            .mount(&server)
            .await;

        let registry = ProviderRegistry::from_config(&config_with_ollama(&server.uri()));
        let statuses = registry
            .health_check_all_within(Duration::from_millis(50))
            .await;
        match &statuses[&ProviderName::Ollama] {
            HealthStatus::Error(msg) => assert!(msg.contains("deadline"), "got: {msg}"),
            other => panic!("expected deadline error, got {other:?}"),
        }
    }

    // -----------------------------------------------------------------------
    // close_all
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn close_all_marks_drivers_unavailable() {
        let registry = ProviderRegistry::from_config(&config_with_ollama("http://localhost:11434"));
        registry.close_all();
        registry.close_all(); // idempotent

        let statuses = registry.health_check_all().await;
        assert!(matches!(statuses[&ProviderName::Ollama], HealthStatus::Error(_)));
    }
}

//! Request routing — the public face of the gateway.
//!
//! [`Gateway`] is the single entry point its consumers load as a library.
//! Every request walks the same decision procedure:
//!
//! 1. **Budget gate** — [`BudgetBreaker::check_and_admit`]; a denied
//!    request never touches a driver.
//! 2. **Chain selection** — explicit provider, local chain, hybrid rule, or
//!    the availability-filtered cloud fallback chain.
//! 3. **Attempt loop** — providers tried in order; transient failures fall
//!    over to the next entry, non-transient failures surface immediately.
//! 4. **Cost record** — on success, exactly one cost record is appended and
//!    the budget debited.
//!
//! Streaming preserves the same contract with one restriction: because
//! bytes cannot be un-sent, fallback is only valid before the first chunk
//! reaches the caller. Errors after that terminate the stream, and the
//! cost record is produced at the terminal chunk.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{Stream, StreamExt};
use tokio::time::Instant;
use uuid::Uuid;

use crate::budget::{BudgetBreaker, BudgetSnapshot};
use crate::catalog::ModelCatalog;
use crate::config::{Config, RoutingMode};
use crate::cost::{CostFilter, CostSummary, CostTracker};
use crate::drivers::{ChunkStream, Driver};
use crate::error::{ErrorKind, GatewayError, ProviderError, ProviderFailure};
use crate::registry::{HealthStatus, ProviderRegistry};
use crate::types::{
    decimal_to_f64, CompletionRequest, CompletionResponse, FinishReason, ModelTier, ProviderName,
    StreamChunk, TokenUsage,
};

/// Default deadline for a non-streaming completion.
const COMPLETION_DEADLINE: Duration = Duration::from_secs(60);
/// Default total deadline for a streaming completion.
const STREAM_DEADLINE: Duration = Duration::from_secs(300);
/// Maximum quiet period between chunks before the stream is declared dead.
const STREAM_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Streaming result surfaced to callers — the driver chunk contract with
/// gateway-level errors.
pub type GatewayStream = Pin<Box<dyn Stream<Item = Result<StreamChunk, GatewayError>> + Send>>;

/// The multi-cloud provider gateway.
///
/// Cheap to share (`Arc` fields throughout) and safe for concurrent
/// callers: drivers are shared, the budget is a single serialised
/// resource, and the registry and catalog are immutable after startup.
pub struct Gateway {
    config: Arc<Config>,
    registry: Arc<ProviderRegistry>,
    catalog: Arc<ModelCatalog>,
    costs: Arc<CostTracker>,
    budget: Arc<BudgetBreaker>,
}

impl Gateway {
    /// Build a gateway from configuration with production wiring.
    pub fn new(config: Config) -> Self {
        let config = Arc::new(config);
        let registry = Arc::new(ProviderRegistry::from_config(&config));
        let catalog = Arc::new(ModelCatalog::from_config(&config));
        let costs = Arc::new(CostTracker::new(Arc::clone(&catalog)));
        let budget = Arc::new(BudgetBreaker::new(&config.budget));
        Self { config, registry, catalog, costs, budget }
    }

    /// Assemble a gateway from pre-built parts. Tests inject replacement
    /// budget state and clocks through here.
    pub fn with_parts(
        config: Arc<Config>,
        registry: Arc<ProviderRegistry>,
        catalog: Arc<ModelCatalog>,
        costs: Arc<CostTracker>,
        budget: Arc<BudgetBreaker>,
    ) -> Self {
        Self { config, registry, catalog, costs, budget }
    }

    // ──────────────────────────────────────────────────────────────────────
    // Entry points
    // ──────────────────────────────────────────────────────────────────────

    /// One non-streaming completion.
    #[tracing::instrument(skip(self, request), fields(provider = tracing::field::Empty))]
    pub async fn complete(
        &self,
        request: CompletionRequest,
    ) -> Result<CompletionResponse, GatewayError> {
        request.validate().map_err(GatewayError::InvalidRequest)?;
        self.budget.check_and_admit(self.log_estimate(&request))?;

        let chain = self.build_chain(&request)?;
        let deadline = request.timeout.unwrap_or(COMPLETION_DEADLINE);
        let started = Instant::now();
        let mut failures: Vec<ProviderFailure> = Vec::new();

        for name in chain {
            let (driver, model) = match self.prepare_attempt(name, &request, &mut failures) {
                Some(pair) => pair,
                None => continue,
            };

            let Some(remaining) = deadline.checked_sub(started.elapsed()) else {
                return Err(GatewayError::Cancelled);
            };

            tracing::debug!(provider = %name, %model, "dispatching completion");
            let attempt = tokio::time::timeout(remaining, driver.complete(&request, &model)).await;

            match attempt {
                // Deadline expiry ends the request; it does not cascade.
                Err(_) => return Err(GatewayError::Cancelled),
                Ok(Ok(mut response)) => {
                    tracing::Span::current().record("provider", name.to_string().as_str());
                    let request_id = Uuid::new_v4().to_string();
                    let cost = self.costs.record(
                        name,
                        &model,
                        response.usage.prompt_tokens,
                        response.usage.completion_tokens,
                        &request_id,
                        response.usage.estimated,
                    );
                    self.budget.record_usage(cost);
                    response.cost_usd = decimal_to_f64(cost);
                    return Ok(response);
                }
                Ok(Err(e)) => {
                    self.classify_failure(name, e, &mut failures)?;
                    continue;
                }
            }
        }

        Err(self.exhausted(failures))
    }

    /// One streaming completion.
    ///
    /// Fallback happens only before the first chunk is delivered; once a
    /// chunk has been yielded the stream is committed to its provider. The
    /// cost record is produced at the terminal chunk, so a stream that
    /// errors mid-flight debits nothing.
    #[tracing::instrument(skip(self, request), fields(provider = tracing::field::Empty))]
    pub async fn stream(&self, request: CompletionRequest) -> Result<GatewayStream, GatewayError> {
        request.validate().map_err(GatewayError::InvalidRequest)?;
        self.budget.check_and_admit(self.log_estimate(&request))?;

        let chain = self.build_chain(&request)?;
        let deadline = request.timeout.unwrap_or(STREAM_DEADLINE);
        let started = Instant::now();
        let mut failures: Vec<ProviderFailure> = Vec::new();

        for name in chain {
            let (driver, model) = match self.prepare_attempt(name, &request, &mut failures) {
                Some(pair) => pair,
                None => continue,
            };

            let Some(remaining) = deadline.checked_sub(started.elapsed()) else {
                return Err(GatewayError::Cancelled);
            };

            tracing::debug!(provider = %name, %model, "opening stream");
            let opened = tokio::time::timeout(remaining, driver.stream(&request, &model)).await;
            let mut inner = match opened {
                Err(_) => return Err(GatewayError::Cancelled),
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    self.classify_failure(name, e, &mut failures)?;
                    continue;
                }
            };

            // Peek the first item: failures here are still eligible for
            // fallback because nothing has reached the caller yet.
            let Some(remaining) = deadline.checked_sub(started.elapsed()) else {
                return Err(GatewayError::Cancelled);
            };
            let first_wait = remaining.min(STREAM_IDLE_TIMEOUT);
            let first = match tokio::time::timeout(first_wait, inner.next()).await {
                Err(_) if first_wait == remaining => return Err(GatewayError::Cancelled),
                Err(_) => {
                    let e = ProviderError::unavailable("no chunk before idle timeout")
                        .with_provider(name);
                    self.classify_failure(name, e, &mut failures)?;
                    continue;
                }
                Ok(item) => item,
            };

            match first {
                None => {
                    let e = ProviderError::unavailable("stream closed without any chunk")
                        .with_provider(name);
                    self.classify_failure(name, e, &mut failures)?;
                    continue;
                }
                Some(Err(e)) => {
                    self.classify_failure(name, e, &mut failures)?;
                    continue;
                }
                // A synthesised error terminal as the very first item means
                // the backend produced nothing — still pre-first-chunk.
                Some(Ok(chunk))
                    if chunk.finish_reason == Some(FinishReason::Error)
                        && chunk.delta.is_empty() =>
                {
                    let e = ProviderError::unavailable("stream ended before first chunk")
                        .with_provider(name);
                    self.classify_failure(name, e, &mut failures)?;
                    continue;
                }
                Some(Ok(first_chunk)) => {
                    tracing::Span::current().record("provider", name.to_string().as_str());
                    return Ok(self.committed_stream(
                        inner,
                        first_chunk,
                        name,
                        model,
                        started,
                        deadline,
                    ));
                }
            }
        }

        Err(self.exhausted(failures))
    }

    /// Embed a batch of texts with the given model, walking the same
    /// budget gate and fallback chain as completions. Providers without
    /// embedding support are skipped.
    pub async fn embed(
        &self,
        texts: &[String],
        model: &str,
    ) -> Result<Vec<Vec<f32>>, GatewayError> {
        if texts.is_empty() {
            return Err(GatewayError::InvalidRequest("texts must not be empty".into()));
        }
        if model.is_empty() {
            return Err(GatewayError::InvalidRequest("model is required".into()));
        }
        self.budget.check_and_admit(0.0)?;

        let chain = self.default_chain()?;
        let started = Instant::now();
        let mut failures: Vec<ProviderFailure> = Vec::new();
        let prompt_chars: usize = texts.iter().map(String::len).sum();

        for name in chain {
            let driver = match self.registry.get(name) {
                Ok(d) => d,
                Err(e) => {
                    self.observe_failure(name, &e);
                    failures.push(failure(name, &e));
                    continue;
                }
            };

            let Some(remaining) = COMPLETION_DEADLINE.checked_sub(started.elapsed()) else {
                return Err(GatewayError::Cancelled);
            };

            match tokio::time::timeout(remaining, driver.embed(texts, model)).await {
                Err(_) => return Err(GatewayError::Cancelled),
                Ok(Ok(vectors)) => {
                    let request_id = Uuid::new_v4().to_string();
                    let prompt_tokens = crate::drivers::estimate_tokens(prompt_chars);
                    let cost = self.costs.record(name, model, prompt_tokens, 0, &request_id, true);
                    self.budget.record_usage(cost);
                    return Ok(vectors);
                }
                Ok(Err(e)) => {
                    self.classify_failure(name, e, &mut failures)?;
                    continue;
                }
            }
        }

        Err(self.exhausted(failures))
    }

    // ──────────────────────────────────────────────────────────────────────
    // Administrative surface
    // ──────────────────────────────────────────────────────────────────────

    pub fn budget_state(&self) -> BudgetSnapshot {
        self.budget.state()
    }

    pub fn reset_budget(&self) {
        self.budget.reset();
    }

    pub fn cost_summary(&self, filter: &CostFilter) -> CostSummary {
        self.costs.summary(filter)
    }

    /// Configuration presence per canonical provider name.
    pub fn providers_status(&self) -> HashMap<ProviderName, bool> {
        let available = self.registry.available();
        ProviderName::ALL
            .into_iter()
            .map(|name| (name, available.contains(&name)))
            .collect()
    }

    pub async fn health_check_all(&self) -> HashMap<ProviderName, HealthStatus> {
        self.registry.health_check_all().await
    }

    /// Release every driver. Called once at shutdown; idempotent.
    pub fn close(&self) {
        self.registry.close_all();
    }

    // ──────────────────────────────────────────────────────────────────────
    // Decision procedure internals
    // ──────────────────────────────────────────────────────────────────────

    /// Chain selection (§ routing policy). The cloud chain is filtered to
    /// available providers; explicit/local/hybrid chains are taken as
    /// given and unconfigured entries fail over inside the attempt loop.
    fn build_chain(&self, request: &CompletionRequest) -> Result<Vec<ProviderName>, GatewayError> {
        if self.registry.available().is_empty() {
            return Err(GatewayError::NoProvidersConfigured);
        }

        if let Some(provider) = request.provider {
            return Ok(vec![provider]);
        }

        let routing = &self.config.routing;
        let chain = match routing.mode {
            RoutingMode::Local => routing.local_chain.clone(),
            RoutingMode::Hybrid => match request.classification.and_then(|c| routing.match_rule(c))
            {
                Some(rule) => vec![rule.provider],
                None => self.filtered_cloud_chain(),
            },
            RoutingMode::Cloud => self.filtered_cloud_chain(),
        };

        Ok(chain)
    }

    /// The mode-dependent chain for requests that carry no routing inputs
    /// of their own (embeddings).
    fn default_chain(&self) -> Result<Vec<ProviderName>, GatewayError> {
        if self.registry.available().is_empty() {
            return Err(GatewayError::NoProvidersConfigured);
        }
        Ok(match self.config.routing.mode {
            RoutingMode::Local => self.config.routing.local_chain.clone(),
            _ => self.filtered_cloud_chain(),
        })
    }

    fn filtered_cloud_chain(&self) -> Vec<ProviderName> {
        let available = self.registry.available();
        self.config
            .routing
            .cloud_chain()
            .into_iter()
            .filter(|name| available.contains(name))
            .collect()
    }

    /// Resolve the driver and concrete model for one attempt. `None` means
    /// the attempt was skipped and recorded; the loop continues.
    fn prepare_attempt(
        &self,
        name: ProviderName,
        request: &CompletionRequest,
        failures: &mut Vec<ProviderFailure>,
    ) -> Option<(Arc<Driver>, String)> {
        let driver = match self.registry.get(name) {
            Ok(d) => d,
            Err(e) => {
                self.observe_failure(name, &e);
                failures.push(failure(name, &e));
                return None;
            }
        };

        // Tier resolution is re-performed per provider as fallback crosses
        // provider boundaries.
        let model = match &request.model {
            Some(id) => id.clone(),
            None => {
                let tier = request.tier.unwrap_or(ModelTier::Sota);
                match self.catalog.resolve(name, tier) {
                    Some(spec) => spec.model_id.clone(),
                    None => {
                        let e = ProviderError::model_not_found(format!(
                            "no {tier} model catalogued for {name}"
                        ));
                        failures.push(failure(name, &e));
                        return None;
                    }
                }
            }
        };

        Some((driver, model))
    }

    /// Dispatch on a driver failure: transient kinds record a
    /// `provider_failed` observation and return `Ok` so the attempt loop
    /// continues, `unsupported` skips silently, cancellation and every
    /// other kind end the request via `Err`.
    fn classify_failure(
        &self,
        name: ProviderName,
        error: ProviderError,
        failures: &mut Vec<ProviderFailure>,
    ) -> Result<(), GatewayError> {
        if error.kind == ErrorKind::Cancelled {
            return Err(GatewayError::Cancelled);
        }
        if error.kind.is_transient() {
            self.observe_failure(name, &error);
            failures.push(failure(name, &error));
            return Ok(());
        }
        if error.kind == ErrorKind::Unsupported {
            tracing::debug!(provider = %name, "capability unsupported — skipping");
            failures.push(failure(name, &error));
            return Ok(());
        }
        Err(GatewayError::Provider(error))
    }

    fn observe_failure(&self, name: ProviderName, error: &ProviderError) {
        tracing::warn!(
            provider = %name,
            kind = %error.kind,
            error = %error.message,
            "provider_failed: falling over to next chain entry"
        );
    }

    fn exhausted(&self, failures: Vec<ProviderFailure>) -> GatewayError {
        GatewayError::AllProvidersFailed(failures)
    }

    /// Crude pre-admission cost estimate, used only in budget log lines.
    fn log_estimate(&self, request: &CompletionRequest) -> f64 {
        let model = match &request.model {
            Some(id) => Some(id.clone()),
            None => {
                let guess = request
                    .provider
                    .unwrap_or(self.config.routing.default_provider);
                let tier = request.tier.unwrap_or(ModelTier::Sota);
                self.catalog.resolve(guess, tier).map(|s| s.model_id.clone())
            }
        };
        let Some((price_in, _)) = model.as_deref().and_then(|m| self.catalog.price_for(m)) else {
            return 0.0;
        };
        let prompt_tokens = crate::drivers::estimate_tokens(request.prompt_chars());
        decimal_to_f64(
            rust_decimal::Decimal::from(prompt_tokens) * price_in
                / rust_decimal::Decimal::from(1_000u32),
        )
    }

    /// Wrap a committed driver stream with idle/total deadlines and the
    /// terminal-chunk cost record.
    fn committed_stream(
        &self,
        inner: ChunkStream,
        first_chunk: StreamChunk,
        provider: ProviderName,
        model: String,
        started: Instant,
        deadline: Duration,
    ) -> GatewayStream {
        struct State {
            inner: ChunkStream,
            pending_first: Option<StreamChunk>,
            provider: ProviderName,
            model: String,
            costs: Arc<CostTracker>,
            budget: Arc<BudgetBreaker>,
            started: Instant,
            deadline: Duration,
            ended: bool,
        }

        impl State {
            /// Terminal-chunk bookkeeping: exactly one cost record per
            /// successfully finished stream, none for error terminals.
            fn settle(&self, chunk: &StreamChunk) {
                let Some(reason) = chunk.finish_reason else {
                    return;
                };
                if reason == FinishReason::Error {
                    return;
                }
                let usage = chunk.usage.unwrap_or_else(|| TokenUsage::estimated(0, 0));
                let request_id = Uuid::new_v4().to_string();
                let cost = self.costs.record(
                    self.provider,
                    &self.model,
                    usage.prompt_tokens,
                    usage.completion_tokens,
                    &request_id,
                    usage.estimated,
                );
                self.budget.record_usage(cost);
            }
        }

        let state = State {
            inner,
            pending_first: Some(first_chunk),
            provider,
            model,
            costs: Arc::clone(&self.costs),
            budget: Arc::clone(&self.budget),
            started,
            deadline,
            ended: false,
        };

        Box::pin(futures_util::stream::unfold(state, |mut st| async move {
            if st.ended {
                return None;
            }

            if let Some(chunk) = st.pending_first.take() {
                if chunk.is_terminal() {
                    st.settle(&chunk);
                    st.ended = true;
                }
                return Some((Ok(chunk), st));
            }

            let Some(remaining) = st.deadline.checked_sub(st.started.elapsed()) else {
                st.ended = true;
                return Some((Err(GatewayError::Cancelled), st));
            };
            let wait = remaining.min(STREAM_IDLE_TIMEOUT);

            match tokio::time::timeout(wait, st.inner.next()).await {
                Err(_) if wait == remaining => {
                    st.ended = true;
                    Some((Err(GatewayError::Cancelled), st))
                }
                Err(_) => {
                    st.ended = true;
                    let e = ProviderError::unavailable("idle timeout between chunks")
                        .with_provider(st.provider);
                    Some((Err(GatewayError::Provider(e)), st))
                }
                Ok(None) => {
                    st.ended = true;
                    None
                }
                Ok(Some(Ok(chunk))) => {
                    if chunk.is_terminal() {
                        st.settle(&chunk);
                        st.ended = true;
                    }
                    Some((Ok(chunk), st))
                }
                Ok(Some(Err(e))) => {
                    st.ended = true;
                    Some((Err(GatewayError::Provider(e)), st))
                }
            }
        }))
    }
}

fn failure(provider: ProviderName, error: &ProviderError) -> ProviderFailure {
    ProviderFailure {
        provider,
        kind: error.kind,
        message: error.message.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::Clock;
    use crate::catalog::ModelSpec;
    use chrono::{DateTime, Datelike, TimeZone, Utc};
    use rust_decimal::Decimal;
    use std::str::FromStr;
    use std::sync::Mutex as StdMutex;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use crate::types::{ChatMessage, DataClassification};

    // -----------------------------------------------------------------------
    // Harness: two wiremock-backed local providers and a settable clock
    // -----------------------------------------------------------------------

    struct Harness {
        gateway: Gateway,
        budget: Arc<BudgetBreaker>,
        costs: Arc<CostTracker>,
        now: Arc<StdMutex<DateTime<Utc>>>,
    }

    fn test_specs() -> Vec<ModelSpec> {
        let mut specs = Vec::new();
        for provider in [ProviderName::Ollama, ProviderName::Vllm] {
            for tier in [ModelTier::Sota, ModelTier::CostEffective] {
                specs.push(ModelSpec {
                    provider,
                    tier,
                    model_id: "test-model".into(),
                    input_per_1k: Decimal::from_str("1.0").unwrap(),
                    output_per_1k: Decimal::from_str("2.0").unwrap(),
                    context_window: 8_192,
                });
            }
        }
        specs
    }

    fn test_config(chain: &str, ollama: &str, vllm: &str, limit: f64) -> Config {
        toml::from_str(&format!(
            r#"
            [routing]
            mode           = "local"
            local_chain    = {chain}
            fallback_chain = ["azure"]

            [budget]
            monthly_limit_usd = {limit}
            alert_threshold   = 0.8
            breaker_threshold = 0.95

            [providers.ollama]
            endpoint = "{ollama}"

            [providers.vllm]
            endpoint = "{vllm}"
            "#
        ))
        .unwrap()
    }

    fn harness(config: Config) -> Harness {
        // Log output for failing tests; repeated init attempts are fine.
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "ai_gateway=debug".into()),
            )
            .with_test_writer()
            .try_init();

        let now = Arc::new(StdMutex::new(Utc::now()));
        let clock_now = Arc::clone(&now);
        let clock: Clock = Arc::new(move || *clock_now.lock().unwrap());

        let config = Arc::new(config);
        let registry = Arc::new(ProviderRegistry::from_config(&config));
        let catalog = Arc::new(ModelCatalog::with_specs(test_specs()));
        let costs = Arc::new(CostTracker::with_clock(Arc::clone(&catalog), Arc::clone(&clock)));
        let budget = Arc::new(BudgetBreaker::with_clock(&config.budget, clock));

        Harness {
            gateway: Gateway::with_parts(
                Arc::clone(&config),
                registry,
                catalog,
                Arc::clone(&costs),
                Arc::clone(&budget),
            ),
            budget,
            costs,
            now,
        }
    }

    fn request() -> CompletionRequest {
        CompletionRequest::with_tier(
            vec![ChatMessage::user("hello gateway")],
            ModelTier::CostEffective,
        )
    }

    /// A deterministic success: 100 prompt / 50 completion tokens against a
    /// $1/1k-in, $2/1k-out model — cost $0.20.
    async fn mount_ok(server: &MockServer) {
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{
                    "message": { "role": "assistant", "content": "A deterministic response." },
                    "finish_reason": "stop",
                }],
                "usage": { "prompt_tokens": 100, "completion_tokens": 50, "total_tokens": 150 },
            })))
            .mount(server)
            .await;
    }

    async fn mount_unavailable(server: &MockServer) {
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(503).set_body_string("down for maintenance"))
            .mount(server)
            .await;
    }

    async fn request_count(server: &MockServer) -> usize {
        server.received_requests().await.unwrap_or_default().len()
    }

    // -----------------------------------------------------------------------
    // Simple success
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn success_records_cost_and_debits_budget() {
        let ollama = MockServer::start().await;
        mount_ok(&ollama).await;
        let vllm = MockServer::start().await;

        let h = harness(test_config(r#"["ollama"]"#, &ollama.uri(), &vllm.uri(), 10.0));
        let resp = h.gateway.complete(request()).await.unwrap();

        assert_eq!(resp.provider, ProviderName::Ollama);
        assert_eq!(resp.model, "test-model");
        assert!((resp.cost_usd - 0.2).abs() < 1e-9, "got {}", resp.cost_usd);

        let state = h.gateway.budget_state();
        assert!((state.spend_usd - 0.2).abs() < 1e-9);
        assert_eq!(state.circuit, crate::budget::CircuitState::Closed);
        assert_eq!(h.costs.record_count(), 1);
    }

    // -----------------------------------------------------------------------
    // Fallback on unavailable
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn unavailable_provider_falls_over_to_next() {
        let vllm = MockServer::start().await;
        mount_unavailable(&vllm).await;
        let ollama = MockServer::start().await;
        mount_ok(&ollama).await;

        let h = harness(test_config(r#"["vllm", "ollama"]"#, &ollama.uri(), &vllm.uri(), 10.0));
        let resp = h.gateway.complete(request()).await.unwrap();

        assert_eq!(resp.provider, ProviderName::Ollama);
        assert_eq!(request_count(&vllm).await, 1, "failed provider was tried once");
        assert_eq!(h.costs.record_count(), 1);
    }

    #[tokio::test]
    async fn exhausted_chain_reports_every_failure() {
        let vllm = MockServer::start().await;
        mount_unavailable(&vllm).await;
        let ollama = MockServer::start().await;
        mount_unavailable(&ollama).await;

        let h = harness(test_config(r#"["vllm", "ollama"]"#, &ollama.uri(), &vllm.uri(), 10.0));
        let err = h.gateway.complete(request()).await.unwrap_err();

        match err {
            GatewayError::AllProvidersFailed(failures) => {
                assert_eq!(failures.len(), 2);
                assert_eq!(failures[0].provider, ProviderName::Vllm);
                assert_eq!(failures[1].provider, ProviderName::Ollama);
                assert_eq!(failures[0].kind, ErrorKind::Unavailable);
            }
            other => panic!("expected AllProvidersFailed, got {other:?}"),
        }
        assert_eq!(h.costs.record_count(), 0, "failed requests never record cost");
        assert!((h.gateway.budget_state().spend_usd - 0.0).abs() < 1e-12);
    }

    // -----------------------------------------------------------------------
    // Budget circuit opens
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn circuit_opens_and_denies_without_touching_drivers() {
        let ollama = MockServer::start().await;
        mount_ok(&ollama).await;
        let vllm = MockServer::start().await;

        let config = test_config(r#"["ollama"]"#, &ollama.uri(), &vllm.uri(), 1.0);
        let h = harness(config);

        // Five $0.20 calls bring spend to $1.00 ≥ 0.95 × limit.
        for _ in 0..5 {
            h.gateway.complete(request()).await.unwrap();
        }
        assert_eq!(h.gateway.budget_state().circuit, crate::budget::CircuitState::Open);

        let before = request_count(&ollama).await;
        let err = h.gateway.complete(request()).await.unwrap_err();
        assert!(matches!(err, GatewayError::BudgetExceeded { .. }));
        assert_eq!(request_count(&ollama).await, before, "no driver touched after OPEN");
    }

    // -----------------------------------------------------------------------
    // Month rollover
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn month_rollover_resets_spend_before_admission() {
        let ollama = MockServer::start().await;
        mount_ok(&ollama).await;
        let vllm = MockServer::start().await;

        let h = harness(test_config(r#"["ollama"]"#, &ollama.uri(), &vllm.uri(), 1.0));

        *h.now.lock().unwrap() = Utc.with_ymd_and_hms(2024, 12, 20, 8, 0, 0).unwrap();
        h.budget.record_usage(Decimal::from_str("0.99").unwrap());
        assert_eq!(h.gateway.budget_state().circuit, crate::budget::CircuitState::Open);

        *h.now.lock().unwrap() = Utc.with_ymd_and_hms(2025, 1, 2, 8, 0, 0).unwrap();
        let resp = h.gateway.complete(request()).await.unwrap();
        assert!((resp.cost_usd - 0.2).abs() < 1e-9);

        let state = h.gateway.budget_state();
        assert_eq!(state.month_key, (2025, 1));
        assert!((state.spend_usd - 0.2).abs() < 1e-9, "only this call's cost remains");
    }

    // -----------------------------------------------------------------------
    // Hybrid routing
    // -----------------------------------------------------------------------

    fn hybrid_config(ollama: &str, vllm: &str) -> Config {
        toml::from_str(&format!(
            r#"
            [routing]
            mode             = "hybrid"
            default_provider = "vllm"
            fallback_chain   = ["vllm"]

            [[routing.hybrid_rules]]
            classification = "confidential"
            provider       = "ollama"

            [providers.ollama]
            endpoint = "{ollama}"

            [providers.vllm]
            endpoint = "{vllm}"
            "#
        ))
        .unwrap()
    }

    #[tokio::test]
    async fn hybrid_rule_overrides_fallback_chain() {
        let ollama = MockServer::start().await;
        mount_unavailable(&ollama).await;
        let vllm = MockServer::start().await;
        mount_ok(&vllm).await;

        let h = harness(hybrid_config(&ollama.uri(), &vllm.uri()));
        let err = h
            .gateway
            .complete(request().with_classification(DataClassification::Confidential))
            .await
            .unwrap_err();

        // The matched rule pins the chain to [ollama]; no fall-through.
        match err {
            GatewayError::AllProvidersFailed(failures) => {
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].provider, ProviderName::Ollama);
            }
            other => panic!("expected AllProvidersFailed, got {other:?}"),
        }
        assert_eq!(request_count(&vllm).await, 0, "fallback chain must not be consulted");
    }

    #[tokio::test]
    async fn unmatched_classification_falls_through_to_cloud_chain() {
        let ollama = MockServer::start().await;
        let vllm = MockServer::start().await;
        mount_ok(&vllm).await;

        let h = harness(hybrid_config(&ollama.uri(), &vllm.uri()));
        let resp = h
            .gateway
            .complete(request().with_classification(DataClassification::Public))
            .await
            .unwrap();
        assert_eq!(resp.provider, ProviderName::Vllm);
        assert_eq!(request_count(&ollama).await, 0);
    }

    // -----------------------------------------------------------------------
    // Streaming fallback is pre-first-chunk only
    // -----------------------------------------------------------------------

    fn sse_ok_body() -> &'static str {
        concat!(
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n",
            "data: {\"choices\":[],\"usage\":{\"prompt_tokens\":100,\"completion_tokens\":50}}\n\n",
            "data: [DONE]\n\n",
        )
    }

    async fn mount_sse(server: &MockServer, body: &str) {
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body.to_string(), "text/event-stream"))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn stream_falls_over_before_first_chunk() {
        let vllm = MockServer::start().await;
        mount_unavailable(&vllm).await;
        let ollama = MockServer::start().await;
        mount_sse(&ollama, sse_ok_body()).await;

        let h = harness(test_config(r#"["vllm", "ollama"]"#, &ollama.uri(), &vllm.uri(), 10.0));
        let stream = h.gateway.stream(request()).await.unwrap();
        let chunks: Vec<StreamChunk> = stream.map(|c| c.unwrap()).collect::<Vec<_>>().await;

        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.provider == ProviderName::Ollama));
        assert_eq!(chunks[2].finish_reason, Some(FinishReason::Stop));

        // Cost recorded at the terminal chunk: $0.20 for 100/50 tokens.
        assert_eq!(h.costs.record_count(), 1);
        assert!((h.gateway.budget_state().spend_usd - 0.2).abs() < 1e-9);
    }

    #[tokio::test]
    async fn error_after_first_chunk_does_not_fall_over() {
        // vLLM streams one delta then closes without a terminal event.
        let vllm = MockServer::start().await;
        mount_sse(&vllm, "data: {\"choices\":[{\"delta\":{\"content\":\"partial\"}}]}\n\n").await;
        let ollama = MockServer::start().await;
        mount_sse(&ollama, sse_ok_body()).await;

        let h = harness(test_config(r#"["vllm", "ollama"]"#, &ollama.uri(), &vllm.uri(), 10.0));
        let stream = h.gateway.stream(request()).await.unwrap();
        let items: Vec<Result<StreamChunk, GatewayError>> = stream.collect::<Vec<_>>().await;

        // Delta then synthesised error terminal; the healthy provider is
        // never consulted and nothing is charged.
        assert_eq!(items.len(), 2);
        let first = items[0].as_ref().unwrap();
        assert_eq!(first.delta, "partial");
        assert_eq!(first.provider, ProviderName::Vllm);
        let terminal = items[1].as_ref().unwrap();
        assert_eq!(terminal.finish_reason, Some(FinishReason::Error));

        assert_eq!(request_count(&ollama).await, 0);
        assert_eq!(h.costs.record_count(), 0);
        assert!((h.gateway.budget_state().spend_usd - 0.0).abs() < 1e-12);
    }

    #[tokio::test]
    async fn stream_with_zero_chunks_fails_over_or_exhausts() {
        // Empty SSE body: the driver synthesises an error terminal, which
        // counts as a pre-first-chunk failure.
        let vllm = MockServer::start().await;
        mount_sse(&vllm, "").await;

        let ollama = MockServer::start().await;
        let h = harness(test_config(r#"["vllm"]"#, &ollama.uri(), &vllm.uri(), 10.0));
        let err = match h.gateway.stream(request()).await {
            Ok(_) => panic!("expected error"),
            Err(e) => e,
        };
        assert!(matches!(err, GatewayError::AllProvidersFailed(_)));
        assert_eq!(h.costs.record_count(), 0);
    }

    #[tokio::test]
    async fn zero_chunk_stream_falls_over_to_healthy_provider() {
        let vllm = MockServer::start().await;
        mount_sse(&vllm, "").await;
        let ollama = MockServer::start().await;
        mount_sse(&ollama, sse_ok_body()).await;

        let h = harness(test_config(r#"["vllm", "ollama"]"#, &ollama.uri(), &vllm.uri(), 10.0));
        let stream = h.gateway.stream(request()).await.unwrap();
        let chunks: Vec<StreamChunk> = stream.map(|c| c.unwrap()).collect::<Vec<_>>().await;
        assert!(chunks.iter().all(|c| c.provider == ProviderName::Ollama));
    }

    // -----------------------------------------------------------------------
    // Chain policy
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn explicit_provider_disables_fallback() {
        let vllm = MockServer::start().await;
        mount_unavailable(&vllm).await;
        let ollama = MockServer::start().await;
        mount_ok(&ollama).await;

        let h = harness(test_config(r#"["vllm", "ollama"]"#, &ollama.uri(), &vllm.uri(), 10.0));
        let err = h
            .gateway
            .complete(request().with_provider(ProviderName::Vllm))
            .await
            .unwrap_err();

        assert!(matches!(err, GatewayError::AllProvidersFailed(_)));
        assert_eq!(request_count(&ollama).await, 0, "no fallback for pinned provider");
    }

    #[tokio::test]
    async fn non_transient_failure_stops_the_chain() {
        let vllm = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_string("bad credentials"))
            .mount(&vllm)
            .await;
        let ollama = MockServer::start().await;
        mount_ok(&ollama).await;

        let h = harness(test_config(r#"["vllm", "ollama"]"#, &ollama.uri(), &vllm.uri(), 10.0));
        let err = h.gateway.complete(request()).await.unwrap_err();

        match err {
            GatewayError::Provider(e) => assert_eq!(e.kind, ErrorKind::Auth),
            other => panic!("expected Provider(auth), got {other:?}"),
        }
        assert_eq!(request_count(&ollama).await, 0);
        assert_eq!(h.costs.record_count(), 0);
    }

    #[tokio::test]
    async fn invalid_request_is_rejected_before_admission() {
        let ollama = MockServer::start().await;
        let vllm = MockServer::start().await;
        let h = harness(test_config(r#"["ollama"]"#, &ollama.uri(), &vllm.uri(), 10.0));

        let mut bad = request();
        bad.messages.clear();
        let err = h.gateway.complete(bad).await.unwrap_err();
        assert!(matches!(err, GatewayError::InvalidRequest(_)));
        assert_eq!(request_count(&ollama).await, 0);
    }

    #[tokio::test]
    async fn empty_registry_is_no_providers_configured() {
        let config: Config = toml::from_str(
            r#"
            [routing]
            mode        = "local"
            local_chain = ["ollama"]
            "#,
        )
        .unwrap();
        let h = harness(config);
        let err = h.gateway.complete(request()).await.unwrap_err();
        assert!(matches!(err, GatewayError::NoProvidersConfigured));
    }

    // -----------------------------------------------------------------------
    // Invariants & admin surface
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn spend_equals_sum_of_cost_records() {
        let ollama = MockServer::start().await;
        mount_ok(&ollama).await;
        let vllm = MockServer::start().await;

        let h = harness(test_config(r#"["ollama"]"#, &ollama.uri(), &vllm.uri(), 10.0));
        for _ in 0..3 {
            h.gateway.complete(request()).await.unwrap();
        }

        let now = *h.now.lock().unwrap();
        let ledger = h.costs.month_total(now.year(), now.month());
        let spend = h.gateway.budget_state().spend_usd;
        assert!((spend - decimal_to_f64(ledger)).abs() < 1e-9);
        assert_eq!(h.costs.record_count(), 3);
    }

    #[tokio::test]
    async fn reset_budget_round_trip() {
        let ollama = MockServer::start().await;
        mount_ok(&ollama).await;
        let vllm = MockServer::start().await;

        let h = harness(test_config(r#"["ollama"]"#, &ollama.uri(), &vllm.uri(), 10.0));
        h.gateway.complete(request()).await.unwrap();
        let month_before = h.gateway.budget_state().month_key;

        h.gateway.reset_budget();
        let state = h.gateway.budget_state();
        assert_eq!(state.spend_usd, 0.0);
        assert_eq!(state.circuit, crate::budget::CircuitState::Closed);
        assert_eq!(state.month_key, month_before);
    }

    #[tokio::test]
    async fn cost_summary_reflects_completed_requests() {
        let ollama = MockServer::start().await;
        mount_ok(&ollama).await;
        let vllm = MockServer::start().await;

        let h = harness(test_config(r#"["ollama"]"#, &ollama.uri(), &vllm.uri(), 10.0));
        h.gateway.complete(request()).await.unwrap();
        h.gateway.complete(request()).await.unwrap();

        let summary = h.gateway.cost_summary(&CostFilter::default());
        assert_eq!(summary.record_count, 2);
        assert!((summary.total_usd - 0.4).abs() < 1e-9);
        assert!(summary.by_provider.contains_key("ollama"));
        assert!(summary.by_model.contains_key("test-model"));
    }

    #[tokio::test]
    async fn providers_status_reports_all_canonical_names() {
        let ollama = MockServer::start().await;
        let vllm = MockServer::start().await;
        let h = harness(test_config(r#"["ollama"]"#, &ollama.uri(), &vllm.uri(), 10.0));

        let status = h.gateway.providers_status();
        assert_eq!(status.len(), ProviderName::ALL.len());
        assert!(status[&ProviderName::Ollama]);
        assert!(status[&ProviderName::Vllm]);
        assert!(!status[&ProviderName::Azure]);
    }

    #[tokio::test]
    async fn embed_walks_the_chain_and_records_estimated_cost() {
        let ollama = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/embeddings"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [{ "embedding": [0.1, 0.2, 0.3] }],
            })))
            .mount(&ollama)
            .await;
        let vllm = MockServer::start().await;

        let h = harness(test_config(r#"["ollama"]"#, &ollama.uri(), &vllm.uri(), 10.0));
        let vectors = h.gateway.embed(&["embed me".into()], "test-model").await.unwrap();
        assert_eq!(vectors.len(), 1);
        assert_eq!(vectors[0].len(), 3);

        assert_eq!(h.costs.record_count(), 1);
        let record = &h.costs.records(0, 1)[0];
        assert_eq!(record.completion_tokens, 0);
        assert!(record.estimated_usage);
    }

    #[tokio::test]
    async fn embed_rejects_empty_input() {
        let ollama = MockServer::start().await;
        let vllm = MockServer::start().await;
        let h = harness(test_config(r#"["ollama"]"#, &ollama.uri(), &vllm.uri(), 10.0));
        let err = h.gateway.embed(&[], "test-model").await.unwrap_err();
        assert!(matches!(err, GatewayError::InvalidRequest(_)));
    }
}

//! # Router
//!
//! Strategy-driven dispatch over registered providers with transparent
//! failover.
//!
//! ## Overview
//!
//! A call picks a starting provider according to the configured strategy,
//! then walks the registration order from there: attempt, and on failure
//! move to the next provider until one succeeds or all have failed, in
//! which case the last error surfaces. Every attempt updates the provider's
//! metrics record and emits one structured event.
//!
//! ## Strategies
//!
//! - **round-robin**: an atomically advanced cursor, advanced once per call
//!   (not per attempt), so the next call starts at the neighbor of this
//!   call's starting provider regardless of how many fallbacks it consumed.
//! - **random**: uniform over registered providers.
//! - **first-available**: probes `health_check` in registration order and
//!   starts at the first provider that passes; if none do, the fallback
//!   loop starts at index 0.
//! - **best-available**: prefers derived health (healthy > degraded >
//!   unhealthy) and, within the best group, the lowest effective latency;
//!   ties break by registration order. Uses recorded metrics only, no
//!   network probes.
//!
//! ## Streaming
//!
//! `route_stream` uses the same selection and fallback ordering, but
//! fallback is permitted only while nothing has reached the caller: a
//! failure before the first chunk (from `generate_stream` itself or as the
//! stream's first item) moves on to the next provider; once a chunk has
//! been yielded, a subsequent error terminates the stream and is reported
//! as-is.
//!
//! ## Cancellation
//!
//! Dropping an in-flight call (or a stream) cancels the current provider
//! attempt. A cancelled attempt updates no counters and triggers no
//! fallback: metrics are only touched after an attempt resolves.

use crate::config::GenerationParams;
use crate::error::{ProviderError, RouterError};
use crate::exporter::{self, ExporterHandle, ExporterMetrics};
use crate::metrics::{HealthStatus, MetricsSnapshot, ProviderMetrics};
use crate::pricing::PricingTable;
use crate::providers::{Provider, ProviderInfo, TextStream};
use crate::tokenizer::TokenCounter;
use async_stream::stream;
use futures::StreamExt;
use rand::Rng;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Instant;

/// Rule for picking the starting provider of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingStrategy {
    RoundRobin,
    Random,
    FirstAvailable,
    BestAvailable,
}

impl RoutingStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoutingStrategy::RoundRobin => "round-robin",
            RoutingStrategy::Random => "random",
            RoutingStrategy::FirstAvailable => "first-available",
            RoutingStrategy::BestAvailable => "best-available",
        }
    }
}

impl FromStr for RoutingStrategy {
    type Err = RouterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "round-robin" => Ok(RoutingStrategy::RoundRobin),
            "random" => Ok(RoutingStrategy::Random),
            "first-available" => Ok(RoutingStrategy::FirstAvailable),
            "best-available" => Ok(RoutingStrategy::BestAvailable),
            other => Err(RouterError::UnknownStrategy {
                name: other.to_string(),
            }),
        }
    }
}

impl std::fmt::Display for RoutingStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone)]
struct ProviderSlot {
    provider: Arc<dyn Provider>,
    metrics: Arc<ProviderMetrics>,
    info: ProviderInfo,
}

/// Per-attempt accounting shared between the unary and streaming paths.
///
/// Owns clones of the router's token counter, pricing table, and exporter
/// hook so committed streams can finish their bookkeeping after `route_stream`
/// has returned.
#[derive(Clone)]
struct Accounting {
    tokens: Arc<TokenCounter>,
    pricing: Arc<PricingTable>,
    exporter: Option<Arc<ExporterMetrics>>,
}

impl Accounting {
    fn success(
        &self,
        slot: &ProviderSlot,
        latency_ms: u64,
        prompt: &str,
        completion: &str,
        streaming: bool,
    ) {
        let info = &slot.info;
        let prompt_tokens = self.tokens.count(prompt, &info.model);
        let completion_tokens = self.tokens.count(completion, &info.model);
        let total_tokens = prompt_tokens + completion_tokens;
        let cost_rub = self.pricing.cost(info.kind, &info.model, total_tokens);

        slot.metrics
            .record_success(latency_ms, prompt_tokens, completion_tokens, cost_rub);
        if let Some(exporter) = &self.exporter {
            exporter.observe_latency(&info.name, latency_ms as f64 / 1000.0);
        }

        tracing::info!(
            provider = %info.name,
            model = %info.model,
            latency_ms,
            streaming,
            success = true,
            prompt_tokens,
            completion_tokens,
            total_tokens,
            cost_rub = (cost_rub * 100.0).round() / 100.0,
            "request_completed"
        );
    }

    fn failure(&self, slot: &ProviderSlot, latency_ms: u64, error: &ProviderError, streaming: bool) {
        let info = &slot.info;
        slot.metrics.record_failure(latency_ms);
        if let Some(exporter) = &self.exporter {
            exporter.observe_latency(&info.name, latency_ms as f64 / 1000.0);
        }

        tracing::warn!(
            provider = %info.name,
            model = %info.model,
            latency_ms,
            streaming,
            success = false,
            error_kind = %error.kind(),
            "request_failed"
        );
    }
}

/// Strategy-driven dispatcher over registered providers.
///
/// Providers are registered before the router is shared; `add_provider`
/// takes `&mut self`, so wrapping the router in an `Arc` closes
/// registration. All state lives inside the instance, so two routers in one
/// process are fully independent, including their Prometheus series.
///
/// # Examples
///
/// ```rust
/// use llm_relay::{Router, RoutingStrategy};
/// use llm_relay::config::ProviderConfig;
/// use llm_relay::providers::{create_provider, ProviderKind};
///
/// # async fn demo() -> Result<(), llm_relay::RouterError> {
/// let mut router = Router::new(RoutingStrategy::RoundRobin);
/// router.add_provider(create_provider(
///     ProviderKind::Mock,
///     ProviderConfig::new("m1").with_model("mock-normal"),
/// )?)?;
///
/// let answer = router.route("What is up?", None).await?;
/// assert!(answer.starts_with("Mock response"));
/// # Ok(())
/// # }
/// ```
pub struct Router {
    strategy: RoutingStrategy,
    slots: Vec<ProviderSlot>,
    rr_cursor: AtomicUsize,
    pricing: Arc<PricingTable>,
    tokens: Arc<TokenCounter>,
    exporter: OnceLock<Arc<ExporterMetrics>>,
    exporter_handle: tokio::sync::Mutex<Option<ExporterHandle>>,
}

impl Router {
    pub fn new(strategy: RoutingStrategy) -> Self {
        Self {
            strategy,
            slots: Vec::new(),
            rr_cursor: AtomicUsize::new(0),
            pricing: Arc::new(PricingTable::default()),
            tokens: Arc::new(TokenCounter::new()),
            exporter: OnceLock::new(),
            exporter_handle: tokio::sync::Mutex::new(None),
        }
    }

    /// Construct from a strategy name, failing fast on unknown names.
    pub fn from_strategy_name(name: &str) -> Result<Self, RouterError> {
        Ok(Self::new(name.parse()?))
    }

    /// Replace the default pricing table.
    pub fn with_pricing(mut self, pricing: PricingTable) -> Self {
        self.pricing = Arc::new(pricing);
        self
    }

    pub fn strategy(&self) -> RoutingStrategy {
        self.strategy
    }

    /// Register a provider. Order of registration is the fallback order.
    pub fn add_provider(&mut self, provider: Arc<dyn Provider>) -> Result<(), RouterError> {
        let info = provider.describe();
        if self.slots.iter().any(|s| s.info.name == info.name) {
            return Err(RouterError::Configuration {
                message: format!("provider name {:?} is already registered", info.name),
            });
        }
        tracing::debug!(provider = %info.name, model = %info.model, kind = %info.kind, "provider registered");
        self.slots.push(ProviderSlot {
            provider,
            metrics: Arc::new(ProviderMetrics::new()),
            info,
        });
        Ok(())
    }

    /// Registered provider names in fallback order.
    pub fn provider_names(&self) -> Vec<String> {
        self.slots.iter().map(|s| s.info.name.clone()).collect()
    }

    /// Current metrics snapshot for every provider.
    pub fn get_metrics(&self) -> HashMap<String, MetricsSnapshot> {
        self.slots
            .iter()
            .map(|s| (s.info.name.clone(), s.metrics.snapshot()))
            .collect()
    }

    fn accounting(&self) -> Accounting {
        Accounting {
            tokens: self.tokens.clone(),
            pricing: self.pricing.clone(),
            exporter: self.exporter.get().cloned(),
        }
    }

    /// Route a unary generation call, failing over until a provider
    /// succeeds or every provider has been attempted.
    pub async fn route(
        &self,
        prompt: &str,
        params: Option<GenerationParams>,
    ) -> Result<String, RouterError> {
        let params = params.unwrap_or_default();
        params.validate()?;
        if self.slots.is_empty() {
            return Err(RouterError::NoProviders);
        }

        let n = self.slots.len();
        let start = self.starting_index(n).await;
        let accounting = self.accounting();
        let mut last_error: Option<ProviderError> = None;

        for offset in 0..n {
            let slot = &self.slots[(start + offset) % n];
            let begin = Instant::now();
            match slot.provider.generate(prompt, &params).await {
                Ok(text) => {
                    let latency_ms = begin.elapsed().as_millis() as u64;
                    accounting.success(slot, latency_ms, prompt, &text, false);
                    return Ok(text);
                }
                Err(error) => {
                    let latency_ms = begin.elapsed().as_millis() as u64;
                    accounting.failure(slot, latency_ms, &error, false);
                    last_error = Some(error);
                }
            }
        }

        match last_error {
            Some(error) => Err(error.into()),
            None => Err(RouterError::NoProviders),
        }
    }

    /// Route a streaming generation call.
    ///
    /// Fallback applies only while the stream is in its pre-flight phase;
    /// once any chunk has been emitted to the caller, an error terminates
    /// the stream without fallback.
    pub async fn route_stream(
        &self,
        prompt: &str,
        params: Option<GenerationParams>,
    ) -> Result<TextStream, RouterError> {
        let params = params.unwrap_or_default();
        params.validate()?;
        if self.slots.is_empty() {
            return Err(RouterError::NoProviders);
        }

        let n = self.slots.len();
        let start = self.starting_index(n).await;
        let accounting = self.accounting();
        let mut last_error: Option<ProviderError> = None;

        for offset in 0..n {
            let slot = self.slots[(start + offset) % n].clone();
            let begin = Instant::now();
            let mut inner = match slot.provider.generate_stream(prompt, &params).await {
                Ok(stream) => stream,
                Err(error) => {
                    accounting.failure(&slot, begin.elapsed().as_millis() as u64, &error, true);
                    last_error = Some(error);
                    continue;
                }
            };

            // Pull the first chunk while fallback is still possible.
            match inner.next().await {
                None => {
                    accounting.success(&slot, begin.elapsed().as_millis() as u64, prompt, "", true);
                    return Ok(Box::pin(futures::stream::empty()));
                }
                Some(Err(error)) => {
                    accounting.failure(&slot, begin.elapsed().as_millis() as u64, &error, true);
                    last_error = Some(error);
                    continue;
                }
                Some(Ok(first)) => {
                    return Ok(committed_stream(
                        accounting,
                        slot,
                        begin,
                        prompt.to_string(),
                        first,
                        inner,
                    ));
                }
            }
        }

        match last_error {
            Some(error) => Err(error.into()),
            None => Err(RouterError::NoProviders),
        }
    }

    async fn starting_index(&self, n: usize) -> usize {
        match self.strategy {
            RoutingStrategy::RoundRobin => self.rr_cursor.fetch_add(1, Ordering::Relaxed) % n,
            RoutingStrategy::Random => rand::thread_rng().gen_range(0..n),
            RoutingStrategy::FirstAvailable => {
                for (i, slot) in self.slots.iter().enumerate() {
                    if slot.provider.health_check().await {
                        return i;
                    }
                }
                0
            }
            RoutingStrategy::BestAvailable => self.best_available_index(),
        }
    }

    fn best_available_index(&self) -> usize {
        let mut best = 0usize;
        let mut best_rank = u8::MAX;
        let mut best_latency = f64::INFINITY;
        for (i, slot) in self.slots.iter().enumerate() {
            let snapshot = slot.metrics.snapshot();
            let rank = match snapshot.health {
                HealthStatus::Healthy => 0,
                HealthStatus::Degraded => 1,
                HealthStatus::Unhealthy => 2,
            };
            let latency = snapshot.effective_latency_ms();
            if rank < best_rank || (rank == best_rank && latency < best_latency) {
                best = i;
                best_rank = rank;
                best_latency = latency;
            }
        }
        best
    }

    /// Start the Prometheus endpoint on the given port (0 picks an
    /// ephemeral one) and the once-per-second refresh task.
    ///
    /// Succeeds at most once per router; a failed bind does not consume the
    /// attempt, so the caller may retry with another port.
    pub async fn start_metrics_server(&self, port: u16) -> Result<SocketAddr, RouterError> {
        if self.exporter.get().is_some() {
            return Err(RouterError::MetricsServerAlreadyStarted);
        }
        let listener = exporter::bind(port).await?;
        let addr = listener.local_addr().map_err(|e| RouterError::Exporter {
            message: format!("listener has no local address: {e}"),
        })?;

        let metrics = Arc::new(ExporterMetrics::new()?);
        if self.exporter.set(metrics.clone()).is_err() {
            return Err(RouterError::MetricsServerAlreadyStarted);
        }

        let providers: Vec<(String, Arc<ProviderMetrics>)> = self
            .slots
            .iter()
            .map(|s| (s.info.name.clone(), s.metrics.clone()))
            .collect();
        let refresher = exporter::spawn_refresher(metrics.clone(), providers);
        let (server, shutdown) = exporter::spawn_server(listener, metrics);

        let mut guard = self.exporter_handle.lock().await;
        *guard = Some(ExporterHandle {
            addr,
            refresher,
            server,
            shutdown,
        });
        tracing::info!(%addr, "metrics server started");
        Ok(addr)
    }

    /// Stop the metrics endpoint. Idempotent; cancels the refresh task and
    /// waits for the server to release the port before returning.
    pub async fn stop_metrics_server(&self) {
        let handle = self.exporter_handle.lock().await.take();
        if let Some(handle) = handle {
            handle.refresher.abort();
            let _ = handle.shutdown.send(());
            let _ = handle.server.await;
            tracing::info!(addr = %handle.addr, "metrics server stopped");
        }
    }

    /// Address of the running metrics server, if any.
    pub async fn metrics_server_addr(&self) -> Option<SocketAddr> {
        self.exporter_handle.lock().await.as_ref().map(|h| h.addr)
    }
}

/// Wrap a stream that has produced its first chunk: from here on errors
/// terminate the stream (no fallback) and a clean end records the success
/// with completion tokens counted over everything that was emitted.
fn committed_stream(
    accounting: Accounting,
    slot: ProviderSlot,
    begin: Instant,
    prompt: String,
    first: String,
    mut inner: TextStream,
) -> TextStream {
    Box::pin(stream! {
        let mut collected = first.clone();
        yield Ok(first);
        while let Some(item) = inner.next().await {
            match item {
                Ok(chunk) => {
                    collected.push_str(&chunk);
                    yield Ok(chunk);
                }
                Err(error) => {
                    accounting.failure(&slot, begin.elapsed().as_millis() as u64, &error, true);
                    yield Err(error);
                    return;
                }
            }
        }
        accounting.success(
            &slot,
            begin.elapsed().as_millis() as u64,
            &prompt,
            &collected,
            true,
        );
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderConfig;
    use crate::providers::{create_provider, ProviderKind};

    #[test]
    fn strategy_names_parse() {
        assert_eq!(
            "round-robin".parse::<RoutingStrategy>().unwrap(),
            RoutingStrategy::RoundRobin
        );
        assert_eq!(
            "RANDOM".parse::<RoutingStrategy>().unwrap(),
            RoutingStrategy::Random
        );
        assert_eq!(
            "first-available".parse::<RoutingStrategy>().unwrap(),
            RoutingStrategy::FirstAvailable
        );
        assert_eq!(
            "best-available".parse::<RoutingStrategy>().unwrap(),
            RoutingStrategy::BestAvailable
        );
    }

    #[test]
    fn unknown_strategy_fails_fast() {
        let err = match Router::from_strategy_name("weighted") {
            Err(e) => e,
            Ok(_) => panic!("expected from_strategy_name to fail"),
        };
        assert!(matches!(err, RouterError::UnknownStrategy { .. }));
    }

    #[test]
    fn duplicate_provider_names_are_rejected() {
        let mut router = Router::new(RoutingStrategy::RoundRobin);
        let make = || {
            create_provider(
                ProviderKind::Mock,
                ProviderConfig::new("p1").with_model("mock-normal"),
            )
            .unwrap()
        };
        router.add_provider(make()).unwrap();
        let err = router.add_provider(make()).unwrap_err();
        assert!(matches!(err, RouterError::Configuration { .. }));
    }

    #[tokio::test]
    async fn empty_router_reports_no_providers() {
        let router = Router::new(RoutingStrategy::RoundRobin);
        assert!(matches!(
            router.route("hi", None).await,
            Err(RouterError::NoProviders)
        ));
        assert!(matches!(
            router.route_stream("hi", None).await,
            Err(RouterError::NoProviders)
        ));
    }

    #[tokio::test]
    async fn invalid_params_fail_before_any_attempt() {
        let mut router = Router::new(RoutingStrategy::RoundRobin);
        router
            .add_provider(
                create_provider(
                    ProviderKind::Mock,
                    ProviderConfig::new("p1").with_model("mock-normal"),
                )
                .unwrap(),
            )
            .unwrap();

        let params = GenerationParams {
            temperature: 5.0,
            ..Default::default()
        };
        let err = router.route("hi", Some(params)).await.unwrap_err();
        assert!(matches!(
            err.provider_error(),
            Some(ProviderError::InvalidRequest(_))
        ));
        assert_eq!(router.get_metrics()["p1"].total, 0);
    }
}

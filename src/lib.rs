//! # llm-relay
//!
//! An in-process dispatcher over heterogeneous LLM backends: it accepts a
//! text-generation request, selects one of the registered providers
//! according to a configurable strategy, invokes it, and on failure
//! transparently fails over to the remaining providers, while observing
//! latency, error rates, token usage, and monetary cost per backend.
//!
//! ## Overview
//!
//! The crate provides:
//! - **Router**: strategy-driven selection (`round-robin`, `random`,
//!   `first-available`, `best-available`), a deterministic fallback loop,
//!   per-attempt accounting, and structured request events.
//! - **Provider contract**: unary and streaming generation, a bounded
//!   non-throwing health probe, and self-describing identity, implemented by
//!   a mock backend, GigaChat (OAuth2 key-for-token exchange with
//!   single-flight refresh), YandexGPT, and a local Ollama server.
//! - **Metrics engine**: per-provider counters, a rolling latency window, a
//!   60-second error window, and a derived health classification that feeds
//!   back into routing.
//! - **Token/cost engine**: BPE token counting with a word-count fallback
//!   and a `(kind, model)` pricing table in rubles per 1000 tokens.
//! - **Prometheus exporter**: a `GET /metrics` endpoint with a
//!   once-per-second refresh task, owned entirely by the router instance.
//!
//! ## Usage
//!
//! ```rust
//! use llm_relay::config::ProviderConfig;
//! use llm_relay::providers::{create_provider, ProviderKind};
//! use llm_relay::{Router, RoutingStrategy};
//!
//! # async fn demo() -> Result<(), llm_relay::RouterError> {
//! let mut router = Router::new(RoutingStrategy::RoundRobin);
//! router.add_provider(create_provider(
//!     ProviderKind::GigaChat,
//!     ProviderConfig::new("sber")
//!         .with_api_key(std::env::var("GIGACHAT_AUTH_KEY").unwrap_or_default())
//!         .with_verify_tls(false),
//! )?)?;
//! router.add_provider(create_provider(
//!     ProviderKind::Ollama,
//!     ProviderConfig::new("local").with_model("llama3"),
//! )?)?;
//!
//! router.start_metrics_server(9090).await?;
//! let answer = router.route("Почему небо синее?", None).await?;
//! println!("{answer}");
//! router.stop_metrics_server().await;
//! # Ok(())
//! # }
//! ```
//!
//! ### Streaming
//!
//! ```rust
//! use futures::StreamExt;
//!
//! # async fn demo(router: llm_relay::Router) -> Result<(), llm_relay::RouterError> {
//! let mut stream = router.route_stream("Tell me a story", None).await?;
//! while let Some(chunk) = stream.next().await {
//!     print!("{}", chunk?);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! Fallback for streams is gated: a provider that fails before yielding
//! anything is retried on the next provider transparently; once a chunk has
//! reached the caller, an error terminates the stream.
//!
//! ## Concurrency
//!
//! The router tolerates concurrent entry from any number of tasks.
//! Round-robin indices are advanced atomically (two concurrent calls get
//! two distinct successive indices), metrics updates for a single provider
//! are serialized behind a per-provider mutex while counter reads stay
//! lock-free, and each credentialed provider guards its token cache with a
//! single-flight lock so concurrent requests trigger at most one refresh.
//! Cancellation (dropping the call future) propagates to the in-flight
//! HTTP request and updates no counters.

pub mod config;
pub mod error;
pub mod exporter;
pub mod metrics;
pub mod pricing;
pub mod providers;
pub mod router;
pub mod tokenizer;

pub use config::{GenerationParams, ProviderConfig};
pub use error::{ErrorKind, ProviderError, RouterError};
pub use metrics::{HealthStatus, MetricsSnapshot};
pub use pricing::PricingTable;
pub use providers::{create_provider, Provider, ProviderInfo, ProviderKind, TextStream};
pub use router::{Router, RoutingStrategy};

/// Convenience alias for router-level operations.
pub type Result<T> = std::result::Result<T, RouterError>;

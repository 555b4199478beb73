//! # Provider System Module
//!
//! This module provides the provider abstraction layer for the routing
//! core. It defines the uniform contract every backend satisfies and the
//! factory for constructing provider instances from configuration.
//!
//! ## Overview
//!
//! The provider system provides:
//! - **Uniform Provider Contract**: one trait covering every backend
//! - **Provider Factory**: construction of instances by kind, failing fast
//!   on invalid or incomplete configuration
//! - **Streaming Support**: incremental responses with a single-chunk
//!   fallback for backends without native streaming
//! - **Health Probes**: bounded, non-throwing availability checks
//! - **Retry Discipline**: shared exponential backoff for transient errors
//! - **Typed Errors**: every wire condition maps onto the closed taxonomy
//!   in [`crate::error::ProviderError`]
//!
//! ## Provider Contract
//!
//! A provider exposes four capabilities:
//!
//! - **Unary generation**: produce a complete response for a prompt.
//! - **Streaming generation**: a lazy, finite, single-shot sequence of text
//!   chunks. Backends without native streaming fall back to unary generation
//!   and yield the whole result as one chunk.
//! - **Health probe**: a cheap liveness check bounded by a 5 second ceiling
//!   that never fails; any error collapses to `false`.
//! - **Identity**: name, model, and kind, used for metrics labels and
//!   pricing lookup.
//!
//! ## Supported Backends
//!
//! - [`mock::MockProvider`]: purely local simulation modes for tests and
//!   demos, selected through the configured model name
//! - [`gigachat::GigaChatProvider`]: OAuth2 key-for-token exchange with
//!   time-bounded caching, single-flight refresh, and on-401 retry
//! - [`yandexgpt::YandexGptProvider`]: API-key remote service with
//!   folder-scoped model URIs
//! - [`ollama::OllamaProvider`]: credential-less local inference server
//!
//! ## Usage Examples
//!
//! ### Creating Providers
//!
//! ```rust
//! use llm_relay::config::{GenerationParams, ProviderConfig};
//! use llm_relay::providers::{create_provider, ProviderKind};
//! use std::time::Duration;
//!
//! # async fn demo() -> Result<(), llm_relay::RouterError> {
//! let config = ProviderConfig::new("sber-main")
//!     .with_api_key("base64-authorization-key")
//!     .with_timeout(Duration::from_secs(60))
//!     .with_scope("GIGACHAT_API_CORP")
//!     .with_verify_tls(false);
//! let provider = create_provider(ProviderKind::GigaChat, config)?;
//!
//! let answer = provider
//!     .generate("Привет!", &GenerationParams::default())
//!     .await?;
//! println!("{answer}");
//! # Ok(())
//! # }
//! ```
//!
//! ### Streaming
//!
//! ```rust
//! use futures::StreamExt;
//!
//! # async fn demo(provider: std::sync::Arc<dyn llm_relay::Provider>) {
//! let params = llm_relay::GenerationParams::default();
//! let mut stream = provider.generate_stream("Tell me a story", &params).await.unwrap();
//! while let Some(chunk) = stream.next().await {
//!     match chunk {
//!         Ok(text) => print!("{text}"),
//!         Err(e) => eprintln!("stream failed: {e}"),
//!     }
//! }
//! # }
//! ```
//!
//! ### Custom Provider Implementation
//!
//! ```rust
//! use llm_relay::config::GenerationParams;
//! use llm_relay::providers::{Provider, ProviderInfo, ProviderKind};
//! use llm_relay::ProviderError;
//!
//! struct EchoProvider;
//!
//! #[async_trait::async_trait]
//! impl Provider for EchoProvider {
//!     fn describe(&self) -> ProviderInfo {
//!         ProviderInfo {
//!             name: "echo".to_string(),
//!             model: "echo-1".to_string(),
//!             kind: ProviderKind::Mock,
//!         }
//!     }
//!
//!     async fn generate(
//!         &self,
//!         prompt: &str,
//!         _params: &GenerationParams,
//!     ) -> Result<String, ProviderError> {
//!         Ok(prompt.to_string())
//!     }
//!
//!     async fn health_check(&self) -> bool {
//!         true
//!     }
//! }
//! ```
//!
//! ### Health Monitoring
//!
//! ```rust
//! # async fn demo(provider: std::sync::Arc<dyn llm_relay::Provider>) {
//! if !provider.health_check().await {
//!     println!("{} is unavailable", provider.describe().name);
//! }
//! # }
//! ```
//!
//! ## Retry Discipline
//!
//! Inside a provider, only `RateLimit` and `Timeout` are retried, with
//! exponential delays 1, 2, 4, … seconds capped at 30 s, up to the
//! configured `max_retries`. Everything else propagates immediately. The
//! schedule lives in [`retry::RetryPolicy`] and is shared by every HTTP
//! backend; the mock fails without backoff since it only simulates the
//! error kind.
//!
//! ## Configuration
//!
//! Each provider is driven entirely by its
//! [`ProviderConfig`](crate::config::ProviderConfig): credential material,
//! endpoint override, per-attempt timeout, retry cap, TLS verification
//! toggle, model identifier, and the provider-specific `scope` and
//! `tenant_id` fields. Constructors validate the ranges and reject missing
//! credential material before the provider ever reaches a router.

use crate::config::{GenerationParams, ProviderConfig};
use crate::error::{ProviderError, RouterError};
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::sync::Arc;

pub mod gigachat;
pub mod http_client;
pub mod mock;
pub mod ollama;
pub mod retry;
pub mod yandexgpt;

/// A lazy, finite, single-shot sequence of response chunks.
///
/// The stream may fail before or between chunks; a failure before the first
/// chunk is a pre-flight failure and is eligible for router-level fallback.
pub type TextStream = Pin<Box<dyn Stream<Item = Result<String, ProviderError>> + Send>>;

/// Backend family, used for pricing lookup and the provider factory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Mock,
    GigaChat,
    YandexGpt,
    Ollama,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Mock => "mock",
            ProviderKind::GigaChat => "gigachat",
            ProviderKind::YandexGpt => "yandexgpt",
            ProviderKind::Ollama => "ollama",
        }
    }

    /// Backends that never bill: their cost is always 0.0.
    pub fn is_free(&self) -> bool {
        matches!(self, ProviderKind::Mock | ProviderKind::Ollama)
    }
}

impl std::str::FromStr for ProviderKind {
    type Err = RouterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mock" => Ok(ProviderKind::Mock),
            "gigachat" => Ok(ProviderKind::GigaChat),
            "yandexgpt" | "yandex-gpt" => Ok(ProviderKind::YandexGpt),
            "ollama" => Ok(ProviderKind::Ollama),
            other => Err(RouterError::Configuration {
                message: format!("unknown provider kind: {other:?}"),
            }),
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Self-described provider identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderInfo {
    pub name: String,
    pub model: String,
    pub kind: ProviderKind,
}

/// Uniform contract for LLM backends.
///
/// Concrete variants are distinct types implementing this set; there is no
/// inheritance tree beyond the shared contract.
#[async_trait::async_trait]
pub trait Provider: Send + Sync {
    /// Identity used for metrics labels and pricing lookup.
    fn describe(&self) -> ProviderInfo;

    /// Produce a complete response; fails with a typed error kind.
    async fn generate(
        &self,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<String, ProviderError>;

    /// Produce an incremental response.
    ///
    /// The default implementation falls back to [`Provider::generate`] and
    /// yields the whole result as a single chunk.
    async fn generate_stream(
        &self,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<TextStream, ProviderError> {
        let text = self.generate(prompt, params).await?;
        Ok(Box::pin(futures::stream::once(async move { Ok(text) })))
    }

    /// Lightweight liveness probe bounded by a 5 s internal deadline.
    ///
    /// Must not fail: implementations collapse every error to `false`.
    async fn health_check(&self) -> bool;
}

/// Build a provider of the given kind from its configuration.
///
/// Validates the configuration and fails fast on missing credential
/// material, so a misconfigured provider never reaches the router.
pub fn create_provider(
    kind: ProviderKind,
    config: ProviderConfig,
) -> Result<Arc<dyn Provider>, RouterError> {
    config.validate()?;
    match kind {
        ProviderKind::Mock => Ok(Arc::new(mock::MockProvider::new(config))),
        ProviderKind::GigaChat => Ok(Arc::new(gigachat::GigaChatProvider::new(config)?)),
        ProviderKind::YandexGpt => Ok(Arc::new(yandexgpt::YandexGptProvider::new(config)?)),
        ProviderKind::Ollama => Ok(Arc::new(ollama::OllamaProvider::new(config)?)),
    }
}

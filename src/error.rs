//! # Error Handling Module
//!
//! This module provides standardized error handling for the routing core.
//! It defines the closed error taxonomy that every backend maps its wire
//! conditions onto, and the router-level error type that callers of
//! [`Router`](crate::router::Router) observe.
//!
//! ## Overview
//!
//! The error handling system provides:
//! - **ProviderError**: the closed taxonomy of backend failures
//! - **ErrorKind**: a copyable discriminant for metrics labels and logs
//! - **RouterError**: router-level failures, wrapping the last provider
//!   error of a failed call
//! - **Transport Mapping**: `reqwest` errors convert onto the taxonomy, so
//!   transport types never leak out of a provider
//! - **Retry Classification**: each error knows whether the provider-local
//!   retry loop may re-attempt it
//!
//! ## Error Categories
//!
//! ### Provider Errors
//!
//! Failures of a single backend attempt, one variant per abstract kind:
//! - **Authentication**: rejected or unobtainable credentials
//! - **RateLimit**: the backend asked the caller to slow down
//! - **Timeout**: the attempt exceeded its deadline
//! - **InvalidRequest**: the backend rejected the request as malformed
//! - **Provider**: every other backend failure (5xx, connection, DNS, TLS,
//!   malformed payloads)
//!
//! ### Router Errors
//!
//! Failures of the dispatch layer itself:
//! - **Provider**: the call failed on every registered provider; this wraps
//!   the last attempt's error
//! - **Configuration**: invalid provider configuration or duplicate names
//! - **NoProviders / UnknownStrategy**: misuse caught before any attempt
//! - **MetricsPortInUse / MetricsServerAlreadyStarted / Exporter**: metrics
//!   server lifecycle failures
//!
//! ## Usage Examples
//!
//! ### Basic Error Handling
//!
//! ```rust
//! use llm_relay::{ProviderError, RouterError};
//!
//! match router.route("Why is the sky blue?", None).await {
//!     Ok(answer) => println!("{answer}"),
//!     Err(RouterError::Provider(ProviderError::RateLimit(msg))) => {
//!         println!("every provider is rate limited: {msg}");
//!     }
//!     Err(RouterError::Provider(ProviderError::Authentication(msg))) => {
//!         println!("credentials need attention: {msg}");
//!     }
//!     Err(e) => println!("call failed: {e}"),
//! }
//! ```
//!
//! ### Dispatching on Error Kind
//!
//! The [`ErrorKind`] view is convenient when the message does not matter,
//! for example in metrics labels:
//!
//! ```rust
//! use llm_relay::ErrorKind;
//!
//! let err = provider.generate("hi", &params).await.unwrap_err();
//! match err.kind() {
//!     ErrorKind::RateLimit | ErrorKind::Timeout => {
//!         // transient: worth retrying later
//!     }
//!     kind => println!("permanent failure: {kind}"),
//! }
//! ```
//!
//! ### Error Conversion
//!
//! Provider errors convert into router errors automatically, and transport
//! errors convert into the taxonomy:
//!
//! ```rust
//! use llm_relay::{ProviderError, RouterError};
//!
//! let provider_error = ProviderError::Timeout("deadline exceeded".into());
//! let router_error: RouterError = provider_error.into();
//! assert!(router_error.provider_error().is_some());
//! ```
//!
//! ## Propagation Policy
//!
//! - The provider-local retry loop absorbs `RateLimit` and `Timeout` up to
//!   `max_retries`; all other kinds propagate immediately.
//! - The router's fallback loop absorbs any kind from a failed attempt and
//!   moves to the next provider; when every attempt fails it surfaces the
//!   *last* error, not an aggregate.
//! - `health_check` never returns an error: providers collapse failures to
//!   `false` and log at warning level.
//! - `start_metrics_server` reports an occupied port as a typed condition,
//!   distinct from generic exporter failures, so callers can pick another
//!   port.
//!
//! ## Error Recovery Strategies
//!
//! The routing core recovers from failures at several layers:
//!
//! - **Provider-Local Retry**: transient errors are re-attempted with
//!   exponential backoff before a failure is reported at all
//! - **Router Fallback**: a failed attempt of any kind moves the call to
//!   the next provider in registration order
//! - **Credential Refresh**: the credentialed backend trades one rejected
//!   token for a fresh one before reporting `Authentication`
//! - **Health-Aware Selection**: the `first-available` and `best-available`
//!   strategies steer new calls away from providers with bad recent records
//!
//! ## Best Practices
//!
//! - Match on specific variants rather than catch-all patterns; the
//!   taxonomy is closed, so a match can be exhaustive
//! - Use [`ProviderError::kind`] for labels and counters instead of
//!   stringifying the full error
//! - Treat `RateLimit` and `Timeout` as transient and everything else as
//!   permanent when building recovery logic on top of the router
//! - Watch `request_failed` events and per-provider error rates instead of
//!   parsing error messages

use thiserror::Error;

/// Closed error taxonomy for provider backends.
///
/// Each concrete provider maps wire errors onto these kinds; the router and
/// the retry helper dispatch on them without knowing the backend.
///
/// # Examples
///
/// ```rust
/// use llm_relay::ProviderError;
///
/// match provider.generate("hi", &params).await {
///     Ok(text) => println!("{text}"),
///     Err(ProviderError::RateLimit(_)) => println!("backing off"),
///     Err(ProviderError::Timeout(_)) => println!("too slow"),
///     Err(e) => println!("failed: {e}"),
/// }
/// ```
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Credentials were rejected or could not be acquired.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// The backend refused the request due to rate limiting.
    #[error("rate limit exceeded: {0}")]
    RateLimit(String),

    /// The attempt exceeded its deadline.
    #[error("request timed out: {0}")]
    Timeout(String),

    /// The backend rejected the request as malformed or unsupported.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Any other backend failure (5xx, connection, DNS, TLS, bad payload).
    #[error("provider error: {0}")]
    Provider(String),
}

impl ProviderError {
    /// The abstract kind of this error, used for metrics labels and logs.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProviderError::Authentication(_) => ErrorKind::Authentication,
            ProviderError::RateLimit(_) => ErrorKind::RateLimit,
            ProviderError::Timeout(_) => ErrorKind::Timeout,
            ProviderError::InvalidRequest(_) => ErrorKind::InvalidRequest,
            ProviderError::Provider(_) => ErrorKind::Provider,
        }
    }

    /// Whether the provider-local retry loop may re-attempt after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProviderError::RateLimit(_) | ProviderError::Timeout(_)
        )
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ProviderError::Timeout(err.to_string())
        } else if err.is_connect() {
            ProviderError::Provider(format!("connection failed: {err}"))
        } else {
            ProviderError::Provider(err.to_string())
        }
    }
}

/// Discriminant-only view of [`ProviderError`], cheap to copy into labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Authentication,
    RateLimit,
    Timeout,
    InvalidRequest,
    Provider,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Authentication => "authentication",
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::Timeout => "timeout",
            ErrorKind::InvalidRequest => "invalid_request",
            ErrorKind::Provider => "provider",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors surfaced by the router and its metrics server.
///
/// # Examples
///
/// ```rust
/// use llm_relay::RouterError;
///
/// match router.start_metrics_server(9090).await {
///     Ok(addr) => println!("metrics on {addr}"),
///     Err(RouterError::MetricsPortInUse { port }) => {
///         println!("port {port} is taken, trying the next one");
///     }
///     Err(e) => println!("failed to start metrics server: {e}"),
/// }
/// ```
#[derive(Debug, Error)]
pub enum RouterError {
    /// The call failed on every provider; this is the last attempt's error.
    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// Invalid or inconsistent configuration.
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// A call was made against a router with no registered providers.
    #[error("no providers registered")]
    NoProviders,

    /// The strategy name did not match any known strategy.
    #[error("unknown routing strategy: {name:?} (expected one of: round-robin, random, first-available, best-available)")]
    UnknownStrategy { name: String },

    /// The metrics port is taken by another listener.
    #[error("metrics port {port} is already in use, try another port")]
    MetricsPortInUse { port: u16 },

    /// `start_metrics_server` already succeeded once for this router.
    #[error("metrics server was already started for this router")]
    MetricsServerAlreadyStarted,

    /// The exporter failed to register series or to serve.
    #[error("metrics exporter error: {message}")]
    Exporter { message: String },
}

impl RouterError {
    /// The provider error behind a failed call, if that is what this is.
    pub fn provider_error(&self) -> Option<&ProviderError> {
        match self {
            RouterError::Provider(e) => Some(e),
            _ => None,
        }
    }
}

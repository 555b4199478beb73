//! Provider configuration and per-call generation parameters.

use crate::error::{ProviderError, RouterError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Bounds enforced by [`ProviderConfig::validate`].
const MIN_TIMEOUT: Duration = Duration::from_secs(1);
const MAX_TIMEOUT: Duration = Duration::from_secs(300);
const MAX_RETRIES_CAP: u32 = 10;

/// Immutable descriptor for a provider instance.
///
/// Created once, handed to the provider at construction, and owned by it for
/// the provider's lifetime. The `name` is the identity used in logs, metrics
/// labels, and provider lookup, and must be unique within a router.
///
/// # Examples
///
/// ```rust
/// use llm_relay::config::ProviderConfig;
/// use std::time::Duration;
///
/// let config = ProviderConfig::new("sber-main")
///     .with_api_key("base64-authorization-key")
///     .with_timeout(Duration::from_secs(60))
///     .with_model("GigaChat-Pro")
///     .with_scope("GIGACHAT_API_CORP")
///     .with_verify_tls(false);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Provider identity used in logs, metrics labels, and lookup.
    pub name: String,
    /// Credential material; semantics are provider-specific.
    pub api_key: Option<String>,
    /// Endpoint override; each provider has a built-in default.
    pub base_url: Option<String>,
    /// Upper bound on a single request attempt.
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
    /// Cap for the provider-local retry loop.
    pub max_retries: u32,
    /// Peer certificate verification toggle.
    pub verify_tls: bool,
    /// Backend-specific model identifier.
    pub model: Option<String>,
    /// OAuth2 scope, for providers that require one.
    pub scope: Option<String>,
    /// Cloud tenant/folder identifier, for providers that require one.
    pub tenant_id: Option<String>,
}

impl ProviderConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            api_key: None,
            base_url: None,
            timeout: Duration::from_secs(30),
            max_retries: 3,
            verify_tls: true,
            model: None,
            scope: None,
            tenant_id: None,
        }
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_verify_tls(mut self, verify_tls: bool) -> Self {
        self.verify_tls = verify_tls;
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    pub fn with_tenant_id(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    /// Check the field constraints. Providers call this in their constructor.
    pub fn validate(&self) -> Result<(), RouterError> {
        if self.name.trim().is_empty() {
            return Err(RouterError::Configuration {
                message: "provider name must not be empty".to_string(),
            });
        }
        if self.timeout < MIN_TIMEOUT || self.timeout > MAX_TIMEOUT {
            return Err(RouterError::Configuration {
                message: format!(
                    "timeout must be between {}s and {}s, got {}s",
                    MIN_TIMEOUT.as_secs(),
                    MAX_TIMEOUT.as_secs(),
                    self.timeout.as_secs()
                ),
            });
        }
        if self.max_retries > MAX_RETRIES_CAP {
            return Err(RouterError::Configuration {
                message: format!(
                    "max_retries must be at most {MAX_RETRIES_CAP}, got {}",
                    self.max_retries
                ),
            });
        }
        Ok(())
    }
}

/// Per-call generation knobs.
///
/// Providers map these onto their own wire parameters and ignore fields the
/// backend does not support; an unsupported field never fails a request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationParams {
    /// Sampling temperature, `0.0..=2.0`.
    pub temperature: f32,
    /// Completion length cap, must be positive.
    pub max_tokens: u32,
    /// Nucleus sampling threshold, `0.0..=1.0`.
    pub top_p: f32,
    /// Stop sequences, applied in order by backends that support them.
    pub stop: Option<Vec<String>>,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            max_tokens: 1000,
            top_p: 1.0,
            stop: None,
        }
    }
}

impl GenerationParams {
    /// Check the range constraints. The router validates once per call,
    /// before any provider attempt.
    pub fn validate(&self) -> Result<(), ProviderError> {
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(ProviderError::InvalidRequest(format!(
                "temperature must be within 0.0..=2.0, got {}",
                self.temperature
            )));
        }
        if self.max_tokens == 0 {
            return Err(ProviderError::InvalidRequest(
                "max_tokens must be positive".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.top_p) {
            return Err(ProviderError::InvalidRequest(format!(
                "top_p must be within 0.0..=1.0, got {}",
                self.top_p
            )));
        }
        Ok(())
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults() {
        let config = ProviderConfig::new("p1");
        assert_eq!(config.name, "p1");
        assert_eq!(config.timeout, Duration::from_secs(30));
        assert_eq!(config.max_retries, 3);
        assert!(config.verify_tls);
        assert!(config.api_key.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn config_builder_chain() {
        let config = ProviderConfig::new("p1")
            .with_api_key("key")
            .with_base_url("http://localhost:9000")
            .with_timeout(Duration::from_secs(5))
            .with_max_retries(1)
            .with_verify_tls(false)
            .with_model("GigaChat")
            .with_scope("GIGACHAT_API_PERS")
            .with_tenant_id("b1gabc");
        assert_eq!(config.api_key.as_deref(), Some("key"));
        assert_eq!(config.base_url.as_deref(), Some("http://localhost:9000"));
        assert_eq!(config.max_retries, 1);
        assert!(!config.verify_tls);
        assert_eq!(config.tenant_id.as_deref(), Some("b1gabc"));
    }

    #[test]
    fn config_rejects_out_of_range_fields() {
        assert!(ProviderConfig::new("").validate().is_err());
        assert!(ProviderConfig::new("   ").validate().is_err());
        assert!(ProviderConfig::new("p")
            .with_timeout(Duration::from_millis(200))
            .validate()
            .is_err());
        assert!(ProviderConfig::new("p")
            .with_timeout(Duration::from_secs(301))
            .validate()
            .is_err());
        assert!(ProviderConfig::new("p")
            .with_max_retries(11)
            .validate()
            .is_err());
        assert!(ProviderConfig::new("p")
            .with_timeout(Duration::from_secs(300))
            .with_max_retries(10)
            .validate()
            .is_ok());
    }

    #[test]
    fn params_defaults() {
        let params = GenerationParams::default();
        assert_eq!(params.temperature, 0.7);
        assert_eq!(params.max_tokens, 1000);
        assert_eq!(params.top_p, 1.0);
        assert!(params.stop.is_none());
        assert!(params.validate().is_ok());
    }

    #[test]
    fn params_range_checks() {
        let mut params = GenerationParams {
            temperature: 2.5,
            ..Default::default()
        };
        assert!(matches!(
            params.validate(),
            Err(ProviderError::InvalidRequest(_))
        ));

        params.temperature = 0.7;
        params.max_tokens = 0;
        assert!(params.validate().is_err());

        params.max_tokens = 10;
        params.top_p = 1.2;
        assert!(params.validate().is_err());

        params.top_p = 0.9;
        assert!(params.validate().is_ok());
    }

    #[test]
    fn config_round_trips_through_serde() {
        let config = ProviderConfig::new("p1").with_timeout(Duration::from_secs(45));
        let json = serde_json::to_string(&config).unwrap();
        let back: ProviderConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.timeout, Duration::from_secs(45));
        assert_eq!(back.name, "p1");
    }
}

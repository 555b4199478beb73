//! Purely local provider with scripted behavior, for tests and demos.
//!
//! The configured `model` selects a simulation mode: `mock-normal` answers
//! after a short delay, the failure modes (`mock-timeout`, `mock-ratelimit`,
//! `mock-auth-error`, `mock-invalid-request`) fail immediately with the
//! corresponding error kind, and any model containing `unhealthy` reports a
//! failing health probe while still answering requests.

use crate::config::{GenerationParams, ProviderConfig};
use crate::error::ProviderError;
use crate::providers::{Provider, ProviderInfo, ProviderKind, TextStream};
use async_stream::stream;
use std::time::Duration;

const DEFAULT_MODEL: &str = "mock-normal";
const RESPONSE_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MockMode {
    Normal,
    Timeout,
    RateLimit,
    AuthError,
    InvalidRequest,
}

impl MockMode {
    fn from_model(model: &str) -> Self {
        if model.contains("timeout") {
            MockMode::Timeout
        } else if model.contains("ratelimit") || model.contains("rate-limit") {
            MockMode::RateLimit
        } else if model.contains("auth-error") {
            MockMode::AuthError
        } else if model.contains("invalid-request") {
            MockMode::InvalidRequest
        } else {
            MockMode::Normal
        }
    }

    fn failure(&self) -> Option<ProviderError> {
        match self {
            MockMode::Normal => None,
            MockMode::Timeout => Some(ProviderError::Timeout(
                "simulated timeout".to_string(),
            )),
            MockMode::RateLimit => Some(ProviderError::RateLimit(
                "simulated rate limit".to_string(),
            )),
            MockMode::AuthError => Some(ProviderError::Authentication(
                "simulated authentication failure".to_string(),
            )),
            MockMode::InvalidRequest => Some(ProviderError::InvalidRequest(
                "simulated invalid request".to_string(),
            )),
        }
    }
}

pub struct MockProvider {
    name: String,
    model: String,
    mode: MockMode,
    healthy: bool,
}

impl MockProvider {
    pub fn new(config: ProviderConfig) -> Self {
        let model = config.model.unwrap_or_else(|| DEFAULT_MODEL.to_string());
        Self {
            name: config.name,
            mode: MockMode::from_model(&model),
            healthy: !model.contains("unhealthy"),
            model,
        }
    }

    fn response_for(&self, prompt: &str, params: &GenerationParams) -> String {
        let reply = format!("Mock response to: {prompt}");
        let cap = params.max_tokens as usize;
        if reply.chars().count() > cap {
            reply.chars().take(cap).collect()
        } else {
            reply
        }
    }
}

#[async_trait::async_trait]
impl Provider for MockProvider {
    fn describe(&self) -> ProviderInfo {
        ProviderInfo {
            name: self.name.clone(),
            model: self.model.clone(),
            kind: ProviderKind::Mock,
        }
    }

    async fn generate(
        &self,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<String, ProviderError> {
        if let Some(error) = self.mode.failure() {
            return Err(error);
        }
        tokio::time::sleep(RESPONSE_DELAY).await;
        Ok(self.response_for(prompt, params))
    }

    async fn generate_stream(
        &self,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<TextStream, ProviderError> {
        if let Some(error) = self.mode.failure() {
            return Err(error);
        }
        tokio::time::sleep(RESPONSE_DELAY).await;
        let response = self.response_for(prompt, params);
        Ok(Box::pin(stream! {
            let mut first = true;
            for word in response.split_whitespace() {
                let chunk = if first {
                    word.to_string()
                } else {
                    format!(" {word}")
                };
                first = false;
                yield Ok(chunk);
            }
        }))
    }

    async fn health_check(&self) -> bool {
        self.healthy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn provider(model: &str) -> MockProvider {
        MockProvider::new(ProviderConfig::new("mock-test").with_model(model))
    }

    #[tokio::test]
    async fn normal_mode_echoes_the_prompt() {
        let p = provider("mock-normal");
        let text = p
            .generate("Q1", &GenerationParams::default())
            .await
            .unwrap();
        assert_eq!(text, "Mock response to: Q1");
        assert!(p.health_check().await);
    }

    #[tokio::test]
    async fn default_model_is_normal() {
        let p = MockProvider::new(ProviderConfig::new("m"));
        assert_eq!(p.describe().model, "mock-normal");
        assert!(p.generate("hi", &GenerationParams::default()).await.is_ok());
    }

    #[tokio::test]
    async fn response_is_truncated_to_max_tokens_chars() {
        let p = provider("mock-normal");
        let params = GenerationParams {
            max_tokens: 10,
            ..Default::default()
        };
        let text = p.generate("a long prompt", &params).await.unwrap();
        assert_eq!(text, "Mock respo");
    }

    #[tokio::test]
    async fn failure_modes_map_to_error_kinds() {
        let cases = [
            ("mock-timeout", "timeout"),
            ("mock-ratelimit", "rate_limit"),
            ("mock-auth-error", "authentication"),
            ("mock-invalid-request", "invalid_request"),
        ];
        for (model, kind) in cases {
            let err = provider(model)
                .generate("hi", &GenerationParams::default())
                .await
                .unwrap_err();
            assert_eq!(err.kind().as_str(), kind, "model {model}");
        }
    }

    #[tokio::test]
    async fn unhealthy_fragment_fails_the_probe_only() {
        let p = provider("mock-unhealthy");
        assert!(!p.health_check().await);
        // Still answers generate calls.
        assert!(p.generate("hi", &GenerationParams::default()).await.is_ok());
    }

    #[tokio::test]
    async fn stream_yields_word_by_word() {
        let p = provider("mock-normal");
        let stream = p
            .generate_stream("hello there", &GenerationParams::default())
            .await
            .unwrap();
        let chunks: Vec<String> = stream.map(|c| c.unwrap()).collect().await;
        assert_eq!(chunks, vec!["Mock", " response", " to:", " hello", " there"]);
        assert_eq!(chunks.concat(), "Mock response to: hello there");
    }

    #[tokio::test]
    async fn stream_failure_is_preflight() {
        let p = provider("mock-timeout");
        let err = match p.generate_stream("hi", &GenerationParams::default()).await {
            Err(e) => e,
            Ok(_) => panic!("expected generate_stream to fail"),
        };
        assert!(matches!(err, ProviderError::Timeout(_)));
    }
}

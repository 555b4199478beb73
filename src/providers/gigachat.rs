//! GigaChat backend: chat completions behind an OAuth2 key-for-token
//! exchange.
//!
//! The long-lived authorization key is traded for a short-lived access token
//! (about 30 minutes). The token is cached with its expiry; a token within
//! 60 seconds of expiring is treated as expired. The cache sits behind an
//! async mutex held across the refresh await, so concurrent callers that
//! observe a missing or stale token coalesce onto a single in-flight
//! refresh instead of launching their own.
//!
//! On HTTP 401 the cached token is invalidated and refreshed exactly once,
//! and the request is re-issued with fresh credentials and a new correlation
//! id; a second 401 within one logical call is reported as an
//! authentication failure.

use crate::config::{GenerationParams, ProviderConfig};
use crate::error::ProviderError;
use crate::providers::http_client::{check_status, AuthStrategy, HttpClient};
use crate::providers::retry::RetryPolicy;
use crate::providers::{Provider, ProviderInfo, ProviderKind, TextStream};
use async_stream::stream;
use futures::StreamExt;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

const DEFAULT_CHAT_BASE: &str = "https://gigachat.devices.sberbank.ru/api/v1";
const DEFAULT_OAUTH_URL: &str = "https://ngw.devices.sberbank.ru:9443/api/v2/oauth";
const DEFAULT_SCOPE: &str = "GIGACHAT_API_PERS";
const DEFAULT_MODEL: &str = "GigaChat";

/// A token this close to expiry is treated as already expired.
const EXPIRY_SLACK: Duration = Duration::from_secs(60);
/// Assumed lifetime when the token response omits `expires_at`.
const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(30 * 60);
const HEALTH_DEADLINE: Duration = Duration::from_secs(5);

struct CachedToken {
    token: String,
    expires_at: Instant,
}

impl CachedToken {
    fn is_usable(&self) -> bool {
        self.expires_at > Instant::now() + EXPIRY_SLACK
    }
}

pub struct GigaChatProvider {
    name: String,
    model: String,
    scope: String,
    chat_url: String,
    oauth_url: String,
    http: HttpClient,
    auth_key: String,
    retry: RetryPolicy,
    token: Mutex<Option<CachedToken>>,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<&'a [String]>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: String,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    /// Unix timestamp in milliseconds.
    expires_at: Option<i64>,
}

#[derive(Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(Deserialize)]
struct StreamChunk {
    choices: Vec<StreamChoice>,
}

impl GigaChatProvider {
    pub fn new(config: ProviderConfig) -> Result<Self, crate::error::RouterError> {
        config.validate()?;
        let auth_key = config.api_key.clone().ok_or_else(|| {
            crate::error::RouterError::Configuration {
                message: format!(
                    "provider {:?} requires an authorization key (api_key)",
                    config.name
                ),
            }
        })?;

        // A base_url override rebases both endpoints so one fake backend can
        // serve the whole exchange; production defaults keep the two hosts.
        let (chat_url, oauth_url) = match config.base_url.as_deref() {
            Some(base) => {
                let base = base.trim_end_matches('/');
                (format!("{base}/chat/completions"), format!("{base}/oauth"))
            }
            None => (
                format!("{DEFAULT_CHAT_BASE}/chat/completions"),
                DEFAULT_OAUTH_URL.to_string(),
            ),
        };

        let http = HttpClient::new(
            config.timeout,
            config.verify_tls,
            None,
            DEFAULT_CHAT_BASE,
            AuthStrategy::None,
        )
        .map_err(|e| crate::error::RouterError::Configuration {
            message: e.to_string(),
        })?;

        Ok(Self {
            name: config.name,
            model: config.model.unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            scope: config.scope.unwrap_or_else(|| DEFAULT_SCOPE.to_string()),
            chat_url,
            oauth_url,
            http,
            auth_key,
            retry: RetryPolicy::new(config.max_retries),
            token: Mutex::new(None),
        })
    }

    /// Exchange the authorization key for a fresh access token.
    async fn request_token(&self) -> Result<CachedToken, ProviderError> {
        let request = self
            .http
            .request_url(Method::POST, &self.oauth_url)
            .header("Authorization", format!("Basic {}", self.auth_key))
            .header("RqUID", uuid::Uuid::new_v4().to_string())
            .header("Accept", "application/json")
            .form(&[("scope", self.scope.as_str())]);

        let response = self.http.send(request).await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            return Err(ProviderError::Authentication(
                "authorization key was rejected by the OAuth endpoint".to_string(),
            ));
        }
        let response = check_status(response).await?;
        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Provider(format!("malformed token response: {e}")))?;

        let expires_at = match body.expires_at {
            Some(ms) => {
                let now_ms = chrono::Utc::now().timestamp_millis();
                let remaining = (ms - now_ms).max(0) as u64;
                Instant::now() + Duration::from_millis(remaining)
            }
            None => Instant::now() + DEFAULT_TOKEN_TTL,
        };

        tracing::debug!(provider = %self.name, "acquired fresh access token");
        Ok(CachedToken {
            token: body.access_token,
            expires_at,
        })
    }

    /// A usable access token, refreshing through the single-flight lock when
    /// the cache is empty or stale.
    async fn access_token(&self) -> Result<String, ProviderError> {
        let mut guard = self.token.lock().await;
        if let Some(cached) = guard.as_ref() {
            if cached.is_usable() {
                return Ok(cached.token.clone());
            }
        }
        let fresh = self.request_token().await?;
        let token = fresh.token.clone();
        *guard = Some(fresh);
        Ok(token)
    }

    /// Replace a token the backend just rejected.
    ///
    /// If another caller already refreshed while we waited on the lock, the
    /// newer token is reused instead of refreshing again.
    async fn refresh_after_unauthorized(&self, stale: &str) -> Result<String, ProviderError> {
        let mut guard = self.token.lock().await;
        if let Some(cached) = guard.as_ref() {
            if cached.token != stale && cached.is_usable() {
                return Ok(cached.token.clone());
            }
        }
        *guard = None;
        let fresh = self.request_token().await?;
        let token = fresh.token.clone();
        *guard = Some(fresh);
        Ok(token)
    }

    fn chat_request(
        &self,
        token: &str,
        prompt: &str,
        params: &GenerationParams,
        streaming: bool,
    ) -> RequestBuilder {
        let body = ChatRequest {
            model: &self.model,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
            max_tokens: Some(params.max_tokens),
            temperature: Some(params.temperature),
            top_p: Some(params.top_p),
            stop: params.stop.as_deref(),
            stream: streaming,
        };
        self.http
            .request_url(Method::POST, &self.chat_url)
            .bearer_auth(token)
            .header("X-Request-ID", uuid::Uuid::new_v4().to_string())
            .json(&body)
    }

    /// Issue the chat request, re-authenticating once on 401.
    async fn send_authorized(
        &self,
        prompt: &str,
        params: &GenerationParams,
        streaming: bool,
    ) -> Result<Response, ProviderError> {
        let token = self.access_token().await?;
        let response = self
            .http
            .send(self.chat_request(&token, prompt, params, streaming))
            .await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return check_status(response).await;
        }

        tracing::debug!(provider = %self.name, "access token rejected, refreshing once");
        let fresh = self.refresh_after_unauthorized(&token).await?;
        let response = self
            .http
            .send(self.chat_request(&fresh, prompt, params, streaming))
            .await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            return Err(ProviderError::Authentication(
                "request rejected twice with 401 after token refresh".to_string(),
            ));
        }
        check_status(response).await
    }

    async fn generate_once(
        &self,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<String, ProviderError> {
        let response = self.send_authorized(prompt, params, false).await?;
        let body: ChatResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Provider(format!("malformed chat response: {e}")))?;
        body.choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| ProviderError::Provider("response contained no choices".to_string()))
    }
}

#[async_trait::async_trait]
impl Provider for GigaChatProvider {
    fn describe(&self) -> ProviderInfo {
        ProviderInfo {
            name: self.name.clone(),
            model: self.model.clone(),
            kind: ProviderKind::GigaChat,
        }
    }

    async fn generate(
        &self,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<String, ProviderError> {
        self.retry
            .run(|| self.generate_once(prompt, params))
            .await
    }

    async fn generate_stream(
        &self,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<TextStream, ProviderError> {
        let response = self
            .retry
            .run(|| self.send_authorized(prompt, params, true))
            .await?;

        Ok(Box::pin(stream! {
            let mut bytes = response.bytes_stream();
            let mut buffer = String::new();
            'outer: while let Some(part) = bytes.next().await {
                let part = match part {
                    Ok(part) => part,
                    Err(e) => {
                        yield Err(ProviderError::from(e));
                        return;
                    }
                };
                buffer.push_str(&String::from_utf8_lossy(&part));
                while let Some(line_end) = buffer.find('\n') {
                    let line = buffer[..line_end].trim().to_string();
                    buffer.drain(..=line_end);
                    let Some(payload) = line.strip_prefix("data: ") else {
                        continue;
                    };
                    if payload == "[DONE]" {
                        break 'outer;
                    }
                    match serde_json::from_str::<StreamChunk>(payload) {
                        Ok(chunk) => {
                            for choice in chunk.choices {
                                if let Some(content) = choice.delta.content {
                                    if !content.is_empty() {
                                        yield Ok(content);
                                    }
                                }
                            }
                        }
                        Err(e) => {
                            yield Err(ProviderError::Provider(format!(
                                "malformed stream chunk: {e}"
                            )));
                            return;
                        }
                    }
                }
            }
        }))
    }

    async fn health_check(&self) -> bool {
        match tokio::time::timeout(HEALTH_DEADLINE, self.access_token()).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                tracing::warn!(provider = %self.name, error = %e, "health check failed");
                false
            }
            Err(_) => {
                tracing::warn!(provider = %self.name, "health check timed out");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ProviderConfig {
        ProviderConfig::new("sber")
            .with_api_key("Zm9vOmJhcg==")
            .with_base_url("http://localhost:9999")
    }

    #[test]
    fn base_url_override_rebases_both_endpoints() {
        let provider = GigaChatProvider::new(config()).unwrap();
        assert_eq!(provider.chat_url, "http://localhost:9999/chat/completions");
        assert_eq!(provider.oauth_url, "http://localhost:9999/oauth");
    }

    #[test]
    fn production_defaults() {
        let provider = GigaChatProvider::new(
            ProviderConfig::new("sber").with_api_key("Zm9vOmJhcg=="),
        )
        .unwrap();
        assert_eq!(
            provider.chat_url,
            "https://gigachat.devices.sberbank.ru/api/v1/chat/completions"
        );
        assert_eq!(provider.oauth_url, DEFAULT_OAUTH_URL);
        assert_eq!(provider.scope, DEFAULT_SCOPE);
        assert_eq!(provider.model, DEFAULT_MODEL);
    }

    #[test]
    fn missing_key_is_rejected_at_construction() {
        assert!(GigaChatProvider::new(ProviderConfig::new("sber")).is_err());
    }

    #[test]
    fn token_expiry_slack() {
        let fresh = CachedToken {
            token: "t".into(),
            expires_at: Instant::now() + Duration::from_secs(120),
        };
        assert!(fresh.is_usable());
        let stale = CachedToken {
            token: "t".into(),
            expires_at: Instant::now() + Duration::from_secs(30),
        };
        assert!(!stale.is_usable());
    }

    #[test]
    fn chat_body_includes_set_params_only() {
        let provider = GigaChatProvider::new(config()).unwrap();
        let params = GenerationParams::default();
        let body = ChatRequest {
            model: &provider.model,
            messages: vec![ChatMessage {
                role: "user",
                content: "hi",
            }],
            max_tokens: Some(params.max_tokens),
            temperature: Some(params.temperature),
            top_p: Some(params.top_p),
            stop: params.stop.as_deref(),
            stream: false,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["model"], "GigaChat");
        assert_eq!(json["messages"][0]["role"], "user");
        assert!(json.get("stop").is_none());
        assert!(json.get("stream").is_none());
    }
}

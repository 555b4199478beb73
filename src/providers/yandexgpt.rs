//! YandexGPT backend: API-key authenticated completions with folder-scoped
//! model URIs (`gpt://<folder>/<model>/latest`).

use crate::config::{GenerationParams, ProviderConfig};
use crate::error::{ProviderError, RouterError};
use crate::providers::http_client::{AuthStrategy, HttpClient};
use crate::providers::retry::RetryPolicy;
use crate::providers::{Provider, ProviderInfo, ProviderKind};
use reqwest::header::{HeaderName, HeaderValue};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const DEFAULT_BASE: &str = "https://llm.api.cloud.yandex.net/foundationModels/v1";
const DEFAULT_MODEL: &str = "yandexgpt-lite";
const HEALTH_DEADLINE: Duration = Duration::from_secs(5);

pub struct YandexGptProvider {
    name: String,
    model: String,
    model_uri: String,
    http: HttpClient,
    retry: RetryPolicy,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CompletionRequest<'a> {
    model_uri: &'a str,
    completion_options: CompletionOptions,
    messages: Vec<Message<'a>>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CompletionOptions {
    stream: bool,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Serialize)]
struct Message<'a> {
    role: &'a str,
    text: &'a str,
}

#[derive(Deserialize)]
struct CompletionResponse {
    result: CompletionResult,
}

#[derive(Deserialize)]
struct CompletionResult {
    alternatives: Vec<Alternative>,
}

#[derive(Deserialize)]
struct Alternative {
    message: AlternativeMessage,
}

#[derive(Deserialize)]
struct AlternativeMessage {
    text: String,
}

impl YandexGptProvider {
    pub fn new(config: ProviderConfig) -> Result<Self, RouterError> {
        config.validate()?;
        let api_key = config
            .api_key
            .clone()
            .ok_or_else(|| RouterError::Configuration {
                message: format!("provider {:?} requires an api_key", config.name),
            })?;
        let folder_id = config
            .tenant_id
            .clone()
            .ok_or_else(|| RouterError::Configuration {
                message: format!(
                    "provider {:?} requires a tenant_id (cloud folder id)",
                    config.name
                ),
            })?;

        let model = config.model.unwrap_or_else(|| DEFAULT_MODEL.to_string());
        let model_uri = format!("gpt://{folder_id}/{model}/latest");

        let folder_header = HeaderValue::from_str(&folder_id).map_err(|_| {
            RouterError::Configuration {
                message: "tenant_id contains invalid header bytes".to_string(),
            }
        })?;
        let http = HttpClient::new(
            config.timeout,
            config.verify_tls,
            config.base_url.as_deref(),
            DEFAULT_BASE,
            AuthStrategy::ApiKey(api_key),
        )
        .map_err(|e| RouterError::Configuration {
            message: e.to_string(),
        })?
        .with_header(HeaderName::from_static("x-folder-id"), folder_header);

        Ok(Self {
            name: config.name,
            model,
            model_uri,
            http,
            retry: RetryPolicy::new(config.max_retries),
        })
    }

    async fn complete(&self, prompt: &str, params: &GenerationParams) -> Result<String, ProviderError> {
        let body = CompletionRequest {
            model_uri: &self.model_uri,
            completion_options: CompletionOptions {
                stream: false,
                temperature: params.temperature,
                max_tokens: params.max_tokens,
            },
            messages: vec![Message {
                role: "user",
                text: prompt,
            }],
        };
        let request = self.http.request(Method::POST, "/completion").json(&body);
        let response: CompletionResponse = self.http.send_json(request).await?;
        response
            .result
            .alternatives
            .into_iter()
            .next()
            .map(|a| a.message.text)
            .ok_or_else(|| {
                ProviderError::Provider("response contained no alternatives".to_string())
            })
    }
}

#[async_trait::async_trait]
impl Provider for YandexGptProvider {
    fn describe(&self) -> ProviderInfo {
        ProviderInfo {
            name: self.name.clone(),
            model: self.model.clone(),
            kind: ProviderKind::YandexGpt,
        }
    }

    async fn generate(
        &self,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<String, ProviderError> {
        // top_p and stop are not mapped; the backend does not take them.
        self.retry.run(|| self.complete(prompt, params)).await
    }

    async fn health_check(&self) -> bool {
        let probe = GenerationParams {
            max_tokens: 1,
            ..Default::default()
        };
        match tokio::time::timeout(HEALTH_DEADLINE, self.complete("ping", &probe)).await {
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

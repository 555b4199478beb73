//! Local inference via an Ollama server on the loopback interface.
//!
//! Stateless HTTP client, no credentials. `max_tokens` maps onto the
//! backend's `num_predict`; `stop` is ignored. Streaming uses the backend's
//! native newline-delimited JSON.

use crate::config::{GenerationParams, ProviderConfig};
use crate::error::{ProviderError, RouterError};
use crate::providers::http_client::{check_status, AuthStrategy, HttpClient};
use crate::providers::retry::RetryPolicy;
use crate::providers::{Provider, ProviderInfo, ProviderKind, TextStream};
use async_stream::stream;
use futures::StreamExt;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const DEFAULT_BASE: &str = "http://localhost:11434";
const DEFAULT_MODEL: &str = "llama3";
const HEALTH_DEADLINE: Duration = Duration::from_secs(5);

pub struct OllamaProvider {
    name: String,
    model: String,
    http: HttpClient,
    retry: RetryPolicy,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    stream: bool,
    options: ChatOptions,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatOptions {
    temperature: f32,
    num_predict: u32,
    top_p: f32,
}

#[derive(Deserialize)]
struct ChatResponse {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    content: String,
}

#[derive(Deserialize)]
struct StreamLine {
    #[serde(default)]
    message: Option<ResponseMessage>,
    #[serde(default)]
    done: bool,
}

impl OllamaProvider {
    pub fn new(config: ProviderConfig) -> Result<Self, RouterError> {
        config.validate()?;
        let http = HttpClient::new(
            config.timeout,
            config.verify_tls,
            config.base_url.as_deref(),
            DEFAULT_BASE,
            AuthStrategy::None,
        )
        .map_err(|e| RouterError::Configuration {
            message: e.to_string(),
        })?;

        Ok(Self {
            name: config.name,
            model: config.model.unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            http,
            retry: RetryPolicy::new(config.max_retries),
        })
    }

    fn chat_body<'a>(&'a self, prompt: &'a str, params: &GenerationParams, stream: bool) -> ChatRequest<'a> {
        ChatRequest {
            model: &self.model,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
            stream,
            options: ChatOptions {
                temperature: params.temperature,
                num_predict: params.max_tokens,
                top_p: params.top_p,
            },
        }
    }

    async fn chat_once(
        &self,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<String, ProviderError> {
        let body = self.chat_body(prompt, params, false);
        let request = self.http.request(Method::POST, "/api/chat").json(&body);
        let response: ChatResponse = self.http.send_json(request).await?;
        Ok(response.message.content)
    }

    async fn open_stream(
        &self,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<reqwest::Response, ProviderError> {
        let body = self.chat_body(prompt, params, true);
        let request = self.http.request(Method::POST, "/api/chat").json(&body);
        let response = self.http.send(request).await?;
        check_status(response).await
    }
}

#[async_trait::async_trait]
impl Provider for OllamaProvider {
    fn describe(&self) -> ProviderInfo {
        ProviderInfo {
            name: self.name.clone(),
            model: self.model.clone(),
            kind: ProviderKind::Ollama,
        }
    }

    async fn generate(
        &self,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<String, ProviderError> {
        self.retry.run(|| self.chat_once(prompt, params)).await
    }

    async fn generate_stream(
        &self,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<TextStream, ProviderError> {
        let response = self.retry.run(|| self.open_stream(prompt, params)).await?;

        Ok(Box::pin(stream! {
            let mut bytes = response.bytes_stream();
            let mut buffer = String::new();
            while let Some(part) = bytes.next().await {
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
                    if line.is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<StreamLine>(&line) {
                        Ok(parsed) => {
                            if let Some(message) = parsed.message {
                                if !message.content.is_empty() {
                                    yield Ok(message.content);
                                }
                            }
                            if parsed.done {
                                return;
                            }
                        }
                        Err(e) => {
                            yield Err(ProviderError::Provider(format!(
                                "malformed stream line: {e}"
                            )));
                            return;
                        }
                    }
                }
            }
        }))
    }

    async fn health_check(&self) -> bool {
        let probe = async {
            let request = self.http.request(Method::GET, "/api/tags");
            let response = self.http.send(request).await?;
            check_status(response).await
        };
        match tokio::time::timeout(HEALTH_DEADLINE, probe).await {
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

    #[test]
    fn defaults() {
        let provider = OllamaProvider::new(ProviderConfig::new("local")).unwrap();
        let info = provider.describe();
        assert_eq!(info.model, DEFAULT_MODEL);
        assert_eq!(info.kind, ProviderKind::Ollama);
        assert_eq!(provider.http.base_url(), DEFAULT_BASE);
    }

    #[test]
    fn max_tokens_maps_to_num_predict() {
        let provider = OllamaProvider::new(
            ProviderConfig::new("local").with_model("qwen3:8b"),
        )
        .unwrap();
        let params = GenerationParams {
            max_tokens: 64,
            temperature: 0.2,
            ..Default::default()
        };
        let body = provider.chat_body("hi", &params, false);
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["model"], "qwen3:8b");
        assert_eq!(json["options"]["num_predict"], 64);
        assert_eq!(json["stream"], false);
    }
}

use crate::error::ProviderError;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use std::time::Duration;

/// How a provider authenticates its requests.
#[derive(Clone, Debug)]
pub enum AuthStrategy {
    /// `Authorization: Bearer <token>` with a per-request token.
    Bearer(String),
    /// `Authorization: Basic <credentials>` with pre-encoded credentials.
    Basic(String),
    /// `Authorization: Api-Key <key>`.
    ApiKey(String),
    None,
}

/// Thin reqwest wrapper shared by the HTTP providers: one client per
/// provider carrying the config timeout and TLS toggle, a base URL with a
/// built-in default, and default auth headers.
#[derive(Clone)]
pub struct HttpClient {
    http: Client,
    base_url: String,
    default_headers: HeaderMap,
}

impl HttpClient {
    pub fn new(
        timeout: Duration,
        verify_tls: bool,
        base_url: Option<&str>,
        default_base: &str,
        auth: AuthStrategy,
    ) -> Result<Self, ProviderError> {
        let http = Client::builder()
            .timeout(timeout)
            .danger_accept_invalid_certs(!verify_tls)
            .build()
            .map_err(|e| ProviderError::Provider(format!("failed to build HTTP client: {e}")))?;

        let mut default_headers = HeaderMap::new();
        let auth_value = match auth {
            AuthStrategy::Bearer(token) => Some(format!("Bearer {token}")),
            AuthStrategy::Basic(credentials) => Some(format!("Basic {credentials}")),
            AuthStrategy::ApiKey(key) => Some(format!("Api-Key {key}")),
            AuthStrategy::None => None,
        };
        if let Some(value) = auth_value {
            let value = HeaderValue::from_str(&value).map_err(|_| {
                ProviderError::Authentication("credential contains invalid header bytes".into())
            })?;
            default_headers.insert(reqwest::header::AUTHORIZATION, value);
        }

        let base_url = base_url
            .unwrap_or(default_base)
            .trim_end_matches('/')
            .to_string();

        Ok(Self {
            http,
            base_url,
            default_headers,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Add a default header sent with every request.
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.default_headers.insert(name, value);
        self
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }

    pub fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.http
            .request(method, self.url(path))
            .headers(self.default_headers.clone())
    }

    /// Like [`HttpClient::request`] but with an absolute URL, for endpoints
    /// outside the base (e.g. a separate OAuth host).
    pub fn request_url(&self, method: Method, url: &str) -> RequestBuilder {
        self.http
            .request(method, url)
            .headers(self.default_headers.clone())
    }

    /// Send, mapping transport errors onto the taxonomy; status is not
    /// inspected so callers can handle it themselves.
    pub async fn send(&self, builder: RequestBuilder) -> Result<Response, ProviderError> {
        Ok(builder.send().await?)
    }

    /// Send and decode a JSON body, mapping non-success statuses onto the
    /// taxonomy.
    pub async fn send_json<T: DeserializeOwned>(
        &self,
        builder: RequestBuilder,
    ) -> Result<T, ProviderError> {
        let response = self.send(builder).await?;
        let response = check_status(response).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| ProviderError::Provider(format!("failed to decode response: {e}")))
    }
}

/// Map a non-success status onto the error taxonomy, pulling a message out
/// of common JSON error shapes when possible.
pub async fn check_status(response: Response) -> Result<Response, ProviderError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let message = error_message(&body, status.as_u16());

    Err(match status.as_u16() {
        401 | 403 => ProviderError::Authentication(message),
        400 | 404 | 422 => ProviderError::InvalidRequest(message),
        429 => ProviderError::RateLimit(message),
        _ => ProviderError::Provider(message),
    })
}

fn error_message(body: &str, code: u16) -> String {
    let detail = serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| {
            v.get("error")
                .and_then(|e| {
                    e.get("message")
                        .and_then(|m| m.as_str())
                        .or_else(|| e.as_str())
                })
                .or_else(|| v.get("message").and_then(|m| m.as_str()))
                .map(|s| s.to_string())
        })
        .unwrap_or_else(|| body.trim().to_string());

    if detail.is_empty() {
        format!("HTTP {code}")
    } else {
        format!("HTTP {code}: {detail}")
    }
}

//! Provider clients and the classifier factory.
//!
//! Each client owns its credential, request shape and response
//! normalization. Shared HTTP plumbing (status mapping, body decoding) lives
//! in this module so that every provider classifies failures the same way:
//!
//! | condition | error |
//! |---|---|
//! | connect / timeout / body read failure | [`ClassifyError::Transient`] |
//! | HTTP 408, 429, 5xx | [`ClassifyError::Transient`] |
//! | HTTP 401, 403, invalid key | [`ClassifyError::ProviderAuth`] |
//! | other 4xx, undecodable body | [`ClassifyError::MalformedResponse`] |

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::{ClassifyError, Classifier, Provider, RawResponse, Usage};
use crate::config::ConfigError;

const OPENAI_BASE_URL: &str = "https://api.openai.com";
const CLAUDE_BASE_URL: &str = "https://api.anthropic.com";
const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const MAX_OUTPUT_TOKENS: u32 = 400;

/// Optional per-provider overrides from configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderOverrides {
    /// Model identifier.
    pub model: Option<String>,
    /// Maximum in-flight requests.
    pub concurrency: Option<usize>,
    /// Requests per minute ceiling.
    pub requests_per_minute: Option<u32>,
    /// API base URL (proxies, gateways).
    pub base_url: Option<String>,
}

/// Fully resolved settings for one provider.
#[derive(Clone, PartialEq)]
pub struct ProviderSettings {
    /// Which provider.
    pub provider: Provider,
    /// Model identifier sent with every request.
    pub model: String,
    /// Credential read from the environment.
    pub api_key: String,
    /// API base URL without trailing slash.
    pub base_url: String,
    /// Default maximum in-flight requests.
    pub concurrency: usize,
    /// Default requests per minute.
    pub requests_per_minute: u32,
}

impl std::fmt::Debug for ProviderSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderSettings")
            .field("provider", &self.provider)
            .field("model", &self.model)
            .field("api_key", &"<redacted>")
            .field("base_url", &self.base_url)
            .field("concurrency", &self.concurrency)
            .field("requests_per_minute", &self.requests_per_minute)
            .finish()
    }
}

impl ProviderSettings {
    /// Resolve settings from built-in defaults, overrides and a key lookup.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingApiKey`] when the provider's key
    /// variable is unset or empty.
    pub fn resolve<F>(
        provider: Provider,
        overrides: &ProviderOverrides,
        lookup_key: F,
    ) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = provider.api_key_env();
        let api_key = lookup_key(var)
            .filter(|k| !k.trim().is_empty())
            .ok_or(ConfigError::MissingApiKey { provider, var })?;

        let (model, concurrency, rpm, base_url) = match provider {
            Provider::Openai => ("gpt-4.1-nano", 10, 60, OPENAI_BASE_URL),
            Provider::Claude => ("claude-3-haiku-20240307", 5, 50, CLAUDE_BASE_URL),
            Provider::Gemini => ("gemini-1.5-flash", 10, 60, GEMINI_BASE_URL),
        };

        Ok(Self {
            provider,
            model: overrides.model.clone().unwrap_or_else(|| model.to_string()),
            api_key: api_key.trim().to_string(),
            base_url: overrides
                .base_url
                .clone()
                .unwrap_or_else(|| base_url.to_string())
                .trim_end_matches('/')
                .to_string(),
            concurrency: overrides.concurrency.unwrap_or(concurrency).max(1),
            requests_per_minute: overrides.requests_per_minute.unwrap_or(rpm),
        })
    }
}

/// Build a classifier for `provider`, reading its key from the environment.
///
/// Returns the client together with its resolved settings so callers can use
/// the provider's default concurrency and rate.
///
/// # Errors
///
/// Returns [`ConfigError::MissingApiKey`] if the key is absent, or
/// [`ConfigError::HttpClient`] if the HTTP client cannot be built.
pub fn build_classifier(
    provider: Provider,
    overrides: &ProviderOverrides,
) -> Result<(Arc<dyn Classifier>, ProviderSettings), ConfigError> {
    let settings = ProviderSettings::resolve(provider, overrides, |var| std::env::var(var).ok())?;
    let http = http_client()?;

    log::debug!(
        "Built {} classifier (model {}, concurrency {}, {} rpm)",
        provider,
        settings.model,
        settings.concurrency,
        settings.requests_per_minute
    );

    let client: Arc<dyn Classifier> = match provider {
        Provider::Openai => Arc::new(OpenAiClient::new(http, settings.clone())),
        Provider::Claude => Arc::new(ClaudeClient::new(http, settings.clone())),
        Provider::Gemini => Arc::new(GeminiClient::new(http, settings.clone())),
    };
    Ok((client, settings))
}

fn http_client() -> Result<Client, ConfigError> {
    Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .pool_max_idle_per_host(32)
        .pool_idle_timeout(Duration::from_secs(90))
        .tcp_keepalive(Duration::from_secs(60))
        .build()
        .map_err(|e| ConfigError::HttpClient(e.to_string()))
}

/// Send a request and decode the JSON body, mapping failures to the taxonomy.
async fn send_json<T: DeserializeOwned>(
    provider: Provider,
    request: RequestBuilder,
) -> Result<T, ClassifyError> {
    let response = request.send().await.map_err(|e| request_error(provider, &e))?;
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| ClassifyError::Transient(format!("{provider}: failed to read body: {e}")))?;

    if !status.is_success() {
        return Err(status_error(provider, status, &body));
    }

    serde_json::from_str(&body).map_err(|e| {
        ClassifyError::MalformedResponse(format!("{provider}: unexpected response body: {e}"))
    })
}

fn request_error(provider: Provider, err: &reqwest::Error) -> ClassifyError {
    if err.is_decode() {
        ClassifyError::MalformedResponse(format!("{provider}: {err}"))
    } else {
        ClassifyError::Transient(format!("{provider}: {err}"))
    }
}

/// Map a non-success HTTP status to a classification error.
pub(crate) fn status_error(provider: Provider, status: StatusCode, body: &str) -> ClassifyError {
    let snippet: String = body.chars().take(200).collect();
    let message = format!("{provider} HTTP {}: {}", status.as_u16(), snippet.trim());

    match status.as_u16() {
        401 | 403 => ClassifyError::ProviderAuth(message),
        // Gemini reports a bad key as 400 INVALID_ARGUMENT
        400 if body.contains("API_KEY_INVALID") => ClassifyError::ProviderAuth(message),
        408 | 429 => ClassifyError::Transient(message),
        s if s >= 500 => ClassifyError::Transient(message),
        _ => ClassifyError::MalformedResponse(message),
    }
}

fn missing_text(provider: Provider) -> ClassifyError {
    ClassifyError::MalformedResponse(format!("{provider}: response contained no text"))
}

// ---------------------------------------------------------------------------
// OpenAI
// ---------------------------------------------------------------------------

/// OpenAI chat-completions client.
pub struct OpenAiClient {
    http: Client,
    settings: ProviderSettings,
}

#[derive(Deserialize)]
struct OpenAiResponse {
    #[serde(default)]
    choices: Vec<OpenAiChoice>,
    usage: Option<OpenAiUsage>,
}

#[derive(Deserialize)]
struct OpenAiChoice {
    message: OpenAiMessage,
}

#[derive(Deserialize)]
struct OpenAiMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct OpenAiUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    #[serde(default)]
    total_tokens: u64,
}

impl OpenAiClient {
    /// Create a client from resolved settings.
    #[must_use]
    pub fn new(http: Client, settings: ProviderSettings) -> Self {
        Self { http, settings }
    }

    fn normalize(response: OpenAiResponse) -> Result<RawResponse, ClassifyError> {
        let text = response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| missing_text(Provider::Openai))?;
        let usage = response.usage.map(|u| Usage {
            input_tokens: u.prompt_tokens,
            output_tokens: u.completion_tokens,
            total_tokens: u.total_tokens,
        });
        Ok(RawResponse { text, usage })
    }
}

#[async_trait]
impl Classifier for OpenAiClient {
    fn provider(&self) -> Provider {
        Provider::Openai
    }

    fn model(&self) -> &str {
        &self.settings.model
    }

    async fn classify(&self, image_base64: &str, prompt: &str) -> Result<RawResponse, ClassifyError> {
        let body = json!({
            "model": self.settings.model,
            "max_tokens": MAX_OUTPUT_TOKENS,
            "temperature": 0.1,
            "response_format": { "type": "json_object" },
            "messages": [{
                "role": "user",
                "content": [
                    { "type": "text", "text": prompt },
                    { "type": "image_url", "image_url": {
                        "url": format!("data:image/jpeg;base64,{image_base64}"),
                        "detail": "low"
                    }}
                ]
            }]
        });

        let request = self
            .http
            .post(format!("{}/v1/chat/completions", self.settings.base_url))
            .bearer_auth(&self.settings.api_key)
            .json(&body);

        Self::normalize(send_json(Provider::Openai, request).await?)
    }
}

// ---------------------------------------------------------------------------
// Claude
// ---------------------------------------------------------------------------

/// Anthropic messages client.
pub struct ClaudeClient {
    http: Client,
    settings: ProviderSettings,
}

#[derive(Deserialize)]
struct ClaudeResponse {
    #[serde(default)]
    content: Vec<ClaudeBlock>,
    usage: Option<ClaudeUsage>,
}

#[derive(Deserialize)]
struct ClaudeBlock {
    #[serde(rename = "type")]
    kind: String,
    text: Option<String>,
}

#[derive(Deserialize)]
struct ClaudeUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

impl ClaudeClient {
    /// Create a client from resolved settings.
    #[must_use]
    pub fn new(http: Client, settings: ProviderSettings) -> Self {
        Self { http, settings }
    }

    fn normalize(response: ClaudeResponse) -> Result<RawResponse, ClassifyError> {
        let text = response
            .content
            .into_iter()
            .find(|b| b.kind == "text")
            .and_then(|b| b.text)
            .ok_or_else(|| missing_text(Provider::Claude))?;
        let usage = response.usage.map(|u| Usage {
            input_tokens: u.input_tokens,
            output_tokens: u.output_tokens,
            total_tokens: u.input_tokens + u.output_tokens,
        });
        Ok(RawResponse { text, usage })
    }
}

#[async_trait]
impl Classifier for ClaudeClient {
    fn provider(&self) -> Provider {
        Provider::Claude
    }

    fn model(&self) -> &str {
        &self.settings.model
    }

    async fn classify(&self, image_base64: &str, prompt: &str) -> Result<RawResponse, ClassifyError> {
        let body = json!({
            "model": self.settings.model,
            "max_tokens": MAX_OUTPUT_TOKENS,
            "temperature": 0.1,
            "messages": [{
                "role": "user",
                "content": [
                    { "type": "text", "text": prompt },
                    { "type": "image", "source": {
                        "type": "base64",
                        "media_type": "image/jpeg",
                        "data": image_base64
                    }}
                ]
            }]
        });

        let request = self
            .http
            .post(format!("{}/v1/messages", self.settings.base_url))
            .header("x-api-key", &self.settings.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body);

        Self::normalize(send_json(Provider::Claude, request).await?)
    }
}

// ---------------------------------------------------------------------------
// Gemini
// ---------------------------------------------------------------------------

/// Google Gemini generateContent client.
pub struct GeminiClient {
    http: Client,
    settings: ProviderSettings,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
    usage_metadata: Option<GeminiUsage>,
}

#[derive(Deserialize)]
struct GeminiCandidate {
    content: Option<GeminiContent>,
}

#[derive(Deserialize)]
struct GeminiContent {
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Deserialize)]
struct GeminiPart {
    text: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiUsage {
    #[serde(default)]
    prompt_token_count: u64,
    #[serde(default)]
    candidates_token_count: u64,
    #[serde(default)]
    total_token_count: u64,
}

impl GeminiClient {
    /// Create a client from resolved settings.
    #[must_use]
    pub fn new(http: Client, settings: ProviderSettings) -> Self {
        Self { http, settings }
    }

    fn normalize(response: GeminiResponse) -> Result<RawResponse, ClassifyError> {
        let text: String = response
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content)
            .map(|c| c.parts.into_iter().filter_map(|p| p.text).collect())
            .filter(|t: &String| !t.is_empty())
            .ok_or_else(|| missing_text(Provider::Gemini))?;
        let usage = response.usage_metadata.map(|u| Usage {
            input_tokens: u.prompt_token_count,
            output_tokens: u.candidates_token_count,
            total_tokens: u.total_token_count,
        });
        Ok(RawResponse { text, usage })
    }
}

#[async_trait]
impl Classifier for GeminiClient {
    fn provider(&self) -> Provider {
        Provider::Gemini
    }

    fn model(&self) -> &str {
        &self.settings.model
    }

    async fn classify(&self, image_base64: &str, prompt: &str) -> Result<RawResponse, ClassifyError> {
        let body = json!({
            "contents": [{
                "parts": [
                    { "text": prompt },
                    { "inline_data": { "mime_type": "image/jpeg", "data": image_base64 } }
                ]
            }],
            "generationConfig": {
                "temperature": 0.1,
                "maxOutputTokens": MAX_OUTPUT_TOKENS,
                "responseMimeType": "application/json"
            }
        });

        let request = self
            .http
            .post(format!(
                "{}/v1beta/models/{}:generateContent",
                self.settings.base_url, self.settings.model
            ))
            .header("x-goog-api-key", &self.settings.api_key)
            .json(&body);

        Self::normalize(send_json(Provider::Gemini, request).await?)
    }
}

//! Concrete [`AiProvider`] adapters.
//!
//! OpenAI, Anthropic and Ollama speak their vendors' JSON APIs over
//! `reqwest`. [`MockProvider`] replays queued results and is what tests and
//! the `"default"` fallback strategy's last resort use.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use pa_core::config::ProvidersConfig;
use pa_harness::provider::{
    AiProvider, AiRequest, AiResponse, ProviderError, ProviderErrorKind, TokenUsage,
};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

const DEFAULT_MAX_TOKENS: u32 = 1024;

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

/// Map a non-success HTTP status to a structured [`ProviderError`].
pub fn map_status(
    provider: &str,
    status: StatusCode,
    body: &str,
    retry_after_secs: Option<u64>,
) -> ProviderError {
    let code = status.as_u16();
    let (kind, label) = match code {
        401 | 403 => (ProviderErrorKind::Unauthorized, "unauthorized"),
        429 => (ProviderErrorKind::RateLimited, "rate_limit"),
        500..=599 => (ProviderErrorKind::Server, "server_error"),
        _ => (ProviderErrorKind::InvalidRequest, "invalid_request"),
    };
    let mut message = format!("{label}: {provider} returned {code}");
    if let Some(secs) = retry_after_secs {
        message.push_str(&format!(" (retry after {secs}s)"));
    }
    let body = body.trim();
    if !body.is_empty() {
        message.push_str(": ");
        message.extend(body.chars().take(300));
    }
    ProviderError::new(kind, message)
}

/// Map a transport failure. Timeouts and connection errors are retryable.
pub fn map_transport(provider: &str, err: &reqwest::Error) -> ProviderError {
    if err.is_timeout() {
        ProviderError::timeout(format!("timeout: {provider} request timed out"))
    } else if err.is_connect() || err.is_request() {
        ProviderError::new(
            ProviderErrorKind::Network,
            format!("network error talking to {provider}: {err}"),
        )
    } else if err.is_decode() {
        ProviderError::other(format!("{provider} returned an unreadable body: {err}"))
            .with_retryable(false)
    } else {
        ProviderError::other(format!("{provider} request failed: {err}"))
    }
}

fn retry_after(resp: &reqwest::Response) -> Option<u64> {
    resp.headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
}

async fn send_json(
    provider: &str,
    builder: reqwest::RequestBuilder,
    body: &Value,
) -> Result<reqwest::Response, ProviderError> {
    let resp = builder
        .json(body)
        .send()
        .await
        .map_err(|e| map_transport(provider, &e))?;
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let wait = retry_after(&resp);
    let text = resp.text().await.unwrap_or_default();
    Err(map_status(provider, status, &text, wait))
}

fn missing_key(provider: &str) -> ProviderError {
    ProviderError::unauthorized(format!("unauthorized: no API key configured for {provider}"))
}

// ---------------------------------------------------------------------------
// OpenAiProvider
// ---------------------------------------------------------------------------

/// OpenAI Chat Completions.
pub struct OpenAiProvider {
    client: reqwest::Client,
    api_key: Option<String>,
    base_url: String,
    default_model: String,
}

impl OpenAiProvider {
    pub fn new(api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.filter(|k| !k.is_empty()),
            base_url: "https://api.openai.com".into(),
            default_model: "gpt-4o-mini".into(),
        }
    }

    pub fn from_config(config: &ProvidersConfig, api_key: Option<String>) -> Self {
        Self::new(api_key)
            .with_base_url(&config.openai_base_url)
            .with_default_model(&config.openai_model)
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = model.into();
        self
    }

    pub fn build_request_body(&self, request: &AiRequest) -> Value {
        let mut messages = Vec::new();
        if let Some(system) = &request.system_prompt {
            messages.push(json!({ "role": "system", "content": system }));
        }
        messages.push(json!({ "role": "user", "content": request.prompt }));

        let mut body = json!({
            "model": request.model.as_deref().unwrap_or(&self.default_model),
            "messages": messages,
        });
        if let Some(max) = request.max_tokens {
            body["max_tokens"] = json!(max);
        }
        if let Some(t) = request.temperature {
            body["temperature"] = json!(t);
        }
        body
    }
}

#[derive(Deserialize)]
struct OpenAiResponse {
    model: String,
    choices: Vec<OpenAiChoice>,
    usage: Option<OpenAiUsage>,
}

#[derive(Deserialize)]
struct OpenAiChoice {
    message: OpenAiMessage,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct OpenAiMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct OpenAiUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
}

#[async_trait]
impl AiProvider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
    }

    async fn generate(&self, request: &AiRequest) -> Result<AiResponse, ProviderError> {
        let key = request
            .api_key
            .as_ref()
            .map(|k| k.expose().to_string())
            .or_else(|| self.api_key.clone())
            .ok_or_else(|| missing_key("openai"))?;
        let body = self.build_request_body(request);
        let url = format!("{}/v1/chat/completions", self.base_url);
        debug!(%url, "openai request");

        let resp = send_json("openai", self.client.post(&url).bearer_auth(key), &body).await?;
        let parsed: OpenAiResponse = resp.json().await.map_err(|e| map_transport("openai", &e))?;

        let choice = parsed.choices.into_iter().next();
        let finish_reason = choice.as_ref().and_then(|c| c.finish_reason.clone());
        Ok(AiResponse {
            content: choice.and_then(|c| c.message.content).unwrap_or_default(),
            model: parsed.model,
            provider: "openai".into(),
            usage: parsed
                .usage
                .map(|u| TokenUsage::new(u.prompt_tokens, u.completion_tokens)),
            finish_reason,
        })
    }

    async fn is_available(&self) -> bool {
        self.api_key.is_some()
    }

    fn available_models(&self) -> Vec<String> {
        ["gpt-4", "gpt-4-turbo", "gpt-4o", "gpt-4o-mini", "gpt-3.5-turbo"]
            .into_iter()
            .map(String::from)
            .collect()
    }
}

// ---------------------------------------------------------------------------
// AnthropicProvider
// ---------------------------------------------------------------------------

/// Anthropic Messages API.
pub struct AnthropicProvider {
    client: reqwest::Client,
    api_key: Option<String>,
    base_url: String,
    default_model: String,
}

impl AnthropicProvider {
    pub fn new(api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.filter(|k| !k.is_empty()),
            base_url: "https://api.anthropic.com".into(),
            default_model: "claude-3-5-sonnet".into(),
        }
    }

    pub fn from_config(config: &ProvidersConfig, api_key: Option<String>) -> Self {
        Self::new(api_key)
            .with_base_url(&config.anthropic_base_url)
            .with_default_model(&config.anthropic_model)
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = model.into();
        self
    }

    /// System prompt goes in the top-level `system` field.
    pub fn build_request_body(&self, request: &AiRequest) -> Value {
        let mut body = json!({
            "model": request.model.as_deref().unwrap_or(&self.default_model),
            "max_tokens": request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            "messages": [{ "role": "user", "content": request.prompt }],
        });
        if let Some(system) = &request.system_prompt {
            body["system"] = json!(system);
        }
        if let Some(t) = request.temperature {
            body["temperature"] = json!(t);
        }
        body
    }
}

#[derive(Deserialize)]
struct AnthropicResponse {
    model: String,
    content: Vec<AnthropicBlock>,
    stop_reason: Option<String>,
    usage: Option<AnthropicUsage>,
}

#[derive(Deserialize)]
struct AnthropicBlock {
    text: Option<String>,
}

#[derive(Deserialize)]
struct AnthropicUsage {
    input_tokens: u64,
    output_tokens: u64,
}

#[async_trait]
impl AiProvider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn generate(&self, request: &AiRequest) -> Result<AiResponse, ProviderError> {
        let key = request
            .api_key
            .as_ref()
            .map(|k| k.expose().to_string())
            .or_else(|| self.api_key.clone())
            .ok_or_else(|| missing_key("anthropic"))?;
        let body = self.build_request_body(request);
        let url = format!("{}/v1/messages", self.base_url);
        debug!(%url, "anthropic request");

        let builder = self
            .client
            .post(&url)
            .header("x-api-key", key)
            .header("anthropic-version", "2023-06-01");
        let resp = send_json("anthropic", builder, &body).await?;
        let parsed: AnthropicResponse = resp
            .json()
            .await
            .map_err(|e| map_transport("anthropic", &e))?;

        let content: String = parsed
            .content
            .iter()
            .filter_map(|b| b.text.as_deref())
            .collect();
        Ok(AiResponse {
            content,
            model: parsed.model,
            provider: "anthropic".into(),
            usage: parsed
                .usage
                .map(|u| TokenUsage::new(u.input_tokens, u.output_tokens)),
            finish_reason: parsed.stop_reason,
        })
    }

    async fn is_available(&self) -> bool {
        self.api_key.is_some()
    }

    fn available_models(&self) -> Vec<String> {
        [
            "claude-3-opus",
            "claude-3-sonnet",
            "claude-3-haiku",
            "claude-3-5-sonnet",
        ]
        .into_iter()
        .map(String::from)
        .collect()
    }
}

// ---------------------------------------------------------------------------
// OllamaProvider
// ---------------------------------------------------------------------------

/// Local Ollama server (`/api/chat`, non-streaming). No credentials.
pub struct OllamaProvider {
    client: reqwest::Client,
    base_url: String,
    default_model: String,
    probe_timeout: Duration,
}

impl OllamaProvider {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            default_model: "llama3".into(),
            probe_timeout: Duration::from_secs(2),
        }
    }

    pub fn from_config(config: &ProvidersConfig) -> Self {
        Self::new(&config.ollama_base_url).with_default_model(&config.ollama_model)
    }

    pub fn with_default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = model.into();
        self
    }

    pub fn build_request_body(&self, request: &AiRequest) -> Value {
        let mut messages = Vec::new();
        if let Some(system) = &request.system_prompt {
            messages.push(json!({ "role": "system", "content": system }));
        }
        messages.push(json!({ "role": "user", "content": request.prompt }));

        let mut options = serde_json::Map::new();
        if let Some(t) = request.temperature {
            options.insert("temperature".into(), json!(t));
        }
        if let Some(max) = request.max_tokens {
            options.insert("num_predict".into(), json!(max));
        }

        let mut body = json!({
            "model": request.model.as_deref().unwrap_or(&self.default_model),
            "messages": messages,
            "stream": false,
        });
        if !options.is_empty() {
            body["options"] = Value::Object(options);
        }
        body
    }
}

#[derive(Deserialize)]
struct OllamaResponse {
    model: String,
    message: Option<OllamaMessage>,
    done_reason: Option<String>,
    prompt_eval_count: Option<u64>,
    eval_count: Option<u64>,
}

#[derive(Deserialize)]
struct OllamaMessage {
    content: String,
}

#[async_trait]
impl AiProvider for OllamaProvider {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn generate(&self, request: &AiRequest) -> Result<AiResponse, ProviderError> {
        let body = self.build_request_body(request);
        let url = format!("{}/api/chat", self.base_url);
        debug!(%url, "ollama request");

        let resp = send_json("ollama", self.client.post(&url), &body).await?;
        let parsed: OllamaResponse = resp.json().await.map_err(|e| map_transport("ollama", &e))?;

        let usage = match (parsed.prompt_eval_count, parsed.eval_count) {
            (None, None) => None,
            (p, c) => Some(TokenUsage::new(p.unwrap_or(0), c.unwrap_or(0))),
        };
        Ok(AiResponse {
            content: parsed.message.map(|m| m.content).unwrap_or_default(),
            model: parsed.model,
            provider: "ollama".into(),
            usage,
            finish_reason: parsed.done_reason,
        })
    }

    async fn is_available(&self) -> bool {
        let url = format!("{}/api/tags", self.base_url);
        match self
            .client
            .get(&url)
            .timeout(self.probe_timeout)
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                debug!(error = %e, "ollama probe failed");
                false
            }
        }
    }

    fn available_models(&self) -> Vec<String> {
        vec![self.default_model.clone()]
    }
}

// ---------------------------------------------------------------------------
// MockProvider
// ---------------------------------------------------------------------------

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Scripted provider. Each `generate` pops the next queued result, or returns
/// a canned reply when the queue is empty.
#[derive(Clone)]
pub struct MockProvider {
    name: String,
    available: bool,
    delay: Option<Duration>,
    queue: Arc<Mutex<VecDeque<Result<AiResponse, ProviderError>>>>,
    captured: Arc<Mutex<Vec<AiRequest>>>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::named("mock")
    }

    /// A mock registered under another provider's name.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            available: true,
            delay: None,
            queue: Arc::default(),
            captured: Arc::default(),
        }
    }

    pub fn with_response(self, response: AiResponse) -> Self {
        lock(&self.queue).push_back(Ok(response));
        self
    }

    /// Queue a plain-text reply with the given token counts.
    pub fn with_text(self, content: impl Into<String>, prompt: u64, completion: u64) -> Self {
        let response = AiResponse {
            content: content.into(),
            model: "mock-model".into(),
            provider: self.name.clone(),
            usage: Some(TokenUsage::new(prompt, completion)),
            finish_reason: Some("stop".into()),
        };
        self.with_response(response)
    }

    pub fn with_error(self, error: ProviderError) -> Self {
        lock(&self.queue).push_back(Err(error));
        self
    }

    pub fn with_availability(mut self, available: bool) -> Self {
        self.available = available;
        self
    }

    /// Sleep before answering (for timeout tests).
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn captured_requests(&self) -> Vec<AiRequest> {
        lock(&self.captured).clone()
    }

    pub fn call_count(&self) -> usize {
        lock(&self.captured).len()
    }

    fn canned(&self, request: &AiRequest) -> AiResponse {
        AiResponse {
            content: "Mock response".into(),
            model: request
                .model
                .clone()
                .unwrap_or_else(|| "mock-model".into()),
            provider: self.name.clone(),
            usage: Some(TokenUsage::new(10, 5)),
            finish_reason: Some("stop".into()),
        }
    }
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AiProvider for MockProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn generate(&self, request: &AiRequest) -> Result<AiResponse, ProviderError> {
        lock(&self.captured).push(request.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let next = lock(&self.queue).pop_front();
        next.unwrap_or_else(|| Ok(self.canned(request)))
    }

    async fn is_available(&self) -> bool {
        self.available
    }

    fn available_models(&self) -> Vec<String> {
        vec!["mock-model".into()]
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

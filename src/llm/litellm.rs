//! OpenAI-compatible chat completion client.
//!
//! Works against LiteLLM proxies and OpenRouter alike. The wire format is the
//! `/chat/completions` endpoint; OpenRouter additionally reports the dollar
//! cost of each call in `usage.cost`, which is surfaced when present.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::LlmError;

/// Base URL used when the client is configured for OpenRouter.
pub const OPENROUTER_BASE_URL: &str = "https://openrouter.ai/api/v1";

/// Default model identifier.
pub const DEFAULT_MODEL: &str = "anthropic/claude-sonnet-4";

const REQUEST_TIMEOUT_SECS: u64 = 300;

/// One conversation turn. Transcripts are lists of these.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// "system", "user" or "assistant".
    pub role: String,
    pub content: String,
    /// Accounting attached to assistant messages. Never sent to the API.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<MessageMeta>,
}

/// Cost accounting recorded alongside a model response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageMeta {
    /// Dollar cost of the call that produced the message.
    pub cost: f64,
    pub usage: Usage,
    /// When the response was received.
    pub timestamp: DateTime<Utc>,
}

impl Message {
    fn with_role(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: content.into(),
            meta: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::with_role("system", content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::with_role("user", content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::with_role("assistant", content)
    }

    /// Attach cost metadata.
    pub fn with_meta(mut self, meta: MessageMeta) -> Self {
        self.meta = Some(meta);
        self
    }
}

/// A chat completion call. An empty `model` selects the client default.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub model: String,
    pub messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

impl GenerationRequest {
    pub fn new(model: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            model: model.into(),
            messages,
            temperature: None,
            max_tokens: None,
        }
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }
}

/// Backend reply to a [`GenerationRequest`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationResponse {
    pub id: String,
    pub model: String,
    pub choices: Vec<Choice>,
    pub usage: Usage,
}

impl GenerationResponse {
    /// Text of the first choice. Only one is ever requested.
    pub fn first_content(&self) -> Option<&str> {
        self.choices.first().map(|c| c.message.content.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Choice {
    pub index: u32,
    pub message: Message,
    /// "stop", "length", ...
    pub finish_reason: String,
}

/// Token counts for one call, plus the dollar cost when the backend
/// reports it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
}

/// A text-completion backend.
///
/// Implementations perform exactly one call per `generate`; retries and
/// accounting belong to [`ModelClient`](super::ModelClient).
#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn generate(&self, request: GenerationRequest) -> Result<GenerationResponse, LlmError>;
}

/// HTTP client for `/chat/completions` endpoints.
pub struct LiteLlmClient {
    api_base: String,
    api_key: Option<String>,
    default_model: String,
    http: Client,
}

impl LiteLlmClient {
    /// Fails with `LlmError::RequestFailed` when the HTTP client cannot be
    /// built, e.g. with an unusable TLS setup.
    pub fn new(
        api_base: impl Into<String>,
        api_key: Option<String>,
        default_model: impl Into<String>,
    ) -> Result<Self, LlmError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| LlmError::RequestFailed(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            api_base: api_base.into().trim_end_matches('/').to_string(),
            api_key,
            default_model: default_model.into(),
            http,
        })
    }

    pub fn openrouter(api_key: String, model: impl Into<String>) -> Result<Self, LlmError> {
        Self::new(OPENROUTER_BASE_URL, Some(api_key), model)
    }

    pub fn api_base(&self) -> &str {
        &self.api_base
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.api_base)
    }

    fn body<'a>(&'a self, request: &'a GenerationRequest) -> ChatBody<'a> {
        let model = if request.model.is_empty() {
            &self.default_model
        } else {
            &request.model
        };
        ChatBody {
            model,
            messages: request
                .messages
                .iter()
                .map(|m| WireMessage {
                    role: &m.role,
                    content: &m.content,
                })
                .collect(),
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            usage: UsageOptions { include: true },
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatBody<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    usage: UsageOptions,
}

#[derive(Debug, Serialize)]
struct WireMessage<'a> {
    role: &'a str,
    content: &'a str,
}

/// Asks OpenRouter to include the call cost in `usage`; ignored elsewhere.
#[derive(Debug, Serialize)]
struct UsageOptions {
    include: bool,
}

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    #[serde(default)]
    id: String,
    #[serde(default)]
    model: String,
    choices: Vec<WireChoice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct WireChoice {
    #[serde(default)]
    index: u32,
    message: WireReply,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireReply {
    role: String,
    /// `null` for tool-call-only replies.
    #[serde(default)]
    content: Option<String>,
}

impl From<ChatCompletion> for GenerationResponse {
    fn from(completion: ChatCompletion) -> Self {
        Self {
            id: completion.id,
            model: completion.model,
            choices: completion
                .choices
                .into_iter()
                .map(|c| Choice {
                    index: c.index,
                    message: Message {
                        role: c.message.role,
                        content: c.message.content.unwrap_or_default(),
                        meta: None,
                    },
                    finish_reason: c.finish_reason.unwrap_or_else(|| "stop".to_string()),
                })
                .collect(),
            usage: completion.usage.unwrap_or_default(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: String,
}

/// Map a non-success HTTP status and body to a typed error.
fn classify_http_error(status_code: u16, body: &str) -> LlmError {
    let message = serde_json::from_str::<ErrorEnvelope>(body)
        .map(|r| r.error.message)
        .unwrap_or_else(|_| body.to_string());

    match status_code {
        401 | 403 => LlmError::Unauthorized(message),
        429 => LlmError::RateLimited(message),
        400 if message.to_lowercase().contains("context length") => {
            LlmError::ContextLengthExceeded(message)
        }
        code => LlmError::ApiError { code, message },
    }
}

#[async_trait]
impl LlmProvider for LiteLlmClient {
    async fn generate(&self, request: GenerationRequest) -> Result<GenerationResponse, LlmError> {
        let mut call = self
            .http
            .post(self.endpoint())
            .header("HTTP-Referer", "https://swe-runner.local")
            .header("X-Title", "swe-runner")
            .json(&self.body(&request));
        if let Some(key) = &self.api_key {
            call = call.bearer_auth(key);
        }

        let response = call
            .send()
            .await
            .map_err(|e| LlmError::RequestFailed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_http_error(status.as_u16(), &body));
        }

        let completion: ChatCompletion = response
            .json()
            .await
            .map_err(|e| LlmError::ParseError(format!("Invalid chat completion: {e}")))?;
        Ok(completion.into())
    }
}

//! Per-task model client.
//!
//! Wraps a shared [`LlmProvider`] with the bookkeeping the agent loop needs:
//! call count, cumulative cost and bounded retry of transient failures.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, warn};

use super::cost::{resolve_call_cost, CostTracker, ModelPricing};
use super::litellm::{GenerationRequest, LlmProvider, Message, MessageMeta, Usage, DEFAULT_MODEL};
use crate::error::LlmError;

/// Exponential backoff policy for transient backend errors.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    /// Delay before the first retry; doubled for each subsequent retry.
    pub base_delay_ms: u64,
    /// Upper bound for a single delay.
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            base_delay_ms: 4_000,
            max_delay_ms: 60_000,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            base_delay_ms: 0,
            max_delay_ms: 0,
        }
    }

    /// Delay before retry number `retry` (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(20);
        let delay = self.base_delay_ms.saturating_mul(1u64 << exponent);
        Duration::from_millis(delay.min(self.max_delay_ms))
    }
}

/// Model selection and sampling settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Model identifier passed to the backend.
    pub name: String,
    /// OpenAI-compatible endpoint. `None` selects OpenRouter or the
    /// `LITELLM_API_BASE` environment variable.
    pub api_base: Option<String>,
    /// API key. Never written to transcripts.
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
    /// Used when the backend does not report a cost per call.
    pub pricing: Option<ModelPricing>,
    pub retry: RetryPolicy,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_MODEL.to_string(),
            api_base: None,
            api_key: None,
            temperature: Some(0.0),
            max_tokens: None,
            pricing: None,
            retry: RetryPolicy::default(),
        }
    }
}

impl ModelConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = Some(api_base.into());
        self
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_pricing(mut self, pricing: ModelPricing) -> Self {
        self.pricing = Some(pricing);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// One model reply with its accounting.
#[derive(Debug, Clone)]
pub struct ModelResponse {
    pub content: String,
    pub cost: f64,
    pub usage: Usage,
}

impl ModelResponse {
    /// Convert into an assistant message carrying cost metadata.
    pub fn into_message(self) -> Message {
        Message::assistant(self.content).with_meta(MessageMeta {
            cost: self.cost,
            usage: self.usage,
            timestamp: Utc::now(),
        })
    }
}

/// Model client owned by a single agent loop.
pub struct ModelClient {
    provider: Arc<dyn LlmProvider>,
    config: ModelConfig,
    tracker: Option<Arc<CostTracker>>,
    n_calls: usize,
    cost: f64,
}

impl ModelClient {
    pub fn new(provider: Arc<dyn LlmProvider>, config: ModelConfig) -> Self {
        Self {
            provider,
            config,
            tracker: None,
            n_calls: 0,
            cost: 0.0,
        }
    }

    /// Also report every call to a run-wide tracker.
    pub fn with_tracker(mut self, tracker: Arc<CostTracker>) -> Self {
        self.tracker = Some(tracker);
        self
    }

    /// Number of completed model calls.
    pub fn n_calls(&self) -> usize {
        self.n_calls
    }

    /// Cumulative dollar cost of completed calls.
    pub fn cost(&self) -> f64 {
        self.cost
    }

    pub fn model_name(&self) -> &str {
        &self.config.name
    }

    /// Query the model with the full conversation.
    ///
    /// Transient failures are retried according to the configured
    /// [`RetryPolicy`]; the returned error is either fatal or the last
    /// transient error once attempts are exhausted.
    pub async fn query(&mut self, messages: &[Message]) -> Result<ModelResponse, LlmError> {
        let mut request = GenerationRequest::new(self.config.name.clone(), messages.to_vec());
        if let Some(temperature) = self.config.temperature {
            request = request.with_temperature(temperature);
        }
        if let Some(max_tokens) = self.config.max_tokens {
            request = request.with_max_tokens(max_tokens);
        }

        let max_attempts = self.config.retry.max_attempts.max(1);
        let mut attempt = 0;
        let response = loop {
            attempt += 1;
            match self.provider.generate(request.clone()).await {
                Ok(response) => break response,
                Err(err) if err.is_retryable() && attempt < max_attempts => {
                    let delay = self.config.retry.delay_for(attempt);
                    warn!(
                        model = %self.config.name,
                        attempt = attempt,
                        max_attempts = max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Transient model error, will retry"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        };

        let content = response
            .first_content()
            .ok_or_else(|| LlmError::ParseError("No content in LLM response".to_string()))?
            .to_string();
        let cost = resolve_call_cost(&response.usage, self.config.pricing.as_ref());

        self.n_calls += 1;
        self.cost += cost;
        if let Some(tracker) = &self.tracker {
            tracker.record(&self.config.name, cost);
        }

        debug!(
            model = %self.config.name,
            n_calls = self.n_calls,
            call_cost = cost,
            total_cost = self.cost,
            "Model call completed"
        );

        Ok(ModelResponse {
            content,
            cost,
            usage: response.usage,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::scripted::ScriptedProvider;

    fn fast_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay_ms: 0,
            max_delay_ms: 0,
        }
    }

    #[test]
    fn test_retry_policy_backoff_is_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_secs(4));
        assert_eq!(policy.delay_for(2), Duration::from_secs(8));
        assert_eq!(policy.delay_for(4), Duration::from_secs(32));
        assert_eq!(policy.delay_for(5), Duration::from_secs(60));
        assert_eq!(policy.delay_for(30), Duration::from_secs(60));
    }

    #[test]
    fn test_model_config_skips_api_key() {
        let config = ModelConfig::new("m").with_api_key("secret");
        let yaml = serde_yaml::to_string(&config).expect("serialize");
        assert!(!yaml.contains("secret"));
        assert!(yaml.contains("name: m"));
    }

    #[tokio::test]
    async fn test_query_tracks_calls_and_cost() {
        let provider = Arc::new(ScriptedProvider::new(vec!["one", "two"]).with_cost_per_call(0.5));
        let tracker = Arc::new(CostTracker::new());
        let mut client = ModelClient::new(provider, ModelConfig::new("scripted"))
            .with_tracker(Arc::clone(&tracker));

        let first = client.query(&[Message::user("hi")]).await.expect("first");
        assert_eq!(first.content, "one");
        let second = client.query(&[Message::user("hi")]).await.expect("second");
        assert_eq!(second.content, "two");

        assert_eq!(client.n_calls(), 2);
        assert!((client.cost() - 1.0).abs() < f64::EPSILON);
        assert_eq!(tracker.calls(), 2);
    }

    #[tokio::test]
    async fn test_query_retries_transient_errors() {
        let provider = Arc::new(
            ScriptedProvider::new(vec!["ok"])
                .with_leading_failures(2, || LlmError::RateLimited("busy".to_string())),
        );
        let mut client = ModelClient::new(
            Arc::clone(&provider) as Arc<dyn LlmProvider>,
            ModelConfig::new("scripted").with_retry(fast_retry(3)),
        );

        let response = client.query(&[Message::user("hi")]).await.expect("recovers");
        assert_eq!(response.content, "ok");
        assert_eq!(client.n_calls(), 1);
        assert_eq!(provider.attempts(), 3);
    }

    #[tokio::test]
    async fn test_query_gives_up_after_max_attempts() {
        let provider = Arc::new(
            ScriptedProvider::new(vec!["never"])
                .with_leading_failures(5, || LlmError::RequestFailed("connection reset".into())),
        );
        let mut client = ModelClient::new(
            Arc::clone(&provider) as Arc<dyn LlmProvider>,
            ModelConfig::new("scripted").with_retry(fast_retry(2)),
        );

        let err = client.query(&[Message::user("hi")]).await.unwrap_err();
        assert!(matches!(err, LlmError::RequestFailed(_)));
        assert_eq!(provider.attempts(), 2);
        assert_eq!(client.n_calls(), 0);
    }

    #[tokio::test]
    async fn test_query_does_not_retry_fatal_errors() {
        let provider = Arc::new(
            ScriptedProvider::new(vec!["never"])
                .with_leading_failures(1, || LlmError::Unauthorized("bad key".into())),
        );
        let mut client = ModelClient::new(
            Arc::clone(&provider) as Arc<dyn LlmProvider>,
            ModelConfig::new("scripted").with_retry(fast_retry(5)),
        );

        let err = client.query(&[Message::user("hi")]).await.unwrap_err();
        assert!(matches!(err, LlmError::Unauthorized(_)));
        assert_eq!(provider.attempts(), 1);
    }
}

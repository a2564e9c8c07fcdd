//! LLM integration for swe-runner.
//!
//! The agent treats the model as an opaque text-completion service:
//!
//! - [`litellm`] holds the wire types, the [`LlmProvider`] trait and an
//!   OpenAI-compatible HTTP client (LiteLLM proxies, OpenRouter).
//! - [`model`] wraps a provider into a per-task [`ModelClient`] that counts
//!   calls, accumulates cost and retries transient failures.
//! - [`cost`] converts token usage into dollars and aggregates run-wide spend.
//! - [`scripted`] replays canned responses for dry runs and tests.
//!
//! ```ignore
//! use std::sync::Arc;
//! use swe_runner::llm::{LiteLlmClient, ModelClient, ModelConfig, Message};
//!
//! let provider = Arc::new(LiteLlmClient::openrouter(api_key, "anthropic/claude-sonnet-4")?);
//! let mut client = ModelClient::new(provider, ModelConfig::new("anthropic/claude-sonnet-4"));
//! let reply = client.query(&[Message::user("Hello")]).await?;
//! println!("{} (${:.4})", reply.content, client.cost());
//! ```

pub mod cost;
pub mod litellm;
pub mod model;
pub mod scripted;

pub use cost::{CostReport, CostTracker, ModelPricing};
pub use litellm::{
    Choice, GenerationRequest, GenerationResponse, LiteLlmClient, LlmProvider, Message,
    MessageMeta, Usage, DEFAULT_MODEL, OPENROUTER_BASE_URL,
};
pub use model::{ModelClient, ModelConfig, ModelResponse, RetryPolicy};
pub use scripted::ScriptedProvider;

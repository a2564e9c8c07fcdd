//! Integration tests against a live OpenRouter endpoint.
//!
//! These tests make real API calls.
//! Run with: OPENROUTER_API_KEY=your_key cargo test --test llm_integration -- --ignored

use std::sync::Arc;

use swe_runner::agent::{ActionParser, FencedBlockParser};
use swe_runner::llm::{
    GenerationRequest, LiteLlmClient, LlmProvider, Message, ModelClient, ModelConfig, RetryPolicy,
};

const TEST_MODEL: &str = "anthropic/claude-sonnet-4";

fn get_test_api_key() -> String {
    std::env::var("OPENROUTER_API_KEY")
        .expect("OPENROUTER_API_KEY environment variable must be set for integration tests")
}

fn create_test_client() -> LiteLlmClient {
    LiteLlmClient::openrouter(get_test_api_key(), TEST_MODEL).expect("client")
}

#[tokio::test]
#[ignore] // Run with: cargo test --test llm_integration -- --ignored
async fn test_simple_generation() {
    let client = create_test_client();

    let request = GenerationRequest::new(
        TEST_MODEL,
        vec![
            Message::system("You are a helpful assistant. Reply concisely."),
            Message::user("What is 2 + 2? Reply with just the number."),
        ],
    )
    .with_max_tokens(10)
    .with_temperature(0.0);

    let response = client.generate(request).await;
    assert!(response.is_ok(), "Generation failed: {:?}", response.err());

    let response = response.expect("Should have response");
    let content = response.first_content().expect("Should have content");
    assert!(content.contains('4'), "Response should contain '4', got: {}", content);
    assert!(response.usage.total_tokens > 0, "Should have token usage");
}

#[tokio::test]
#[ignore]
async fn test_model_client_tracks_calls_and_cost() {
    let provider: Arc<dyn LlmProvider> = Arc::new(create_test_client());
    let mut client = ModelClient::new(
        provider,
        ModelConfig::new(TEST_MODEL).with_retry(RetryPolicy::none()),
    );

    let reply = client
        .query(&[
            Message::system("Reply with one word."),
            Message::user("Say hello."),
        ])
        .await
        .expect("query");

    assert!(!reply.content.is_empty());
    assert_eq!(client.n_calls(), 1);
    assert!(client.cost() >= 0.0);
}

#[tokio::test]
#[ignore]
async fn test_model_follows_action_format() {
    let provider: Arc<dyn LlmProvider> = Arc::new(create_test_client());
    let mut client = ModelClient::new(provider, ModelConfig::new(TEST_MODEL));
    let parser = FencedBlockParser::new("bash").expect("parser");

    let reply = client
        .query(&[
            Message::system(
                "Respond with exactly one shell command inside a ```bash code block and nothing else.",
            ),
            Message::user("List the files in the current directory."),
        ])
        .await
        .expect("query");

    let command = parser.parse(&reply.content).expect("one action");
    assert!(command.contains("ls"), "Unexpected command: {}", command);
}

#[tokio::test]
#[ignore]
async fn test_invalid_key_is_not_retryable() {
    let client = LiteLlmClient::openrouter("invalid-key".to_string(), TEST_MODEL).expect("client");
    let request = GenerationRequest::new(TEST_MODEL, vec![Message::user("hi")]).with_max_tokens(1);

    if let Err(e) = client.generate(request).await {
        if !matches!(e, swe_runner::LlmError::RequestFailed(_)) {
            assert!(!e.is_retryable(), "Auth failure should not be retryable: {e}");
        }
    }
}

//! Deterministic provider that replays canned responses.
//!
//! Used for dry runs (`--scripted-responses`) and throughout the test suite
//! to drive the agent loop without a live model.

use async_trait::async_trait;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use super::litellm::{Choice, GenerationRequest, GenerationResponse, LlmProvider, Message, Usage};
use crate::error::LlmError;

type FailureFactory = Box<dyn Fn() -> LlmError + Send + Sync>;

enum Script {
    Sequence(Vec<String>),
    Repeat(String),
}

/// Replays a fixed list of responses, or one response forever.
pub struct ScriptedProvider {
    script: Script,
    cursor: AtomicUsize,
    attempts: AtomicUsize,
    cost_per_call: Option<f64>,
    leading_failures: usize,
    failure: Option<FailureFactory>,
    received: Mutex<Vec<Vec<Message>>>,
}

impl ScriptedProvider {
    /// Responses are returned in order; once exhausted every call fails
    /// with [`LlmError::ScriptExhausted`].
    pub fn new<S: Into<String>>(responses: Vec<S>) -> Self {
        Self::with_script(Script::Sequence(
            responses.into_iter().map(Into::into).collect(),
        ))
    }

    /// Every call returns the same response.
    pub fn repeating(response: impl Into<String>) -> Self {
        Self::with_script(Script::Repeat(response.into()))
    }

    /// Load a response list from a JSON or YAML file containing a sequence
    /// of strings.
    pub fn from_file(path: &Path) -> Result<Self, LlmError> {
        let content = std::fs::read_to_string(path)?;
        let responses: Vec<String> = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(&content)
                .map_err(|e| LlmError::ParseError(format!("{}: {e}", path.display())))?,
            _ => serde_yaml::from_str(&content)
                .map_err(|e| LlmError::ParseError(format!("{}: {e}", path.display())))?,
        };
        Ok(Self::new(responses))
    }

    fn with_script(script: Script) -> Self {
        Self {
            script,
            cursor: AtomicUsize::new(0),
            attempts: AtomicUsize::new(0),
            cost_per_call: None,
            leading_failures: 0,
            failure: None,
            received: Mutex::new(Vec::new()),
        }
    }

    /// Report this dollar cost in the usage of every successful call.
    pub fn with_cost_per_call(mut self, cost: f64) -> Self {
        self.cost_per_call = Some(cost);
        self
    }

    /// Fail the first `count` calls with errors built by `factory`.
    pub fn with_leading_failures<F>(mut self, count: usize, factory: F) -> Self
    where
        F: Fn() -> LlmError + Send + Sync + 'static,
    {
        self.leading_failures = count;
        self.failure = Some(Box::new(factory));
        self
    }

    /// Total number of `generate` invocations, failed ones included.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Conversations received by successful calls, in order.
    pub fn received(&self) -> Vec<Vec<Message>> {
        self.received
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn next_response(&self) -> Result<String, LlmError> {
        match &self.script {
            Script::Repeat(response) => Ok(response.clone()),
            Script::Sequence(responses) => {
                let index = self.cursor.fetch_add(1, Ordering::SeqCst);
                responses
                    .get(index)
                    .cloned()
                    .ok_or(LlmError::ScriptExhausted { calls: index })
            }
        }
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    async fn generate(&self, request: GenerationRequest) -> Result<GenerationResponse, LlmError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if attempt < self.leading_failures {
            if let Some(factory) = &self.failure {
                return Err(factory());
            }
        }

        let content = self.next_response()?;
        self.received
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request.messages);

        Ok(GenerationResponse {
            id: format!("scripted-{attempt}"),
            model: request.model,
            choices: vec![Choice {
                index: 0,
                message: Message::assistant(content),
                finish_reason: "stop".to_string(),
            }],
            usage: Usage {
                cost: self.cost_per_call,
                ..Usage::default()
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn request() -> GenerationRequest {
        GenerationRequest::new("scripted", vec![Message::user("go")])
    }

    #[tokio::test]
    async fn test_sequence_then_exhausted() {
        let provider = ScriptedProvider::new(vec!["a", "b"]);
        assert_eq!(
            provider.generate(request()).await.expect("a").first_content(),
            Some("a")
        );
        assert_eq!(
            provider.generate(request()).await.expect("b").first_content(),
            Some("b")
        );
        assert!(matches!(
            provider.generate(request()).await,
            Err(LlmError::ScriptExhausted { calls: 2 })
        ));
        assert_eq!(provider.received().len(), 2);
    }

    #[tokio::test]
    async fn test_repeating_never_exhausts() {
        let provider = ScriptedProvider::repeating("same").with_cost_per_call(0.1);
        for _ in 0..5 {
            let response = provider.generate(request()).await.expect("response");
            assert_eq!(response.first_content(), Some("same"));
            assert_eq!(response.usage.cost, Some(0.1));
        }
        assert_eq!(provider.attempts(), 5);
    }

    #[test]
    fn test_from_yaml_file() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("responses.yaml");
        std::fs::write(&path, "- first\n- |\n  second\n  line\n").expect("write");

        let provider = ScriptedProvider::from_file(&path).expect("load");
        match &provider.script {
            Script::Sequence(responses) => {
                assert_eq!(responses.len(), 2);
                assert_eq!(responses[1], "second\nline\n");
            }
            Script::Repeat(_) => panic!("expected sequence"),
        }
    }
}

//! Action extraction from model responses.

use regex::Regex;
use thiserror::Error;

/// The response did not contain exactly one action.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("expected exactly one action, found {found}")]
pub struct FormatError {
    pub found: usize,
}

/// Turns a model response into a single shell command.
pub trait ActionParser: Send + Sync {
    fn parse(&self, response: &str) -> Result<String, FormatError>;

    /// Code fence language shown in format error messages.
    fn language(&self) -> &str;
}

/// Accepts exactly one fenced code block tagged with a language.
#[derive(Debug, Clone)]
pub struct FencedBlockParser {
    language: String,
    pattern: Regex,
}

impl FencedBlockParser {
    pub fn new(language: &str) -> Result<Self, regex::Error> {
        let pattern = Regex::new(&format!(
            r"(?s)```{}\s*\n(.*?)\n```",
            regex::escape(language)
        ))?;
        Ok(Self {
            language: language.to_string(),
            pattern,
        })
    }
}

impl ActionParser for FencedBlockParser {
    fn parse(&self, response: &str) -> Result<String, FormatError> {
        let actions: Vec<&str> = self
            .pattern
            .captures_iter(response)
            .filter_map(|c| c.get(1))
            .map(|m| m.as_str())
            .collect();

        match actions.as_slice() {
            [action] => Ok(action.trim().to_string()),
            other => Err(FormatError { found: other.len() }),
        }
    }

    fn language(&self) -> &str {
        &self.language
    }
}

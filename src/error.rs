//! Error types for collaborator calls and request validation.

use serde::Serialize;
use std::collections::BTreeMap;
use thiserror::Error;

/// Failure of an upstream collaborator (embedder, retriever or generator).
///
/// The display text is what clients see; it carries the upstream message
/// but no internal structure.
#[derive(Debug, Error)]
pub enum UpstreamError {
    /// Embedding request failed.
    #[error("embedding failed: {0}")]
    Embed(String),
    /// Vector search request failed.
    #[error("search failed: {0}")]
    Search(String),
    /// Chat completion request failed, or the stream broke mid-way.
    #[error("generation failed: {0}")]
    Generate(String),
    /// Upstream answered with a payload that could not be decoded.
    #[error("invalid upstream response: {0}")]
    Decode(String),
    /// Request deadline elapsed.
    #[error("request timed out")]
    Timeout,
    /// Missing credentials or client setup problem.
    #[error("configuration error: {0}")]
    Config(String),
}

/// Field-level validation failures, keyed by request field name.
///
/// Serializes as `{"question": ["..."], "topK": ["..."]}`.
#[derive(Debug, Error, Default, Clone, PartialEq, Eq, Serialize)]
#[error("invalid request: {}", summary(.0))]
#[serde(transparent)]
pub struct ValidationErrors(pub BTreeMap<String, Vec<String>>);

impl ValidationErrors {
    pub fn add(&mut self, field: &str, message: impl Into<String>) {
        self.0
            .entry(field.to_string())
            .or_default()
            .push(message.into());
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }
}

fn summary(fields: &BTreeMap<String, Vec<String>>) -> String {
    fields
        .iter()
        .map(|(field, msgs)| format!("{}: {}", field, msgs.join(", ")))
        .collect::<Vec<_>>()
        .join("; ")
}

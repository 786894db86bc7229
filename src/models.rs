//! Core data models used throughout the trainer.
//!
//! These types represent the conversation turns, retrieved passages, and
//! chat messages that flow through the retrieval and generation pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Speaker of a conversation turn or chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One role-tagged entry in a conversation ledger.
///
/// `seq` increases monotonically within a conversation and is never reused,
/// even after older turns have been trimmed.
#[derive(Debug, Clone, PartialEq)]
pub struct Turn {
    pub seq: u64,
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// A message sent to the generator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

impl From<&Turn> for ChatMessage {
    fn from(turn: &Turn) -> Self {
        Self {
            role: turn.role,
            content: turn.content.clone(),
        }
    }
}

/// A scored retrieval result.
///
/// `page_num` is stored 0-based, as indexed; it is shown 1-based in prompts.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Passage {
    pub id: Option<String>,
    pub content: String,
    pub doc_id: String,
    pub path: Option<String>,
    pub page_num: Option<i64>,
    pub chunk_num: Option<i64>,
    pub course_id: Option<String>,
    pub module_id: Option<String>,
    pub source_type: Option<String>,
    pub score: f64,
}

/// Citation entry emitted on the stream and in spoken responses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRef {
    #[serde(rename = "ref")]
    pub reference: String,
    pub doc_id: String,
    pub path: Option<String>,
    pub page_num: Option<i64>,
}

/// Citation entry returned by the Q&A endpoint; adds course/module metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Citation {
    #[serde(rename = "ref")]
    pub reference: String,
    pub doc_id: String,
    pub path: Option<String>,
    pub page_num: Option<i64>,
    pub course_id: Option<String>,
    pub module_id: Option<String>,
}

/// Citation label for the passage at `index` (0-based) in retrieval order.
pub fn citation_ref(index: usize) -> String {
    format!("#{}", index + 1)
}

/// Ordered source list for the given passages.
pub fn source_refs(passages: &[Passage]) -> Vec<SourceRef> {
    passages
        .iter()
        .enumerate()
        .map(|(i, p)| SourceRef {
            reference: citation_ref(i),
            doc_id: p.doc_id.clone(),
            path: p.path.clone(),
            page_num: p.page_num,
        })
        .collect()
}

/// Ordered citation list (with course/module metadata) for the given passages.
pub fn citations(passages: &[Passage]) -> Vec<Citation> {
    passages
        .iter()
        .enumerate()
        .map(|(i, p)| Citation {
            reference: citation_ref(i),
            doc_id: p.doc_id.clone(),
            path: p.path.clone(),
            page_num: p.page_num,
            course_id: p.course_id.clone(),
            module_id: p.module_id.clone(),
        })
        .collect()
}

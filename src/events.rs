//! Server-sent event protocol for streamed answers.
//!
//! Every event is framed as two lines and a blank line:
//!
//! ```text
//! event: token
//! data: {"token":"Hello"}
//!
//! ```
//!
//! A stream always begins with `meta` and ends with exactly one of `done` or
//! `error`, unless the client cancels, in which case it simply stops.
//!
//! | Event | Payload |
//! |-------|---------|
//! | `meta` | `{"conversationId": "...", "sources": [{"ref": "#1", ...}]}` |
//! | `token` | `{"token": "..."}` |
//! | `done` | `{"ok": true}` |
//! | `error` | `{"error": "..."}` |
//!
//! [`EventParser`] is the matching client-side decoder.

use serde::Serialize;
use serde_json::{json, Value};

use crate::models::SourceRef;

/// One event on the answer stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Meta {
        conversation_id: String,
        sources: Vec<SourceRef>,
    },
    Token(String),
    Done,
    Error(String),
}

#[derive(Serialize)]
struct MetaPayload<'a> {
    #[serde(rename = "conversationId")]
    conversation_id: &'a str,
    sources: &'a [SourceRef],
}

impl StreamEvent {
    pub fn name(&self) -> &'static str {
        match self {
            StreamEvent::Meta { .. } => "meta",
            StreamEvent::Token(_) => "token",
            StreamEvent::Done => "done",
            StreamEvent::Error(_) => "error",
        }
    }

    /// JSON payload carried on the `data:` line.
    pub fn data(&self) -> Value {
        match self {
            StreamEvent::Meta {
                conversation_id,
                sources,
            } => serde_json::to_value(MetaPayload {
                conversation_id,
                sources,
            })
            .unwrap_or(Value::Null),
            StreamEvent::Token(token) => json!({ "token": token }),
            StreamEvent::Done => json!({ "ok": true }),
            StreamEvent::Error(error) => json!({ "error": error }),
        }
    }

    /// Whether this event ends the stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Done | StreamEvent::Error(_))
    }

    /// Wire form: `event: <name>\ndata: <json>\n\n`.
    pub fn to_frame(&self) -> String {
        format!("event: {}\ndata: {}\n\n", self.name(), self.data())
    }

    pub fn to_sse(&self) -> axum::response::sse::Event {
        axum::response::sse::Event::default()
            .event(self.name())
            .data(self.data().to_string())
    }
}

/// Payload of a received event.
#[derive(Debug, Clone, PartialEq)]
pub enum EventData {
    Json(Value),
    /// The `data:` text was not valid JSON.
    Raw(String),
}

impl EventData {
    /// Payload as JSON; raw text is wrapped as `{"raw": "..."}`.
    pub fn into_json(self) -> Value {
        match self {
            EventData::Json(v) => v,
            EventData::Raw(s) => json!({ "raw": s }),
        }
    }
}

/// An event decoded by [`EventParser`].
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedEvent {
    pub name: String,
    pub data: EventData,
}

/// Incremental decoder for the event stream.
///
/// Bytes may arrive split at any position, including inside a multi-byte
/// UTF-8 sequence or between the two newlines of a frame boundary.
#[derive(Debug, Default)]
pub struct EventParser {
    pending: Vec<u8>,
    buffer: String,
}

impl EventParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of bytes and return every event it completes.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<ReceivedEvent> {
        self.pending.extend_from_slice(chunk);
        let valid_up_to = match std::str::from_utf8(&self.pending) {
            Ok(s) => s.len(),
            Err(e) if e.error_len().is_none() => e.valid_up_to(),
            // Invalid bytes (not a truncated sequence): decode lossily.
            Err(_) => self.pending.len(),
        };
        let rest = self.pending.split_off(valid_up_to);
        let decoded = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending = rest;
        self.buffer.push_str(&decoded);
        // A CRLF pair may straddle two chunks, so normalize the whole buffer.
        if self.buffer.contains('\r') {
            self.buffer = self.buffer.replace("\r\n", "\n");
        }

        let mut events = Vec::new();
        while let Some(idx) = self.buffer.find("\n\n") {
            let raw: String = self.buffer.drain(..idx + 2).collect();
            if let Some(event) = parse_block(&raw[..idx]) {
                events.push(event);
            }
        }
        events
    }

    /// Flush a trailing block that was not terminated by a blank line.
    pub fn finish(&mut self) -> Option<ReceivedEvent> {
        let raw = std::mem::take(&mut self.buffer);
        parse_block(raw.trim_end_matches('\r'))
    }
}

fn parse_block(block: &str) -> Option<ReceivedEvent> {
    let mut name = "message".to_string();
    let mut lines: Vec<&str> = Vec::new();

    for line in block.lines().filter(|l| !l.is_empty()) {
        if let Some(rest) = line.strip_prefix("event:") {
            name = rest.trim().to_string();
        } else if let Some(rest) = line.strip_prefix("data:") {
            lines.push(rest.strip_prefix(' ').unwrap_or(rest));
        }
    }

    if lines.is_empty() {
        return None;
    }
    let data = lines.join("\n");

    let data = match serde_json::from_str(&data) {
        Ok(v) => EventData::Json(v),
        Err(_) => EventData::Raw(data),
    };
    Some(ReceivedEvent { name, data })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta() -> StreamEvent {
        StreamEvent::Meta {
            conversation_id: "conv-1".to_string(),
            sources: vec![SourceRef {
                reference: "#1".to_string(),
                doc_id: "policy-1".to_string(),
                path: Some("docs/policy.pdf".to_string()),
                page_num: Some(4),
            }],
        }
    }

    #[test]
    fn test_frames() {
        assert_eq!(
            StreamEvent::Token("Hi".to_string()).to_frame(),
            "event: token\ndata: {\"token\":\"Hi\"}\n\n"
        );
        assert_eq!(StreamEvent::Done.to_frame(), "event: done\ndata: {\"ok\":true}\n\n");
        assert_eq!(
            StreamEvent::Error("boom".to_string()).to_frame(),
            "event: error\ndata: {\"error\":\"boom\"}\n\n"
        );
    }

    #[test]
    fn test_meta_payload_shape() {
        let data = meta().data();
        assert_eq!(data["conversationId"], "conv-1");
        assert_eq!(data["sources"][0]["ref"], "#1");
        assert_eq!(data["sources"][0]["doc_id"], "policy-1");
        assert_eq!(data["sources"][0]["page_num"], 4);
    }

    #[test]
    fn test_parser_handles_split_frames() {
        let wire = format!(
            "{}{}{}",
            meta().to_frame(),
            StreamEvent::Token("Hé".to_string()).to_frame(),
            StreamEvent::Done.to_frame()
        );
        let bytes = wire.as_bytes();

        let mut parser = EventParser::new();
        let mut events = Vec::new();
        for chunk in bytes.chunks(3) {
            events.extend(parser.push(chunk));
        }

        let names: Vec<&str> = events.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["meta", "token", "done"]);
        assert_eq!(
            events[1].data,
            EventData::Json(serde_json::json!({ "token": "Hé" }))
        );
        assert!(parser.finish().is_none());
    }

    #[test]
    fn test_parser_handles_crlf_split_across_chunks() {
        let mut parser = EventParser::new();
        let mut events = parser.push(b"event: token\r\ndata: {\"token\":\"a\"}\r");
        assert!(events.is_empty());
        events.extend(parser.push(b"\n\r\nevent: done\r\ndata: {\"ok\":true}\r\n\r\n"));

        let names: Vec<&str> = events.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["token", "done"]);
        assert_eq!(events[0].data, EventData::Json(serde_json::json!({ "token": "a" })));
    }

    #[test]
    fn test_parser_joins_data_lines_with_newline() {
        let mut parser = EventParser::new();
        let events = parser.push(b"data: first\ndata: second\n\nevent: meta\ndata: {\"a\":\ndata: 1}\n\n");
        assert_eq!(events[0].data, EventData::Raw("first\nsecond".to_string()));
        assert_eq!(events[1].data, EventData::Json(serde_json::json!({ "a": 1 })));
    }

    #[test]
    fn test_parser_tolerates_malformed_json() {
        let mut parser = EventParser::new();
        let events = parser.push(b"event: token\ndata: {not json\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, EventData::Raw("{not json".to_string()));
        assert_eq!(
            events[0].data.clone().into_json(),
            serde_json::json!({ "raw": "{not json" })
        );
    }

    #[test]
    fn test_parser_skips_blocks_without_data() {
        let mut parser = EventParser::new();
        let events = parser.push(b": keep-alive\n\nevent: done\ndata: {\"ok\":true}\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].name, "done");
    }

    #[test]
    fn test_parser_defaults_event_name() {
        let mut parser = EventParser::new();
        let events = parser.push(b"data: 1\n\n");
        assert_eq!(events[0].name, "message");
    }

    #[test]
    fn test_terminal_events() {
        assert!(StreamEvent::Done.is_terminal());
        assert!(StreamEvent::Error("x".into()).is_terminal());
        assert!(!StreamEvent::Token("x".into()).is_terminal());
        assert!(!meta().is_terminal());
    }
}

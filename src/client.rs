//! Streaming client for `POST /api/trainer/respond/stream`.
//!
//! Used by `trainer chat`. Events are decoded with [`EventParser`] as bytes
//! arrive and handed to a callback, so tokens can be printed immediately.

use anyhow::{bail, Context, Result};
use futures_util::StreamExt;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::events::{EventParser, ReceivedEvent};

/// How a streamed exchange ended, from the client's side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ending {
    Done,
    Error(String),
    /// Cancelled locally before a terminal event arrived.
    Cancelled,
    /// Server closed the connection without a terminal event.
    Disconnected,
}

/// Everything received on one stream.
#[derive(Debug, Clone)]
pub struct Exchange {
    pub conversation_id: Option<String>,
    pub sources: Vec<Value>,
    pub answer: String,
    pub ending: Ending,
}

pub struct TrainerClient {
    client: reqwest::Client,
    base_url: String,
}

impl TrainerClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Ask a question on a conversation, calling `on_event` for every event.
    ///
    /// Cancelling `cancel` drops the response, which closes the connection.
    pub async fn chat<F>(
        &self,
        question: &str,
        conversation_id: Option<&str>,
        top_k: Option<usize>,
        cancel: CancellationToken,
        mut on_event: F,
    ) -> Result<Exchange>
    where
        F: FnMut(&ReceivedEvent),
    {
        let mut body = json!({ "question": question });
        if let Some(id) = conversation_id {
            body["conversationId"] = json!(id);
        }
        if let Some(k) = top_k {
            body["topK"] = json!(k);
        }

        let url = format!("{}/api/trainer/respond/stream", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("failed to reach {}", url))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<Value>(&text)
                .ok()
                .and_then(|v| v["error"]["message"].as_str().map(str::to_string))
                .unwrap_or(text);
            bail!("server returned {}: {}", status, message);
        }

        let mut exchange = Exchange {
            conversation_id: None,
            sources: Vec::new(),
            answer: String::new(),
            ending: Ending::Disconnected,
        };
        let mut parser = EventParser::new();
        let mut body = response.bytes_stream();

        loop {
            let chunk = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    exchange.ending = Ending::Cancelled;
                    return Ok(exchange);
                }
                c = body.next() => c,
            };
            let (events, at_end) = match chunk {
                Some(Ok(bytes)) => (parser.push(&bytes), false),
                Some(Err(e)) => return Err(e).context("stream interrupted"),
                None => (parser.finish().into_iter().collect(), true),
            };

            for event in &events {
                on_event(event);
                if apply(&mut exchange, event) {
                    return Ok(exchange);
                }
            }
            if at_end {
                return Ok(exchange);
            }
        }
    }
}

/// Fold one event into the exchange. Returns `true` on a terminal event.
fn apply(exchange: &mut Exchange, event: &ReceivedEvent) -> bool {
    let data = event.data.clone().into_json();
    match event.name.as_str() {
        "meta" => {
            exchange.conversation_id = data["conversationId"].as_str().map(str::to_string);
            if let Some(sources) = data["sources"].as_array() {
                exchange.sources = sources.clone();
            }
            false
        }
        "token" => {
            if let Some(t) = data["token"].as_str() {
                exchange.answer.push_str(t);
            }
            false
        }
        "done" => {
            exchange.ending = Ending::Done;
            true
        }
        "error" => {
            let message = data["error"].as_str().unwrap_or("unknown error");
            exchange.ending = Ending::Error(message.to_string());
            true
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventData;

    fn event(name: &str, data: Value) -> ReceivedEvent {
        ReceivedEvent {
            name: name.to_string(),
            data: EventData::Json(data),
        }
    }

    fn empty() -> Exchange {
        Exchange {
            conversation_id: None,
            sources: Vec::new(),
            answer: String::new(),
            ending: Ending::Disconnected,
        }
    }

    #[test]
    fn test_apply_accumulates_tokens() {
        let mut ex = empty();
        assert!(!apply(
            &mut ex,
            &event("meta", json!({"conversationId": "conv-9", "sources": [{"ref": "#1"}]}))
        ));
        assert!(!apply(&mut ex, &event("token", json!({"token": "Hi "}))));
        assert!(!apply(&mut ex, &event("token", json!({"token": "there"}))));
        assert!(apply(&mut ex, &event("done", json!({"ok": true}))));

        assert_eq!(ex.conversation_id.as_deref(), Some("conv-9"));
        assert_eq!(ex.sources.len(), 1);
        assert_eq!(ex.answer, "Hi there");
        assert_eq!(ex.ending, Ending::Done);
    }

    #[test]
    fn test_apply_error_is_terminal() {
        let mut ex = empty();
        assert!(apply(&mut ex, &event("error", json!({"error": "search failed: 503"}))));
        assert_eq!(ex.ending, Ending::Error("search failed: 503".to_string()));
    }

    #[test]
    fn test_unknown_events_ignored() {
        let mut ex = empty();
        assert!(!apply(&mut ex, &event("message", json!({"x": 1}))));
        assert_eq!(ex.ending, Ending::Disconnected);
    }
}

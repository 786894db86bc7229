//! Chat completion, whole or streamed.
//!
//! [`Generator::complete_streaming`] returns a [`FragmentStream`]: a lazy,
//! cancellable sequence of text fragments. Fragments are yielded as the
//! upstream produces them. Dropping the stream drops the underlying HTTP
//! response, which closes the upstream connection.

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::collections::VecDeque;
use std::time::Duration;
use tracing::debug;

use crate::config::OpenAiConfig;
use crate::embedding::deployment_url;
use crate::error::UpstreamError;
use crate::events::{EventData, EventParser, ReceivedEvent};
use crate::models::ChatMessage;
use crate::retry::send_with_retry;

/// Lazily produced text fragments.
pub type FragmentStream = BoxStream<'static, Result<String, UpstreamError>>;

/// Produces an answer for a message list.
#[async_trait]
pub trait Generator: Send + Sync {
    /// Full completion, trimmed.
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String, UpstreamError>;

    /// Streamed completion. Errors before the first fragment are returned
    /// directly; later errors appear as an `Err` item.
    async fn complete_streaming(
        &self,
        messages: &[ChatMessage],
    ) -> Result<FragmentStream, UpstreamError>;
}

/// Generator backed by an Azure OpenAI chat deployment.
pub struct AzureOpenAiGenerator {
    client: reqwest::Client,
    url: String,
    deployment: String,
    api_key: String,
    temperature: f32,
    timeout: Duration,
    max_retries: u32,
}

impl AzureOpenAiGenerator {
    /// # Errors
    ///
    /// Returns an error if the API key variable is unset or the HTTP client
    /// cannot be built.
    pub fn new(config: &OpenAiConfig) -> anyhow::Result<Self> {
        let api_key = config.api_key()?;
        let timeout = Duration::from_secs(config.timeout_secs);
        // No client-wide timeout: a stream may legitimately outlive it.
        let client = reqwest::Client::builder().connect_timeout(timeout).build()?;

        Ok(Self {
            client,
            url: deployment_url(config, &config.chat_deployment, "chat/completions"),
            deployment: config.chat_deployment.clone(),
            api_key,
            temperature: config.temperature,
            timeout,
            max_retries: config.max_retries,
        })
    }

    fn body(&self, messages: &[ChatMessage], stream: bool) -> serde_json::Value {
        json!({
            "model": self.deployment,
            "messages": messages,
            "temperature": self.temperature,
            "stream": stream,
        })
    }
}

#[derive(Deserialize)]
struct Completion {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
}

#[derive(Deserialize)]
struct CompletionChoice {
    #[serde(default)]
    message: Option<CompletionMessage>,
}

#[derive(Deserialize)]
struct CompletionMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct CompletionChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: Option<ChunkDelta>,
}

#[derive(Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}

fn completion_text(completion: Completion) -> String {
    completion
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message)
        .and_then(|m| m.content)
        .map(|s| s.trim().to_string())
        .unwrap_or_default()
}

#[async_trait]
impl Generator for AzureOpenAiGenerator {
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String, UpstreamError> {
        let body = self.body(messages, false);
        let response = send_with_retry("chat", self.max_retries, || {
            self.client
                .post(&self.url)
                .header("api-key", &self.api_key)
                .timeout(self.timeout)
                .json(&body)
        })
        .await
        .map_err(UpstreamError::Generate)?;

        let completion: Completion = response
            .json()
            .await
            .map_err(|e| UpstreamError::Decode(format!("chat response: {}", e)))?;
        Ok(completion_text(completion))
    }

    async fn complete_streaming(
        &self,
        messages: &[ChatMessage],
    ) -> Result<FragmentStream, UpstreamError> {
        let body = self.body(messages, true);
        let response = send_with_retry("chat stream", self.max_retries, || {
            self.client
                .post(&self.url)
                .header("api-key", &self.api_key)
                .json(&body)
        })
        .await
        .map_err(UpstreamError::Generate)?;

        debug!("chat stream opened");
        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map(|b| b.to_vec()).map_err(|e| e.to_string()))
            .boxed();
        Ok(fragments(body))
    }
}

/// What one upstream stream event means.
#[derive(Debug, PartialEq)]
enum ChunkEvent {
    Text(String),
    /// Metadata-only chunk, or an empty delta.
    Nothing,
    Finished,
}

fn decode_chunk(event: ReceivedEvent) -> Result<ChunkEvent, UpstreamError> {
    match event.data {
        EventData::Raw(raw) if raw == "[DONE]" => Ok(ChunkEvent::Finished),
        EventData::Raw(raw) => Err(UpstreamError::Decode(format!(
            "unexpected stream payload: {}",
            raw
        ))),
        EventData::Json(value) => {
            if let Some(err) = value.get("error") {
                let msg = err
                    .get("message")
                    .and_then(|m| m.as_str())
                    .map(str::to_string)
                    .unwrap_or_else(|| err.to_string());
                return Err(UpstreamError::Generate(msg));
            }
            let chunk: CompletionChunk = serde_json::from_value(value)
                .map_err(|e| UpstreamError::Decode(format!("stream chunk: {}", e)))?;
            let text = chunk
                .choices
                .into_iter()
                .next()
                .and_then(|c| c.delta)
                .and_then(|d| d.content)
                .filter(|s| !s.is_empty());
            Ok(text.map(ChunkEvent::Text).unwrap_or(ChunkEvent::Nothing))
        }
    }
}

struct ChunkDecoder {
    body: BoxStream<'static, Result<Vec<u8>, String>>,
    parser: EventParser,
    ready: VecDeque<String>,
    finished: bool,
}

/// Turn a raw chat-completions event stream into text fragments.
fn fragments(body: BoxStream<'static, Result<Vec<u8>, String>>) -> FragmentStream {
    let state = ChunkDecoder {
        body,
        parser: EventParser::new(),
        ready: VecDeque::new(),
        finished: false,
    };

    stream::unfold(state, |mut st| async move {
        loop {
            if let Some(fragment) = st.ready.pop_front() {
                return Some((Ok(fragment), st));
            }
            if st.finished {
                return None;
            }
            match st.body.next().await {
                Some(Ok(bytes)) => {
                    for event in st.parser.push(&bytes) {
                        match decode_chunk(event) {
                            Ok(ChunkEvent::Text(text)) => st.ready.push_back(text),
                            Ok(ChunkEvent::Nothing) => {}
                            Ok(ChunkEvent::Finished) => {
                                st.finished = true;
                                break;
                            }
                            Err(e) => {
                                st.finished = true;
                                st.ready.clear();
                                return Some((Err(e), st));
                            }
                        }
                    }
                }
                Some(Err(e)) => {
                    st.finished = true;
                    return Some((Err(UpstreamError::Generate(e)), st));
                }
                None => st.finished = true,
            }
        }
    })
    .boxed()
}

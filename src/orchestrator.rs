//! Retrieval-augmented answering, streamed or whole.
//!
//! The [`Orchestrator`] ties the three collaborators together:
//!
//! ```text
//! question ─▶ Embedder ─▶ Retriever ─▶ prompt ─▶ Generator ─▶ answer
//!                                        ▲
//!                    conversation ledger ┘ (streaming only)
//! ```
//!
//! For a streamed request the order is always embed → retrieve → `meta` →
//! tokens → `done`/`error`. Each fragment from the generator is forwarded as
//! its own `token` event, in arrival order. The user turn is appended to the
//! ledger before anything else happens; the assistant turn only after the
//! generator finished cleanly.
//!
//! Cancellation (client gone, or the request's [`CancellationToken`]
//! cancelled) stops the pipeline at its next suspension point, drops the
//! upstream stream and emits nothing further. A cancelled or failed request
//! never adds an assistant turn.
//!
//! The per-request deadline covers retrieval and generation only. Once the
//! generator has finished, the answer is recorded and `done` is sent
//! regardless of the clock.

use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{Config, UnansweredTurns};
use crate::embedding::Embedder;
use crate::error::UpstreamError;
use crate::events::StreamEvent;
use crate::generation::Generator;
use crate::ledger::ConversationStore;
use crate::models::{citations, source_refs, Citation, Passage, Role, SourceRef};
use crate::prompt::{build_messages, PromptMode};
use crate::request::{QueryRequest, SpokenRequest, StreamRequest};
use crate::search::Retriever;

/// Events buffered between the orchestrator task and the HTTP response.
const EVENT_BUFFER: usize = 64;

/// Behavioral knobs taken from configuration.
#[derive(Debug, Clone)]
pub struct Settings {
    pub history_turns: usize,
    pub unanswered_turns: UnansweredTurns,
    pub request_timeout: Option<Duration>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            history_turns: 20,
            unanswered_turns: UnansweredTurns::Retain,
            request_timeout: None,
        }
    }
}

impl From<&Config> for Settings {
    fn from(config: &Config) -> Self {
        Self {
            history_turns: config.conversation.history_turns,
            unanswered_turns: config.conversation.unanswered_turns,
            request_timeout: config.server.request_timeout_secs.map(Duration::from_secs),
        }
    }
}

/// Body of a successful Q&A response.
#[derive(Debug, Clone, Serialize)]
pub struct AnswerResponse {
    pub answer: String,
    pub citations: Vec<Citation>,
}

/// Body of a successful spoken response.
#[derive(Debug, Clone, Serialize)]
pub struct SpokenResponse {
    pub speech: String,
    pub sources: Vec<SourceRef>,
}

/// How a streamed request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOutcome {
    /// `done` was emitted and the assistant turn recorded.
    Completed,
    /// `error` was emitted.
    Failed,
    /// The client went away or the request was cancelled; nothing more was
    /// emitted.
    Cancelled,
}

/// Per-request streaming state.
struct StreamSession {
    conversation_id: String,
    accumulated: String,
    cancel: CancellationToken,
    events: mpsc::Sender<StreamEvent>,
}

impl StreamSession {
    /// Send an event unless the request has been cancelled.
    ///
    /// Returns `false` when the event could not be delivered.
    async fn emit(&self, event: StreamEvent) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            sent = self.events.send(event) => sent.is_ok(),
        }
    }

    fn is_gone(&self) -> bool {
        self.cancel.is_cancelled() || self.events.is_closed()
    }

    /// Resolves once the request is cancelled or the receiver is dropped.
    async fn gone(&self) {
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = self.events.closed() => {}
        }
    }

    async fn fail(&self, err: UpstreamError) -> StreamOutcome {
        warn!(conversation_id = %self.conversation_id, error = %err, "stream failed");
        if self.emit(StreamEvent::Error(err.to_string())).await {
            StreamOutcome::Failed
        } else {
            StreamOutcome::Cancelled
        }
    }
}

/// Coordinates embedder, retriever, generator and the conversation ledger.
#[derive(Clone)]
pub struct Orchestrator {
    embedder: Arc<dyn Embedder>,
    retriever: Arc<dyn Retriever>,
    generator: Arc<dyn Generator>,
    ledger: Arc<ConversationStore>,
    settings: Settings,
}

impl Orchestrator {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        retriever: Arc<dyn Retriever>,
        generator: Arc<dyn Generator>,
        ledger: Arc<ConversationStore>,
        settings: Settings,
    ) -> Self {
        Self {
            embedder,
            retriever,
            generator,
            ledger,
            settings,
        }
    }

    pub fn ledger(&self) -> &Arc<ConversationStore> {
        &self.ledger
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Embed the question and fetch passages in retrieval order.
    async fn retrieve(&self, query: &QueryRequest) -> Result<Vec<Passage>, UpstreamError> {
        let vector = self.embedder.embed(&query.question).await?;
        let filter = query.filters.to_expression();
        debug!(
            top_k = query.top_k,
            filter = filter.as_deref().unwrap_or(""),
            "retrieving passages"
        );
        self.retriever
            .search(&vector, query.top_k, filter.as_deref())
            .await
    }

    async fn with_deadline<T, F>(&self, fut: F) -> Result<T, UpstreamError>
    where
        F: Future<Output = Result<T, UpstreamError>>,
    {
        match self.settings.request_timeout {
            Some(limit) => tokio::time::timeout(limit, fut)
                .await
                .unwrap_or(Err(UpstreamError::Timeout)),
            None => fut.await,
        }
    }

    /// Written answer with citations. Does not touch the ledger.
    pub async fn answer(&self, query: &QueryRequest) -> Result<AnswerResponse, UpstreamError> {
        self.with_deadline(async {
            let passages = self.retrieve(query).await?;
            let messages = build_messages(&query.question, &passages, &[], PromptMode::Answer);
            let answer = self.generator.complete(&messages).await?;
            info!(passages = passages.len(), "answered question");
            Ok(AnswerResponse {
                answer,
                citations: citations(&passages),
            })
        })
        .await
    }

    /// Spoken answer in the requested persona. Does not touch the ledger.
    pub async fn respond(&self, request: &SpokenRequest) -> Result<SpokenResponse, UpstreamError> {
        let query = &request.query;
        self.with_deadline(async {
            let passages = self.retrieve(query).await?;
            let messages = build_messages(
                &query.question,
                &passages,
                &[],
                PromptMode::Spoken(request.persona),
            );
            let speech = self.generator.complete(&messages).await?;
            info!(
                passages = passages.len(),
                persona = request.persona.as_str(),
                "produced spoken response"
            );
            Ok(SpokenResponse {
                speech,
                sources: source_refs(&passages),
            })
        })
        .await
    }

    /// Start a streamed answer on a background task.
    ///
    /// Returns the resolved conversation id (generated when the request has
    /// none) and the event stream. Dropping the stream, or cancelling
    /// `cancel`, aborts the request.
    pub fn stream(
        &self,
        request: StreamRequest,
        cancel: CancellationToken,
    ) -> (String, ReceiverStream<StreamEvent>) {
        let conversation_id = request
            .conversation_id
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);

        let this = self.clone();
        let id = conversation_id.clone();
        tokio::spawn(async move {
            this.run_stream(id, request.query, tx, cancel).await;
        });

        (conversation_id, ReceiverStream::new(rx))
    }

    /// Run one streamed request to completion, writing events to `events`.
    pub async fn run_stream(
        &self,
        conversation_id: String,
        query: QueryRequest,
        events: mpsc::Sender<StreamEvent>,
        cancel: CancellationToken,
    ) -> StreamOutcome {
        let user_seq = self
            .ledger
            .begin_exchange(&conversation_id, query.question.clone());
        info!(%conversation_id, top_k = query.top_k, "stream started");

        let mut session = StreamSession {
            conversation_id,
            accumulated: String::new(),
            cancel,
            events,
        };

        let generated = match self.settings.request_timeout {
            Some(limit) => {
                let timed =
                    tokio::time::timeout(limit, self.generate(&mut session, &query, user_seq))
                        .await;
                match timed {
                    Ok(generated) => generated,
                    Err(_) if session.is_gone() => Err(StreamOutcome::Cancelled),
                    Err(_) => Err(session.fail(UpstreamError::Timeout).await),
                }
            }
            None => self.generate(&mut session, &query, user_seq).await,
        };
        let outcome = match generated {
            Ok(()) => self.complete(&session).await,
            Err(outcome) => outcome,
        };

        if outcome != StreamOutcome::Completed
            && self.settings.unanswered_turns == UnansweredTurns::Discard
        {
            self.ledger.retract(&session.conversation_id, user_seq);
            debug!(conversation_id = %session.conversation_id, "discarded unanswered turn");
        }
        self.ledger.end_exchange(&session.conversation_id);

        match outcome {
            StreamOutcome::Completed => info!(
                conversation_id = %session.conversation_id,
                chars = session.accumulated.len(),
                "stream completed"
            ),
            StreamOutcome::Cancelled => info!(
                conversation_id = %session.conversation_id,
                "stream cancelled by client"
            ),
            StreamOutcome::Failed => {}
        }
        outcome
    }

    /// Retrieve, send `meta` and forward every fragment as a `token`.
    ///
    /// `Ok` means the generator finished cleanly and the answer is in
    /// `session.accumulated`; `Err` carries how the request ended instead.
    async fn generate(
        &self,
        session: &mut StreamSession,
        query: &QueryRequest,
        user_seq: u64,
    ) -> Result<(), StreamOutcome> {
        let retrieved = tokio::select! {
            biased;
            _ = session.gone() => return Err(StreamOutcome::Cancelled),
            r = self.retrieve(query) => r,
        };
        let passages = match retrieved {
            Ok(p) => p,
            Err(e) => return Err(session.fail(e).await),
        };

        let history = self.ledger.history_before(
            &session.conversation_id,
            user_seq,
            self.settings.history_turns,
        );
        let messages = build_messages(
            &query.question,
            &passages,
            &history,
            PromptMode::Conversational,
        );

        let meta = StreamEvent::Meta {
            conversation_id: session.conversation_id.clone(),
            sources: source_refs(&passages),
        };
        if !session.emit(meta).await {
            return Err(StreamOutcome::Cancelled);
        }

        let opened = tokio::select! {
            biased;
            _ = session.gone() => return Err(StreamOutcome::Cancelled),
            r = self.generator.complete_streaming(&messages) => r,
        };
        let mut fragments = match opened {
            Ok(s) => s,
            Err(e) => return Err(session.fail(e).await),
        };

        loop {
            let next = tokio::select! {
                biased;
                _ = session.gone() => return Err(StreamOutcome::Cancelled),
                n = fragments.next() => n,
            };
            match next {
                Some(Ok(fragment)) => {
                    session.accumulated.push_str(&fragment);
                    if !session.emit(StreamEvent::Token(fragment)).await {
                        return Err(StreamOutcome::Cancelled);
                    }
                }
                Some(Err(e)) => return Err(session.fail(e).await),
                None => return Ok(()),
            }
        }
    }

    /// Record the assistant turn and send `done`.
    async fn complete(&self, session: &StreamSession) -> StreamOutcome {
        if session.is_gone() {
            return StreamOutcome::Cancelled;
        }

        let answer = session.accumulated.trim().to_string();
        self.ledger
            .append(&session.conversation_id, Role::Assistant, answer);

        session.emit(StreamEvent::Done).await;
        StreamOutcome::Completed
    }
}

//! In-process collaborators shared by the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use rag_trainer::embedding::Embedder;
use rag_trainer::error::UpstreamError;
use rag_trainer::generation::{FragmentStream, Generator};
use rag_trainer::ledger::ConversationStore;
use rag_trainer::models::{ChatMessage, Passage};
use rag_trainer::orchestrator::{Orchestrator, Settings};
use rag_trainer::search::Retriever;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;

// ─── Embedder ───────────────────────────────────────────────────────

pub struct FakeEmbedder {
    pub failure: Option<String>,
}

#[async_trait]
impl Embedder for FakeEmbedder {
    async fn embed(&self, _text: &str) -> Result<Vec<f32>, UpstreamError> {
        match &self.failure {
            Some(msg) => Err(UpstreamError::Embed(msg.clone())),
            None => Ok(vec![0.1, 0.2, 0.3]),
        }
    }
}

// ─── Retriever ──────────────────────────────────────────────────────

#[derive(Default)]
pub struct FakeRetriever {
    pub passages: Vec<Passage>,
    /// `(k, filter)` for every call.
    pub calls: Mutex<Vec<(usize, Option<String>)>>,
    /// When set, every search waits for a permit before answering.
    pub gate: Option<Arc<Semaphore>>,
}

#[async_trait]
impl Retriever for FakeRetriever {
    async fn search(
        &self,
        _vector: &[f32],
        k: usize,
        filter: Option<&str>,
    ) -> Result<Vec<Passage>, UpstreamError> {
        self.calls.lock().push((k, filter.map(str::to_string)));
        if let Some(gate) = &self.gate {
            let _permit = gate
                .acquire()
                .await
                .map_err(|_| UpstreamError::Search("gate closed".to_string()))?;
        }
        Ok(self.passages.iter().take(k).cloned().collect())
    }
}

// ─── Generator ──────────────────────────────────────────────────────

/// What the fake generator's stream does after its fragments.
#[derive(Clone)]
pub enum Tail {
    /// End cleanly.
    End,
    /// Yield an error item.
    Fail(String),
    /// Never produce another item.
    Hang,
}

pub struct FakeGenerator {
    pub fragments: Vec<String>,
    pub tail: Tail,
    /// Message lists received, one per call.
    pub seen: Mutex<Vec<Vec<ChatMessage>>>,
    /// Set when a returned stream has been dropped.
    pub dropped: Arc<AtomicBool>,
}

impl FakeGenerator {
    pub fn new(fragments: &[&str], tail: Tail) -> Self {
        Self {
            fragments: fragments.iter().map(|s| s.to_string()).collect(),
            tail,
            seen: Mutex::new(Vec::new()),
            dropped: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn last_messages(&self) -> Vec<ChatMessage> {
        self.seen.lock().last().cloned().unwrap_or_default()
    }

    pub fn was_dropped(&self) -> bool {
        self.dropped.load(Ordering::SeqCst)
    }
}

struct DropFlag(Arc<AtomicBool>);

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl Generator for FakeGenerator {
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String, UpstreamError> {
        self.seen.lock().push(messages.to_vec());
        match &self.tail {
            Tail::Fail(msg) => Err(UpstreamError::Generate(msg.clone())),
            _ => Ok(self.fragments.concat().trim().to_string()),
        }
    }

    async fn complete_streaming(
        &self,
        messages: &[ChatMessage],
    ) -> Result<FragmentStream, UpstreamError> {
        self.seen.lock().push(messages.to_vec());

        let head = stream::iter(
            self.fragments
                .clone()
                .into_iter()
                .map(Ok::<_, UpstreamError>),
        );
        let tail: BoxStream<'static, Result<String, UpstreamError>> = match self.tail.clone() {
            Tail::End => stream::empty().boxed(),
            Tail::Fail(msg) => stream::once(async move { Err(UpstreamError::Generate(msg)) }).boxed(),
            Tail::Hang => stream::pending().boxed(),
        };

        let flag = DropFlag(self.dropped.clone());
        Ok(head
            .chain(tail)
            .map(move |item| {
                let _held = &flag;
                item
            })
            .boxed())
    }
}

// ─── Fixtures ───────────────────────────────────────────────────────

pub fn passage(doc_id: &str, page_num: Option<i64>, content: &str) -> Passage {
    Passage {
        id: Some(format!("{}-chunk", doc_id)),
        content: content.to_string(),
        doc_id: doc_id.to_string(),
        path: Some(format!("docs/{}.pdf", doc_id)),
        page_num,
        course_id: Some("retail-101".to_string()),
        score: 0.5,
        ..Default::default()
    }
}

pub fn policy_passages() -> Vec<Passage> {
    vec![
        passage("policy-1", Some(4), "Returns are accepted within 30 days."),
        passage("policy-2", None, "Refunds go back to the original payment method."),
    ]
}

pub struct Harness {
    pub orchestrator: Orchestrator,
    pub retriever: Arc<FakeRetriever>,
    pub generator: Arc<FakeGenerator>,
}

pub fn harness(
    embed_failure: Option<&str>,
    passages: Vec<Passage>,
    generator: FakeGenerator,
    settings: Settings,
) -> Harness {
    let retriever = FakeRetriever {
        passages,
        ..Default::default()
    };
    harness_with(embed_failure, retriever, generator, settings)
}

pub fn harness_with(
    embed_failure: Option<&str>,
    retriever: FakeRetriever,
    generator: FakeGenerator,
    settings: Settings,
) -> Harness {
    let retriever = Arc::new(retriever);
    let generator = Arc::new(generator);
    let orchestrator = Orchestrator::new(
        Arc::new(FakeEmbedder {
            failure: embed_failure.map(str::to_string),
        }),
        retriever.clone(),
        generator.clone(),
        Arc::new(ConversationStore::unbounded()),
        settings,
    );
    Harness {
        orchestrator,
        retriever,
        generator,
    }
}

//! Prompt assembly.
//!
//! Everything here is a pure function of its inputs: the same question,
//! passages, history and mode always produce the same message list.
//!
//! The context block numbers passages in retrieval order so that a citation
//! `[#i]` in the answer always points at the `i`-th passage of the request:
//!
//! ```text
//! [#1 | policy-1 p.5]
//! Returns are accepted within 30 days.
//!
//! ---
//!
//! [#2 | policy-2]
//! Refunds go back to the original payment method.
//! ```

use crate::models::{ChatMessage, Passage, Turn};

const PASSAGE_SEPARATOR: &str = "\n\n---\n\n";

/// Speaking style for spoken responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Persona {
    #[default]
    Instructor,
    Coach,
}

impl Persona {
    pub fn as_str(&self) -> &'static str {
        match self {
            Persona::Instructor => "instructor",
            Persona::Coach => "coach",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "instructor" => Some(Persona::Instructor),
            "coach" => Some(Persona::Coach),
            _ => None,
        }
    }
}

/// Which endpoint the prompt is built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptMode {
    /// Written Q&A answer with citations.
    Answer,
    /// Spoken answer in the given persona's style.
    Spoken(Persona),
    /// Streamed spoken answer within a conversation.
    Conversational,
}

pub fn system_prompt() -> String {
    "You are an enterprise training instructor.\n\
     Use ONLY the provided context.\n\
     If the context doesn't contain the answer, say you don't know and ask a clarifying question.\n\
     Keep answers short and actionable."
        .to_string()
}

fn system_for(mode: PromptMode) -> String {
    match mode {
        PromptMode::Answer => system_prompt(),
        PromptMode::Spoken(persona) => format!(
            "{}\nStyle: {}. Keep it spoken and natural.",
            system_prompt(),
            persona.as_str()
        ),
        PromptMode::Conversational => {
            format!("{}\nKeep it spoken and training-friendly.", system_prompt())
        }
    }
}

fn answer_suffix(mode: PromptMode) -> &'static str {
    match mode {
        PromptMode::Answer => "",
        PromptMode::Spoken(_) => {
            "\n\nReturn ONLY the spoken answer (no markdown, no bullet lists unless necessary)."
        }
        PromptMode::Conversational => "\n\nReturn ONLY the spoken answer. No markdown.",
    }
}

/// Header line for one passage, e.g. `[#1 | policy-1 p.5]`.
///
/// The page locator appears only for a non-negative page number and is
/// shown 1-based.
pub fn passage_header(index: usize, passage: &Passage) -> String {
    let loc = match passage.page_num {
        Some(page) if page >= 0 => format!(" p.{}", page + 1),
        _ => String::new(),
    };
    format!("[#{} | {}{}]", index + 1, passage.doc_id, loc)
}

/// Context block: each passage under its header, in retrieval order,
/// separated by a blank-line `---` rule.
pub fn render_context(passages: &[Passage]) -> String {
    passages
        .iter()
        .enumerate()
        .map(|(i, p)| format!("{}\n{}", passage_header(i, p), p.content))
        .collect::<Vec<_>>()
        .join(PASSAGE_SEPARATOR)
}

/// Final user message: question, context block and the citation instruction.
pub fn user_prompt(question: &str, passages: &[Passage]) -> String {
    format!(
        "Question: {}\n\nContext:\n{}\n\nAnswer in plain English. \
         Cite sources using [#1], [#2] at the end of sentences where you used context.",
        question,
        render_context(passages)
    )
}

/// Build the full message list for the generator.
///
/// `history` must already exclude the in-flight question; the question is
/// added once, as the final user message, together with the context block.
pub fn build_messages(
    question: &str,
    passages: &[Passage],
    history: &[Turn],
    mode: PromptMode,
) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(history.len() + 2);
    messages.push(ChatMessage::system(system_for(mode)));
    messages.extend(history.iter().map(ChatMessage::from));
    messages.push(ChatMessage::user(format!(
        "{}{}",
        user_prompt(question, passages),
        answer_suffix(mode)
    )));
    messages
}

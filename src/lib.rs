//! # RAG Trainer
//!
//! A conversational training assistant that answers questions from an
//! indexed corpus of course material, streaming the answer token by token.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌────────────┐   ┌────────────┐   ┌───────────┐
//! │  HTTP    │──▶│ Embedder   │──▶│ Retriever  │──▶│ Generator │
//! │ (axum)   │   │ Azure OAI  │   │ Azure AI   │   │ Azure OAI │
//! └────┬─────┘   └────────────┘   │ Search     │   └─────┬─────┘
//!      │                          └────────────┘         │
//!      │          ┌──────────────────────┐               │
//!      └─────────▶│ Conversation ledger  │◀──────────────┘
//!                 └──────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! export AZURE_OPENAI_API_KEY=...
//! export AZURE_SEARCH_ADMIN_KEY=...
//! trainer check                      # validate configuration
//! trainer ask "What is the returns window?"
//! trainer serve                      # start HTTP server
//! trainer chat "And for opened items?" --conversation-id <id>
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`error`] | Upstream and validation errors |
//! | [`request`] | Request decoding and validation |
//! | [`filter`] | Metadata filter expressions |
//! | [`prompt`] | Prompt assembly |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`search`] | Vector retrieval |
//! | [`generation`] | Chat completion, whole or streamed |
//! | [`retry`] | Upstream retry with backoff |
//! | [`ledger`] | Per-conversation turn history |
//! | [`events`] | Server-sent event framing and parsing |
//! | [`orchestrator`] | The retrieval-augmented pipeline |
//! | [`server`] | HTTP server |
//! | [`client`] | Streaming client |

pub mod client;
pub mod config;
pub mod embedding;
pub mod error;
pub mod events;
pub mod filter;
pub mod generation;
pub mod ledger;
pub mod models;
pub mod orchestrator;
pub mod prompt;
pub mod request;
pub mod retry;
pub mod search;
pub mod server;
